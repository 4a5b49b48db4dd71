//! Configuration Management Module
//!
//! Loads the gateway's configuration from a JSON file on disk (the
//! documented schema — accounts, router, fallbacks, quota) and layers a
//! handful of environment-variable overrides for settings that should not
//! live in the checked-in config file.
//!
//! Strict parsing: every struct rejects unknown keys via
//! `#[serde(deny_unknown_fields)]`, so a typo'd or stale key fails loudly
//! at startup instead of being silently ignored.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::routing::Strategy;

/// Get environment variable value or fallback to default.
pub fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

/// Parse boolean values from environment variables.
pub fn bool_env(key: &str, fallback: bool) -> bool {
    match env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") => true,
        Ok("0") | Ok("false") | Ok("FALSE") => false,
        _ => fallback,
    }
}

fn default_true() -> bool {
    true
}

/// One statically-configured account entry.
///
/// Feeds the fleet independently of directory scan: an account whose id
/// has no matching file under `authProfilesDir` is still turned into a
/// worker, using `authFile` as its auth-profile path. Profiles discovered
/// via directory scan that aren't named here are also kept, with the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub id: String,
    #[serde(rename = "authFile")]
    pub auth_file: String,
    pub port: Option<u16>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "maxConcurrent", default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_weight() -> u32 {
    1
}

fn default_max_concurrent() -> u32 {
    1
}

/// Router-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(rename = "healthCheckInterval", default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(rename = "requestTimeout", default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(rename = "maxRetries", default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(rename = "queueOnSaturation", default = "default_true")]
    pub queue_on_saturation: bool,
    #[serde(rename = "maxQueueLength", default = "default_max_queue_length")]
    pub max_queue_length: usize,
    #[serde(rename = "autoRestart", default = "default_true")]
    pub auto_restart: bool,
    /// CORS origins; empty means permissive (`Any`), kept configurable
    /// for operators who need to lock it down.
    #[serde(rename = "corsAllowedOrigins", default)]
    pub cors_allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_queue_length() -> usize {
    1000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            strategy: Strategy::default(),
            health_check_interval: default_health_check_interval(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            queue_on_saturation: true,
            max_queue_length: default_max_queue_length(),
            auto_restart: true,
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// Quota/cooldown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    #[serde(rename = "cooldownSeconds", default = "default_cooldown")]
    pub cooldown_seconds: u64,
}

fn default_cooldown() -> u64 {
    3600
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(rename = "authProfilesDir", default = "default_auth_profiles_dir")]
    pub auth_profiles_dir: String,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub fallbacks: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(rename = "basePort", default = "default_base_port")]
    pub base_port: u16,
}

fn default_auth_profiles_dir() -> String {
    "./auth_profiles/multi".to_string()
}

fn default_base_port() -> u16 {
    8001
}

/// Fully-resolved configuration: the parsed file plus environment-variable
/// overrides for settings that should never live in a checked-in file.
#[derive(Debug, Clone)]
pub struct Config {
    pub file: FileConfig,
    /// Path to the worker executable; overridable so operators can point
    /// at a different build without editing the config file.
    pub worker_exec: String,
    pub log_level: String,
}

impl Config {
    /// Load and strictly parse the configuration file at `path`, then
    /// layer environment-variable overrides on top.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("cannot read {}: {e}", path.display())))?;
        let file: FileConfig = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("invalid config json: {e}")))?;

        if file.accounts.iter().any(|a| a.id.trim().is_empty()) {
            return Err(GatewayError::Config("account id must not be empty".to_string()));
        }

        Ok(Self {
            file,
            worker_exec: env_or("GATEWAY_WORKER_EXEC", "worker"),
            log_level: env_or("RUST_LOG", "info"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_top_level_key() {
        let json = r#"{"accounts": [], "bogus": true}"#;
        let result: Result<FileConfig, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_account_key() {
        let json = r#"{"accounts": [{"id":"a","authFile":"a.json","nope":1}]}"#;
        let result: Result<FileConfig, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn applies_defaults() {
        let json = r#"{"accounts":[{"id":"a","authFile":"a.json"}]}"#;
        let file: FileConfig = serde_json::from_str(json).unwrap();
        assert_eq!(file.router.port, 8080);
        assert_eq!(file.quota.cooldown_seconds, 3600);
        assert_eq!(file.accounts[0].weight, 1);
        assert_eq!(file.accounts[0].max_concurrent, 1);
        assert!(file.accounts[0].enabled);
    }

    #[test]
    fn parses_full_example() {
        let json = r#"{
            "accounts": [{"id":"a","authFile":"a.json","port":8001,"weight":2,"enabled":true,"maxConcurrent":3}],
            "router": {"strategy":"weighted","maxRetries":1},
            "fallbacks": {"gpt-4": ["gpt-4-mini"]},
            "quota": {"cooldownSeconds": 60}
        }"#;
        let file: FileConfig = serde_json::from_str(json).unwrap();
        assert_eq!(file.accounts[0].port, Some(8001));
        assert!(matches!(file.router.strategy, Strategy::Weighted));
        assert_eq!(file.router.max_retries, 1);
        assert_eq!(file.fallbacks.get("gpt-4").unwrap(), &vec!["gpt-4-mini".to_string()]);
        assert_eq!(file.quota.cooldown_seconds, 60);
    }
}
