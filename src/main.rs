//! Multi-account scheduling and request-routing gateway entry point.
//!
//! Wires together the three core components — Supervisor, Registry,
//! Router/Gateway — and starts the public HTTP server. See
//! `README`-equivalent `DESIGN.md` for the grounding of each module.

mod config;
mod error;
mod gateway;
mod profile;
mod registry;
mod routing;
mod supervisor;
mod types;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::signal;
use tracing::{error, info};

use config::{AccountConfig, Config};
use gateway::GatewayState;
use registry::Registry;
use supervisor::Supervisor;
use types::AuthProfile;

/// Merge directory-scan-discovered profiles with statically-configured
/// accounts: an account with no matching discovered profile still gets one,
/// synthesized from its own `authFile`, so an `accounts`-only deployment
/// (empty or unmatched `authProfilesDir`) still produces a worker per
/// account. A discovered profile wins over a synthesized one for the same id
/// since it reflects the file actually on disk.
fn merge_account_profiles(discovered: Vec<AuthProfile>, accounts: &[AccountConfig], auth_profiles_dir: &Path) -> Vec<AuthProfile> {
    let mut by_id: HashMap<String, AuthProfile> = discovered.into_iter().map(|p| (p.id.clone(), p)).collect();

    for account in accounts {
        by_id.entry(account.id.clone()).or_insert_with(|| {
            let configured = PathBuf::from(&account.auth_file);
            let file_path = if configured.is_absolute() {
                configured
            } else {
                auth_profiles_dir.join(configured)
            };
            let stem = file_path.file_stem().and_then(|s| s.to_str()).unwrap_or(&account.id);
            AuthProfile {
                id: account.id.clone(),
                email: profile::extract_email_from_filename(stem),
                file_path,
                last_updated: SystemTime::now(),
                valid: true,
            }
        });
    }

    let mut merged: Vec<AuthProfile> = by_id.into_values().collect();
    merged.sort_by(|a, b| a.id.cmp(&b.id));
    merged
}

/// Exit codes: `0` normal shutdown, `2` configuration
/// invalid, `3` unable to bind public port, `4` no enabled accounts on
/// startup.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some(config_path) = std::env::args().nth(1) else {
        error!("usage: acct-gateway <config-path.json>");
        return ExitCode::from(2);
    };

    let config = match Config::load(&PathBuf::from(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            return ExitCode::from(2);
        }
    };

    info!(path = %config_path, "loaded configuration");

    let auth_profiles_dir = PathBuf::from(&config.file.auth_profiles_dir);
    let supervisor = Arc::new(Supervisor::new(
        auth_profiles_dir.clone(),
        config.worker_exec.clone(),
        config.file.base_port,
        config.file.router.auto_restart,
    ));

    let discovered = match supervisor.discover_profiles() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to discover auth profiles");
            return ExitCode::from(2);
        }
    };
    let profiles = merge_account_profiles(discovered, &config.file.accounts, &auth_profiles_dir);

    let overrides = config
        .file
        .accounts
        .iter()
        .map(|a| {
            (
                a.id.clone(),
                supervisor::WorkerConfigOverride {
                    weight: a.weight,
                    enabled: a.enabled,
                    max_concurrent: a.max_concurrent,
                    port: a.port,
                },
            )
        })
        .collect();

    supervisor.warn_on_busy_ports(profiles.len());
    supervisor.reconcile_fleet(&profiles, &overrides).await;

    let enabled_count = supervisor
        .snapshot()
        .await
        .iter()
        .filter(|w| w.enabled)
        .count();
    if enabled_count == 0 {
        error!("no enabled accounts on startup");
        return ExitCode::from(4);
    }

    let snapshot = supervisor.snapshot().await;
    for worker in &snapshot {
        if let Err(e) = supervisor.start_worker(&worker.id).await {
            error!(worker = %worker.id, error = %e, "failed to start worker at launch, will retry via probe sweep");
        }
    }

    let registry = Arc::new(Registry::new(
        config.file.quota.cooldown_seconds,
        config.file.fallbacks.clone(),
    ));

    let router_config = gateway::router_config_from(&config);
    let host = router_config.host.clone();
    let port = router_config.port;
    let state: gateway::AppState = Arc::new(GatewayState::new(
        supervisor.clone(),
        registry,
        router_config,
        auth_profiles_dir,
        Some(PathBuf::from(&config_path)),
    ));

    spawn_probe_loop(supervisor.clone(), config.file.router.health_check_interval);

    let app = gateway::build_router(state);

    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid bind address");
            return ExitCode::from(3);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %addr, "unable to bind public port");
            return ExitCode::from(3);
        }
    };

    info!(%addr, "gateway listening");

    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    if let Err(e) = serve_result {
        error!(error = %e, "server error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn spawn_probe_loop(supervisor: Arc<Supervisor>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            supervisor.run_probe_sweep().await;
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, auth_file: &str) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            auth_file: auth_file.to_string(),
            port: None,
            weight: 1,
            enabled: true,
            max_concurrent: 1,
        }
    }

    #[test]
    fn account_without_discovered_profile_still_gets_one() {
        let dir = PathBuf::from("/nonexistent/auth_profiles");
        let accounts = vec![account("acct-a", "acct-a.json")];
        let merged = merge_account_profiles(Vec::new(), &accounts, &dir);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "acct-a");
        assert_eq!(merged[0].file_path, dir.join("acct-a.json"));
    }

    #[test]
    fn discovered_profile_wins_over_synthesized_duplicate() {
        let dir = PathBuf::from("/auth_profiles");
        let discovered = vec![AuthProfile {
            id: "acct-a".to_string(),
            email: Some("a@example.com".to_string()),
            file_path: dir.join("real_at_example_com.json"),
            last_updated: SystemTime::now(),
            valid: true,
        }];
        let accounts = vec![account("acct-a", "acct-a.json")];
        let merged = merge_account_profiles(discovered, &accounts, &dir);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].file_path, dir.join("real_at_example_com.json"));
    }

    #[test]
    fn absolute_auth_file_path_is_kept_as_is() {
        let dir = PathBuf::from("/auth_profiles");
        let accounts = vec![account("acct-a", "/secrets/acct-a.json")];
        let merged = merge_account_profiles(Vec::new(), &accounts, &dir);
        assert_eq!(merged[0].file_path, PathBuf::from("/secrets/acct-a.json"));
    }

    #[test]
    fn merge_sorts_by_id() {
        let dir = PathBuf::from("/auth_profiles");
        let accounts = vec![account("zebra", "zebra.json"), account("apple", "apple.json")];
        let merged = merge_account_profiles(Vec::new(), &accounts, &dir);
        assert_eq!(merged.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["apple", "zebra"]);
    }
}
