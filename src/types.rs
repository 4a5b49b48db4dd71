//! Shared Type Definitions
//!
//! Types shared across `supervisor`, `registry`, and `gateway`: worker
//! identity and state, auth profiles, and the chat-completion request
//! shape the public endpoint accepts.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub type WorkerId = String;
pub type ModelId = String;

/// A discovered authentication profile, one-to-one with a Worker.
#[derive(Debug, Clone)]
pub struct AuthProfile {
    pub id: String,
    pub email: Option<String>,
    pub file_path: PathBuf,
    pub last_updated: SystemTime,
    pub valid: bool,
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Starting,
    Ready,
    Busy,
    Failed,
    Restarting,
}

impl WorkerState {
    /// Ready and Busy are both dispatchable from the eligibility filter's
    /// point of view; Busy only distinguishes "at capacity" for display.
    pub fn is_routable_class(&self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Busy)
    }
}

/// A point-in-time, read-only view of one worker, as returned by
/// `Supervisor::snapshot` for routing decisions and status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub port: u16,
    pub weight: u32,
    pub enabled: bool,
    pub state: WorkerState,
    #[serde(rename = "activeRequests")]
    pub active_requests: u32,
    #[serde(rename = "maxConcurrent")]
    pub max_concurrent: u32,
    #[serde(rename = "totalRequests")]
    pub total_requests: u64,
    #[serde(rename = "failedRequests")]
    pub failed_requests: u64,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: Option<u64>,
    #[serde(rename = "restartCount")]
    pub restart_count: u32,
    #[serde(default, rename = "modelWhitelist")]
    pub model_whitelist: Vec<ModelId>,
    #[serde(default, rename = "modelBlacklist")]
    pub model_blacklist: Vec<ModelId>,
}

/// Minimal OpenAI-style chat-completion request. Only the fields the
/// Router inspects are typed; everything else travels opaquely inside
/// `extra` and is forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatCompletionRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("messages must be non-empty".to_string());
        }
        if self.model.trim().is_empty() {
            return Err("model must be a non-empty string".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_messages() {
        let req = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![],
            stream: false,
            extra: Default::default(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_request() {
        let req = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![serde_json::json!({"role":"user","content":"hi"})],
            stream: false,
            extra: Default::default(),
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn extra_fields_round_trip() {
        let json = r#"{"model":"m","messages":[],"temperature":0.5,"tools":[]}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.extra.get("temperature").unwrap(), 0.5);
        assert!(req.extra.contains_key("tools"));
    }
}
