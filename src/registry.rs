//! Quota & Fallback Registry
//!
//! Remembers that a specific (worker, model) pair is currently
//! rate-limited and maps a requested model to viable alternatives.
//! Owned once at startup and shared via `Arc`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::types::{ModelId, WorkerId};

#[derive(Debug, Clone)]
struct ModelAvailability {
    available: bool,
    quota_exceeded_at: Option<u64>,
    error_count: u32,
    last_error_message: Option<String>,
}

impl Default for ModelAvailability {
    fn default() -> Self {
        Self {
            available: true,
            quota_exceeded_at: None,
            error_count: 0,
            last_error_message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelAvailabilitySummary {
    pub available: bool,
    #[serde(rename = "errorCount")]
    pub error_count: u32,
    #[serde(rename = "quotaExceededAt")]
    pub quota_exceeded_at: Option<u64>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-(worker, model) availability state with cooldown, plus a static
/// per-model fallback chain. Single lock protecting the whole map, per
/// single lock protecting the whole map, O(1) amortized per operation.
pub struct Registry {
    cooldown_seconds: u64,
    state: Mutex<HashMap<(WorkerId, ModelId), ModelAvailability>>,
    fallbacks: Mutex<HashMap<ModelId, Vec<ModelId>>>,
}

impl Registry {
    pub fn new(cooldown_seconds: u64, fallbacks: HashMap<ModelId, Vec<ModelId>>) -> Self {
        Self {
            cooldown_seconds,
            state: Mutex::new(HashMap::new()),
            fallbacks: Mutex::new(fallbacks),
        }
    }

    /// Replace the fallback chain wholesale, e.g. on config reload.
    pub fn replace_fallbacks(&self, fallbacks: HashMap<ModelId, Vec<ModelId>>) {
        *self.fallbacks.lock().unwrap() = fallbacks;
    }

    /// Returns the stored availability flag; lazily resets to available if
    /// the cooldown window has elapsed since the quota event.
    pub fn is_available(&self, worker: &WorkerId, model: &ModelId) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.get_mut(&(worker.clone(), model.clone())) else {
            return true;
        };
        if !entry.available {
            if let Some(exceeded_at) = entry.quota_exceeded_at {
                if now_secs().saturating_sub(exceeded_at) >= self.cooldown_seconds {
                    entry.available = true;
                    entry.quota_exceeded_at = None;
                }
            }
        }
        entry.available
    }

    pub fn mark_quota_exceeded(&self, worker: &WorkerId, model: &ModelId, message: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry((worker.clone(), model.clone())).or_default();
        entry.available = false;
        entry.quota_exceeded_at = Some(now_secs());
        entry.error_count += 1;
        entry.last_error_message = Some(message.into());
    }

    /// Returns `requested` if available for `worker`, else walks the
    /// configured fallback chain in order and returns the first available
    /// alternative; `None` if nothing is available.
    pub fn resolve_model(&self, worker: &WorkerId, requested: &ModelId) -> Option<ModelId> {
        if self.is_available(worker, requested) {
            return Some(requested.clone());
        }
        let chain = self.fallbacks.lock().unwrap().get(requested).cloned().unwrap_or_default();
        chain.into_iter().find(|candidate| self.is_available(worker, candidate))
    }

    /// First candidate worker for which `(worker, model)` is available.
    pub fn pick_worker_for_model<'a>(&self, candidates: &'a [WorkerId], model: &ModelId) -> Option<&'a WorkerId> {
        candidates.iter().find(|w| self.is_available(w, model))
    }

    /// Human-readable dump for `/router/status`, keyed by worker then model.
    pub fn summary(&self) -> HashMap<WorkerId, HashMap<ModelId, ModelAvailabilitySummary>> {
        let state = self.state.lock().unwrap();
        let mut out: HashMap<WorkerId, HashMap<ModelId, ModelAvailabilitySummary>> = HashMap::new();
        for ((worker, model), entry) in state.iter() {
            out.entry(worker.clone()).or_default().insert(
                model.clone(),
                ModelAvailabilitySummary {
                    available: entry.available,
                    error_count: entry.error_count,
                    quota_exceeded_at: entry.quota_exceeded_at,
                },
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(s: &str) -> WorkerId {
        s.to_string()
    }
    fn model(s: &str) -> ModelId {
        s.to_string()
    }

    #[test]
    fn unknown_pair_is_available_by_default() {
        let registry = Registry::new(3600, HashMap::new());
        assert!(registry.is_available(&worker("w1"), &model("m1")));
    }

    #[test]
    fn mark_quota_exceeded_makes_pair_unavailable() {
        let registry = Registry::new(3600, HashMap::new());
        registry.mark_quota_exceeded(&worker("w1"), &model("m1"), "429");
        assert!(!registry.is_available(&worker("w1"), &model("m1")));
    }

    #[test]
    fn lazy_reset_after_cooldown() {
        let registry = Registry::new(0, HashMap::new());
        registry.mark_quota_exceeded(&worker("w1"), &model("m1"), "429");
        // cooldown of 0 means the very next read restores availability
        assert!(registry.is_available(&worker("w1"), &model("m1")));
    }

    #[test]
    fn resolve_model_walks_fallback_chain() {
        let mut fallbacks = HashMap::new();
        fallbacks.insert(model("m1"), vec![model("m2"), model("m3")]);
        let registry = Registry::new(3600, fallbacks);

        registry.mark_quota_exceeded(&worker("w1"), &model("m1"), "429");
        assert_eq!(registry.resolve_model(&worker("w1"), &model("m1")), Some(model("m2")));

        registry.mark_quota_exceeded(&worker("w1"), &model("m2"), "429");
        assert_eq!(registry.resolve_model(&worker("w1"), &model("m1")), Some(model("m3")));

        registry.mark_quota_exceeded(&worker("w1"), &model("m3"), "429");
        assert_eq!(registry.resolve_model(&worker("w1"), &model("m1")), None);
    }

    #[test]
    fn pick_worker_for_model_skips_unavailable() {
        let registry = Registry::new(3600, HashMap::new());
        registry.mark_quota_exceeded(&worker("w1"), &model("m1"), "429");
        let candidates = vec![worker("w1"), worker("w2")];
        assert_eq!(registry.pick_worker_for_model(&candidates, &model("m1")), Some(&worker("w2")));
    }
}
