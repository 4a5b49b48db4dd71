//! Multi-account scheduling and request-routing gateway — library crate.
//!
//! Re-exports the gateway's modules for integration testing and
//! exposes the core wiring (`Supervisor`, `Registry`, `gateway::GatewayState`)
//! as a library surface distinct from the `acct-gateway` binary.

pub mod config;
pub mod error;
pub mod gateway;
pub mod profile;
pub mod registry;
pub mod routing;
pub mod supervisor;
pub mod types;

#[test]
fn config_and_routing_wire_together() {
    use crate::config::FileConfig;
    use crate::routing::{pick, PickContext, RoundRobinCounter, Strategy};
    use crate::types::{WorkerSnapshot, WorkerState};

    let json = r#"{"accounts":[{"id":"a","authFile":"a.json"}],"router":{"strategy":"leastLoaded"}}"#;
    let file: FileConfig = serde_json::from_str(json).unwrap();
    assert!(matches!(file.router.strategy, Strategy::LeastLoaded));

    let worker = WorkerSnapshot {
        id: "a".to_string(),
        port: 9001,
        weight: 1,
        enabled: true,
        state: WorkerState::Ready,
        active_requests: 0,
        max_concurrent: 1,
        total_requests: 0,
        failed_requests: 0,
        last_heartbeat: None,
        restart_count: 0,
        model_whitelist: vec![],
        model_blacklist: vec![],
    };
    let ctx = PickContext { client_key: None };
    let counter = RoundRobinCounter::new();
    assert_eq!(pick(file.router.strategy, &[worker], &ctx, &counter), Some("a".to_string()));
}

#[test]
fn registry_and_profile_parsing_wire_together() {
    use crate::profile::extract_email_from_filename;
    use crate::registry::Registry;
    use std::collections::HashMap;

    let email = extract_email_from_filename("jane_doe_at_example_com").unwrap();
    assert_eq!(email, "jane.doe@example.com");

    let registry = Registry::new(3600, HashMap::new());
    assert!(registry.is_available(&"worker-1".to_string(), &"gpt".to_string()));
}
