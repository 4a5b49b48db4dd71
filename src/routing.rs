//! Routing Strategies
//!
//! One operator-selectable strategy picks a worker from the eligible set
//! for each request, expressed as a single tagged enum with one `pick`
//! arm per variant rather than a class hierarchy.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::WorkerSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[serde(rename = "roundrobin")]
    RoundRobin,
    Weighted,
    Hash,
    #[serde(rename = "leastLoaded")]
    LeastLoaded,
    #[serde(rename = "primaryFirst")]
    PrimaryFirst,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin
    }
}

/// Everything a strategy needs to know about the request being routed,
/// beyond the candidate list itself.
pub struct PickContext<'a> {
    /// Bearer token, else `X-API-Key`, else client IP — used by `Hash`.
    pub client_key: Option<&'a str>,
}

/// Monotonic counter backing `RoundRobin`; owned by the gateway and
/// threaded through so the strategy function stays pure otherwise.
#[derive(Debug, Default)]
pub struct RoundRobinCounter(AtomicU64);

impl RoundRobinCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn next(&self, len: usize) -> usize {
        let idx = self.0.fetch_add(1, Ordering::Relaxed);
        (idx % len as u64) as usize
    }
}

/// 64-bit FNV-1a, used only for the `Hash` strategy's stable client→worker
/// mapping (not a cryptographic property we rely on).
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn least_loaded<'a>(eligible: &'a [WorkerSnapshot]) -> Option<&'a WorkerSnapshot> {
    eligible.iter().min_by(|a, b| {
        let load_a = a.active_requests as f64 / a.max_concurrent.max(1) as f64;
        let load_b = b.active_requests as f64 / b.max_concurrent.max(1) as f64;
        load_a
            .partial_cmp(&load_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.total_requests.cmp(&b.total_requests))
    })
}

/// Select one worker from `eligible` per `strategy`. `eligible` must
/// already have passed the §4.3 eligibility predicate; this function only
/// breaks ties among already-eligible candidates. Returns `None` only
/// when `eligible` is empty.
pub fn pick(
    strategy: Strategy,
    eligible: &[WorkerSnapshot],
    ctx: &PickContext,
    round_robin: &RoundRobinCounter,
) -> Option<String> {
    if eligible.is_empty() {
        return None;
    }

    match strategy {
        Strategy::RoundRobin => {
            let idx = round_robin.next(eligible.len());
            Some(eligible[idx].id.clone())
        }
        Strategy::Weighted => {
            let total_weight: u64 = eligible.iter().map(|w| w.weight as u64).sum();
            if total_weight == 0 {
                return Some(eligible[0].id.clone());
            }
            let mut roll = rand::thread_rng().gen_range(0..total_weight);
            for worker in eligible {
                if roll < worker.weight as u64 {
                    return Some(worker.id.clone());
                }
                roll -= worker.weight as u64;
            }
            Some(eligible.last().unwrap().id.clone())
        }
        Strategy::Hash => {
            let key = ctx.client_key.unwrap_or("anonymous");
            let idx = (fnv1a(key.as_bytes()) % eligible.len() as u64) as usize;
            Some(eligible[idx].id.clone())
        }
        Strategy::LeastLoaded => least_loaded(eligible).map(|w| w.id.clone()),
        Strategy::PrimaryFirst => {
            let mut sorted: Vec<&WorkerSnapshot> = eligible.iter().collect();
            sorted.sort_by(|a, b| a.id.cmp(&b.id));
            let primary = sorted[0];
            let under_80pct =
                (primary.active_requests as f64) < 0.8 * primary.max_concurrent.max(1) as f64;
            if under_80pct {
                Some(primary.id.clone())
            } else {
                least_loaded(eligible).map(|w| w.id.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, weight: u32, active: u32, max_concurrent: u32, total: u64) -> WorkerSnapshot {
        WorkerSnapshot {
            id: id.to_string(),
            port: 0,
            weight,
            enabled: true,
            state: crate::types::WorkerState::Ready,
            active_requests: active,
            max_concurrent,
            total_requests: total,
            failed_requests: 0,
            last_heartbeat: None,
            restart_count: 0,
            model_whitelist: vec![],
            model_blacklist: vec![],
        }
    }

    #[test]
    fn round_robin_cycles_through_all_eligible() {
        let eligible = vec![worker("a", 1, 0, 1, 0), worker("b", 1, 0, 1, 0), worker("c", 1, 0, 1, 0)];
        let ctx = PickContext { client_key: None };
        let counter = RoundRobinCounter::new();
        let picks: Vec<String> = (0..6)
            .map(|_| pick(Strategy::RoundRobin, &eligible, &ctx, &counter).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn weighted_distribution_favors_higher_weight() {
        let eligible = vec![worker("a", 1, 0, 1, 0), worker("b", 2, 0, 1, 0), worker("c", 3, 0, 1, 0)];
        let ctx = PickContext { client_key: None };
        let counter = RoundRobinCounter::new();
        let mut counts = std::collections::HashMap::new();
        for _ in 0..6000 {
            let id = pick(Strategy::Weighted, &eligible, &ctx, &counter).unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }
        let a = counts["a"] as f64;
        let b = counts["b"] as f64;
        let c = counts["c"] as f64;
        assert!((b / a - 2.0).abs() < 0.3);
        assert!((c / a - 3.0).abs() < 0.3);
    }

    #[test]
    fn hash_is_stable_for_same_key() {
        let eligible = vec![worker("a", 1, 0, 1, 0), worker("b", 1, 0, 1, 0), worker("c", 1, 0, 1, 0)];
        let ctx = PickContext {
            client_key: Some("client-42"),
        };
        let counter = RoundRobinCounter::new();
        let first = pick(Strategy::Hash, &eligible, &ctx, &counter);
        let second = pick(Strategy::Hash, &eligible, &ctx, &counter);
        assert_eq!(first, second);
    }

    #[test]
    fn least_loaded_prefers_lowest_ratio_then_fewer_total() {
        let eligible = vec![
            worker("a", 1, 1, 2, 100),
            worker("b", 1, 0, 2, 50),
            worker("c", 1, 0, 2, 10),
        ];
        let ctx = PickContext { client_key: None };
        let counter = RoundRobinCounter::new();
        assert_eq!(pick(Strategy::LeastLoaded, &eligible, &ctx, &counter), Some("c".to_string()));
    }

    #[test]
    fn primary_first_prefers_lexicographically_first_under_80_percent() {
        let eligible = vec![worker("instance_1", 1, 1, 10, 0), worker("instance_2", 1, 0, 10, 0)];
        let ctx = PickContext { client_key: None };
        let counter = RoundRobinCounter::new();
        assert_eq!(
            pick(Strategy::PrimaryFirst, &eligible, &ctx, &counter),
            Some("instance_1".to_string())
        );
    }

    #[test]
    fn primary_first_falls_back_to_least_loaded_over_80_percent() {
        let eligible = vec![worker("instance_1", 1, 9, 10, 0), worker("instance_2", 1, 0, 10, 0)];
        let ctx = PickContext { client_key: None };
        let counter = RoundRobinCounter::new();
        assert_eq!(
            pick(Strategy::PrimaryFirst, &eligible, &ctx, &counter),
            Some("instance_2".to_string())
        );
    }

    #[test]
    fn empty_eligible_returns_none() {
        let ctx = PickContext { client_key: None };
        let counter = RoundRobinCounter::new();
        assert_eq!(pick(Strategy::RoundRobin, &[], &ctx, &counter), None);
    }
}
