//! Router / Gateway
//!
//! The public HTTP surface: parses the request, selects a worker,
//! enforces concurrency caps, forwards (streaming or buffered), records
//! the outcome, routes around failures, and exposes the operator
//! endpoints.
//!
//! Live, hot-reloadable settings live behind `Arc<RwLock<Arc<...>>>`;
//! the lock is only ever held for the duration of an `Arc::clone`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::{Config, RouterConfig};
use crate::error::GatewayError;
use crate::registry::Registry;
use crate::routing::{self, PickContext, RoundRobinCounter, Strategy};
use crate::supervisor::{Supervisor, WorkerConfigOverride};
use crate::types::{ChatCompletionRequest, WorkerSnapshot, WorkerState};

const RECENT_REQUESTS_CAPACITY: usize = 200;
const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct TrafficEntry {
    request_id: String,
    model: String,
    worker_id: Option<String>,
    status: u16,
    started_at: Instant,
}

struct TrafficLog {
    entries: std::sync::Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(VecDeque::with_capacity(RECENT_REQUESTS_CAPACITY)),
        }
    }

    fn record(&self, entry: TrafficEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= RECENT_REQUESTS_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Gateway state shared across handlers. `runtime` is the
/// atomically-swappable slice replaced wholesale on `/router/reload`.
pub struct GatewayState {
    pub supervisor: Arc<Supervisor>,
    pub registry: Arc<Registry>,
    runtime: RwLock<Arc<RouterConfig>>,
    auth_profiles_dir: std::path::PathBuf,
    /// Path to the on-disk config file, re-read by `/router/reload` to pick
    /// up a changed fallback chain; `None` in tests that build state
    /// without a backing file.
    config_path: Option<std::path::PathBuf>,
    round_robin: RoundRobinCounter,
    traffic: TrafficLog,
    queue_len: AtomicUsize,
    http: reqwest::Client,
    /// CORS origins as configured at startup; fixed for the process
    /// lifetime (unlike `runtime`, `/router/reload` does not touch this —
    /// the middleware stack is built once, before the state is routable).
    cors_allowed_origins: Vec<String>,
}

pub type AppState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(
        supervisor: Arc<Supervisor>,
        registry: Arc<Registry>,
        router_config: RouterConfig,
        auth_profiles_dir: std::path::PathBuf,
        config_path: Option<std::path::PathBuf>,
    ) -> Self {
        let cors_allowed_origins = router_config.cors_allowed_origins.clone();
        Self {
            supervisor,
            registry,
            runtime: RwLock::new(Arc::new(router_config)),
            auth_profiles_dir,
            config_path,
            round_robin: RoundRobinCounter::new(),
            traffic: TrafficLog::new(),
            queue_len: AtomicUsize::new(0),
            http: reqwest::Client::builder()
                .build()
                .expect("building the worker-forwarding HTTP client"),
            cors_allowed_origins,
        }
    }

    async fn config(&self) -> Arc<RouterConfig> {
        self.runtime.read().await.clone()
    }

    async fn replace_config(&self, new: RouterConfig) {
        *self.runtime.write().await = Arc::new(new);
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = {
        let origins: Vec<axum::http::HeaderValue> = state
            .cors_allowed_origins
            .iter()
            .filter_map(|o| match axum::http::HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(origin = %o, error = %e, "ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();

        let allow_origin = if origins.is_empty() {
            AllowOrigin::any()
        } else {
            AllowOrigin::list(origins)
        };
        CorsLayer::new().allow_origin(allow_origin).allow_methods(Any).allow_headers(Any)
    };

    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/router/status", get(router_status))
        .route("/router/health-check", post(router_health_check))
        .route("/router/reload", post(router_reload))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.supervisor.snapshot().await;
    let total = snapshot.len();
    let healthy = snapshot.iter().filter(|w| w.state == WorkerState::Ready || w.state == WorkerState::Busy).count();
    let body = json!({
        "status": if healthy > 0 { "ok" } else { "unhealthy" },
        "instances": { "total": total, "healthy": healthy, "unhealthy": total - healthy },
    });
    let code = if healthy > 0 { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body))
}

async fn list_models(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let snapshot = state.supervisor.snapshot().await;
    let ready = snapshot
        .iter()
        .find(|w| w.enabled && (w.state == WorkerState::Ready || w.state == WorkerState::Busy))
        .ok_or_else(|| GatewayError::NoEligibleWorker("<any>".to_string()))?;

    let url = format!("http://127.0.0.1:{}/v1/models", ready.port);
    let resp = state
        .http
        .get(&url)
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamConnection(e.to_string()))?;
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = resp.bytes().await.map_err(|e| GatewayError::UpstreamConnection(e.to_string()))?;
    Ok((status, body).into_response())
}

/// A worker is eligible for request `r` iff enabled, in a routable
/// state, under its concurrency cap, passes the model allow/deny lists,
/// and the Registry reports the (worker, model) pair available.
fn eligible_workers(snapshot: &[WorkerSnapshot], model: &str, registry: &Registry) -> Vec<WorkerSnapshot> {
    snapshot
        .iter()
        .filter(|w| {
            w.enabled
                && w.state.is_routable_class()
                && w.active_requests < w.max_concurrent
                && !w.model_blacklist.iter().any(|m| m == model)
                && (w.model_whitelist.is_empty() || w.model_whitelist.iter().any(|m| m == model))
                && registry.is_available(&w.id, &model.to_string())
        })
        .cloned()
        .collect()
}

fn client_key(headers: &HeaderMap, client_ip: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    client_ip.map(|s| s.to_string())
}

/// Signal that a worker response indicates quota exhaustion for the
/// effective model: HTTP 429, or a quota-exceeded marker in the body.
fn looks_quota_exceeded(status: StatusCode, body: &[u8]) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let text = String::from_utf8_lossy(body);
    text.to_lowercase().contains("quota_exceeded") || text.to_lowercase().contains("quota exceeded")
}

struct DispatchOutcome {
    status: StatusCode,
    body: Vec<u8>,
    content_type: Option<String>,
}

async fn forward_buffered(http: &reqwest::Client, port: u16, body: &Value) -> Result<DispatchOutcome, GatewayError> {
    let url = format!("http://127.0.0.1:{port}/v1/chat/completions");
    let resp = http
        .post(&url)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GatewayError::UpstreamTimeout
            } else {
                GatewayError::UpstreamConnection(e.to_string())
            }
        })?;
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = resp
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let bytes = resp.bytes().await.map_err(|e| GatewayError::UpstreamConnection(e.to_string()))?;
    Ok(DispatchOutcome {
        status,
        body: bytes.to_vec(),
        content_type,
    })
}

/// Decrements `activeRequests` when dropped, whether the stream finished
/// normally, errored, or the client disconnected mid-stream — the single
/// place §4.3's "decremented when ... the client disconnects" guarantee
/// is enforced.
struct ConcurrencySlot {
    record: Arc<crate::supervisor::WorkerRecord>,
    failed: bool,
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.record.end_request(self.failed);
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<std::net::SocketAddr>,
    Json(raw): Json<Value>,
) -> Result<Response, GatewayError> {
    let request: ChatCompletionRequest = serde_json::from_value(raw).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
    request.validate().map_err(GatewayError::BadRequest)?;

    let request_id = Uuid::new_v4().to_string();
    let config = state.config().await;
    let key = client_key(&headers, Some(&peer.ip().to_string()));
    let original_model = request.model.clone();
    let mut effective_model = request.model.clone();
    let mut attempts_left = config.max_retries + 1;
    let deadline = Instant::now() + Duration::from_secs(config.request_timeout);

    loop {
        let snapshot = state.supervisor.snapshot().await;
        let mut eligible = eligible_workers(&snapshot, &effective_model, &state.registry);

        if eligible.is_empty() {
            if !config.queue_on_saturation {
                return Err(GatewayError::NoEligibleWorker(effective_model));
            }
            if state.queue_len.load(Ordering::SeqCst) >= config.max_queue_length {
                return Err(GatewayError::QueueFull);
            }
            state.queue_len.fetch_add(1, Ordering::SeqCst);
            let wait_result = wait_for_eligible(&state, &effective_model, deadline).await;
            state.queue_len.fetch_sub(1, Ordering::SeqCst);
            match wait_result {
                Some(found) => eligible = found,
                None => return Err(GatewayError::RequestTimeout),
            }
        }

        let ctx = PickContext { client_key: key.as_deref() };
        let Some(worker_id) = routing::pick(config.strategy, &eligible, &ctx, &state.round_robin) else {
            return Err(GatewayError::NoEligibleWorker(effective_model));
        };
        let Some(record) = state.supervisor.record(&worker_id).await else {
            continue;
        };
        let worker_snapshot = eligible.iter().find(|w| w.id == worker_id).unwrap().clone();

        record.begin_request();
        let mut slot = ConcurrencySlot { record: record.clone(), failed: false };

        let body = serde_json::to_value(&ChatCompletionRequest {
            model: effective_model.clone(),
            ..request.clone()
        })
        .expect("serializing an already-validated chat completion request");

        if request.stream {
            match dispatch_streaming(&state, &worker_id, worker_snapshot.port, body, slot, request_id.clone(), &effective_model).await? {
                StreamDispatch::Response(response) => return Ok(response),
                StreamDispatch::QuotaExceeded => {
                    attempts_left = attempts_left.saturating_sub(1);
                    match state.registry.resolve_model(&worker_id, &original_model) {
                        Some(fallback) if attempts_left > 0 => {
                            effective_model = fallback;
                            continue;
                        }
                        _ => return Err(GatewayError::QuotaExceeded(original_model)),
                    }
                }
            }
        }

        match forward_buffered(&state.http, worker_snapshot.port, &body).await {
            Ok(outcome) if looks_quota_exceeded(outcome.status, &outcome.body) => {
                slot.failed = true;
                drop(slot);
                state.registry.mark_quota_exceeded(&worker_id, &effective_model, "upstream reported quota exhaustion");
                attempts_left = attempts_left.saturating_sub(1);
                match state.registry.resolve_model(&worker_id, &original_model) {
                    Some(fallback) if attempts_left > 0 => {
                        effective_model = fallback;
                        continue;
                    }
                    _ => {
                        return Err(GatewayError::QuotaExceeded(original_model));
                    }
                }
            }
            Ok(outcome) => {
                state.traffic.record(TrafficEntry {
                    request_id: request_id.clone(),
                    model: effective_model.clone(),
                    worker_id: Some(worker_id.clone()),
                    status: outcome.status.as_u16(),
                    started_at: Instant::now(),
                });
                let mut response = (
                    outcome.status,
                    outcome.body,
                )
                    .into_response();
                if let Some(ct) = outcome.content_type {
                    if let Ok(value) = axum::http::HeaderValue::from_str(&ct) {
                        response.headers_mut().insert(axum::http::header::CONTENT_TYPE, value);
                    }
                }
                response.headers_mut().insert(
                    "x-request-id",
                    axum::http::HeaderValue::from_str(&request_id).unwrap(),
                );
                return Ok(response);
            }
            Err(e @ (GatewayError::UpstreamTimeout | GatewayError::UpstreamConnection(_))) => {
                slot.failed = true;
                drop(slot);
                attempts_left = attempts_left.saturating_sub(1);
                if attempts_left == 0 || Instant::now() >= deadline {
                    return Err(e);
                }
                continue;
            }
            Err(e) => {
                slot.failed = true;
                return Err(e);
            }
        }
    }
}

/// Poll every second for an eligible worker until `deadline`.
async fn wait_for_eligible(state: &AppState, model: &str, deadline: Instant) -> Option<Vec<WorkerSnapshot>> {
    loop {
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
        let snapshot = state.supervisor.snapshot().await;
        let eligible = eligible_workers(&snapshot, model, &state.registry);
        if !eligible.is_empty() {
            return Some(eligible);
        }
    }
}

/// Outcome of dialing the upstream worker for a `stream=true` request,
/// before any SSE bytes are committed to the client.
enum StreamDispatch {
    Response(Response),
    QuotaExceeded,
}

/// Quota exhaustion is detected from the status line only: the body isn't
/// safe to read without consuming the stream, unlike the buffered path's
/// `looks_quota_exceeded`, which inspects both.
async fn dispatch_streaming(
    state: &AppState,
    worker_id: &str,
    port: u16,
    body: Value,
    mut slot: ConcurrencySlot,
    request_id: String,
    effective_model: &str,
) -> Result<StreamDispatch, GatewayError> {
    let url = format!("http://127.0.0.1:{port}/v1/chat/completions");
    let upstream = match state.http.post(&url).json(&body).send().await {
        Ok(resp) => resp,
        Err(e) => {
            slot.failed = true;
            return Err(GatewayError::UpstreamConnection(e.to_string()));
        }
    };

    if upstream.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        slot.failed = true;
        drop(slot);
        state.registry.mark_quota_exceeded(worker_id, effective_model, "upstream reported quota exhaustion (streaming)");
        return Ok(StreamDispatch::QuotaExceeded);
    }

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let byte_stream = upstream.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));

    // `slot` is moved into the stream so `ConcurrencySlot::drop` fires
    // exactly once the body finishes, errors, or the client disconnects
    // and axum drops the stream early.
    let guarded = GuardedStream { inner: byte_stream, _slot: slot };
    let response = Response::builder()
        .status(status)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header("x-request-id", request_id)
        .body(Body::from_stream(guarded))
        .expect("building a streaming response from a well-formed status/body");
    Ok(StreamDispatch::Response(response))
}

struct GuardedStream<S> {
    inner: S,
    _slot: ConcurrencySlot,
}

impl<S: futures_util::Stream + Unpin> futures_util::Stream for GuardedStream<S> {
    type Item = S::Item;
    fn poll_next(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.inner).poll_next(cx)
    }
}

#[derive(Serialize)]
struct QueueStatus {
    length: usize,
    #[serde(rename = "maxLength")]
    max_length: usize,
}

async fn router_status(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config().await;
    let snapshot = state.supervisor.snapshot().await;
    let quota = state.registry.summary();
    let body = json!({
        "strategy": strategy_name(config.strategy),
        "instances": snapshot,
        "queue": QueueStatus { length: state.queue_len.load(Ordering::SeqCst), max_length: config.max_queue_length },
        "quota": quota,
    });
    Json(body)
}

fn strategy_name(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::RoundRobin => "roundrobin",
        Strategy::Weighted => "weighted",
        Strategy::Hash => "hash",
        Strategy::LeastLoaded => "leastLoaded",
        Strategy::PrimaryFirst => "primaryFirst",
    }
}

async fn router_health_check(State(state): State<AppState>) -> impl IntoResponse {
    state.supervisor.run_probe_sweep().await;
    let snapshot = state.supervisor.snapshot().await;
    Json(json!({ "instances": snapshot }))
}

async fn router_reload(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let profiles = state
        .supervisor
        .discover_profiles()
        .map_err(|e| GatewayError::Config(e.to_string()))?;
    let overrides: HashMap<String, WorkerConfigOverride> = HashMap::new();
    let created = state.supervisor.reconcile_fleet(&profiles, &overrides).await;

    let mut fallbacks_reloaded = false;
    if let Some(path) = &state.config_path {
        let config = Config::load(path)?;
        state.registry.replace_fallbacks(config.file.fallbacks.clone());
        fallbacks_reloaded = true;
    }

    Ok(Json(json!({
        "discovered": profiles.len(),
        "created": created,
        "fallbacksReloaded": fallbacks_reloaded,
    }))
    .into_response())
}

/// Build the gateway's `Config`-sourced settings once at startup.
pub fn router_config_from(config: &Config) -> RouterConfig {
    config.file.router.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkerState;

    fn snap(id: &str, active: u32, max_concurrent: u32, blacklist: Vec<String>, whitelist: Vec<String>) -> WorkerSnapshot {
        WorkerSnapshot {
            id: id.to_string(),
            port: 0,
            weight: 1,
            enabled: true,
            state: WorkerState::Ready,
            active_requests: active,
            max_concurrent,
            total_requests: 0,
            failed_requests: 0,
            last_heartbeat: None,
            restart_count: 0,
            model_whitelist: whitelist,
            model_blacklist: blacklist,
        }
    }

    #[test]
    fn eligibility_filters_saturated_workers() {
        let registry = Registry::new(3600, HashMap::new());
        let workers = vec![snap("a", 1, 1, vec![], vec![]), snap("b", 0, 1, vec![], vec![])];
        let eligible = eligible_workers(&workers, "m", &registry);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "b");
    }

    #[test]
    fn eligibility_respects_blacklist_and_whitelist() {
        let registry = Registry::new(3600, HashMap::new());
        let workers = vec![
            snap("a", 0, 1, vec!["m".to_string()], vec![]),
            snap("b", 0, 1, vec![], vec!["other".to_string()]),
            snap("c", 0, 1, vec![], vec!["m".to_string()]),
        ];
        let eligible = eligible_workers(&workers, "m", &registry);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "c");
    }

    #[test]
    fn eligibility_excludes_quota_exhausted_pair() {
        let registry = Registry::new(3600, HashMap::new());
        registry.mark_quota_exceeded(&"a".to_string(), &"m".to_string(), "429");
        let workers = vec![snap("a", 0, 1, vec![], vec![])];
        assert!(eligible_workers(&workers, "m", &registry).is_empty());
    }

    #[test]
    fn quota_marker_detection_covers_status_and_body() {
        assert!(looks_quota_exceeded(StatusCode::TOO_MANY_REQUESTS, b"{}"));
        assert!(looks_quota_exceeded(StatusCode::OK, b"{\"error\":\"quota_exceeded\"}"));
        assert!(!looks_quota_exceeded(StatusCode::OK, b"{\"ok\":true}"));
    }
}
