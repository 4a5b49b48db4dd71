//! Worker Supervisor
//!
//! Owns the worker set and keeps it consistent with discovered auth
//! profiles and operator overrides: launches worker subprocesses,
//! monitors them, restarts on failure.
//!
//! The subprocess handle is stored in a side table (`WorkerHandle`),
//! separate from the `WorkerRecord` the Router reads, avoiding the
//! cyclic reference the source's dataclass-holds-a-Popen pattern would
//! otherwise require in Rust.

use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::profile;
use crate::types::{AuthProfile, ModelId, WorkerId, WorkerSnapshot, WorkerState};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const GRACE_TIMEOUT: Duration = Duration::from_secs(5);
const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const UNHEALTHY_AFTER_PROBES: u32 = 2;
const MAX_CONSECUTIVE_RESTARTS: u32 = 5;
const RESTART_WINDOW: Duration = Duration::from_secs(600);
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(300);

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Exponential backoff for worker restarts: base 2s, doubling per
/// consecutive restart, capped at 60s, reset after 5 minutes of
/// continuous `Ready`.
#[derive(Debug, Default)]
pub struct RestartBackoff {
    consecutive: u32,
    ready_since: Option<Instant>,
}

impl RestartBackoff {
    pub fn delay(&self) -> Duration {
        let multiplier = 1u32.checked_shl(self.consecutive).unwrap_or(u32::MAX);
        BACKOFF_BASE.saturating_mul(multiplier).min(BACKOFF_CAP)
    }

    pub fn record_restart(&mut self) {
        self.consecutive = self.consecutive.saturating_add(1);
        self.ready_since = None;
    }

    pub fn note_ready(&mut self) {
        let now = Instant::now();
        match self.ready_since {
            None => self.ready_since = Some(now),
            Some(since) if now.duration_since(since) >= BACKOFF_RESET_AFTER => {
                self.consecutive = 0;
            }
            Some(_) => {}
        }
    }

    pub fn note_not_ready(&mut self) {
        self.ready_since = None;
    }
}

struct WorkerInner {
    state: WorkerState,
    weight: u32,
    enabled: bool,
    max_concurrent: u32,
    model_whitelist: Vec<ModelId>,
    model_blacklist: Vec<ModelId>,
    last_heartbeat: Option<u64>,
    last_error: Option<String>,
    auth_profile_id: String,
    auth_file_path: std::path::PathBuf,
    consecutive_probe_failures: u32,
    restart_timestamps: Vec<Instant>,
}

/// Mutable worker state + lock-free counters, owned exclusively by the
/// Supervisor. The Router only ever reads a `WorkerSnapshot` or bumps a
/// counter through the methods below.
pub struct WorkerRecord {
    pub id: WorkerId,
    pub port: u16,
    pub active_requests: AtomicU32,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub restart_count: AtomicU32,
    inner: RwLock<WorkerInner>,
}

impl WorkerRecord {
    pub fn begin_request(&self) {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_request(&self, failed: bool) {
        self.active_requests.fetch_sub(1, Ordering::SeqCst);
        if failed {
            self.failed_requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        let inner = self.inner.read().await;
        WorkerSnapshot {
            id: self.id.clone(),
            port: self.port,
            weight: inner.weight,
            enabled: inner.enabled,
            state: inner.state,
            active_requests: self.active_requests.load(Ordering::SeqCst),
            max_concurrent: inner.max_concurrent,
            total_requests: self.total_requests.load(Ordering::SeqCst),
            failed_requests: self.failed_requests.load(Ordering::SeqCst),
            last_heartbeat: inner.last_heartbeat,
            restart_count: self.restart_count.load(Ordering::SeqCst),
            model_whitelist: inner.model_whitelist.clone(),
            model_blacklist: inner.model_blacklist.clone(),
        }
    }

    pub async fn state(&self) -> WorkerState {
        self.inner.read().await.state
    }
}

/// Subprocess handle + backoff state, kept out of `WorkerRecord` per the
/// cyclic-reference note above.
struct WorkerHandle {
    child: Child,
    pid: u32,
    log_tasks: Vec<JoinHandle<()>>,
}

pub struct WorkerConfigOverride {
    pub weight: u32,
    pub enabled: bool,
    pub max_concurrent: u32,
    pub port: Option<u16>,
}

pub struct Supervisor {
    auth_profiles_dir: std::path::PathBuf,
    worker_exec: String,
    base_port: u16,
    auto_restart: bool,
    http: reqwest::Client,
    workers: RwLock<HashMap<WorkerId, Arc<WorkerRecord>>>,
    handles: tokio::sync::Mutex<HashMap<WorkerId, WorkerHandle>>,
    backoffs: tokio::sync::Mutex<HashMap<WorkerId, RestartBackoff>>,
}

impl Supervisor {
    pub fn new(auth_profiles_dir: std::path::PathBuf, worker_exec: String, base_port: u16, auto_restart: bool) -> Self {
        Self {
            auth_profiles_dir,
            worker_exec,
            base_port,
            auto_restart,
            http: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("building the worker-probe HTTP client"),
            workers: RwLock::new(HashMap::new()),
            handles: tokio::sync::Mutex::new(HashMap::new()),
            backoffs: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn discover_profiles(&self) -> Result<Vec<AuthProfile>, GatewayError> {
        profile::discover_profiles(&self.auth_profiles_dir)
    }

    /// Reconcile the worker set against `profiles` (directory-scan results,
    /// statically-configured accounts, or both merged by the caller).
    /// Idempotent: calling this twice in a row with unchanged profiles
    /// leaves existing workers' runtime state untouched.
    pub async fn reconcile_fleet(
        &self,
        profiles: &[AuthProfile],
        overrides: &HashMap<String, WorkerConfigOverride>,
    ) -> Vec<WorkerId> {
        let mut workers = self.workers.write().await;
        let mut seen = std::collections::HashSet::new();
        let mut created = Vec::new();

        for (index, p) in profiles.iter().enumerate() {
            seen.insert(p.id.clone());
            if workers.contains_key(&p.id) {
                continue;
            }
            let ovr = overrides.get(&p.id);
            let port = ovr.and_then(|o| o.port).unwrap_or(self.base_port + index as u16);
            let record = Arc::new(WorkerRecord {
                id: p.id.clone(),
                port,
                active_requests: AtomicU32::new(0),
                total_requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
                restart_count: AtomicU32::new(0),
                inner: RwLock::new(WorkerInner {
                    state: WorkerState::Stopped,
                    weight: ovr.map(|o| o.weight).unwrap_or(1),
                    enabled: ovr.map(|o| o.enabled).unwrap_or(true),
                    max_concurrent: ovr.map(|o| o.max_concurrent).unwrap_or(1),
                    model_whitelist: Vec::new(),
                    model_blacklist: Vec::new(),
                    last_heartbeat: None,
                    last_error: None,
                    auth_profile_id: p.id.clone(),
                    auth_file_path: p.file_path.clone(),
                    consecutive_probe_failures: 0,
                    restart_timestamps: Vec::new(),
                }),
            });
            workers.insert(p.id.clone(), record);
            created.push(p.id.clone());
        }

        // Workers whose profile disappeared: remove if idle, else drain
        // (disable and leave running until `active_requests` hits 0).
        let stale: Vec<WorkerId> = {
            let mut stale = Vec::new();
            for (id, record) in workers.iter() {
                if !seen.contains(id) {
                    stale.push(id.clone());
                    if record.active_requests.load(Ordering::SeqCst) == 0 {
                        continue;
                    }
                    record.inner.write().await.enabled = false;
                }
            }
            stale
        };
        for id in stale {
            let idle = workers
                .get(&id)
                .map(|r| r.active_requests.load(Ordering::SeqCst) == 0)
                .unwrap_or(true);
            if idle {
                workers.remove(&id);
            }
        }

        created
    }

    fn port_in_use(port: u16) -> bool {
        StdTcpListener::bind(("0.0.0.0", port)).is_err()
    }

    /// Best-effort reclaim of ports from a prior instance of this program.
    /// We can't attribute ownership without a process walk, so this only
    /// logs ports that are unexpectedly busy before any worker of ours has
    /// started — an operator signal, not an automatic kill.
    pub fn warn_on_busy_ports(&self, profile_count: usize) {
        for i in 0..profile_count {
            let port = self.base_port + i as u16;
            if Self::port_in_use(port) {
                tracing::warn!(port, "port already in use at startup; a stale process may be holding it");
            }
        }
    }

    pub async fn start_worker(&self, id: &WorkerId) -> Result<(), GatewayError> {
        let record = {
            let workers = self.workers.read().await;
            workers.get(id).cloned().ok_or_else(|| GatewayError::UnknownWorker(id.clone()))?
        };

        if Self::port_in_use(record.port) {
            return Err(GatewayError::PortInUse(record.port));
        }

        record.inner.write().await.state = WorkerState::Starting;

        let auth_path = record.inner.read().await.auth_file_path.clone();
        let mut child = Command::new(&self.worker_exec)
            .arg("--auth")
            .arg(&auth_path)
            .arg("--port")
            .arg(record.port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Launch(e.to_string()))?;

        let pid = child.id().ok_or_else(|| GatewayError::Launch("subprocess exited immediately".to_string()))?;

        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(spawn_log_drain(id.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(spawn_log_drain(id.clone(), "stderr", stderr));
        }

        {
            let mut handles = self.handles.lock().await;
            handles.insert(id.clone(), WorkerHandle { child, pid, log_tasks });
        }

        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            if self.probe(id).await.is_ok() {
                let mut inner = record.inner.write().await;
                inner.state = WorkerState::Ready;
                return Ok(());
            }
            if Instant::now() >= deadline {
                record.inner.write().await.state = WorkerState::Failed;
                return Err(GatewayError::Launch(format!("worker {id} did not become healthy before startup timeout")));
            }
            if let Some(handle) = self.handles.lock().await.get_mut(id) {
                if let Ok(Some(_)) = handle.child.try_wait() {
                    record.inner.write().await.state = WorkerState::Failed;
                    return Err(GatewayError::Launch(format!("worker {id} exited before first successful probe")));
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn stop_worker(&self, id: &WorkerId, graceful: bool) -> Result<(), GatewayError> {
        let record = {
            let workers = self.workers.read().await;
            workers.get(id).cloned().ok_or_else(|| GatewayError::UnknownWorker(id.clone()))?
        };
        record.inner.write().await.state = WorkerState::Restarting;

        let mut handles = self.handles.lock().await;
        let Some(handle) = handles.get_mut(id) else {
            record.inner.write().await.state = WorkerState::Stopped;
            return Ok(());
        };

        if graceful {
            #[cfg(unix)]
            {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(handle.pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            let exited = tokio::time::timeout(GRACE_TIMEOUT, handle.child.wait()).await;
            if exited.is_err() {
                let _ = handle.child.start_kill();
                let _ = handle.child.wait().await;
            }
        } else {
            let _ = handle.child.start_kill();
            let _ = handle.child.wait().await;
        }
        for task in handle.log_tasks.drain(..) {
            task.abort();
        }
        handles.remove(id);
        drop(handles);

        let port = record.port;
        let deadline = Instant::now() + PORT_RELEASE_TIMEOUT;
        while Self::port_in_use(port) {
            if Instant::now() >= deadline {
                return Err(GatewayError::PortStuck(port));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        record.inner.write().await.state = WorkerState::Stopped;
        Ok(())
    }

    /// `StopWorker(true) -> StartWorker`, honoring exponential backoff and
    /// the permanent-failure threshold.
    pub async fn restart_worker(&self, id: &WorkerId) -> Result<(), GatewayError> {
        let record = {
            let workers = self.workers.read().await;
            workers.get(id).cloned().ok_or_else(|| GatewayError::UnknownWorker(id.clone()))?
        };

        {
            let mut inner = record.inner.write().await;
            let now = Instant::now();
            inner.restart_timestamps.retain(|t| now.duration_since(*t) < RESTART_WINDOW);
            inner.restart_timestamps.push(now);
            if inner.restart_timestamps.len() as u32 > MAX_CONSECUTIVE_RESTARTS {
                inner.state = WorkerState::Failed;
                inner.last_error = Some("exceeded max consecutive restarts; operator reset required".to_string());
                return Err(GatewayError::Launch(format!("worker {id} exceeded restart budget")));
            }
        }

        let delay = {
            let mut backoffs = self.backoffs.lock().await;
            let backoff = backoffs.entry(id.clone()).or_default();
            backoff.record_restart();
            backoff.delay()
        };

        let _ = self.stop_worker(id, true).await;
        tokio::time::sleep(delay).await;
        record.restart_count.fetch_add(1, Ordering::SeqCst);
        self.start_worker(id).await
    }

    /// `GET /health` on the worker's port with a 5s timeout. Updates
    /// `last_heartbeat` on success and transitions to `Failed` after
    /// `unhealthyAfter` (2x probe interval) consecutive misses
    /// 
    pub async fn probe(&self, id: &WorkerId) -> Result<(), GatewayError> {
        let record = {
            let workers = self.workers.read().await;
            workers.get(id).cloned().ok_or_else(|| GatewayError::UnknownWorker(id.clone()))?
        };

        let url = format!("http://127.0.0.1:{}/health", record.port);
        let result = self.http.get(&url).send().await;

        let mut inner = record.inner.write().await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                inner.last_heartbeat = Some(now_secs());
                inner.consecutive_probe_failures = 0;
                if inner.state != WorkerState::Failed {
                    inner.state = WorkerState::Ready;
                }
                self.backoffs.lock().await.entry(id.clone()).or_default().note_ready();
                Ok(())
            }
            _ => {
                inner.consecutive_probe_failures += 1;
                self.backoffs.lock().await.entry(id.clone()).or_default().note_not_ready();
                if inner.consecutive_probe_failures >= UNHEALTHY_AFTER_PROBES {
                    inner.state = WorkerState::Failed;
                }
                Err(GatewayError::UpstreamConnection(format!("probe failed for {id}")))
            }
        }
    }

    /// Periodic liveness sweep over every worker. Runs as the single
    /// long-lived supervisor task; triggers `autoRestart`
    /// when a worker has transitioned to `Failed`.
    pub async fn run_probe_sweep(&self) {
        let ids: Vec<WorkerId> = self.workers.read().await.keys().cloned().collect();
        for id in ids {
            let was_failed = {
                let workers = self.workers.read().await;
                match workers.get(&id) {
                    Some(r) => r.state().await == WorkerState::Failed,
                    None => continue,
                }
            };
            let _ = self.probe(&id).await;
            if self.auto_restart && !was_failed {
                let now_failed = {
                    let workers = self.workers.read().await;
                    match workers.get(&id) {
                        Some(r) => r.state().await == WorkerState::Failed,
                        None => continue,
                    }
                };
                if now_failed {
                    tracing::warn!(worker = %id, "worker transitioned to failed, attempting restart");
                    if let Err(e) = self.restart_worker(&id).await {
                        tracing::error!(worker = %id, error = %e, "restart attempt failed");
                    }
                }
            }
        }
    }

    pub async fn record(&self, id: &WorkerId) -> Option<Arc<WorkerRecord>> {
        self.workers.read().await.get(id).cloned()
    }

    /// Immutable read model consumed by the Router for dispatch decisions.
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.read().await;
        let mut out = Vec::with_capacity(workers.len());
        for record in workers.values() {
            out.push(record.snapshot().await);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

/// Test-only worker injection: lets the gateway's scenario tests stand up
/// a `WorkerRecord` pointed at a mock HTTP server without going through
/// `start_worker`'s real subprocess spawn.
#[cfg(test)]
impl Supervisor {
    pub(crate) async fn install_test_worker(&self, id: &str, port: u16, weight: u32, max_concurrent: u32) {
        let record = Arc::new(WorkerRecord {
            id: id.to_string(),
            port,
            active_requests: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            restart_count: AtomicU32::new(0),
            inner: RwLock::new(WorkerInner {
                state: WorkerState::Ready,
                weight,
                enabled: true,
                max_concurrent,
                model_whitelist: Vec::new(),
                model_blacklist: Vec::new(),
                last_heartbeat: Some(now_secs()),
                last_error: None,
                auth_profile_id: id.to_string(),
                auth_file_path: std::path::PathBuf::new(),
                consecutive_probe_failures: 0,
                restart_timestamps: Vec::new(),
            }),
        });
        self.workers.write().await.insert(id.to_string(), record);
    }

    pub(crate) async fn set_test_worker_state(&self, id: &str, state: WorkerState) {
        if let Some(record) = self.workers.read().await.get(id) {
            record.inner.write().await.state = state;
        }
    }
}

fn spawn_log_drain<R>(worker_id: WorkerId, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::info!(worker = %worker_id, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker = %worker_id, stream, error = %e, "log stream read error");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = RestartBackoff::default();
        assert_eq!(b.delay(), Duration::from_secs(2));
        b.record_restart();
        assert_eq!(b.delay(), Duration::from_secs(4));
        b.record_restart();
        assert_eq!(b.delay(), Duration::from_secs(8));
        for _ in 0..10 {
            b.record_restart();
        }
        assert_eq!(b.delay(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn reconcile_fleet_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("gateway-supervisor-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a_at_example_com.json"), "{}").unwrap();
        std::fs::write(dir.join("b_at_example_com.json"), "{}").unwrap();

        let supervisor = Supervisor::new(dir.clone(), "worker".to_string(), 9001, true);
        let profiles = supervisor.discover_profiles().unwrap();
        let overrides = HashMap::new();

        let created_first = supervisor.reconcile_fleet(&profiles, &overrides).await;
        assert_eq!(created_first.len(), 2);

        let record = supervisor.record(&profiles[0].id).await.unwrap();
        record.total_requests.fetch_add(7, Ordering::SeqCst);

        let created_second = supervisor.reconcile_fleet(&profiles, &overrides).await;
        assert!(created_second.is_empty());

        let record_after = supervisor.record(&profiles[0].id).await.unwrap();
        assert_eq!(record_after.total_requests.load(Ordering::SeqCst), 7);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn snapshot_reflects_assigned_ports_in_profile_order() {
        let dir = std::env::temp_dir().join(format!("gateway-supervisor-ports-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a_at_example_com.json"), "{}").unwrap();
        std::fs::write(dir.join("b_at_example_com.json"), "{}").unwrap();

        let supervisor = Supervisor::new(dir.clone(), "worker".to_string(), 9101, true);
        let profiles = supervisor.discover_profiles().unwrap();
        supervisor.reconcile_fleet(&profiles, &HashMap::new()).await;

        let snapshot = supervisor.snapshot().await;
        let ports: Vec<u16> = snapshot.iter().map(|w| w.port).collect();
        assert_eq!(ports, vec![9101, 9102]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
