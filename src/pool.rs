//! Server pools: selection, session affinity, health-check scheduling and
//! transactional member swaps for one virtual host.

use crate::affinity::{AffinityStore, StickyConfig, StickyMethod};
use crate::backend::{cookie_value, Backend, BackendStats, HealthStatus};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, COOKIE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use http_body_util::Empty;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors produced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no healthy servers available in pool")]
    NoHealthyServer,
    #[error("server not found in pool")]
    ServerNotFound,
    #[error("new server is taking too long, transaction rolled back")]
    TransactionTimeout,
    #[error("new server is not healthy, transaction rolled back")]
    TransactionUnhealthy,
}

/// Health-check parameters a pool starts with. All of them can be updated
/// at runtime through [`Pool::update`].
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckParams {
    pub interval: Duration,
    pub initial_delay: Duration,
    pub timeout: Duration,
    pub num_ok: u32,
    pub num_fail: u32,
}

/// Partial update of the health-check parameters; `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolUpdate {
    pub interval: Option<Duration>,
    pub initial_delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub num_ok: Option<u32>,
    pub num_fail: Option<u32>,
}

#[derive(Default)]
struct ServerLists {
    conditional: Vec<Arc<Backend>>,
    unconditional: Vec<Arc<Backend>>,
}

impl ServerLists {
    fn iter_all(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.conditional.iter().chain(self.unconditional.iter())
    }

    fn find(&self, id: Uuid) -> Option<&Arc<Backend>> {
        self.iter_all().find(|server| server.id == id)
    }
}

/// A set of upstream servers answering for one hostname.
pub struct Pool {
    pub hostname: String,
    servers: RwLock<ServerLists>,
    interval_secs: AtomicU64,
    initial_delay_secs: AtomicU64,
    timeout_secs: AtomicU64,
    num_ok: AtomicU32,
    num_fail: AtomicU32,
    sticky: Option<StickyConfig>,
    affinity: Arc<AffinityStore>,
    request_counter: AtomicU64,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
}

impl Pool {
    pub fn new(
        hostname: impl Into<String>,
        params: HealthCheckParams,
        sticky: Option<StickyConfig>,
    ) -> Self {
        let ttl = sticky
            .as_ref()
            .map(|s| s.timeout)
            .unwrap_or(Duration::ZERO);

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let probe_client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            hostname: hostname.into(),
            servers: RwLock::new(ServerLists::default()),
            interval_secs: AtomicU64::new(params.interval.as_secs()),
            initial_delay_secs: AtomicU64::new(params.initial_delay.as_secs()),
            timeout_secs: AtomicU64::new(params.timeout.as_secs()),
            num_ok: AtomicU32::new(params.num_ok),
            num_fail: AtomicU32::new(params.num_fail),
            sticky,
            affinity: Arc::new(AffinityStore::new(ttl)),
            request_counter: AtomicU64::new(0),
            probe_client,
        }
    }

    pub fn params(&self) -> HealthCheckParams {
        HealthCheckParams {
            interval: Duration::from_secs(self.interval_secs.load(Ordering::Relaxed)),
            initial_delay: Duration::from_secs(self.initial_delay_secs.load(Ordering::Relaxed)),
            timeout: Duration::from_secs(self.timeout_secs.load(Ordering::Relaxed)),
            num_ok: self.num_ok.load(Ordering::Relaxed),
            num_fail: self.num_fail.load(Ordering::Relaxed),
        }
    }

    pub fn sticky(&self) -> Option<&StickyConfig> {
        self.sticky.as_ref()
    }

    pub fn request_count(&self) -> u64 {
        self.request_counter.load(Ordering::Relaxed)
    }

    /// Apply the non-empty fields of an update. The probe timeout takes
    /// effect on the next probe; the shared client is not rebuilt.
    pub fn update(&self, update: &PoolUpdate) {
        if let Some(interval) = update.interval {
            self.interval_secs.store(interval.as_secs(), Ordering::Relaxed);
        }
        if let Some(initial_delay) = update.initial_delay {
            self.initial_delay_secs
                .store(initial_delay.as_secs(), Ordering::Relaxed);
        }
        if let Some(timeout) = update.timeout {
            self.timeout_secs.store(timeout.as_secs(), Ordering::Relaxed);
        }
        if let Some(num_ok) = update.num_ok {
            self.num_ok.store(num_ok, Ordering::Relaxed);
        }
        if let Some(num_fail) = update.num_fail {
            self.num_fail.store(num_fail, Ordering::Relaxed);
        }
    }

    /// Attach a server. Conditional servers join the scan list, everything
    /// else joins the round-robin list. The sticky method decides which
    /// cookie hooks the server gets.
    pub async fn add_server(&self, mut backend: Backend) -> Arc<Backend> {
        if let Some(sticky) = &self.sticky {
            match sticky.method {
                StickyMethod::LbCookie => backend.set_lb_cookie(&sticky.cookie_name),
                StickyMethod::AppCookie => {
                    let store = Arc::clone(&self.affinity);
                    let backend_id = backend.id;
                    backend.set_app_cookie_interceptor(
                        &sticky.cookie_name,
                        Arc::new(move |value: &str| {
                            store.register(value, backend_id);
                        }),
                    );
                }
                StickyMethod::Ip => {}
            }
        }

        let backend = Arc::new(backend);
        let mut servers = self.servers.write().await;
        if backend.condition.is_some() {
            servers.conditional.push(Arc::clone(&backend));
        } else {
            servers.unconditional.push(Arc::clone(&backend));
        }
        info!(
            pool = %self.hostname,
            server = %backend.id,
            address = %backend.address,
            "server added to pool"
        );
        backend
    }

    /// Detach a server by id from whichever list holds it. Sticky sessions
    /// pointing at it are left to expire.
    pub async fn remove_server(&self, id: Uuid) -> Result<Arc<Backend>, PoolError> {
        let mut servers = self.servers.write().await;
        if let Some(pos) = servers.conditional.iter().position(|s| s.id == id) {
            let removed = servers.conditional.remove(pos);
            info!(pool = %self.hostname, server = %id, "server removed from pool");
            return Ok(removed);
        }
        if let Some(pos) = servers.unconditional.iter().position(|s| s.id == id) {
            let removed = servers.unconditional.remove(pos);
            info!(pool = %self.hostname, server = %id, "server removed from pool");
            return Ok(removed);
        }
        Err(PoolError::ServerNotFound)
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.servers.read().await.find(id).is_some()
    }

    /// Snapshot of both lists in insertion order.
    pub async fn server_snapshot(&self) -> (Vec<Arc<Backend>>, Vec<Arc<Backend>>) {
        let servers = self.servers.read().await;
        (servers.conditional.clone(), servers.unconditional.clone())
    }

    /// Response counters per server, keyed by upstream address.
    pub async fn stats(&self) -> HashMap<String, BackendStats> {
        let servers = self.servers.read().await;
        servers
            .iter_all()
            .map(|server| (server.address.to_string(), server.stats()))
            .collect()
    }

    /// Select a server for a request: affinity hit first, then the
    /// conditional list in insertion order, then round-robin over the
    /// healthy unconditional servers.
    pub async fn choose(
        &self,
        headers: &HeaderMap,
        client_ip: IpAddr,
    ) -> Result<Arc<Backend>, PoolError> {
        if self.sticky.is_some() {
            if let Some(server) = self.sticky_server(headers, client_ip).await {
                if server.status() == HealthStatus::Healthy {
                    debug!(pool = %self.hostname, server = %server.address, "sticky session hit");
                    return Ok(server);
                }
            }
        }

        let counter = self
            .request_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let servers = self.servers.read().await;

        for server in &servers.conditional {
            if server.status() == HealthStatus::Healthy && server.check_condition(headers) {
                self.register_affinity(client_ip, server);
                return Ok(Arc::clone(server));
            }
        }

        let healthy: Vec<&Arc<Backend>> = servers
            .unconditional
            .iter()
            .filter(|server| server.status() == HealthStatus::Healthy)
            .collect();
        if healthy.is_empty() {
            return Err(PoolError::NoHealthyServer);
        }
        let server = healthy[(counter % healthy.len() as u64) as usize];
        self.register_affinity(client_ip, server);
        Ok(Arc::clone(server))
    }

    /// Resolve the affinity key for this request and look up a still-present
    /// server for it. Expiry is handled by the store, existence here.
    async fn sticky_server(&self, headers: &HeaderMap, client_ip: IpAddr) -> Option<Arc<Backend>> {
        let sticky = self.sticky.as_ref()?;
        let key = match sticky.method {
            StickyMethod::Ip => client_ip.to_string(),
            StickyMethod::LbCookie | StickyMethod::AppCookie => headers
                .get(COOKIE)
                .and_then(|v| v.to_str().ok())
                .and_then(|header| cookie_value(header, &sticky.cookie_name))
                .map(str::to_string)?,
        };
        let backend_id = self.affinity.lookup(&key)?;
        let servers = self.servers.read().await;
        servers.find(backend_id).cloned()
    }

    /// Record affinity for a fresh selection. AppCookie sessions are only
    /// created when the upstream response reveals the cookie value, so the
    /// selection path skips them.
    fn register_affinity(&self, client_ip: IpAddr, server: &Arc<Backend>) {
        let Some(sticky) = &self.sticky else {
            return;
        };
        let key = match sticky.method {
            StickyMethod::Ip => client_ip.to_string(),
            StickyMethod::LbCookie => server.id.to_string(),
            StickyMethod::AppCookie => return,
        };
        self.affinity.register(&key, server.id);
    }

    /// Drop expired sticky sessions. Called from the registry's tick.
    pub fn evict_expired_sessions(&self) -> usize {
        if self.sticky.is_some() {
            self.affinity.evict_expired()
        } else {
            0
        }
    }

    #[cfg(test)]
    pub(crate) fn affinity_store(&self) -> &Arc<AffinityStore> {
        &self.affinity
    }

    /// Dispatch probes for every server whose interval has elapsed. The
    /// list lock is released before any probe I/O starts; each probe task
    /// gets a handle to the shared probe client and the parameters current
    /// at dispatch time.
    pub async fn run_health_checks(&self) {
        let params = self.params();
        let due: Vec<Arc<Backend>> = {
            let servers = self.servers.read().await;
            servers
                .iter_all()
                .filter(|server| {
                    server.due_for_probe(params.interval) && server.is_ready(params.initial_delay)
                })
                .cloned()
                .collect()
        };
        for server in due {
            let client = self.probe_client.clone();
            let hostname = self.hostname.clone();
            tokio::spawn(async move {
                probe_server(client, hostname, server, params).await;
            });
        }
    }

    /// Swap a member: add `candidate`, wait for it to pass health checks,
    /// then remove `old_id`. Rolls the candidate back if it does not become
    /// healthy before the deadline.
    ///
    /// A request arriving between the candidate turning healthy and the old
    /// server's removal may still reach the old server; nothing stronger is
    /// promised.
    pub async fn transaction(&self, candidate: Backend, old_id: Uuid) -> Result<(), PoolError> {
        if !self.contains(old_id).await {
            return Err(PoolError::ServerNotFound);
        }

        let candidate = self.add_server(candidate).await;
        let deadline = Instant::now() + self.transaction_deadline();
        loop {
            if candidate.status() != HealthStatus::Pending {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if candidate.status() == HealthStatus::Healthy {
            if let Err(e) = self.remove_server(old_id).await {
                debug!(pool = %self.hostname, server = %old_id, error = %e, "old server already gone");
            }
            info!(
                pool = %self.hostname,
                new = %candidate.id,
                old = %old_id,
                "transaction completed"
            );
            Ok(())
        } else {
            let timed_out = candidate.status() == HealthStatus::Pending;
            let _ = self.remove_server(candidate.id).await;
            warn!(
                pool = %self.hostname,
                candidate = %candidate.id,
                timed_out,
                "transaction rolled back"
            );
            if timed_out {
                Err(PoolError::TransactionTimeout)
            } else {
                Err(PoolError::TransactionUnhealthy)
            }
        }
    }

    /// Deadline for a candidate to leave Pending: the initial delay, plus
    /// twice `num_ok` probe timeouts, plus a second of slack.
    fn transaction_deadline(&self) -> Duration {
        let params = self.params();
        params.initial_delay + params.timeout * (params.num_ok * 2) + Duration::from_secs(1)
    }
}

/// Probe one server: GET address + health-check path, 200 within the pool
/// timeout counts as ok, anything else as a failure.
async fn probe_server(
    client: Client<HttpConnector, Empty<Bytes>>,
    hostname: String,
    server: Arc<Backend>,
    params: HealthCheckParams,
) {
    let ok = match server.address.join(&server.health_check_path) {
        Ok(url) => {
            let request = Request::builder()
                .method(Method::GET)
                .uri(url.as_str())
                .body(Empty::<Bytes>::new());
            match request {
                Ok(request) => {
                    match tokio::time::timeout(params.timeout, client.request(request)).await {
                        Ok(Ok(response)) => response.status() == StatusCode::OK,
                        Ok(Err(e)) => {
                            debug!(pool = %hostname, server = %server.address, error = %e, "probe failed");
                            false
                        }
                        Err(_) => {
                            debug!(pool = %hostname, server = %server.address, "probe timed out");
                            false
                        }
                    }
                }
                Err(e) => {
                    warn!(pool = %hostname, server = %server.address, error = %e, "failed to build probe request");
                    false
                }
            }
        }
        Err(e) => {
            warn!(pool = %hostname, server = %server.address, error = %e, "invalid health check URL");
            false
        }
    };

    match server.record_probe(ok, params.num_ok, params.num_fail) {
        Some(HealthStatus::Healthy) => {
            info!(pool = %hostname, server = %server.address, "server is healthy");
        }
        Some(HealthStatus::Unhealthy) => {
            warn!(pool = %hostname, server = %server.address, "server marked unhealthy");
        }
        _ => {}
    }
    server.touch_checked();
}
