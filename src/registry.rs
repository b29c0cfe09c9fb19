//! Host-to-pool dispatch and the data-plane listener.

use crate::error::{json_error_response, ControlError, ProxyBody, ProxyErrorCode};
use crate::pool::Pool;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Owns every pool and routes data-plane requests to them by hostname.
pub struct Registry {
    bind_addr: SocketAddr,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl Registry {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub async fn add_pool(&self, pool: Pool) -> Result<Arc<Pool>, ControlError> {
        let mut pools = self.pools.write().await;
        if pools.contains_key(&pool.hostname) {
            return Err(ControlError::AlreadyExists(format!(
                "pool already exists for hostname '{}'",
                pool.hostname
            )));
        }
        let pool = Arc::new(pool);
        pools.insert(pool.hostname.clone(), Arc::clone(&pool));
        info!(hostname = %pool.hostname, "pool registered");
        Ok(pool)
    }

    pub async fn get_pool(&self, hostname: &str) -> Result<Arc<Pool>, ControlError> {
        let pools = self.pools.read().await;
        pools
            .get(hostname)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(format!("pool not found for hostname '{hostname}'")))
    }

    pub async fn remove_pool(&self, hostname: &str) -> Result<(), ControlError> {
        let mut pools = self.pools.write().await;
        if pools.remove(hostname).is_none() {
            return Err(ControlError::NotFound(format!(
                "pool not found for hostname '{hostname}'"
            )));
        }
        info!(hostname, "pool removed");
        Ok(())
    }

    pub async fn pool_hostnames(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    pub async fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools.read().await.values().cloned().collect()
    }

    /// Dispatch one data-plane exchange: resolve the pool by Host header,
    /// run selection, delegate to the chosen server's proxy.
    pub async fn serve(&self, req: Request<ProxyBody>, client_ip: IpAddr) -> Response<ProxyBody> {
        let raw_host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host());
        let Some(hostname) = raw_host.and_then(normalize_hostname) else {
            return json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "missing or invalid Host header",
            );
        };

        let pool = {
            let pools = self.pools.read().await;
            pools.get(&hostname).cloned()
        };
        let Some(pool) = pool else {
            debug!(hostname, "no pool for host");
            return json_error_response(ProxyErrorCode::UnknownHost, "unknown or unconfigured host");
        };

        match pool.choose(req.headers(), client_ip).await {
            Ok(server) => server.proxy(req).await,
            Err(e) => {
                warn!(hostname, error = %e, "no server available for request");
                json_error_response(ProxyErrorCode::NoHealthyServer, e.to_string())
            }
        }
    }

    /// Probe scheduler: sweeps every pool once a second for as long as the
    /// proxy runs, and evicts expired sticky sessions along the way.
    pub async fn health_check_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("starting health-check loop");
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let pools: Vec<Arc<Pool>> = self.pools.read().await.values().cloned().collect();
                    for pool in pools {
                        pool.run_health_checks().await;
                        let evicted = pool.evict_expired_sessions();
                        if evicted > 0 {
                            debug!(pool = %pool.hostname, evicted, "expired sticky sessions evicted");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("health-check loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Accept loop for the data plane (HTTP/1.1 and h2c).
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "load balancer listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(registry, stream, addr).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("load balancer shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    registry: Arc<Registry>,
    stream: TcpStream,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        async move {
            let response = registry.serve(req.map(|body| body.boxed()), addr.ip()).await;
            Ok::<_, Infallible>(response)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

    Ok(())
}

/// Strip the port from a Host header or URI authority and validate the
/// remaining hostname.
fn normalize_hostname(raw: &str) -> Option<String> {
    let hostname = raw.split(':').next()?;
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }
    Some(hostname.to_lowercase())
}
