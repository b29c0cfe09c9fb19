//! Control-plane HTTP API: pool and server management over JSON.
//!
//! Hostnames travel base64url-encoded (unpadded) in URL paths. Every
//! mutating operation triggers a configuration save; transactions save on
//! completion.

use crate::auth::RequestVerifier;
use crate::backend::{Backend, BackendStats, Condition};
use crate::config::SaveHandle;
use crate::error::{control_error_response, empty_body, full_body, ControlError, ProxyBody};
use crate::pool::{HealthCheckParams, Pool, PoolUpdate};
use crate::registry::Registry;
use crate::VERSION;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListPoolsResponse {
    pub pools: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerHostResponse {
    pub id: Uuid,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    pub status: String,
    pub health_check_path: String,
}

impl ServerHostResponse {
    fn from_backend(backend: &Backend) -> Self {
        Self {
            id: backend.id,
            address: backend.address.to_string(),
            condition: backend.condition.clone(),
            status: backend.status().to_string(),
            health_check_path: backend.health_check_path.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolResponse {
    pub hostname: String,
    pub health_check_interval: u64,
    pub health_check_initial_delay: u64,
    pub health_check_timeout: u64,
    pub health_check_num_ok: u32,
    pub health_check_num_fail: u32,
    pub conditional_servers: Vec<ServerHostResponse>,
    pub unconditional_servers: Vec<ServerHostResponse>,
    pub sticky_sessions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_method: Option<String>,
    #[serde(default)]
    pub sticky_session_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_cookie_name: Option<String>,
    pub request_counter: u64,
}

impl PoolResponse {
    pub async fn from_pool(pool: &Pool) -> Self {
        let params = pool.params();
        let (conditional, unconditional) = pool.server_snapshot().await;
        Self {
            hostname: pool.hostname.clone(),
            health_check_interval: params.interval.as_secs(),
            health_check_initial_delay: params.initial_delay.as_secs(),
            health_check_timeout: params.timeout.as_secs(),
            health_check_num_ok: params.num_ok,
            health_check_num_fail: params.num_fail,
            conditional_servers: conditional
                .iter()
                .map(|s| ServerHostResponse::from_backend(s))
                .collect(),
            unconditional_servers: unconditional
                .iter()
                .map(|s| ServerHostResponse::from_backend(s))
                .collect(),
            sticky_sessions: pool.sticky().is_some(),
            sticky_method: pool.sticky().map(|s| s.method.to_string()),
            sticky_session_timeout: pool.sticky().map(|s| s.timeout.as_secs()).unwrap_or(0),
            sticky_cookie_name: pool.sticky().map(|s| s.cookie_name.clone()),
            request_counter: pool.request_count(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolStatsResponse {
    pub stats: HashMap<String, BackendStats>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub transaction_id: Uuid,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatePoolRequest {
    pub hostname: String,
    pub health_check_interval: u64,
    pub health_check_initial_delay: u64,
    pub health_check_timeout: u64,
    pub health_check_num_ok: u32,
    pub health_check_num_fail: u32,
    #[serde(default)]
    pub sticky_sessions: bool,
    #[serde(default)]
    pub sticky_method: String,
    #[serde(default)]
    pub sticky_session_timeout: u64,
    #[serde(default)]
    pub sticky_session_cookie_name: String,
}

impl CreatePoolRequest {
    pub fn validate(&self) -> Result<Pool, ControlError> {
        if self.hostname.is_empty() {
            return Err(ControlError::Validation("hostname is required".to_string()));
        }
        for (field, value) in [
            ("health_check_interval", self.health_check_interval),
            ("health_check_initial_delay", self.health_check_initial_delay),
            ("health_check_timeout", self.health_check_timeout),
            ("health_check_num_ok", self.health_check_num_ok as u64),
            ("health_check_num_fail", self.health_check_num_fail as u64),
        ] {
            if value == 0 {
                return Err(ControlError::Validation(format!(
                    "{field} must be greater than 0"
                )));
            }
        }

        let sticky = if self.sticky_sessions {
            let cookie_name = if self.sticky_session_cookie_name.is_empty() {
                None
            } else {
                Some(self.sticky_session_cookie_name.as_str())
            };
            Some(crate::affinity::StickyConfig::build(
                &self.sticky_method,
                self.sticky_session_timeout,
                cookie_name,
            )?)
        } else {
            None
        };

        Ok(Pool::new(
            self.hostname.clone(),
            HealthCheckParams {
                interval: Duration::from_secs(self.health_check_interval),
                initial_delay: Duration::from_secs(self.health_check_initial_delay),
                timeout: Duration::from_secs(self.health_check_timeout),
                num_ok: self.health_check_num_ok,
                num_fail: self.health_check_num_fail,
            },
            sticky,
        ))
    }
}

/// Partial update; zero fields are left untouched.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdatePoolRequest {
    #[serde(default)]
    pub health_check_interval: u64,
    #[serde(default)]
    pub health_check_initial_delay: u64,
    #[serde(default)]
    pub health_check_timeout: u64,
    #[serde(default)]
    pub health_check_num_ok: u32,
    #[serde(default)]
    pub health_check_num_fail: u32,
}

impl UpdatePoolRequest {
    pub fn to_update(&self) -> PoolUpdate {
        fn secs(value: u64) -> Option<Duration> {
            (value != 0).then(|| Duration::from_secs(value))
        }
        PoolUpdate {
            interval: secs(self.health_check_interval),
            initial_delay: secs(self.health_check_initial_delay),
            timeout: secs(self.health_check_timeout),
            num_ok: (self.health_check_num_ok != 0).then_some(self.health_check_num_ok),
            num_fail: (self.health_check_num_fail != 0).then_some(self.health_check_num_fail),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddServerRequest {
    pub new_server_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    pub health_check_path: String,
}

/// An all-empty condition is treated as absent; a half-empty one is an
/// error.
fn normalize_condition(condition: Option<Condition>) -> Result<Option<Condition>, ControlError> {
    match condition {
        None => Ok(None),
        Some(condition) if condition.header.is_empty() && condition.value.is_empty() => Ok(None),
        Some(condition) => {
            condition.validate()?;
            Ok(Some(condition))
        }
    }
}

impl AddServerRequest {
    pub fn validate(&self) -> Result<Backend, ControlError> {
        if self.health_check_path.is_empty() {
            return Err(ControlError::Validation(
                "health_check_path is required".to_string(),
            ));
        }
        let condition = normalize_condition(self.condition.clone())?;
        Backend::new(&self.new_server_address, &self.health_check_path, condition)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub new_server_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_server_condition: Option<Condition>,
    pub new_server_health_check_path: String,
    pub old_server_id: String,
}

impl TransactionRequest {
    pub fn validate(&self) -> Result<(Backend, Uuid), ControlError> {
        if self.new_server_health_check_path.is_empty() {
            return Err(ControlError::Validation(
                "new_server_health_check_path is required".to_string(),
            ));
        }
        let condition = normalize_condition(self.new_server_condition.clone())?;
        let backend = Backend::new(
            &self.new_server_address,
            &self.new_server_health_check_path,
            condition,
        )?;
        let old_id = Uuid::parse_str(&self.old_server_id)
            .map_err(|_| ControlError::InvalidEncoding("invalid old server ID".to_string()))?;
        Ok((backend, old_id))
    }
}

#[derive(Debug, Clone)]
struct TransactionRecord {
    completed: bool,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// The management API server.
pub struct ApiServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    save: SaveHandle,
    verifier: Option<RequestVerifier>,
    transactions: Arc<DashMap<Uuid, TransactionRecord>>,
}

fn decode_hostname(encoded: &str) -> Result<String, ControlError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| ControlError::InvalidEncoding("invalid hostname encoding".to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| ControlError::InvalidEncoding("invalid hostname encoding".to_string()))
}

/// Encode a hostname the way the API expects it in URL paths.
pub fn encode_hostname(hostname: &str) -> String {
    URL_SAFE_NO_PAD.encode(hostname)
}

fn json_response<T: Serialize>(value: &T) -> Response<ProxyBody> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .expect("valid response with static headers")
}

fn ok_empty() -> Response<ProxyBody> {
    Response::new(empty_body())
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, ControlError> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ControlError::Validation(format!("failed to read request body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| ControlError::Validation(e.to_string()))
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        save: SaveHandle,
        verifier: Option<RequestVerifier>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            save,
            verifier,
            transactions: Arc::new(DashMap::new()),
        }
    }

    /// Accept loop for the management plane.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, auth = self.verifier.is_some(), "management API listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(api, stream).await {
                                    debug!(addr = %addr, error = %e, "management connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept management connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("management API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if let Some(verifier) = &self.verifier {
            let authorized = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(|header| verifier.verify(header).is_ok())
                .unwrap_or(false);
            if !authorized {
                return control_error_response(&ControlError::Unauthorized);
            }
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let result = self.route(&method, &segments, req).await;
        match result {
            Ok(response) => response,
            Err(e) => control_error_response(&e),
        }
    }

    async fn route(
        &self,
        method: &Method,
        segments: &[&str],
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ControlError> {
        match (method, segments) {
            (&Method::GET, ["version"]) => Ok(json_response(&VersionResponse {
                version: VERSION.to_string(),
            })),
            (&Method::GET, ["pools"]) => Ok(self.list_pools().await),
            (&Method::POST, ["pools"]) => {
                let body = read_json(req).await?;
                self.create_pool(body).await
            }
            (&Method::GET, ["pools", "transaction", id]) => self.get_transaction(id),
            (&Method::GET, ["pools", host]) => self.get_pool(&decode_hostname(host)?).await,
            (&Method::POST, ["pools", host]) => {
                let hostname = decode_hostname(host)?;
                let body = read_json(req).await?;
                self.update_pool(&hostname, body).await
            }
            (&Method::DELETE, ["pools", host]) => self.delete_pool(&decode_hostname(host)?).await,
            (&Method::GET, ["pools", host, "stats"]) => {
                self.pool_stats(&decode_hostname(host)?).await
            }
            (&Method::POST, ["pools", host, "server"]) => {
                let hostname = decode_hostname(host)?;
                let body = read_json(req).await?;
                self.add_server(&hostname, body).await
            }
            (&Method::POST, ["pools", host, "transaction"]) => {
                let hostname = decode_hostname(host)?;
                let body = read_json(req).await?;
                self.add_transaction(&hostname, body).await
            }
            (&Method::DELETE, ["pools", host, server]) => {
                self.remove_server(&decode_hostname(host)?, server).await
            }
            _ => Err(ControlError::NotFound("unknown route".to_string())),
        }
    }

    async fn list_pools(&self) -> Response<ProxyBody> {
        let mut pools = self.registry.pool_hostnames().await;
        pools.sort();
        json_response(&ListPoolsResponse { pools })
    }

    async fn create_pool(&self, req: CreatePoolRequest) -> Result<Response<ProxyBody>, ControlError> {
        let pool = req.validate()?;
        self.registry.add_pool(pool).await?;
        self.save.trigger();
        Ok(ok_empty())
    }

    async fn delete_pool(&self, hostname: &str) -> Result<Response<ProxyBody>, ControlError> {
        self.registry.remove_pool(hostname).await?;
        self.save.trigger();
        Ok(ok_empty())
    }

    async fn get_pool(&self, hostname: &str) -> Result<Response<ProxyBody>, ControlError> {
        let pool = self.registry.get_pool(hostname).await?;
        Ok(json_response(&PoolResponse::from_pool(&pool).await))
    }

    async fn pool_stats(&self, hostname: &str) -> Result<Response<ProxyBody>, ControlError> {
        let pool = self.registry.get_pool(hostname).await?;
        Ok(json_response(&PoolStatsResponse {
            stats: pool.stats().await,
        }))
    }

    async fn update_pool(
        &self,
        hostname: &str,
        req: UpdatePoolRequest,
    ) -> Result<Response<ProxyBody>, ControlError> {
        let pool = self.registry.get_pool(hostname).await?;
        pool.update(&req.to_update());
        self.save.trigger();
        Ok(ok_empty())
    }

    async fn add_server(
        &self,
        hostname: &str,
        req: AddServerRequest,
    ) -> Result<Response<ProxyBody>, ControlError> {
        let pool = self.registry.get_pool(hostname).await?;
        let backend = req.validate()?;
        pool.add_server(backend).await;
        self.save.trigger();
        Ok(ok_empty())
    }

    async fn remove_server(
        &self,
        hostname: &str,
        server_id: &str,
    ) -> Result<Response<ProxyBody>, ControlError> {
        let pool = self.registry.get_pool(hostname).await?;
        let server_id = Uuid::parse_str(server_id)
            .map_err(|_| ControlError::InvalidEncoding("invalid server ID".to_string()))?;
        pool.remove_server(server_id)
            .await
            .map_err(|e| ControlError::NotFound(e.to_string()))?;
        self.save.trigger();
        Ok(ok_empty())
    }

    /// Start an asynchronous member swap and answer immediately with the
    /// transaction id; completion is reported by `get_transaction`.
    async fn add_transaction(
        &self,
        hostname: &str,
        req: TransactionRequest,
    ) -> Result<Response<ProxyBody>, ControlError> {
        let pool = self.registry.get_pool(hostname).await?;
        let (candidate, old_id) = req.validate()?;

        let transaction_id = Uuid::new_v4();
        self.transactions.insert(
            transaction_id,
            TransactionRecord {
                completed: false,
                created_at: Utc::now(),
                completed_at: None,
                error: None,
            },
        );

        let transactions = Arc::clone(&self.transactions);
        let save = self.save.clone();
        tokio::spawn(async move {
            let result = pool.transaction(candidate, old_id).await;
            if let Some(mut record) = transactions.get_mut(&transaction_id) {
                let now = Utc::now();
                record.completed = true;
                record.completed_at = Some(now);
                if let Err(e) = result {
                    record.error = Some(e.to_string());
                }
                info!(
                    transaction = %transaction_id,
                    elapsed_ms = (now - record.created_at).num_milliseconds(),
                    ok = record.error.is_none(),
                    "transaction finished"
                );
            }
            save.trigger();
        });

        Ok(json_response(&TransactionResponse {
            transaction_id,
            completed: false,
            completed_at: None,
            error: None,
        }))
    }

    fn get_transaction(&self, id: &str) -> Result<Response<ProxyBody>, ControlError> {
        let transaction_id = Uuid::parse_str(id)
            .map_err(|_| ControlError::InvalidEncoding("invalid transaction ID".to_string()))?;
        let record = self
            .transactions
            .get(&transaction_id)
            .ok_or_else(|| ControlError::NotFound("transaction not found".to_string()))?;
        Ok(json_response(&TransactionResponse {
            transaction_id,
            completed: record.completed,
            completed_at: record.completed_at,
            error: record.error.clone(),
        }))
    }
}

async fn handle_connection(api: Arc<ApiServer>, stream: TcpStream) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let api = Arc::clone(&api);
        async move { Ok::<_, Infallible>(api.handle(req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

    Ok(())
}
