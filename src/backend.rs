//! Upstream origins: health state machine, request forwarding and
//! per-response cookie side effects.

use crate::error::{json_error_response, ControlError, ProxyBody, ProxyErrorCode};
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderValue, HOST, SET_COOKIE};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;
use url::Url;
use uuid::Uuid;

/// Header match that gates selection of a conditional server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub header: String,
    pub value: String,
}

impl Condition {
    /// Parse the `header=value` CLI form.
    pub fn parse(s: &str) -> Result<Self, ControlError> {
        let (header, value) = s.split_once('=').ok_or_else(|| {
            ControlError::Validation("invalid condition format, expected header=value".to_string())
        })?;
        let condition = Self {
            header: header.to_string(),
            value: value.to_string(),
        };
        condition.validate()?;
        Ok(condition)
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.header.is_empty() || self.value.is_empty() {
            return Err(ControlError::Validation(
                "both header and value must be set in condition".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.header, self.value)
    }
}

/// Lifecycle state of a server. Draining is reserved for operator-driven
/// shutdown and is never entered by the health loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    Healthy = 0,
    Unhealthy = 1,
    Pending = 2,
    Draining = 3,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Unhealthy,
            3 => HealthStatus::Draining,
            _ => HealthStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Unhealthy => "Unhealthy",
            HealthStatus::Pending => "Pending",
            HealthStatus::Draining => "Draining",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response counters reported by the stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStats {
    pub ok: u64,
    pub not_ok: u64,
}

/// Callback invoked with the value of the configured app cookie whenever
/// an upstream response sets it.
pub type AppCookieCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct AppCookieHook {
    name: String,
    callback: AppCookieCallback,
}

/// One upstream origin owned by a pool.
pub struct Backend {
    pub id: Uuid,
    pub address: Url,
    pub condition: Option<Condition>,
    pub health_check_path: String,
    status: AtomicU8,
    consecutive_ok: AtomicU32,
    consecutive_fail: AtomicU32,
    ok_responses: AtomicU64,
    not_ok_responses: AtomicU64,
    /// Epoch millis of the last completed probe; 0 means never probed.
    last_checked_ms: AtomicU64,
    created_at: Instant,
    lb_cookie_name: Option<String>,
    app_cookie: Option<AppCookieHook>,
    client: Client<HttpConnector, ProxyBody>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("address", &self.address.as_str())
            .field("condition", &self.condition)
            .field("status", &self.status())
            .finish()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Extract a cookie value from a Cookie or Set-Cookie header line.
pub(crate) fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    for pair in header.split(';') {
        let pair = pair.trim();
        if let Some((key, value)) = pair.split_once('=') {
            if key == name && !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

impl Backend {
    /// Create a server in Pending state with a fresh id.
    pub fn new(
        address: &str,
        health_check_path: &str,
        condition: Option<Condition>,
    ) -> Result<Self, ControlError> {
        let parsed = Url::parse(address).map_err(|e| {
            ControlError::Validation(format!("invalid server address '{address}': {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ControlError::Validation(format!(
                "server address '{address}' must be an absolute http(s) URL"
            )));
        }
        if let Some(condition) = &condition {
            condition.validate()?;
        }

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            id: Uuid::new_v4(),
            address: parsed,
            condition,
            health_check_path: health_check_path.to_string(),
            status: AtomicU8::new(HealthStatus::Pending as u8),
            consecutive_ok: AtomicU32::new(0),
            consecutive_fail: AtomicU32::new(0),
            ok_responses: AtomicU64::new(0),
            not_ok_responses: AtomicU64::new(0),
            last_checked_ms: AtomicU64::new(0),
            created_at: Instant::now(),
            lb_cookie_name: None,
            app_cookie: None,
            client,
        })
    }

    /// Replace the generated id, used when restoring persisted servers.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn mark_healthy(&self) {
        self.status.store(HealthStatus::Healthy as u8, Ordering::SeqCst);
        self.consecutive_ok.store(0, Ordering::SeqCst);
        self.consecutive_fail.store(0, Ordering::SeqCst);
    }

    pub fn mark_unhealthy(&self) {
        self.status.store(HealthStatus::Unhealthy as u8, Ordering::SeqCst);
        self.consecutive_ok.store(0, Ordering::SeqCst);
        self.consecutive_fail.store(0, Ordering::SeqCst);
    }

    /// A Pending server younger than the initial delay is not probed yet.
    pub fn is_ready(&self, initial_delay: Duration) -> bool {
        !(self.status() == HealthStatus::Pending && self.created_at.elapsed() < initial_delay)
    }

    /// Apply one probe outcome. A failure only counts against a Healthy or
    /// Pending server; a success only counts for an Unhealthy or Pending
    /// one. Returns the new status when a threshold was crossed.
    pub fn record_probe(&self, ok: bool, num_ok: u32, num_fail: u32) -> Option<HealthStatus> {
        let status = self.status();
        if ok {
            if matches!(status, HealthStatus::Unhealthy | HealthStatus::Pending) {
                let streak = self.consecutive_ok.fetch_add(1, Ordering::SeqCst) + 1;
                if streak >= num_ok {
                    self.mark_healthy();
                    return Some(HealthStatus::Healthy);
                }
            }
        } else if matches!(status, HealthStatus::Healthy | HealthStatus::Pending) {
            let streak = self.consecutive_fail.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= num_fail {
                self.mark_unhealthy();
                return Some(HealthStatus::Unhealthy);
            }
        }
        None
    }

    pub fn due_for_probe(&self, interval: Duration) -> bool {
        let last = self.last_checked_ms.load(Ordering::Relaxed);
        now_millis().saturating_sub(last) >= interval.as_millis() as u64
    }

    /// Record that a probe completed, regardless of its outcome.
    pub fn touch_checked(&self) {
        self.last_checked_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn consecutive_ok(&self) -> u32 {
        self.consecutive_ok.load(Ordering::SeqCst)
    }

    pub fn consecutive_fail(&self) -> u32 {
        self.consecutive_fail.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            ok: self.ok_responses.load(Ordering::Relaxed),
            not_ok: self.not_ok_responses.load(Ordering::Relaxed),
        }
    }

    /// True when the server has no condition, or the request carries the
    /// configured header with the configured value.
    pub fn check_condition(&self, headers: &HeaderMap) -> bool {
        match &self.condition {
            None => true,
            Some(condition) => headers
                .get(condition.header.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|v| v == condition.value)
                .unwrap_or(false),
        }
    }

    /// Inject `name=<id>` as a Set-Cookie on every proxied response.
    pub(crate) fn set_lb_cookie(&mut self, name: &str) {
        self.lb_cookie_name = Some(name.to_string());
    }

    /// Watch upstream responses for the named cookie and report its value.
    pub(crate) fn set_app_cookie_interceptor(&mut self, name: &str, callback: AppCookieCallback) {
        self.app_cookie = Some(AppCookieHook {
            name: name.to_string(),
            callback,
        });
    }

    /// Forward a request to the upstream origin, rewriting the target and
    /// Host header. Transport failures become a 502 response and are
    /// counted; they never propagate to the caller.
    pub async fn proxy(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let authority = self.address.authority();
        let target = format!("{}://{}{}", self.address.scheme(), authority, path_and_query);

        let uri = match target.parse::<hyper::Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(backend = %self.id, uri = %target, error = %e, "failed to build upstream URI");
                self.not_ok_responses.fetch_add(1, Ordering::Relaxed);
                return json_error_response(
                    ProxyErrorCode::UpstreamUnreachable,
                    "failed to reach upstream server",
                );
            }
        };
        parts.uri = uri;
        if let Ok(host) = HeaderValue::from_str(authority) {
            parts.headers.insert(HOST, host);
        }

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                self.apply_response_hooks(&mut parts.headers);
                self.ok_responses.fetch_add(1, Ordering::Relaxed);
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!(backend = %self.id, upstream = %self.address, error = %e, "error proxying request");
                self.not_ok_responses.fetch_add(1, Ordering::Relaxed);
                json_error_response(
                    ProxyErrorCode::UpstreamUnreachable,
                    "failed to reach upstream server",
                )
            }
        }
    }

    fn apply_response_hooks(&self, headers: &mut HeaderMap) {
        if let Some(name) = &self.lb_cookie_name {
            if let Ok(value) = HeaderValue::from_str(&format!("{}={}", name, self.id)) {
                headers.append(SET_COOKIE, value);
            }
        }
        if let Some(hook) = &self.app_cookie {
            for header in headers.get_all(SET_COOKIE) {
                if let Some(value) = header
                    .to_str()
                    .ok()
                    .and_then(|raw| cookie_value(raw, &hook.name))
                {
                    (hook.callback)(value);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(condition: Option<Condition>) -> Backend {
        Backend::new("http://127.0.0.1:9001", "/health", condition).unwrap()
    }

    #[tokio::test]
    async fn test_new_backend_is_pending() {
        let backend = backend(None);
        assert_eq!(backend.status(), HealthStatus::Pending);
        assert_eq!(backend.stats(), BackendStats::default());
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        assert!(Backend::new("not a url", "/health", None).is_err());
        assert!(Backend::new("127.0.0.1:9001", "/health", None).is_err());
        assert!(Backend::new("ftp://127.0.0.1", "/health", None).is_err());
    }

    #[tokio::test]
    async fn test_probe_promotion_at_threshold() {
        let backend = backend(None);
        assert_eq!(backend.record_probe(true, 2, 2), None);
        assert_eq!(backend.consecutive_ok(), 1);
        assert_eq!(backend.record_probe(true, 2, 2), Some(HealthStatus::Healthy));
        assert_eq!(backend.status(), HealthStatus::Healthy);
        // Both streaks reset on transition.
        assert_eq!(backend.consecutive_ok(), 0);
        assert_eq!(backend.consecutive_fail(), 0);
    }

    #[tokio::test]
    async fn test_probe_demotion_at_threshold() {
        let backend = backend(None);
        backend.mark_healthy();
        assert_eq!(backend.record_probe(false, 2, 3), None);
        assert_eq!(backend.record_probe(false, 2, 3), None);
        assert_eq!(
            backend.record_probe(false, 2, 3),
            Some(HealthStatus::Unhealthy)
        );
        assert_eq!(backend.consecutive_fail(), 0);
    }

    #[tokio::test]
    async fn test_probe_outcomes_ignored_in_terminal_direction() {
        let backend = backend(None);
        backend.mark_healthy();
        // Successes do not accumulate for an already-healthy server.
        assert_eq!(backend.record_probe(true, 1, 1), None);
        assert_eq!(backend.consecutive_ok(), 0);

        backend.mark_unhealthy();
        assert_eq!(backend.record_probe(false, 1, 1), None);
        assert_eq!(backend.consecutive_fail(), 0);
    }

    #[tokio::test]
    async fn test_is_ready_honors_initial_delay() {
        let backend = backend(None);
        assert!(!backend.is_ready(Duration::from_secs(60)));
        assert!(backend.is_ready(Duration::ZERO));
        backend.mark_unhealthy();
        // Only Pending servers wait out the delay.
        assert!(backend.is_ready(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_check_condition() {
        let unconditional = backend(None);
        let conditional = backend(Some(Condition {
            header: "x-env".to_string(),
            value: "prod".to_string(),
        }));

        let mut headers = HeaderMap::new();
        assert!(unconditional.check_condition(&headers));
        assert!(!conditional.check_condition(&headers));

        headers.insert("x-env", HeaderValue::from_static("prod"));
        assert!(conditional.check_condition(&headers));

        headers.insert("x-env", HeaderValue::from_static("staging"));
        assert!(!conditional.check_condition(&headers));
    }

    #[test]
    fn test_condition_parse() {
        let condition = Condition::parse("x-env=prod").unwrap();
        assert_eq!(condition.header, "x-env");
        assert_eq!(condition.value, "prod");
        assert_eq!(condition.to_string(), "x-env=prod");

        assert!(Condition::parse("x-env").is_err());
        assert!(Condition::parse("=prod").is_err());
        assert!(Condition::parse("x-env=").is_err());
    }

    #[test]
    fn test_cookie_value() {
        assert_eq!(cookie_value("session=abc; Path=/", "session"), Some("abc"));
        assert_eq!(cookie_value("a=1; session=abc", "session"), Some("abc"));
        assert_eq!(cookie_value("a=1; b=2", "session"), None);
        assert_eq!(cookie_value("session=", "session"), None);
    }

    #[tokio::test]
    async fn test_due_for_probe() {
        let backend = backend(None);
        // Never probed: immediately due.
        assert!(backend.due_for_probe(Duration::from_secs(1)));
        backend.touch_checked();
        assert!(!backend.due_for_probe(Duration::from_secs(1)));
        assert!(backend.due_for_probe(Duration::ZERO));
    }
}
