//! Sticky sessions: method selection and the per-pool affinity store.

use crate::error::ControlError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Cookie injected by the load balancer for the LBCookie sticky method.
/// Its value is the chosen server's UUID.
pub const LB_COOKIE_NAME: &str = "x-continuity-sticky";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickyMethod {
    Ip,
    AppCookie,
    LbCookie,
}

impl StickyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StickyMethod::Ip => "IP",
            StickyMethod::AppCookie => "AppCookie",
            StickyMethod::LbCookie => "LBCookie",
        }
    }

    pub fn parse(method: &str) -> Result<Self, ControlError> {
        match method {
            "IP" => Ok(StickyMethod::Ip),
            "AppCookie" => Ok(StickyMethod::AppCookie),
            "LBCookie" => Ok(StickyMethod::LbCookie),
            _ => Err(ControlError::Validation(format!(
                "invalid sticky_method '{method}', possible values are: IP, AppCookie, LBCookie"
            ))),
        }
    }
}

impl fmt::Display for StickyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sticky-session configuration fixed at pool creation time.
#[derive(Debug, Clone)]
pub struct StickyConfig {
    pub method: StickyMethod,
    pub timeout: Duration,
    pub cookie_name: String,
}

impl StickyConfig {
    /// Load-balancer managed cookie, fixed name, UUID value.
    pub fn lb_cookie(timeout: Duration) -> Self {
        Self {
            method: StickyMethod::LbCookie,
            timeout,
            cookie_name: LB_COOKIE_NAME.to_string(),
        }
    }

    /// Client-IP keyed affinity.
    pub fn ip(timeout: Duration) -> Self {
        Self {
            method: StickyMethod::Ip,
            ..Self::lb_cookie(timeout)
        }
    }

    /// Affinity keyed on a cookie the upstream application sets itself.
    pub fn app_cookie(timeout: Duration, cookie_name: &str) -> Result<Self, ControlError> {
        if cookie_name.is_empty() {
            return Err(ControlError::Validation(
                "cookie name cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            method: StickyMethod::AppCookie,
            timeout,
            cookie_name: cookie_name.to_string(),
        })
    }

    /// Validate the sticky fields of a create-pool request or a persisted
    /// pool entry and build the configuration.
    pub fn build(
        method: &str,
        timeout_secs: u64,
        cookie_name: Option<&str>,
    ) -> Result<Self, ControlError> {
        if method.is_empty() {
            return Err(ControlError::Validation(
                "sticky_method is required when sticky_sessions is true".to_string(),
            ));
        }
        let method = StickyMethod::parse(method)?;
        if timeout_secs == 0 {
            return Err(ControlError::Validation(
                "sticky_session_timeout must be greater than 0 when sticky_sessions is true"
                    .to_string(),
            ));
        }
        let timeout = Duration::from_secs(timeout_secs);
        match method {
            StickyMethod::AppCookie => {
                let cookie_name = cookie_name.unwrap_or_default();
                if cookie_name.is_empty() {
                    return Err(ControlError::Validation(
                        "sticky_session_cookie_name is required".to_string(),
                    ));
                }
                Self::app_cookie(timeout, cookie_name)
            }
            StickyMethod::LbCookie => {
                if cookie_name.is_some_and(|name| !name.is_empty()) {
                    return Err(ControlError::Validation(
                        "sticky_session_cookie_name is not applicable for LBCookie sticky method"
                            .to_string(),
                    ));
                }
                Ok(Self::lb_cookie(timeout))
            }
            StickyMethod::Ip => Ok(Self::ip(timeout)),
        }
    }
}

/// One sticky session. Holds the server's id rather than the server so a
/// stale entry can never keep a removed server alive.
#[derive(Debug, Clone, Copy)]
pub struct AffinitySession {
    pub backend_id: Uuid,
    pub created_at: Instant,
}

impl AffinitySession {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Session map keyed by client IP, server UUID or app cookie value,
/// depending on the pool's sticky method.
pub struct AffinityStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, AffinitySession>>,
}

impl AffinityStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve an unexpired session. Expired entries are left in place for
    /// the periodic sweep.
    pub fn lookup(&self, key: &str) -> Option<Uuid> {
        let sessions = self.sessions.read();
        sessions
            .get(key)
            .filter(|session| !session.is_expired(self.ttl))
            .map(|session| session.backend_id)
    }

    /// Record a session unless an unexpired one already exists for the key.
    pub fn register(&self, key: &str, backend_id: Uuid) {
        {
            let sessions = self.sessions.read();
            if let Some(existing) = sessions.get(key) {
                if !existing.is_expired(self.ttl) {
                    return;
                }
            }
        }
        let mut sessions = self.sessions.write();
        sessions.insert(
            key.to_string(),
            AffinitySession {
                backend_id,
                created_at: Instant::now(),
            },
        );
    }

    /// Drop every expired session, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(self.ttl));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
