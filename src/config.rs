//! Persisted state: the YAML configuration document, load/save and the
//! save-on-change trigger.

use crate::affinity::StickyConfig;
use crate::backend::{Backend, Condition};
use crate::pool::{HealthCheckParams, Pool};
use crate::registry::Registry;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use uuid::Uuid;

/// Top-level persisted document: listener addresses plus every pool.
/// Runtime state (statuses, counters, sticky sessions) is not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub address: String,
    pub port: u16,
    pub management_address: String,
    pub management_port: u16,
    /// Authorized-keys file for control-plane request signatures; requests
    /// are unauthenticated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_authorized_keys: Option<String>,
    #[serde(default)]
    pub pools: Vec<PoolEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub hostname: String,
    pub health_check_interval_seconds: u64,
    pub health_check_initial_delay_seconds: u64,
    pub health_check_timeout_seconds: u64,
    pub health_check_num_ok: u32,
    pub health_check_num_fail: u32,
    #[serde(default)]
    pub sticky_sessions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_method: Option<String>,
    #[serde(default)]
    pub sticky_session_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_cookie_name: Option<String>,
    #[serde(default)]
    pub conditional_servers: Vec<ServerEntry>,
    #[serde(default)]
    pub unconditional_servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: Uuid,
    pub address: String,
    pub health_check_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Configuration {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.address, self.port))
    }

    pub fn management_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.management_address, self.management_port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid management address {}:{}",
                    self.management_address, self.management_port
                )
            })
    }
}

/// Minimal starting document written by `--sample-config`.
pub fn sample() -> Configuration {
    Configuration {
        address: "0.0.0.0".to_string(),
        port: 443,
        management_address: "127.0.0.1".to_string(),
        management_port: 8090,
        management_authorized_keys: None,
        pools: Vec::new(),
    }
}

pub async fn write_sample(path: impl AsRef<Path>) -> anyhow::Result<()> {
    save(path, &sample()).await
}

/// Read the document and build the registry it describes. Server UUIDs are
/// preserved; every server starts over in Pending.
pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<(Configuration, Arc<Registry>)> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let configuration: Configuration =
        serde_yaml::from_str(&contents).context("failed to parse YAML config")?;

    let registry = Arc::new(Registry::new(configuration.bind_addr()?));
    for entry in &configuration.pools {
        let sticky = if entry.sticky_sessions {
            Some(
                StickyConfig::build(
                    entry.sticky_method.as_deref().unwrap_or_default(),
                    entry.sticky_session_timeout_seconds,
                    entry.sticky_cookie_name.as_deref(),
                )
                .map_err(|e| anyhow::anyhow!("pool '{}': {e}", entry.hostname))?,
            )
        } else {
            None
        };

        let pool = Pool::new(
            entry.hostname.clone(),
            HealthCheckParams {
                interval: Duration::from_secs(entry.health_check_interval_seconds),
                initial_delay: Duration::from_secs(entry.health_check_initial_delay_seconds),
                timeout: Duration::from_secs(entry.health_check_timeout_seconds),
                num_ok: entry.health_check_num_ok,
                num_fail: entry.health_check_num_fail,
            },
            sticky,
        );

        for server in entry
            .conditional_servers
            .iter()
            .chain(entry.unconditional_servers.iter())
        {
            let backend = Backend::new(
                &server.address,
                &server.health_check_path,
                server.condition.clone(),
            )
            .map_err(|e| anyhow::anyhow!("pool '{}': {e}", entry.hostname))?
            .with_id(server.id);
            pool.add_server(backend).await;
        }

        let pool = registry.add_pool(pool).await.map_err(|e| anyhow::anyhow!("{e}"))?;
        info!(hostname = %pool.hostname, "pool loaded from configuration");
    }

    Ok((configuration, registry))
}

/// Capture the current registry state into a document, keeping the listener
/// and management settings of `base`. Pools are sorted by hostname so the
/// output is stable across saves.
pub async fn snapshot(registry: &Registry, base: &Configuration) -> Configuration {
    let mut pools = Vec::new();
    for pool in registry.pools().await {
        pools.push(pool_entry(&pool).await);
    }
    pools.sort_by(|a, b| a.hostname.cmp(&b.hostname));

    Configuration {
        address: base.address.clone(),
        port: base.port,
        management_address: base.management_address.clone(),
        management_port: base.management_port,
        management_authorized_keys: base.management_authorized_keys.clone(),
        pools,
    }
}

async fn pool_entry(pool: &Pool) -> PoolEntry {
    let params = pool.params();
    let (conditional, unconditional) = pool.server_snapshot().await;
    PoolEntry {
        hostname: pool.hostname.clone(),
        health_check_interval_seconds: params.interval.as_secs(),
        health_check_initial_delay_seconds: params.initial_delay.as_secs(),
        health_check_timeout_seconds: params.timeout.as_secs(),
        health_check_num_ok: params.num_ok,
        health_check_num_fail: params.num_fail,
        sticky_sessions: pool.sticky().is_some(),
        sticky_method: pool.sticky().map(|s| s.method.to_string()),
        sticky_session_timeout_seconds: pool.sticky().map(|s| s.timeout.as_secs()).unwrap_or(0),
        sticky_cookie_name: pool.sticky().map(|s| s.cookie_name.clone()),
        conditional_servers: conditional.iter().map(|s| server_entry(s)).collect(),
        unconditional_servers: unconditional.iter().map(|s| server_entry(s)).collect(),
    }
}

fn server_entry(backend: &Backend) -> ServerEntry {
    ServerEntry {
        id: backend.id,
        address: backend.address.to_string(),
        health_check_path: backend.health_check_path.clone(),
        condition: backend.condition.clone(),
    }
}

pub async fn save(path: impl AsRef<Path>, configuration: &Configuration) -> anyhow::Result<()> {
    let path = path.as_ref();
    let data = serde_yaml::to_string(configuration).context("failed to serialize config")?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

/// Handle used by the control plane to request a save after a mutation.
#[derive(Clone)]
pub struct SaveHandle {
    tx: mpsc::Sender<()>,
}

impl SaveHandle {
    pub fn trigger(&self) {
        // A full channel already has saves queued; dropping is fine.
        let _ = self.tx.try_send(());
    }

    /// A handle whose triggers go nowhere, for tests.
    pub fn disconnected() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }
}

/// Start the autosave task: every trigger snapshots the registry and
/// rewrites the document. Owned by the process top level.
pub fn spawn_autosave(
    path: PathBuf,
    registry: Arc<Registry>,
    base: Configuration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> SaveHandle {
    let (tx, mut rx) = mpsc::channel(10);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    let snapshot = snapshot(&registry, &base).await;
                    match save(&path, &snapshot).await {
                        Ok(()) => info!(path = %path.display(), "configuration saved"),
                        Err(e) => error!(error = %e, "error saving configuration"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    SaveHandle { tx }
}
