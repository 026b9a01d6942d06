use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Container limits for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    /// Runs with `--network=none` when set.
    pub network_disabled: bool,
    /// Passed to `docker run --memory`.
    pub memory_limit: Option<String>,
    /// Passed to `docker run --cpus`.
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Transport security for node-to-node RPC.
///
/// An enabled config with every path set means mutual TLS against the
/// cluster CA in both directions.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Fall back to plaintext instead of refusing to start when the
    /// certificate material is missing.
    pub allow_insecure: bool,
}

impl TlsConfig {
    pub fn is_complete(&self) -> bool {
        self.enabled
            && [&self.ca_cert_path, &self.cert_path, &self.key_path]
                .iter()
                .all(|p| p.is_some())
    }
}

/// Where plugins are loaded from.
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    /// Plugin search path. `None` uses `<shared>/plugins`.
    pub path: Option<PathBuf>,
    /// Development mode: `path` overrides the shared plugin directory.
    pub dev_override: bool,
}

impl PluginConfig {
    pub fn search_path(&self, shared_dir: &std::path::Path) -> PathBuf {
        match (&self.path, self.dev_override) {
            (Some(path), true) => path.clone(),
            _ => shared_dir.join("plugins"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_uuid: Uuid,
    pub title: String,
    pub listen_addr: SocketAddr,
    /// Host peers use to reach this node. `None` disables RPC export.
    pub advertise_host: Option<String>,
    pub database_url: String,
    pub heartbeat_interval_ms: u64,
    pub liveness_threshold_ms: u64,
    pub rpc_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Claims older than this go back to the queue even if the owner is alive.
    pub work_timeout_ms: u64,
    pub worker_count: usize,
    pub claim_batch: u32,
    /// Transient executor failures are retried until a job has this many attempts.
    pub max_attempts: u32,
    pub sandbox: SandboxConfig,
    pub tls: TlsConfig,
    pub plugins: PluginConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_uuid: Uuid::new_v4(),
            title: "Untitled Node".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 1099)),
            advertise_host: Some("127.0.0.1".to_string()),
            database_url: "sqlite:markhive.db".to_string(),
            heartbeat_interval_ms: 5_000,
            liveness_threshold_ms: 60_000,
            rpc_timeout_ms: 5_000,
            lock_timeout_ms: 10_000,
            poll_interval_ms: 10_000,
            work_timeout_ms: 120_000,
            worker_count: 2,
            claim_batch: 1,
            max_attempts: 3,
            sandbox: SandboxConfig::default(),
            tls: TlsConfig::default(),
            plugins: PluginConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_uuid: Uuid, listen_addr: SocketAddr, database_url: impl Into<String>) -> Self {
        Self {
            node_uuid,
            listen_addr,
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_timings(mut self, heartbeat_interval_ms: u64, liveness_threshold_ms: u64) -> Self {
        self.heartbeat_interval_ms = heartbeat_interval_ms;
        self.liveness_threshold_ms = liveness_threshold_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_millis(self.liveness_threshold_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn work_timeout(&self) -> Duration {
        Duration::from_millis(self.work_timeout_ms)
    }

    /// Age after which a claimant is considered gone and its claims reclaimable.
    pub fn stale_claim_after(&self) -> Duration {
        self.liveness_threshold() + self.heartbeat_interval()
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::NodeError;

        if self.worker_count == 0 {
            return Err(NodeError::Config("worker_count must be at least 1".into()));
        }
        if self.claim_batch == 0 {
            return Err(NodeError::Config("claim_batch must be at least 1".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(NodeError::Config("heartbeat interval must be non-zero".into()));
        }
        if self.work_timeout_ms == 0 {
            return Err(NodeError::Config("work timeout must be non-zero".into()));
        }
        if self.liveness_threshold_ms <= self.heartbeat_interval_ms {
            return Err(NodeError::Config(
                "liveness threshold must exceed the heartbeat interval".into(),
            ));
        }
        Ok(())
    }
}
