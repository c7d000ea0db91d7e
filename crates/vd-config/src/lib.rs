//! vDAG Node Configuration
//!
//! Configuration is layered:
//! - Built-in defaults for every section
//! - A TOML file (optional; a missing path means defaults only)
//! - `VDAG_*` environment variable overrides
//!
//! The result is validated before the node starts.

use std::path::Path;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use vd_common::{AssignmentTable, DispatchMode, OutputDescriptor};

pub mod env;

pub use env::{ENV_PREFIX, EnvOverrides};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Label this node answers to inside routing graphs
    pub label: String,
    pub node_id: String,
    pub inbound_queue: String,
    /// Destination used when a packet carries no routing graph
    pub default_output_queue: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            label: "node".to_string(),
            node_id: "node-0".to_string(),
            inbound_queue: "vdag:node-0:inbound".to_string(),
            default_output_queue: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub redis_url: String,
    /// Blocking pop timeout in seconds
    pub pop_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            pop_timeout_secs: 5,
        }
    }
}

impl QueueConfig {
    /// Host and port of the Redis server named by `redis_url`
    pub fn redis_endpoint(&self) -> (String, u16) {
        let rest = self
            .redis_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.redis_url);
        let authority = rest.split('/').next().unwrap_or(rest);
        let authority = authority.rsplit_once('@').map(|(_, a)| a).unwrap_or(authority);
        match authority.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(DEFAULT_REDIS_PORT)),
            None => (authority.to_string(), DEFAULT_REDIS_PORT),
        }
    }
}

const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionCacheConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Request timeout for direct (port 0) destinations
    pub direct_timeout_ms: u64,
}

impl Default for ConnectionCacheConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 5_000,
            direct_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub enabled: bool,
    pub mode: DispatchMode,
    pub workers: u32,
    pub queue_capacity: u32,
    pub sticky: bool,
    pub rate_limit_per_minute: Option<u32>,
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DispatchMode::Tasks,
            workers: 4,
            queue_capacity: 64,
            sticky: true,
            rate_limit_per_minute: None,
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    /// Model used by the node's own business logic
    pub model_id: String,
    pub timeout_ms: u64,
    pub trigger_timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            model_id: "default".to_string(),
            timeout_ms: 60_000,
            trigger_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStoreConfig {
    pub backend: SessionStoreBackend,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub key_prefix: String,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            backend: SessionStoreBackend::Memory,
            ttl_secs: 3_600,
            sweep_interval_secs: 60,
            key_prefix: "vdag:session".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStage {
    Pre,
    Post,
}

/// Binds a named policy to one sub-graph's pre- or post-processing stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRegistration {
    pub subgraph: String,
    pub stage: PolicyStage,
    pub name: String,
    #[serde(default = "default_policy_version")]
    pub version: String,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

fn default_policy_version() -> String {
    "1".to_string()
}

/// One row of the label/node assignment table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentEntry {
    pub label: Option<String>,
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub queue_name: String,
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VdagConfig {
    pub node: NodeConfig,
    pub queue: QueueConfig,
    pub connection_cache: ConnectionCacheConfig,
    pub worker_pool: WorkerPoolConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub inference: InferenceConfig,
    pub session_store: SessionStoreConfig,
    pub policies: Vec<PolicyRegistration>,
    pub assignments: Vec<AssignmentEntry>,
}

impl VdagConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Parsing config file");
        Self::from_toml_str(&raw)
    }

    /// Full load: file (if any), process environment, validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(&EnvOverrides::from_process())?;
        config.validate()?;

        info!(
            node_label = %config.node.label,
            node_id = %config.node.node_id,
            inbound_queue = %config.node.inbound_queue,
            policies = config.policies.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.label.trim().is_empty() {
            return Err(ConfigError::Validation("node.label must not be empty".into()));
        }
        if self.node.inbound_queue.trim().is_empty() {
            return Err(ConfigError::Validation("node.inbound_queue must not be empty".into()));
        }
        if self.connection_cache.max_retries == 0 {
            return Err(ConfigError::Validation("connection_cache.max_retries must be positive".into()));
        }
        if self.worker_pool.enabled {
            if self.worker_pool.workers == 0 {
                return Err(ConfigError::Validation("worker_pool.workers must be positive".into()));
            }
            if self.worker_pool.queue_capacity == 0 {
                return Err(ConfigError::Validation("worker_pool.queue_capacity must be positive".into()));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for policy in &self.policies {
            if policy.subgraph.trim().is_empty() || policy.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "policy registrations need a subgraph and a name".into(),
                ));
            }
            if !seen.insert((policy.subgraph.as_str(), policy.stage)) {
                return Err(ConfigError::Validation(format!(
                    "duplicate {:?} policy for subgraph '{}'",
                    policy.stage, policy.subgraph
                )));
            }
            if policy.name == "cyclic-router" {
                let roles = policy
                    .settings
                    .get("roles")
                    .and_then(|r| r.as_array())
                    .map(|r| r.len())
                    .unwrap_or(0);
                if roles != 2 {
                    return Err(ConfigError::Validation(format!(
                        "cyclic-router for subgraph '{}' needs exactly two roles, found {}",
                        policy.subgraph, roles
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the label/node assignment table used by graph rewrites
    pub fn assignment_table(&self) -> AssignmentTable {
        let mut table = AssignmentTable::new();
        for entry in &self.assignments {
            let descriptor = OutputDescriptor::new(
                entry.host.clone(),
                entry.port,
                entry.queue_name.clone(),
                entry.node_id.clone(),
            );
            match &entry.label {
                Some(label) => table.assign(label.clone(), descriptor),
                None => table.insert_block(descriptor),
            }
        }
        table
    }

    /// Where packets without a routing graph go: the configured default
    /// queue on this node's own queue server
    pub fn default_output(&self) -> Option<OutputDescriptor> {
        let queue = self.node.default_output_queue.as_ref()?;
        let (host, port) = self.queue.redis_endpoint();
        Some(OutputDescriptor::new(host, port, queue.clone(), format!("{}:default", self.node.node_id)))
    }

    pub fn policies_for(&self, stage: PolicyStage) -> impl Iterator<Item = &PolicyRegistration> {
        self.policies.iter().filter(move |p| p.stage == stage)
    }
}
