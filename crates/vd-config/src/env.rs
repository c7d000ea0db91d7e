//! `VDAG_*` environment overrides

use std::collections::HashMap;
use std::str::FromStr;

use vd_common::DispatchMode;

use crate::{ConfigError, QueueBackend, Result, SessionStoreBackend, VdagConfig};

pub const ENV_PREFIX: &str = "VDAG_";

/// Snapshot of the override variables, so loading never races the process env
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    vars: HashMap<String, String>,
}

impl EnvOverrides {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars()
                .filter(|(k, _)| k.starts_with(ENV_PREFIX))
                .collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(v) = self.get(key) {
            *target = v.to_string();
        }
    }

    fn parse<T: FromStr>(&self, key: &str, target: &mut T) -> Result<()> {
        if let Some(v) = self.get(key) {
            *target = v.parse().map_err(|_| ConfigError::InvalidOverride {
                key: key.to_string(),
                value: v.to_string(),
            })?;
        }
        Ok(())
    }
}

impl VdagConfig {
    pub fn apply_overrides(&mut self, env: &EnvOverrides) -> Result<()> {
        env.string("VDAG_NODE_LABEL", &mut self.node.label);
        env.string("VDAG_NODE_ID", &mut self.node.node_id);
        env.string("VDAG_INBOUND_QUEUE", &mut self.node.inbound_queue);
        if let Some(v) = env.get("VDAG_DEFAULT_OUTPUT_QUEUE") {
            self.node.default_output_queue = Some(v.to_string());
        }

        env.string("VDAG_REDIS_URL", &mut self.queue.redis_url);
        if let Some(v) = env.get("VDAG_QUEUE_BACKEND") {
            self.queue.backend = match v {
                "redis" => QueueBackend::Redis,
                "memory" => QueueBackend::Memory,
                other => return Err(invalid("VDAG_QUEUE_BACKEND", other)),
            };
        }

        env.parse("VDAG_CONNECT_MAX_RETRIES", &mut self.connection_cache.max_retries)?;
        env.parse("VDAG_CONNECT_RETRY_DELAY_MS", &mut self.connection_cache.retry_delay_ms)?;

        env.parse("VDAG_POOL_ENABLED", &mut self.worker_pool.enabled)?;
        env.parse("VDAG_POOL_WORKERS", &mut self.worker_pool.workers)?;
        env.parse("VDAG_POOL_QUEUE_CAPACITY", &mut self.worker_pool.queue_capacity)?;
        env.parse("VDAG_POOL_STICKY", &mut self.worker_pool.sticky)?;
        if let Some(v) = env.get("VDAG_POOL_MODE") {
            self.worker_pool.mode = match v {
                "tasks" => DispatchMode::Tasks,
                "isolated" => DispatchMode::Isolated,
                other => return Err(invalid("VDAG_POOL_MODE", other)),
            };
        }
        if let Some(v) = env.get("VDAG_POOL_RATE_LIMIT") {
            let rpm: u32 = v.parse().map_err(|_| invalid("VDAG_POOL_RATE_LIMIT", v))?;
            self.worker_pool.rate_limit_per_minute = Some(rpm).filter(|r| *r > 0);
        }

        env.string("VDAG_API_HOST", &mut self.api.host);
        env.parse("VDAG_API_PORT", &mut self.api.port)?;
        env.parse("VDAG_METRICS_ENABLED", &mut self.metrics.enabled)?;
        env.parse("VDAG_METRICS_PORT", &mut self.metrics.port)?;

        env.string("VDAG_INFERENCE_URL", &mut self.inference.base_url);
        env.string("VDAG_INFERENCE_MODEL", &mut self.inference.model_id);
        env.parse("VDAG_INFERENCE_TIMEOUT_MS", &mut self.inference.timeout_ms)?;

        if let Some(v) = env.get("VDAG_SESSION_STORE") {
            self.session_store.backend = match v {
                "memory" => SessionStoreBackend::Memory,
                "redis" => SessionStoreBackend::Redis,
                other => return Err(invalid("VDAG_SESSION_STORE", other)),
            };
        }
        env.parse("VDAG_SESSION_TTL_SECS", &mut self.session_store.ttl_secs)?;

        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidOverride {
        key: key.to_string(),
        value: value.to_string(),
    }
}
