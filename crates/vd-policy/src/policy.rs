//! Policy contract, registry and evaluation harness

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use vd_common::{AssignmentTable, Packet};
use vd_config::{PolicyRegistration, PolicyStage};

use crate::inference::InferenceClient;
use crate::session_store::StoreFactory;
use crate::{PolicyError, Result};

/// What a policy decided for one packet
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Forward(Packet),
    FanOut(Vec<Packet>),
    Drop { reason: String },
}

impl PolicyDecision {
    /// Packets to continue with; a drop yields none
    pub fn into_packets(self) -> Vec<Packet> {
        match self {
            PolicyDecision::Forward(p) => vec![p],
            PolicyDecision::FanOut(ps) => ps,
            PolicyDecision::Drop { .. } => Vec::new(),
        }
    }
}

/// Where the policy is running
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub node_label: String,
    pub subgraph: Option<String>,
    pub assignments: Arc<AssignmentTable>,
}

impl PolicyContext {
    pub fn new(node_label: impl Into<String>, subgraph: Option<String>, assignments: Arc<AssignmentTable>) -> Self {
        Self {
            node_label: node_label.into(),
            subgraph,
            assignments,
        }
    }

    pub fn subgraph(&self) -> Option<&str> {
        self.subgraph.as_deref()
    }
}

#[async_trait]
pub trait Policy: Send + Sync {
    async fn evaluate(&self, params: &Value, input: Packet, ctx: &PolicyContext) -> Result<PolicyDecision>;

    /// Out-of-band administration; never called on the packet path
    async fn manage(&self, action: &str, _data: Value) -> Result<Value> {
        Err(PolicyError::UnsupportedAction(action.to_string()))
    }
}

/// Identity of a policy instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub parameters: Value,
}

impl PolicySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1".to_string(),
            settings: Value::Null,
            parameters: Value::Null,
        }
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Map keys serialize in sorted order, so equal specs share a key
    pub fn cache_key(&self) -> String {
        format!("{}@{}|{}|{}", self.name, self.version, self.settings, self.parameters)
    }
}

impl From<&PolicyRegistration> for PolicySpec {
    fn from(reg: &PolicyRegistration) -> Self {
        Self {
            name: reg.name.clone(),
            version: reg.version.clone(),
            settings: reg.settings.clone(),
            parameters: reg.parameters.clone(),
        }
    }
}

/// Collaborators handed to policy factories
#[derive(Clone)]
pub struct PolicyDeps {
    pub inference: Arc<dyn InferenceClient>,
    pub stores: Arc<StoreFactory>,
}

pub type PolicyFactory = Arc<dyn Fn(&PolicySpec, &PolicyDeps) -> Result<Arc<dyn Policy>> + Send + Sync>;

/// A built policy plus the spec it was built from
#[derive(Clone)]
pub struct PolicyHandle {
    spec: PolicySpec,
    policy: Arc<dyn Policy>,
}

impl PolicyHandle {
    pub fn spec(&self) -> &PolicySpec {
        &self.spec
    }

    /// Evaluate, degrading any error or panic to "forward unchanged"
    pub async fn evaluate_or_default(&self, input: Packet, ctx: &PolicyContext) -> PolicyDecision {
        let fallback = input.clone();
        let outcome = AssertUnwindSafe(self.policy.evaluate(&self.spec.parameters, input, ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(
                    policy = %self.spec.name,
                    session_id = %fallback.session_id,
                    error = %e,
                    "Policy evaluation failed, passing packet through"
                );
                counter!("vdag_policy_failures_total", "policy" => self.spec.name.clone(), "kind" => "error").increment(1);
                PolicyDecision::Forward(fallback)
            }
            Err(_) => {
                error!(
                    policy = %self.spec.name,
                    session_id = %fallback.session_id,
                    "Policy evaluation panicked, passing packet through"
                );
                counter!("vdag_policy_failures_total", "policy" => self.spec.name.clone(), "kind" => "panic").increment(1);
                PolicyDecision::Forward(fallback)
            }
        }
    }

    pub async fn manage(&self, action: &str, data: Value) -> Result<Value> {
        self.policy.manage(action, data).await
    }
}

/// Builds policies by name and caches each distinct spec. Also holds the
/// per-subgraph pre/post bindings a node resolves packets against.
pub struct PolicyRegistry {
    factories: HashMap<String, PolicyFactory>,
    instances: DashMap<String, PolicyHandle>,
    bindings: DashMap<(String, PolicyStage), PolicyHandle>,
    deps: PolicyDeps,
}

impl PolicyRegistry {
    pub fn new(deps: PolicyDeps) -> Self {
        Self {
            factories: HashMap::new(),
            instances: DashMap::new(),
            bindings: DashMap::new(),
            deps,
        }
    }

    /// Registry pre-loaded with `passthrough`, `history-compactor` and `cyclic-router`
    pub fn with_builtins(deps: PolicyDeps) -> Self {
        let mut registry = Self::new(deps);
        registry.register("passthrough", |_, _| Ok(Arc::new(crate::Passthrough) as Arc<dyn Policy>));
        registry.register("history-compactor", |spec, deps| {
            Ok(Arc::new(crate::HistoryCompactor::from_spec(spec, deps)?) as Arc<dyn Policy>)
        });
        registry.register("cyclic-router", |spec, deps| {
            Ok(Arc::new(crate::CyclicRouter::from_spec(spec, deps)?) as Arc<dyn Policy>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PolicySpec, &PolicyDeps) -> Result<Arc<dyn Policy>> + Send + Sync + 'static,
    {
        let factory: PolicyFactory = Arc::new(factory);
        self.factories.insert(name.into(), factory);
    }

    /// Build-once lookup
    pub fn get_or_create(&self, spec: &PolicySpec) -> Result<PolicyHandle> {
        let key = spec.cache_key();
        if let Some(handle) = self.instances.get(&key) {
            return Ok(handle.clone());
        }

        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| PolicyError::UnknownPolicy(spec.name.clone()))?;
        let policy = factory(spec, &self.deps)?;
        let handle = PolicyHandle {
            spec: spec.clone(),
            policy,
        };

        // A racing builder may have won; keep whichever landed first
        let handle = self.instances.entry(key).or_insert(handle).clone();
        debug!(policy = %spec.name, version = %spec.version, "Policy instance ready");
        Ok(handle)
    }

    pub fn bind(&self, subgraph: impl Into<String>, stage: PolicyStage, spec: &PolicySpec) -> Result<()> {
        let subgraph = subgraph.into();
        let handle = self.get_or_create(spec)?;
        info!(subgraph = %subgraph, stage = ?stage, policy = %spec.name, "Bound policy");
        self.bindings.insert((subgraph, stage), handle);
        Ok(())
    }

    pub fn bind_all(&self, registrations: &[PolicyRegistration]) -> Result<()> {
        for reg in registrations {
            self.bind(reg.subgraph.clone(), reg.stage, &PolicySpec::from(reg))?;
        }
        Ok(())
    }

    /// Policy bound to `subgraph` at `stage`; `None` means identity
    pub fn resolve(&self, subgraph: &str, stage: PolicyStage) -> Option<PolicyHandle> {
        self.bindings
            .get(&(subgraph.to_string(), stage))
            .map(|h| h.clone())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn stores(&self) -> &Arc<StoreFactory> {
        &self.deps.stores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use serde_json::json;

    struct NoInference;

    #[async_trait]
    impl InferenceClient for NoInference {
        async fn infer(&self, _model_id: &str, _prompt: &str) -> Result<String> {
            Err(PolicyError::Inference("offline".into()))
        }
    }

    struct Failing;

    #[async_trait]
    impl Policy for Failing {
        async fn evaluate(&self, _params: &Value, _input: Packet, _ctx: &PolicyContext) -> Result<PolicyDecision> {
            Err(PolicyError::Inference("nope".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Policy for Panicking {
        async fn evaluate(&self, _params: &Value, _input: Packet, _ctx: &PolicyContext) -> Result<PolicyDecision> {
            panic!("policy bug");
        }
    }

    fn deps() -> PolicyDeps {
        PolicyDeps {
            inference: Arc::new(NoInference),
            stores: Arc::new(StoreFactory::memory(Duration::from_secs(60))),
        }
    }

    fn ctx() -> PolicyContext {
        PolicyContext::new("node", None, Arc::new(AssignmentTable::new()))
    }

    #[tokio::test]
    async fn test_error_degrades_to_forward() {
        let mut registry = PolicyRegistry::new(deps());
        registry.register("failing", |_, _| Ok(Arc::new(Failing) as Arc<dyn Policy>));
        let handle = registry.get_or_create(&PolicySpec::new("failing")).unwrap();

        let packet = Packet::new("s", 1, json!({"k": 1}));
        let decision = handle.evaluate_or_default(packet.clone(), &ctx()).await;
        assert_eq!(decision, PolicyDecision::Forward(packet));
    }

    #[tokio::test]
    async fn test_panic_degrades_to_forward() {
        let mut registry = PolicyRegistry::new(deps());
        registry.register("panicking", |_, _| Ok(Arc::new(Panicking) as Arc<dyn Policy>));
        let handle = registry.get_or_create(&PolicySpec::new("panicking")).unwrap();

        let packet = Packet::new("s", 1, json!({}));
        let decision = handle.evaluate_or_default(packet.clone(), &ctx()).await;
        assert_eq!(decision, PolicyDecision::Forward(packet));
    }

    #[test]
    fn test_instances_cached_per_spec() {
        let built = Arc::new(AtomicU32::new(0));
        let mut registry = PolicyRegistry::new(deps());
        let counter = built.clone();
        registry.register("counted", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(crate::Passthrough) as Arc<dyn Policy>)
        });

        let a = PolicySpec::new("counted").with_settings(json!({"x": 1, "y": 2}));
        let same = PolicySpec::new("counted").with_settings(json!({"y": 2, "x": 1}));
        let other = PolicySpec::new("counted").with_parameters(json!({"p": true}));

        registry.get_or_create(&a).unwrap();
        registry.get_or_create(&same).unwrap();
        registry.get_or_create(&other).unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(registry.instance_count(), 2);
    }

    #[test]
    fn test_unknown_policy() {
        let registry = PolicyRegistry::with_builtins(deps());
        let err = registry.get_or_create(&PolicySpec::new("nope")).err().unwrap();
        assert!(matches!(err, PolicyError::UnknownPolicy(n) if n == "nope"));
    }

    #[test]
    fn test_missing_binding_resolves_to_none() {
        let registry = PolicyRegistry::with_builtins(deps());
        registry.bind("g", PolicyStage::Pre, &PolicySpec::new("passthrough")).unwrap();
        assert!(registry.resolve("g", PolicyStage::Pre).is_some());
        assert!(registry.resolve("g", PolicyStage::Post).is_none());
        assert!(registry.resolve("other", PolicyStage::Pre).is_none());
    }
}
