use std::sync::Arc;
use async_trait::async_trait;
use metrics::counter;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use vd_common::Packet;

use crate::inference::InferenceClient;
use crate::session_store::{SessionLocks, SessionStateStore};
use crate::{Policy, PolicyContext, PolicyDecision, PolicyDeps, PolicyError, PolicySpec, Result};

use super::decision::{parse_decision, ArbiterDecision, REPLY_FORMAT};
use super::state::SessionRoutingState;
use super::{CyclicRouterSettings, RoleBinding};

const POLICY_NAME: &str = "cyclic-router";
const STORE_NAMESPACE: &str = "routing";

pub struct CyclicRouter {
    settings: CyclicRouterSettings,
    store: Arc<dyn SessionStateStore<SessionRoutingState>>,
    locks: Arc<SessionLocks>,
    inference: Arc<dyn InferenceClient>,
}

impl CyclicRouter {
    pub fn new(
        settings: CyclicRouterSettings,
        store: Arc<dyn SessionStateStore<SessionRoutingState>>,
        inference: Arc<dyn InferenceClient>,
    ) -> Result<Self> {
        if settings.roles.len() != 2 {
            return Err(PolicyError::invalid_settings(
                POLICY_NAME,
                format!("exactly two roles required, got {}", settings.roles.len()),
            ));
        }
        if settings.roles[0].name == settings.roles[1].name {
            return Err(PolicyError::invalid_settings(POLICY_NAME, "role names must differ"));
        }
        if settings.arbiter_label.trim().is_empty() {
            return Err(PolicyError::invalid_settings(POLICY_NAME, "arbiter_label must not be empty"));
        }

        Ok(Self {
            settings,
            store,
            locks: Arc::new(SessionLocks::new()),
            inference,
        })
    }

    pub fn from_spec(spec: &PolicySpec, deps: &PolicyDeps) -> Result<Self> {
        let settings: CyclicRouterSettings = serde_json::from_value(spec.settings.clone())
            .map_err(|e| PolicyError::invalid_settings(POLICY_NAME, e.to_string()))?;
        let mut router = Self::new(settings, deps.stores.build(STORE_NAMESPACE), deps.inference.clone())?;
        router.locks = deps.stores.session_locks();
        Ok(router)
    }

    pub fn settings(&self) -> &CyclicRouterSettings {
        &self.settings
    }

    // ------------------------------------------------------------------------
    // Peer side
    // ------------------------------------------------------------------------

    async fn at_peer(
        &self,
        input: Packet,
        ctx: &PolicyContext,
        mut state: SessionRoutingState,
    ) -> Result<PolicyDecision> {
        let text = payload_text(&input.payload);
        let role = payload_role(&input.payload)
            .or_else(|| self.settings.role_for_label(&ctx.node_label).map(|r| r.name.clone()));

        let Some(binding) = role.as_deref().and_then(|r| self.settings.role(r)).cloned() else {
            let role = role.unwrap_or_default();
            return self.escalate(&input, ctx, state, &role, &text, "unknown_role").await;
        };
        let Some(opponent) = self.settings.opponent_of(&binding.name).cloned() else {
            return self.escalate(&input, ctx, state, &binding.name, &text, "unknown_role").await;
        };

        let is_retry = state.retry_pending.as_deref() == Some(binding.name.as_str());
        state.retry_pending = None;

        if is_retry {
            state.replace_candidate(&binding.name, &text);
        } else {
            state.record_turn(&binding.name, &text, self.settings.sidecar_window);

            if state.consecutive_same_role_count >= self.settings.max_consecutive_by_same_role {
                state.consecutive_same_role_count = 0;
                return self.escalate(&input, ctx, state, &binding.name, &text, "consecutive_limit").await;
            }
            if state.total_rounds >= self.settings.max_rounds {
                return self.escalate(&input, ctx, state, &binding.name, &text, "max_rounds").await;
            }
            let interval = self.settings.judge_interval_rounds;
            if interval > 0 && state.total_rounds % interval == 0 {
                return self.escalate(&input, ctx, state, &binding.name, &text, "judge_interval").await;
            }
        }

        let score = match self.score(&binding.name, &text).await {
            Ok(score) => score,
            Err(e) => {
                warn!(session_id = %input.session_id, role = %binding.name, error = %e, "Evaluator unavailable, escalating");
                return self.escalate(&input, ctx, state, &binding.name, &text, "evaluator_unavailable").await;
            }
        };

        if score >= self.settings.quality_threshold {
            state.retry_counts_by_role.insert(binding.name.clone(), 0);
            return self.advance(&input, ctx, state, &binding, &opponent, &text).await;
        }

        let attempts = state.retry_count(&binding.name);
        if attempts < self.settings.max_router_retries {
            state.retry_counts_by_role.insert(binding.name.clone(), attempts + 1);
            state.retry_pending = Some(binding.name.clone());
            return self.self_retry(&input, ctx, state, &binding, &opponent, &text, score).await;
        }

        state.retry_counts_by_role.insert(binding.name.clone(), 0);
        self.escalate(&input, ctx, state, &binding.name, &text, "retry_budget_exhausted").await
    }

    async fn advance(
        &self,
        input: &Packet,
        ctx: &PolicyContext,
        state: SessionRoutingState,
        speaker: &RoleBinding,
        opponent: &RoleBinding,
        text: &str,
    ) -> Result<PolicyDecision> {
        let mut payload = Map::new();
        payload.insert("role".into(), json!(speaker.name));
        payload.insert("text".into(), json!(text));
        if let Some(last) = state.last_utterance_by_role.get(&opponent.name) {
            payload.insert("receiverLastTurn".into(), json!({ "role": opponent.name, "text": last }));
        }
        payload.insert("history".into(), json!(state.sidecar(self.settings.sidecar_window)));
        payload.insert("round".into(), json!(state.total_rounds));

        let packet = route_to(input, ctx, &opponent.label, Value::Object(payload))?;
        debug!(session_id = %input.session_id, from = %speaker.name, to = %opponent.name, "Advancing to opponent");
        self.store.put(&input.session_id, state).await?;
        Ok(PolicyDecision::Forward(packet))
    }

    #[allow(clippy::too_many_arguments)]
    async fn self_retry(
        &self,
        input: &Packet,
        ctx: &PolicyContext,
        state: SessionRoutingState,
        speaker: &RoleBinding,
        opponent: &RoleBinding,
        text: &str,
        score: f64,
    ) -> Result<PolicyDecision> {
        let mut payload = Map::new();
        payload.insert("role".into(), json!(speaker.name));
        payload.insert("text".into(), json!(text));
        payload.insert("underReview".into(), json!(true));
        payload.insert("qualityScore".into(), json!(score));
        payload.insert("retryAttempt".into(), json!(state.retry_count(&speaker.name)));
        if let Some(last) = state.last_utterance_by_role.get(&opponent.name) {
            payload.insert("opponentLastTurn".into(), json!({ "role": opponent.name, "text": last }));
        }

        let packet = route_to(input, ctx, &speaker.label, Value::Object(payload))?;
        debug!(
            session_id = %input.session_id,
            role = %speaker.name,
            score = score,
            attempt = state.retry_count(&speaker.name),
            "Candidate below threshold, retrying"
        );
        counter!("vdag_router_self_retries_total").increment(1);
        self.store.put(&input.session_id, state).await?;
        Ok(PolicyDecision::Forward(packet))
    }

    async fn escalate(
        &self,
        input: &Packet,
        ctx: &PolicyContext,
        state: SessionRoutingState,
        role: &str,
        text: &str,
        reason: &'static str,
    ) -> Result<PolicyDecision> {
        let options: Vec<String> = std::iter::once("FINALIZE".to_string())
            .chain(self.settings.roles.iter().map(|r| format!("CONTINUE_{}", r.name)))
            .collect();
        let payload = json!({
            "role": role,
            "text": text,
            "history": state.sidecar(self.settings.sidecar_window),
            "escalationReason": reason,
            "totalRounds": state.total_rounds,
            "roundsByRole": state.rounds_by_role,
            "options": options,
            "replyFormat": REPLY_FORMAT,
        });

        let packet = route_to(input, ctx, &self.settings.arbiter_label, payload)?;
        info!(session_id = %input.session_id, role = %role, reason = reason, "Escalating to arbiter");
        counter!("vdag_router_escalations_total", "reason" => reason).increment(1);
        self.store.put(&input.session_id, state).await?;
        Ok(PolicyDecision::Forward(packet))
    }

    async fn score(&self, role: &str, text: &str) -> Result<f64> {
        let prompt = format!(
            "Score the following turn by {} from 0.0 (unusable) to 1.0 (excellent). \
             Reply with the number only.\n\n{}",
            role, text
        );
        let reply = self.inference.infer(&self.settings.evaluator_model, &prompt).await?;
        parse_score(&reply).ok_or_else(|| PolicyError::Inference(format!("unparseable score: {}", reply)))
    }

    // ------------------------------------------------------------------------
    // Arbiter side
    // ------------------------------------------------------------------------

    async fn at_arbiter(
        &self,
        input: Packet,
        ctx: &PolicyContext,
        mut state: SessionRoutingState,
    ) -> Result<PolicyDecision> {
        let text = payload_text(&input.payload);

        if state.force_finalize_requested {
            return self.finalize(&input, ctx, state, &text, "forced").await;
        }

        let role = match parse_decision(&text, &self.settings.role_names()) {
            ArbiterDecision::Finalize => return self.finalize(&input, ctx, state, &text, "arbiter").await,
            ArbiterDecision::Continue(role) => role,
        };

        state.arbiter_continuations += 1;
        let rounds_capped = state.total_rounds >= self.settings.max_rounds;
        let continuations_capped = state.arbiter_continuations >= self.settings.judge_continuation_cap;

        if rounds_capped || continuations_capped {
            state.force_finalize_requested = true;
            let reason = if rounds_capped { "max_rounds" } else { "continuation_cap" };
            let payload = json!({
                "forceFinalize": true,
                "text": text,
                "reason": reason,
                "history": state.sidecar(self.settings.sidecar_window),
                "totalRounds": state.total_rounds,
            });
            let packet = route_to(&input, ctx, &self.settings.arbiter_label, payload)?;
            info!(
                session_id = %input.session_id,
                reason = reason,
                continuations = state.arbiter_continuations,
                "Cap reached, requesting forced finalization"
            );
            counter!("vdag_router_forced_finalizations_total").increment(1);
            self.store.put(&input.session_id, state).await?;
            return Ok(PolicyDecision::Forward(packet));
        }

        let Some(target) = self.settings.role(&role).cloned() else {
            return self.finalize(&input, ctx, state, &text, "arbiter").await;
        };
        let Some(opponent) = self.settings.opponent_of(&target.name).cloned() else {
            return self.finalize(&input, ctx, state, &text, "arbiter").await;
        };

        // The continued role must have something to answer
        let prompt = state
            .opponent_utterance(&target.name, &opponent.name)
            .unwrap_or_else(|| text.clone());

        let mut payload = Map::new();
        payload.insert("role".into(), json!(opponent.name));
        payload.insert("text".into(), json!(prompt));
        if let Some(own) = state.last_utterance_by_role.get(&target.name) {
            payload.insert("receiverLastTurn".into(), json!({ "role": target.name, "text": own }));
        }
        payload.insert("history".into(), json!(state.sidecar(self.settings.sidecar_window)));
        payload.insert("arbiterNote".into(), json!(text));
        payload.insert("continuation".into(), json!(state.arbiter_continuations));

        state.retry_pending = None;
        let packet = route_to(&input, ctx, &target.label, Value::Object(payload))?;
        info!(session_id = %input.session_id, role = %target.name, "Arbiter continued role");
        self.store.put(&input.session_id, state).await?;
        Ok(PolicyDecision::Forward(packet))
    }

    async fn finalize(
        &self,
        input: &Packet,
        ctx: &PolicyContext,
        state: SessionRoutingState,
        text: &str,
        cause: &'static str,
    ) -> Result<PolicyDecision> {
        let payload = json!({
            "decision": "FINALIZE",
            "text": text,
            "history": state.sidecar(self.settings.sidecar_window),
            "totalRounds": state.total_rounds,
            "roundsByRole": state.rounds_by_role,
        });
        let packet = input
            .rewrite_graph(|g| g.finalize(&ctx.node_label, ctx.subgraph()))?
            .with_payload(payload);

        self.store.remove(&input.session_id).await?;
        self.locks.release(&input.session_id);
        info!(
            session_id = %input.session_id,
            cause = cause,
            total_rounds = state.total_rounds,
            "Session finalized"
        );
        Ok(PolicyDecision::Forward(packet))
    }
}

#[async_trait]
impl Policy for CyclicRouter {
    async fn evaluate(&self, _params: &Value, input: Packet, ctx: &PolicyContext) -> Result<PolicyDecision> {
        let _guard = self.locks.acquire(&input.session_id).await;
        let state = self.store.get(&input.session_id).await?.unwrap_or_default();

        if ctx.node_label == self.settings.arbiter_label {
            self.at_arbiter(input, ctx, state).await
        } else {
            self.at_peer(input, ctx, state).await
        }
    }

    async fn manage(&self, action: &str, data: Value) -> Result<Value> {
        match action {
            "settings" => Ok(serde_json::to_value(&self.settings)?),
            "state" => {
                let session_id = session_arg(&data)?;
                let state = self.store.get(session_id).await?;
                Ok(json!({ "sessionId": session_id, "state": state }))
            }
            "reset" => {
                let session_id = session_arg(&data)?;
                let _guard = self.locks.acquire(session_id).await;
                self.store.remove(session_id).await?;
                self.locks.release(session_id);
                Ok(json!({ "sessionId": session_id, "reset": true }))
            }
            other => Err(PolicyError::UnsupportedAction(other.to_string())),
        }
    }
}

fn session_arg(data: &Value) -> Result<&str> {
    data.get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| PolicyError::BadRequest("sessionId is required".to_string()))
}

fn payload_text(payload: &Value) -> String {
    payload
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| payload.as_str())
        .unwrap_or_default()
        .to_string()
}

fn payload_role(payload: &Value) -> Option<String> {
    payload
        .get("role")
        .and_then(Value::as_str)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
}

/// Overwrite the executing node's outputs with `target_label`'s node
fn route_to(input: &Packet, ctx: &PolicyContext, target_label: &str, payload: Value) -> Result<Packet> {
    let packet = input.rewrite_graph(|g| {
        g.set_destination_nodes(&ctx.node_label, ctx.subgraph(), &[target_label], &ctx.assignments)
    })?;
    Ok(packet.with_payload(payload))
}

/// First number in an evaluator reply
fn parse_score(reply: &str) -> Option<f64> {
    reply
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find_map(|token| token.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;
    use parking_lot::Mutex;
    use vd_common::{AssignmentTable, NodeOutputs, OutputDescriptor, RoutingGraph};
    use crate::session_store::MemorySessionStore;

    /// Replies from a script, then repeats `fallback`
    struct ScriptedEvaluator {
        script: Mutex<VecDeque<Result<String>>>,
        fallback: String,
    }

    impl ScriptedEvaluator {
        fn always(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                fallback: reply.to_string(),
            })
        }

        fn failing() -> Arc<Self> {
            let script: VecDeque<Result<String>> = (0..16)
                .map(|_| Err(PolicyError::Inference("down".into())))
                .collect();
            Arc::new(Self {
                script: Mutex::new(script),
                fallback: "1.0".to_string(),
            })
        }
    }

    #[async_trait]
    impl InferenceClient for ScriptedEvaluator {
        async fn infer(&self, _model_id: &str, _prompt: &str) -> Result<String> {
            match self.script.lock().pop_front() {
                Some(reply) => reply,
                None => Ok(self.fallback.clone()),
            }
        }
    }

    const LABELS: [(&str, &str); 3] = [("debater_a", "node-a"), ("debater_b", "node-b"), ("judge", "node-j")];

    fn table() -> Arc<AssignmentTable> {
        let mut table = AssignmentTable::new();
        for (label, node) in LABELS {
            table.assign(label, OutputDescriptor::new("redis", 6379, format!("q-{}", node), node));
        }
        Arc::new(table)
    }

    fn graph_json() -> String {
        let mut nodes = NodeOutputs::new();
        for (label, _) in LABELS {
            nodes.insert(label.to_string(), Vec::new());
        }
        RoutingGraph::Flat(nodes).to_json().unwrap()
    }

    fn settings() -> CyclicRouterSettings {
        CyclicRouterSettings {
            roles: vec![
                RoleBinding { name: "A".into(), label: "debater_a".into() },
                RoleBinding { name: "B".into(), label: "debater_b".into() },
            ],
            arbiter_label: "judge".into(),
            judge_interval_rounds: 0,
            max_consecutive_by_same_role: 10,
            max_rounds: 100,
            judge_continuation_cap: 10,
            max_router_retries: 2,
            ..Default::default()
        }
    }

    struct Harness {
        router: CyclicRouter,
        store: Arc<MemorySessionStore<SessionRoutingState>>,
        table: Arc<AssignmentTable>,
    }

    impl Harness {
        fn new(settings: CyclicRouterSettings, evaluator: Arc<ScriptedEvaluator>) -> Self {
            let store = Arc::new(MemorySessionStore::<SessionRoutingState>::new(Duration::from_secs(60)));
            let router = CyclicRouter::new(settings, store.clone(), evaluator).unwrap();
            Self { router, store, table: table() }
        }

        async fn hop(&self, label: &str, payload: Value) -> Packet {
            let packet = Packet::new("debate::s1", 1, payload).with_routing_graph(graph_json());
            let ctx = PolicyContext::new(label, Some("debate".into()), self.table.clone());
            match self.router.evaluate(&Value::Null, packet, &ctx).await.unwrap() {
                PolicyDecision::Forward(p) => p,
                other => panic!("unexpected decision {:?}", other),
            }
        }

        async fn state(&self) -> Option<SessionRoutingState> {
            self.store.get("debate::s1").await.unwrap()
        }
    }

    /// Node ids the packet now routes to from `label`
    fn destinations(packet: &Packet, label: &str) -> Vec<String> {
        packet
            .graph()
            .unwrap()
            .unwrap()
            .outputs_for(label, None)
            .unwrap()
            .into_iter()
            .map(|d| d.node_id)
            .collect()
    }

    fn label_of(node_id: &str) -> &'static str {
        LABELS.iter().find(|(_, n)| *n == node_id).map(|(l, _)| *l).unwrap()
    }

    #[tokio::test]
    async fn test_third_consecutive_pass_routes_to_arbiter() {
        let mut s = settings();
        s.max_consecutive_by_same_role = 3;
        let h = Harness::new(s, ScriptedEvaluator::always("0.9"));

        let first = h.hop("debater_a", json!({"role": "A", "text": "a1"})).await;
        assert_eq!(destinations(&first, "debater_a"), vec!["node-b"]);
        let second = h.hop("debater_a", json!({"role": "A", "text": "a2"})).await;
        assert_eq!(destinations(&second, "debater_a"), vec!["node-b"]);
        let third = h.hop("debater_a", json!({"role": "A", "text": "a3"})).await;
        assert_eq!(destinations(&third, "debater_a"), vec!["node-j"]);
        assert_eq!(third.payload["escalationReason"], "consecutive_limit");
        assert_eq!(third.payload["replyFormat"], REPLY_FORMAT);

        assert_eq!(h.state().await.unwrap().consecutive_same_role_count, 0);
    }

    #[tokio::test]
    async fn test_round_cap_forces_exactly_one_finalization_request() {
        let mut s = settings();
        s.max_rounds = 2;
        let h = Harness::new(s, ScriptedEvaluator::always("0.9"));

        let a = h.hop("debater_a", json!({"role": "A", "text": "a1"})).await;
        assert_eq!(destinations(&a, "debater_a"), vec!["node-b"]);
        let b = h.hop("debater_b", json!({"role": "B", "text": "b1"})).await;
        assert_eq!(destinations(&b, "debater_b"), vec!["node-j"]);

        let forced = h.hop("judge", json!({"text": "CONTINUE_A"})).await;
        assert_eq!(destinations(&forced, "judge"), vec!["node-j"]);
        assert_eq!(forced.payload["forceFinalize"], true);
        assert!(h.state().await.unwrap().force_finalize_requested);

        // arbiter still says continue; it no longer matters
        let done = h.hop("judge", json!({"text": "CONTINUE_A"})).await;
        assert!(destinations(&done, "judge").is_empty());
        assert_eq!(done.payload["decision"], "FINALIZE");
        assert!(h.state().await.is_none());
    }

    #[tokio::test]
    async fn test_retry_budget_then_escalate() {
        let h = Harness::new(settings(), ScriptedEvaluator::always("0.1"));

        let first = h.hop("debater_a", json!({"role": "A", "text": "weak"})).await;
        assert_eq!(destinations(&first, "debater_a"), vec!["node-a"]);
        assert_eq!(first.payload["underReview"], true);

        let second = h.hop("debater_a", json!({"role": "A", "text": "still weak"})).await;
        assert_eq!(destinations(&second, "debater_a"), vec!["node-a"]);

        let third = h.hop("debater_a", json!({"role": "A", "text": "weak again"})).await;
        assert_eq!(destinations(&third, "debater_a"), vec!["node-j"]);
        assert_eq!(third.payload["escalationReason"], "retry_budget_exhausted");

        let state = h.state().await.unwrap();
        // retried candidates never advanced the round counter
        assert_eq!(state.total_rounds, 1);
        assert_eq!(state.retry_pending, None);
    }

    #[tokio::test]
    async fn test_evaluator_failure_escalates() {
        let h = Harness::new(settings(), ScriptedEvaluator::failing());
        let packet = h.hop("debater_a", json!({"role": "A", "text": "a1"})).await;
        assert_eq!(destinations(&packet, "debater_a"), vec!["node-j"]);
        assert_eq!(packet.payload["escalationReason"], "evaluator_unavailable");
    }

    #[tokio::test]
    async fn test_unknown_role_escalates() {
        let h = Harness::new(settings(), ScriptedEvaluator::always("0.9"));
        let packet = h.hop("debater_a", json!({"role": "C", "text": "who am I"})).await;
        assert_eq!(destinations(&packet, "debater_a"), vec!["node-j"]);
        assert_eq!(packet.payload["escalationReason"], "unknown_role");
    }

    #[tokio::test]
    async fn test_role_falls_back_to_node_label() {
        let h = Harness::new(settings(), ScriptedEvaluator::always("0.9"));
        let packet = h.hop("debater_b", json!({"text": "b1"})).await;
        assert_eq!(destinations(&packet, "debater_b"), vec!["node-a"]);
        assert_eq!(packet.payload["role"], "B");
    }

    #[tokio::test]
    async fn test_continue_carries_opponent_utterance() {
        let mut s = settings();
        s.judge_interval_rounds = 2;
        let h = Harness::new(s, ScriptedEvaluator::always("0.9"));

        h.hop("debater_a", json!({"role": "A", "text": "a1"})).await;
        let escalated = h.hop("debater_b", json!({"role": "B", "text": "b1"})).await;
        assert_eq!(escalated.payload["escalationReason"], "judge_interval");

        let cont = h.hop("judge", json!({"text": "Decision: CONTINUE_A"})).await;
        assert_eq!(destinations(&cont, "judge"), vec!["node-a"]);
        assert_eq!(cont.payload["role"], "B");
        assert_eq!(cont.payload["text"], "b1");
        assert_eq!(cont.payload["receiverLastTurn"]["text"], "a1");
    }

    #[tokio::test]
    async fn test_continue_with_separator_role_names() {
        let mut s = settings();
        s.roles = vec![
            RoleBinding { name: "pro_side".into(), label: "debater_a".into() },
            RoleBinding { name: "con-side".into(), label: "debater_b".into() },
        ];
        s.judge_interval_rounds = 2;
        let h = Harness::new(s, ScriptedEvaluator::always("0.9"));

        let first = h.hop("debater_a", json!({"text": "pro opening"})).await;
        assert_eq!(first.payload["role"], "pro_side");
        let escalated = h.hop("debater_b", json!({"text": "con reply"})).await;
        assert_eq!(destinations(&escalated, "debater_b"), vec!["node-j"]);
        assert_eq!(escalated.payload["options"], json!(["FINALIZE", "CONTINUE_pro_side", "CONTINUE_con-side"]));

        let cont = h.hop("judge", json!({"text": "Decision: CONTINUE_pro_side"})).await;
        assert_eq!(destinations(&cont, "judge"), vec!["node-a"]);
        assert_eq!(cont.payload["text"], "con reply");

        let cont = h.hop("judge", json!({"text": "CONTINUE_con-side"})).await;
        assert_eq!(destinations(&cont, "judge"), vec!["node-b"]);
        assert!(h.state().await.is_some());
    }

    #[tokio::test]
    async fn test_unparseable_arbiter_output_finalizes() {
        let h = Harness::new(settings(), ScriptedEvaluator::always("0.9"));
        h.hop("debater_a", json!({"role": "A", "text": "a1"})).await;

        let done = h.hop("judge", json!({"text": "I cannot decide"})).await;
        assert!(destinations(&done, "judge").is_empty());
        assert!(h.state().await.is_none());
    }

    #[tokio::test]
    async fn test_terminates_within_round_and_continuation_caps() {
        let mut s = settings();
        s.max_rounds = 5;
        s.judge_continuation_cap = 3;
        s.judge_interval_rounds = 2;
        let (max_rounds, cap) = (s.max_rounds, s.judge_continuation_cap);
        let h = Harness::new(s, ScriptedEvaluator::always("0.9"));

        let mut label = "debater_a";
        let mut hops = 0;
        loop {
            hops += 1;
            assert!(hops <= max_rounds + cap + 1, "did not terminate within bound");
            let payload = if label == "judge" {
                json!({"text": "CONTINUE_A"})
            } else {
                json!({"text": format!("turn {}", hops)})
            };
            let packet = h.hop(label, payload).await;
            match destinations(&packet, label).first() {
                Some(node) => label = label_of(node),
                None => break,
            }
        }
        assert!(h.state().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_graph_is_error() {
        let h = Harness::new(settings(), ScriptedEvaluator::always("0.9"));
        let packet = Packet::new("s", 1, json!({"role": "A", "text": "x"}));
        let ctx = PolicyContext::new("debater_a", None, h.table.clone());
        let result = h.router.evaluate(&Value::Null, packet, &ctx).await;
        assert!(matches!(result, Err(PolicyError::Routing(_))));
    }

    #[tokio::test]
    async fn test_manage_reset_clears_state() {
        let h = Harness::new(settings(), ScriptedEvaluator::always("0.9"));
        h.hop("debater_a", json!({"role": "A", "text": "a1"})).await;
        assert!(h.state().await.is_some());

        let reply = h.router.manage("reset", json!({"sessionId": "debate::s1"})).await.unwrap();
        assert_eq!(reply["reset"], true);
        assert!(h.state().await.is_none());

        assert!(h.router.manage("bogus", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_session_lock_swept() {
        let stores = Arc::new(crate::StoreFactory::memory(Duration::from_millis(1)));
        let deps = PolicyDeps {
            inference: ScriptedEvaluator::always("0.9"),
            stores: stores.clone(),
        };
        let spec = PolicySpec::new(POLICY_NAME).with_settings(serde_json::to_value(settings()).unwrap());
        let router = CyclicRouter::from_spec(&spec, &deps).unwrap();

        let packet = Packet::new("debate::gone", 1, json!({"role": "A", "text": "a1"})).with_routing_graph(graph_json());
        let ctx = PolicyContext::new("debater_a", Some("debate".into()), table());
        router.evaluate(&Value::Null, packet, &ctx).await.unwrap();
        assert_eq!(router.locks.len(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stores.sweep_expired(), 1);
        assert!(router.locks.is_empty());
    }

    #[test]
    fn test_rejects_single_role() {
        let mut s = settings();
        s.roles.pop();
        let store = Arc::new(MemorySessionStore::<SessionRoutingState>::new(Duration::from_secs(1)));
        assert!(CyclicRouter::new(s, store, ScriptedEvaluator::always("1")).is_err());
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("0.75"), Some(0.75));
        assert_eq!(parse_score("Score: 0.4/1.0"), Some(0.4));
        assert_eq!(parse_score("excellent"), None);
    }
}
