use std::collections::{HashMap, VecDeque};
use serde::{Deserialize, Serialize};
use vd_common::Turn;

/// Per-session bookkeeping owned by the cyclic router
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRoutingState {
    pub rounds_by_role: HashMap<String, u32>,
    pub consecutive_same_role_count: u32,
    pub last_role: Option<String>,
    pub total_rounds: u32,
    pub retry_counts_by_role: HashMap<String, u32>,
    pub last_utterance_by_role: HashMap<String, String>,
    /// Role whose candidate was sent back for another attempt
    pub retry_pending: Option<String>,
    pub force_finalize_requested: bool,
    pub arbiter_continuations: u32,
    pub recent_turns: VecDeque<Turn>,
}

impl SessionRoutingState {
    /// Count a fresh turn by `role`
    pub fn record_turn(&mut self, role: &str, text: &str, window: usize) {
        if self.last_role.as_deref() == Some(role) {
            self.consecutive_same_role_count += 1;
        } else {
            self.consecutive_same_role_count = 1;
            self.last_role = Some(role.to_string());
        }
        self.total_rounds += 1;
        *self.rounds_by_role.entry(role.to_string()).or_insert(0) += 1;
        self.last_utterance_by_role.insert(role.to_string(), text.to_string());
        self.push_recent(role, text, window);
    }

    /// A retried candidate replaces the attempt it retried, without counting
    pub fn replace_candidate(&mut self, role: &str, text: &str) {
        self.last_utterance_by_role.insert(role.to_string(), text.to_string());
        if let Some(last) = self.recent_turns.back_mut() {
            if last.role == role {
                last.text = text.to_string();
                return;
            }
        }
        self.recent_turns.push_back(Turn::new(role, text));
    }

    pub fn retry_count(&self, role: &str) -> u32 {
        self.retry_counts_by_role.get(role).copied().unwrap_or(0)
    }

    pub fn sidecar(&self, window: usize) -> Vec<Turn> {
        let skip = self.recent_turns.len().saturating_sub(window);
        self.recent_turns.iter().skip(skip).cloned().collect()
    }

    /// Most recent thing the opponent of `target` said. The sidecar is
    /// preferred; per-role state covers turns that aged out of it.
    pub fn opponent_utterance(&self, target: &str, opponent: &str) -> Option<String> {
        self.recent_turns
            .iter()
            .rev()
            .find(|t| t.role != target && !t.text.trim().is_empty())
            .map(|t| t.text.clone())
            .or_else(|| self.last_utterance_by_role.get(opponent).cloned())
    }

    fn push_recent(&mut self, role: &str, text: &str, window: usize) {
        self.recent_turns.push_back(Turn::new(role, text));
        while self.recent_turns.len() > window.max(1) {
            self.recent_turns.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_counting() {
        let mut state = SessionRoutingState::default();
        state.record_turn("A", "1", 4);
        state.record_turn("A", "2", 4);
        assert_eq!(state.consecutive_same_role_count, 2);
        state.record_turn("B", "3", 4);
        assert_eq!(state.consecutive_same_role_count, 1);
        assert_eq!(state.total_rounds, 3);
        assert_eq!(state.rounds_by_role["A"], 2);
    }

    #[test]
    fn test_recent_turns_bounded() {
        let mut state = SessionRoutingState::default();
        for i in 0..10 {
            state.record_turn(if i % 2 == 0 { "A" } else { "B" }, &i.to_string(), 3);
        }
        assert_eq!(state.recent_turns.len(), 3);
        assert_eq!(state.recent_turns.back().map(|t| t.text.as_str()), Some("9"));
        assert_eq!(state.sidecar(2).len(), 2);
    }

    #[test]
    fn test_opponent_utterance_falls_back_to_state() {
        let mut state = SessionRoutingState::default();
        state.last_utterance_by_role.insert("B".into(), "old B".into());
        state.record_turn("A", "a1", 1);
        // window only holds A's turn, so B comes from per-role state
        assert_eq!(state.opponent_utterance("A", "B"), Some("old B".to_string()));

        state.record_turn("B", "b2", 1);
        assert_eq!(state.opponent_utterance("A", "B"), Some("b2".to_string()));
    }

    #[test]
    fn test_replace_candidate_keeps_counters() {
        let mut state = SessionRoutingState::default();
        state.record_turn("A", "draft", 4);
        state.replace_candidate("A", "revised");
        assert_eq!(state.total_rounds, 1);
        assert_eq!(state.recent_turns.len(), 1);
        assert_eq!(state.last_utterance_by_role["A"], "revised");
    }
}
