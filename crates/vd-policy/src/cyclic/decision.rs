//! Arbiter output parsing
//!
//! Structured contract first: a JSON object `{"decision": "FINALIZE" | "CONTINUE_<ROLE>"}`
//! anywhere in the text (the last one wins). Otherwise the last decision token
//! in free text, skipping lines that echo the option list (`FINALIZE | CONTINUE_A`).
//! Anything unparseable finalizes.

use std::sync::OnceLock;
use regex::Regex;

const OPTION_SEPARATOR: char = '|';

/// Instruction sent with every escalation so arbiters answer in the structured form
pub const REPLY_FORMAT: &str = r#"Reply with a JSON object {"decision": "<one of the options>"}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterDecision {
    Finalize,
    Continue(String),
}

fn token_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\b(FINALIZE\b|CONTINUE_[\w-]+)").ok())
        .as_ref()
}

fn object_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{[^{}]*\}").ok()).as_ref()
}

/// Map one token to a decision; unknown roles are not a decision
fn classify(token: &str, roles: &[String]) -> Option<ArbiterDecision> {
    let token = token.trim();
    if token.eq_ignore_ascii_case("FINALIZE") {
        return Some(ArbiterDecision::Finalize);
    }
    let suffix = token
        .get(..9)
        .filter(|prefix| prefix.eq_ignore_ascii_case("CONTINUE_"))
        .map(|_| token[9..].trim_end_matches('-'))?;
    roles
        .iter()
        .find(|r| r.eq_ignore_ascii_case(suffix))
        .map(|r| ArbiterDecision::Continue(r.clone()))
}

fn structured(text: &str, roles: &[String]) -> Option<ArbiterDecision> {
    object_pattern()?
        .find_iter(text)
        .filter_map(|m| serde_json::from_str::<serde_json::Value>(m.as_str()).ok())
        .filter_map(|v| v.get("decision").and_then(|d| d.as_str()).map(str::to_string))
        .filter_map(|d| classify(&d, roles))
        .last()
}

fn free_text(text: &str, roles: &[String]) -> Option<ArbiterDecision> {
    let pattern = token_pattern()?;
    text.lines()
        .filter(|line| !line.contains(OPTION_SEPARATOR))
        .flat_map(|line| pattern.find_iter(line))
        .filter_map(|m| classify(m.as_str(), roles))
        .last()
}

pub fn parse_decision(text: &str, roles: &[String]) -> ArbiterDecision {
    structured(text, roles)
        .or_else(|| free_text(text, roles))
        .unwrap_or(ArbiterDecision::Finalize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> Vec<String> {
        vec!["A".to_string(), "B".to_string()]
    }

    #[test]
    fn test_structured_decision_wins() {
        let text = r#"I lean FINALIZE but {"decision": "CONTINUE_B"}"#;
        assert_eq!(parse_decision(text, &roles()), ArbiterDecision::Continue("B".into()));
    }

    #[test]
    fn test_last_token_wins() {
        let text = "At first CONTINUE_A seemed right.\nOn reflection: FINALIZE";
        assert_eq!(parse_decision(text, &roles()), ArbiterDecision::Finalize);

        let text = "FINALIZE would be premature.\nDecision: CONTINUE_A";
        assert_eq!(parse_decision(text, &roles()), ArbiterDecision::Continue("A".into()));
    }

    #[test]
    fn test_option_echo_is_ignored() {
        let text = "Options: FINALIZE | CONTINUE_A | CONTINUE_B\nCONTINUE_B";
        assert_eq!(parse_decision(text, &roles()), ArbiterDecision::Continue("B".into()));

        let text = "Options: FINALIZE | CONTINUE_A | CONTINUE_B";
        assert_eq!(parse_decision(text, &roles()), ArbiterDecision::Finalize);
    }

    #[test]
    fn test_unknown_role_is_not_a_decision() {
        let text = "CONTINUE_A\nCONTINUE_Z";
        assert_eq!(parse_decision(text, &roles()), ArbiterDecision::Continue("A".into()));
    }

    #[test]
    fn test_reply_format_echo_is_not_a_decision() {
        let text = format!("{}\nCONTINUE_B", REPLY_FORMAT);
        assert_eq!(parse_decision(&text, &roles()), ArbiterDecision::Continue("B".into()));
        assert_eq!(parse_decision(REPLY_FORMAT, &roles()), ArbiterDecision::Finalize);
    }

    #[test]
    fn test_garbage_finalizes() {
        assert_eq!(parse_decision("no idea", &roles()), ArbiterDecision::Finalize);
        assert_eq!(parse_decision("", &roles()), ArbiterDecision::Finalize);
    }

    #[test]
    fn test_role_names_with_separators() {
        let roles = vec!["pro_side".to_string(), "con-side".to_string()];
        assert_eq!(
            parse_decision("Decision: CONTINUE_pro_side", &roles),
            ArbiterDecision::Continue("pro_side".into())
        );
        assert_eq!(
            parse_decision("I would say CONTINUE_con-side.", &roles),
            ArbiterDecision::Continue("con-side".into())
        );
        // a longer name sharing the prefix is a different role
        assert_eq!(parse_decision("CONTINUE_pro_side_b", &roles), ArbiterDecision::Finalize);
        assert_eq!(parse_decision("FINALIZED", &roles), ArbiterDecision::Finalize);
        assert_eq!(
            parse_decision("FINALIZED? no. CONTINUE_pro_side", &roles),
            ArbiterDecision::Continue("pro_side".into())
        );
    }

    #[test]
    fn test_case_insensitive_role_match() {
        let roles = vec!["pro".to_string(), "con".to_string()];
        assert_eq!(parse_decision("CONTINUE_PRO", &roles), ArbiterDecision::Continue("pro".into()));
    }
}
