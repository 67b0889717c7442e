//! Skill-key helpers. Skills here are fixed invocation keys with no
//! content to load (`format_skill_invocation` only ever formats a key +
//! args string) — no markdown-backed discovery machinery is needed. See
//! DESIGN.md.

use regex::Regex;

use crate::config::UNKNOWN_SKILL_PATTERN;

/// Detects the `"Unknown skill: X"` pattern in agent output. Only this
/// exact phrasing is recognized; we do not guess at additional phrasings
/// a backend might use.
pub fn detect_missing_skill(text: &str) -> Option<String> {
    let re = Regex::new(UNKNOWN_SKILL_PATTERN).expect("static regex");
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_unknown_skill_with_namespace() {
        assert_eq!(
            detect_missing_skill("Error: Unknown skill: beagle-python:review-python"),
            Some("beagle-python:review-python".to_string())
        );
    }

    #[test]
    fn returns_none_when_absent() {
        assert_eq!(detect_missing_skill("all good here"), None);
    }
}
