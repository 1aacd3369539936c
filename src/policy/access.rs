//! Target access control — which sources may address which targets.
//!
//! A target with no rule is open to everyone. Once a target has a rule, only
//! the listed sources may reach it.

use std::collections::{HashMap, HashSet};

/// Target → allowed sources policy.
#[derive(Debug, Default, Clone)]
pub struct AccessPolicy {
    /// target → set of allowed sources
    rules: HashMap<String, HashSet<String>>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn from_rules(rules: &HashMap<String, Vec<String>>) -> Self {
        let mut policy = Self::new();
        for (target, sources) in rules {
            policy.restrict(target, sources);
        }
        policy
    }

    /// Allow `source` to address `target`, creating a rule if none exists.
    pub fn allow(&mut self, target: &str, source: &str) {
        self.rules
            .entry(target.to_string())
            .or_default()
            .insert(source.to_string());
    }

    /// Replace the rule for `target` with exactly `sources`.
    ///
    /// An empty list closes the target to every source.
    pub fn restrict(&mut self, target: &str, sources: &[String]) {
        self.rules
            .insert(target.to_string(), sources.iter().cloned().collect());
    }

    /// Remove `source` from the rule for `target`.
    pub fn revoke(&mut self, target: &str, source: &str) {
        if let Some(set) = self.rules.get_mut(target) {
            set.remove(source);
        }
    }

    /// Check if `source` may address `target`.
    pub fn check_access(&self, source: &str, target: &str) -> bool {
        self.rules
            .get(target)
            .map_or(true, |set| set.contains(source))
    }

    /// Sources allowed for `target`, sorted. `None` means unrestricted.
    pub fn sources_for(&self, target: &str) -> Option<Vec<String>> {
        self.rules.get(target).map(|set| {
            let mut ids: Vec<String> = set.iter().cloned().collect();
            ids.sort();
            ids
        })
    }

    /// Remove the rule for `target`, opening it again.
    pub fn clear_target(&mut self, target: &str) {
        self.rules.remove(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrestricted_target_is_open() {
        let policy = AccessPolicy::new();
        assert!(policy.check_access("anyone", "math-service"));
        assert!(policy.sources_for("math-service").is_none());
    }

    #[test]
    fn test_allow_and_check() {
        let mut policy = AccessPolicy::new();
        policy.allow("math-service", "alice");

        assert!(policy.check_access("alice", "math-service"));
        assert!(!policy.check_access("mallory", "math-service"));
        assert!(policy.check_access("mallory", "string-service"));
    }

    #[test]
    fn test_restrict_to_empty_closes_target() {
        let mut policy = AccessPolicy::new();
        policy.restrict("python", &[]);
        assert!(!policy.check_access("alice", "python"));
    }

    #[test]
    fn test_from_rules_and_sources_sorted() {
        let rules: HashMap<String, Vec<String>> = [(
            "python".to_string(),
            vec!["zed".to_string(), "amy".to_string()],
        )]
        .into_iter()
        .collect();
        let policy = AccessPolicy::from_rules(&rules);
        assert_eq!(policy.sources_for("python").unwrap(), vec!["amy", "zed"]);
    }

    #[test]
    fn test_revoke_and_clear() {
        let mut policy = AccessPolicy::new();
        policy.allow("python", "amy");
        policy.revoke("python", "amy");
        assert!(!policy.check_access("amy", "python"));

        policy.clear_target("python");
        assert!(policy.check_access("amy", "python"));
    }
}
