//! URL allow/block policy.
//!
//! Block patterns always win. When an allow-list is configured and non-empty,
//! a URL must match at least one allow pattern to pass.

use regex::Regex;
use tracing::warn;

#[derive(Debug, Default)]
pub struct UrlPolicy {
    allow: Vec<Regex>,
    block: Vec<Regex>,
}

impl UrlPolicy {
    /// Compile pattern lists. Invalid patterns are skipped with a warning
    /// rather than failing the whole policy.
    pub fn new(allow_patterns: &[String], block_patterns: &[String]) -> Self {
        Self {
            allow: compile(allow_patterns, "allowlist"),
            block: compile(block_patterns, "blocklist"),
        }
    }

    pub fn permits(&self, url: &str) -> bool {
        if self.block.iter().any(|re| re.is_match(url)) {
            return false;
        }
        if !self.allow.is_empty() {
            return self.allow.iter().any(|re| re.is_match(url));
        }
        true
    }
}

fn compile(patterns: &[String], list_name: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pat| match Regex::new(pat) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!("invalid {list_name} pattern {pat:?}: {err}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pats(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_policy_permits_everything() {
        let policy = UrlPolicy::new(&[], &[]);
        assert!(policy.permits("https://example.com/Archive/Events/2024.html"));
    }

    #[test]
    fn blocklist_always_wins() {
        let policy = UrlPolicy::new(&pats(&[r"/Archive/"]), &pats(&[r"/Archive/Private/"]));
        assert!(policy.permits("https://example.com/Archive/Events/1.html"));
        assert!(!policy.permits("https://example.com/Archive/Private/1.html"));
    }

    #[test]
    fn nonempty_allowlist_requires_a_match() {
        let policy = UrlPolicy::new(&pats(&[r"/Scorecards/\d+"]), &[]);
        assert!(policy.permits("https://example.com/Scorecards/12345.html"));
        assert!(!policy.permits("https://example.com/News/latest.html"));
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let policy = UrlPolicy::new(&pats(&["(unclosed"]), &pats(&["[bad"]));
        // Both lists compiled empty, so nothing is filtered.
        assert!(policy.permits("https://example.com/anything"));
    }
}
