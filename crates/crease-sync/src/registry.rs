//! Source registry: the ingestable sources and how to reach them.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: i64,
    pub display_name: String,
    pub base_url: String,
    pub enabled: bool,
    /// Pages need script execution; route fetches to the browser transport.
    #[serde(default)]
    pub requires_js: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn source(&self, source_id: i64) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Resolve a possibly-relative URL against a source's base URL.
pub fn join_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_urls_pass_through() {
        assert_eq!(
            join_url("https://base.example", "https://other.example/p"),
            "https://other.example/p"
        );
    }

    #[test]
    fn relative_urls_join_without_double_slashes() {
        assert_eq!(
            join_url("https://base.example/", "/Archive/Events/2024.html"),
            "https://base.example/Archive/Events/2024.html"
        );
    }

    #[test]
    fn registry_parses_yaml() {
        let text = r#"
sources:
  - source_id: 1
    display_name: CricketArchive
    base_url: https://cricketarchive.example
    enabled: true
  - source_id: 2
    display_name: Cricsheet
    base_url: https://cricsheet.example
    enabled: false
    requires_js: true
    notes: CSV supplementary source
"#;
        let registry: SourceRegistry = serde_yaml::from_str(text).expect("parse");
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.enabled().count(), 1);
        assert!(registry.source(2).expect("source 2").requires_js);
        assert!(registry.source(3).is_none());
    }
}
