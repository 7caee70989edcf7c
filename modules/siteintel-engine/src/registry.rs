//! Available scrapers and what the advisor knows about them.
//!
//! Profiles come from a TOML file; secrets and endpoints that vary per
//! deployment stay in the environment.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use siteintel_common::{Cents, TargetSchema};

use crate::adapter::{ScraperAdapter, ScraperConfig};
use crate::remote::RemoteScraperAdapter;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScraperProfile {
    pub id: String,
    /// HTTP endpoint for tools driven through `RemoteScraperAdapter`.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub estimated_cost_cents: Cents,
    /// 0.0-1.0: how trustworthy this tool's output is.
    pub fidelity: f64,
    /// Schema fields this tool tends to fill.
    #[serde(default)]
    pub provides_fields: Vec<String>,
    /// Expected page content per run, in characters.
    #[serde(default)]
    pub depth_yield_chars: u64,
    /// Runs per session after which the tool is considered exhausted.
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub defaults: ScraperConfig,
}

/// TOML file layout: `[[scrapers]]` entries plus an optional `[schema]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub scrapers: Vec<ScraperProfile>,
    #[serde(default)]
    pub schema: Option<TargetSchema>,
}

impl FileConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let config: FileConfig = toml::from_str(content).context("Failed to parse scraper config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scraper config: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("In {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for profile in &self.scrapers {
            if !seen.insert(profile.id.as_str()) {
                bail!("duplicate scraper id: {}", profile.id);
            }
            if !(0.0..=1.0).contains(&profile.fidelity) {
                bail!("scraper {}: fidelity must be within 0.0..=1.0", profile.id);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct ScraperRegistry {
    profiles: BTreeMap<String, ScraperProfile>,
    adapters: HashMap<String, Arc<dyn ScraperAdapter>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile: ScraperProfile, adapter: Arc<dyn ScraperAdapter>) {
        self.adapters.insert(profile.id.clone(), adapter);
        self.profiles.insert(profile.id.clone(), profile);
    }

    /// Builder-style `register`.
    pub fn with(mut self, profile: ScraperProfile, adapter: Arc<dyn ScraperAdapter>) -> Self {
        self.register(profile, adapter);
        self
    }

    /// One `RemoteScraperAdapter` per profile. Every profile needs an endpoint.
    pub fn from_file_config(config: &FileConfig, default_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        let mut registry = Self::new();
        for profile in &config.scrapers {
            let Some(endpoint) = profile.endpoint.as_deref() else {
                bail!("scraper {} has no endpoint", profile.id);
            };
            let timeout = profile
                .defaults
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout);
            let adapter = RemoteScraperAdapter::new(client.clone(), endpoint, timeout)?;
            registry.register(profile.clone(), Arc::new(adapter));
        }
        info!(scrapers = registry.profiles.len(), "Scraper registry loaded");
        Ok(registry)
    }

    pub fn profile(&self, id: &str) -> Option<&ScraperProfile> {
        self.profiles.get(id)
    }

    pub fn adapter(&self, id: &str) -> Option<Arc<dyn ScraperAdapter>> {
        self.adapters.get(id).cloned()
    }

    /// Profiles ordered by id.
    pub fn profiles(&self) -> impl Iterator<Item = &ScraperProfile> {
        self.profiles.values()
    }

    pub fn fidelity(&self, id: &str) -> Option<f64> {
        self.profiles.get(id).map(|p| p.fidelity)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siteintel_common::ResolutionRule;

    const SAMPLE: &str = r#"
        [[scrapers]]
        id = "basic-crawl"
        endpoint = "http://crawler.internal/run"
        estimated_cost_cents = 5
        fidelity = 0.6
        provides_fields = ["company_name", "description"]
        depth_yield_chars = 20000
        max_runs = 3

        [scrapers.defaults]
        page_limit = 25
        flags = { render_js = false }

        [[scrapers]]
        id = "ai-extract"
        endpoint = "http://extractor.internal/run"
        estimated_cost_cents = 40
        fidelity = 0.9
        provides_fields = ["employee_count", "leadership", "pricing"]

        [schema]
        fields = [
            { name = "company_name", rule = "prefer_non_empty" },
            { name = "employee_count" },
        ]
    "#;

    #[test]
    fn parses_profiles_and_schema() {
        let config = FileConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.scrapers.len(), 2);
        let basic = &config.scrapers[0];
        assert_eq!(basic.max_runs, Some(3));
        assert_eq!(basic.defaults.page_limit, Some(25));
        assert_eq!(basic.defaults.flags["render_js"], false);

        let schema = config.schema.unwrap();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.rule_for("employee_count"), ResolutionRule::Manual);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_fidelity() {
        let unknown = r#"
            [[scrapers]]
            id = "x"
            estimated_cost_cents = 1
            fidelity = 0.5
            colour = "blue"
        "#;
        assert!(FileConfig::parse(unknown).is_err());

        let bad = r#"
            [[scrapers]]
            id = "x"
            estimated_cost_cents = 1
            fidelity = 1.5
        "#;
        assert!(FileConfig::parse(bad).is_err());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let dup = r#"
            [[scrapers]]
            id = "x"
            estimated_cost_cents = 1
            fidelity = 0.5

            [[scrapers]]
            id = "x"
            estimated_cost_cents = 2
            fidelity = 0.5
        "#;
        assert!(FileConfig::parse(dup).is_err());
    }

    #[test]
    fn builds_remote_adapters_for_every_profile() {
        let config = FileConfig::parse(SAMPLE).unwrap();
        let registry = ScraperRegistry::from_file_config(&config, Duration::from_secs(60)).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.adapter("ai-extract").is_some());
        assert_eq!(registry.fidelity("basic-crawl"), Some(0.6));
    }
}
