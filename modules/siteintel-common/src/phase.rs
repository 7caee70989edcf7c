use serde::{Deserialize, Serialize};

/// Coarse lifecycle stage of a research session.
///
/// The happy path runs `Discovery → SitemapSelection → Scraping → Extraction →
/// Enrichment → Generation → Complete`. `Failed` and `Aborted` are terminal and
/// reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Discovery,
    SitemapSelection,
    Scraping,
    Extraction,
    Enrichment,
    Generation,
    Complete,
    Failed,
    Aborted,
}

impl Phase {
    pub const PIPELINE: [Phase; 7] = [
        Phase::Discovery,
        Phase::SitemapSelection,
        Phase::Scraping,
        Phase::Extraction,
        Phase::Enrichment,
        Phase::Generation,
        Phase::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::SitemapSelection => "sitemap-selection",
            Phase::Scraping => "scraping",
            Phase::Extraction => "extraction",
            Phase::Enrichment => "enrichment",
            Phase::Generation => "generation",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
            Phase::Aborted => "aborted",
        }
    }

    /// The next phase on the happy path. `None` for terminal phases.
    pub fn successor(&self) -> Option<Phase> {
        match self {
            Phase::Discovery => Some(Phase::SitemapSelection),
            Phase::SitemapSelection => Some(Phase::Scraping),
            Phase::Scraping => Some(Phase::Extraction),
            Phase::Extraction => Some(Phase::Enrichment),
            Phase::Enrichment => Some(Phase::Generation),
            Phase::Generation => Some(Phase::Complete),
            Phase::Complete | Phase::Failed | Phase::Aborted => None,
        }
    }

    /// Whether leaving this phase for its successor needs a human approval.
    /// Scraping → extraction is the only edge that may advance on criteria alone.
    pub fn exit_requires_approval(&self) -> bool {
        !matches!(self, Phase::Scraping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed | Phase::Aborted)
    }

    /// Phases in which scraper executions may be requested.
    pub fn allows_execution(&self) -> bool {
        matches!(
            self,
            Phase::Discovery
                | Phase::SitemapSelection
                | Phase::Scraping
                | Phase::Extraction
                | Phase::Enrichment
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(Phase::Discovery),
            "sitemap-selection" => Ok(Phase::SitemapSelection),
            "scraping" => Ok(Phase::Scraping),
            "extraction" => Ok(Phase::Extraction),
            "enrichment" => Ok(Phase::Enrichment),
            "generation" => Ok(Phase::Generation),
            "complete" => Ok(Phase::Complete),
            "failed" => Ok(Phase::Failed),
            "aborted" => Ok(Phase::Aborted),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_successors_chain_to_complete() {
        let mut phase = Phase::Discovery;
        let mut visited = vec![phase];
        while let Some(next) = phase.successor() {
            visited.push(next);
            phase = next;
        }
        assert_eq!(visited, Phase::PIPELINE.to_vec());
    }

    #[test]
    fn only_scraping_exit_is_ungated() {
        for phase in Phase::PIPELINE {
            assert_eq!(phase.exit_requires_approval(), phase != Phase::Scraping, "{phase}");
        }
    }

    #[test]
    fn string_round_trip_matches_serde() {
        for phase in [Phase::SitemapSelection, Phase::Aborted] {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase.as_str()));
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
    }

    #[test]
    fn generation_and_terminals_refuse_execution() {
        assert!(Phase::Scraping.allows_execution());
        assert!(!Phase::Generation.allows_execution());
        assert!(!Phase::Aborted.allows_execution());
    }
}
