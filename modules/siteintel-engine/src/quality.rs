//! Composite completeness score for a merged dataset.
//!
//! Every component is non-decreasing in what the dataset holds: more covered
//! fields, more content, or another contributing tool can only raise the
//! score. Freshness is reported but never scored.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use siteintel_common::{MergedDataset, QualityAssessment, QualityLevel, ScraperRun, TargetSchema};

use crate::registry::ScraperRegistry;

/// Characters of page content that count as full depth.
pub const CONTENT_BASELINE_CHARS: f64 = 60_000.0;

pub const COVERAGE_WEIGHT: f64 = 0.5;
pub const DEPTH_WEIGHT: f64 = 0.3;
pub const SOURCE_WEIGHT: f64 = 0.2;

/// Listed in recommendations at most this many at a time.
const MAX_MISSING_IN_RECOMMENDATION: usize = 5;

pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// 0-100 depth score for a content volume.
pub fn depth_score(chars: usize) -> f64 {
    (100.0 * chars as f64 / CONTENT_BASELINE_CHARS).min(100.0)
}

/// Overall-score points a page of this size is worth on its own.
pub fn page_contribution(chars: usize) -> f64 {
    round1(depth_score(chars) * DEPTH_WEIGHT)
}

/// Noisy-or over fidelities, 0-100.
pub fn combined_fidelity<I: IntoIterator<Item = f64>>(fidelities: I) -> f64 {
    let miss: f64 = fidelities
        .into_iter()
        .map(|f| 1.0 - f.clamp(0.0, 1.0))
        .product();
    100.0 * (1.0 - miss)
}

pub fn overall(coverage: f64, depth: f64, source: f64) -> f64 {
    COVERAGE_WEIGHT * coverage + DEPTH_WEIGHT * depth + SOURCE_WEIGHT * source
}

pub struct QualityAssessor<'a> {
    schema: &'a TargetSchema,
    registry: &'a ScraperRegistry,
}

impl<'a> QualityAssessor<'a> {
    pub fn new(schema: &'a TargetSchema, registry: &'a ScraperRegistry) -> Self {
        Self { schema, registry }
    }

    pub fn coverage(&self, dataset: &MergedDataset) -> f64 {
        if self.schema.is_empty() {
            return 0.0;
        }
        let covered = self
            .schema
            .field_names()
            .filter(|f| dataset.has_value(f))
            .count();
        100.0 * covered as f64 / self.schema.len() as f64
    }

    /// Only registered tools count; manual overrides and retired tools add nothing.
    pub fn source_quality(&self, dataset: &MergedDataset) -> f64 {
        combined_fidelity(
            dataset
                .contributing_sources()
                .into_iter()
                .filter_map(|id| self.registry.fidelity(id)),
        )
    }

    pub fn assess(
        &self,
        dataset: &MergedDataset,
        history: &[ScraperRun],
        now: DateTime<Utc>,
    ) -> QualityAssessment {
        let coverage = self.coverage(dataset);
        let depth = depth_score(dataset.total_content_chars());
        let source = self.source_quality(dataset);
        let score = round1(overall(coverage, depth, source));

        let missing_fields: Vec<String> = self
            .schema
            .field_names()
            .filter(|f| !dataset.has_value(f))
            .map(String::from)
            .collect();

        let freshness_hours = dataset
            .latest_ingestion()
            .map(|t| round1((now - t).num_seconds().max(0) as f64 / 3600.0));

        QualityAssessment {
            field_coverage: round1(coverage),
            content_depth: round1(depth),
            freshness_hours,
            source_quality: round1(source),
            overall: score,
            level: QualityLevel::from_score(score),
            recommendations: self.recommendations(&missing_fields, history, depth),
            missing_fields,
            assessed_at: now,
        }
    }

    fn recommendations(&self, missing: &[String], history: &[ScraperRun], depth: f64) -> Vec<String> {
        let ran: BTreeSet<&str> = history.iter().map(|r| r.scraper_id.as_str()).collect();
        let mut out = Vec::new();

        for profile in self.registry.profiles() {
            if ran.contains(profile.id.as_str()) {
                continue;
            }
            let fills: Vec<&str> = profile
                .provides_fields
                .iter()
                .filter(|f| missing.contains(f))
                .map(String::as_str)
                .collect();
            if !fills.is_empty() {
                out.push(format!("Run {} to cover {}", profile.id, fills.join(", ")));
            } else if depth < 100.0 && profile.depth_yield_chars > 0 {
                out.push(format!("Run {} to add page content", profile.id));
            }
        }

        if !missing.is_empty() {
            let shown: Vec<&str> = missing
                .iter()
                .take(MAX_MISSING_IN_RECOMMENDATION)
                .map(String::as_str)
                .collect();
            let more = missing.len().saturating_sub(shown.len());
            let suffix = if more > 0 { format!(" (+{more} more)") } else { String::new() };
            out.push(format!("Still missing: {}{suffix}", shown.join(", ")));
        }
        out
    }
}
