//! Folds one execution's batch into a session's merged dataset.
//!
//! Pages are keyed by canonical URL and compared by content fingerprint, so
//! merging the same batch twice changes nothing. Field disagreements become
//! first-class conflicts; rules only decide whether a human is needed.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use siteintel_common::{
    is_empty_value, AuditEntry, AuditKind, DataConflict, FieldCandidate, PageRecord, Phase,
    Provenance, ResolutionRule, ResolutionType, ResolvedField, Session, TargetSchema,
};

use crate::adapter::{ExtractedField, ScrapeBatch};
use crate::lock::canonicalize_url;
use crate::quality::page_contribution;

/// Where a batch came from.
#[derive(Debug, Clone)]
pub struct BatchOrigin<'a> {
    pub scraper_id: &'a str,
    pub execution_id: &'a str,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub pages_added: u32,
    pub pages_updated: u32,
    pub pages_unchanged: u32,
    /// Non-empty field observations in the batch.
    pub data_points: u32,
    pub fields_set: u32,
    pub links_discovered: u32,
    pub auto_resolved: u32,
    /// Pending conflicts opened or given a new candidate by this merge.
    pub conflicts: Vec<DataConflict>,
}

impl MergeReport {
    pub fn conflicts_opened(&self) -> u32 {
        self.conflicts.len() as u32
    }
}

pub fn fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

pub fn merge_batch(
    session: &mut Session,
    batch: &ScrapeBatch,
    origin: &BatchOrigin<'_>,
    schema: &TargetSchema,
) -> MergeReport {
    let mut report = MergeReport::default();
    let phase = session.phase;

    for page in &batch.pages {
        merge_page(session, &page.url, &page.content, origin, phase, &mut report);
    }

    for field in &batch.fields {
        merge_field(session, field, origin, schema, &mut report);
    }

    for link in &batch.links {
        let link = canonicalize_url(link);
        if !link.is_empty() && session.dataset.links.insert(link) {
            report.links_discovered += 1;
        }
    }

    recount(session);
    report
}

/// Aggregates are derived from the dataset so they can never drift from it.
pub fn recount(session: &mut Session) {
    let dataset = &mut session.dataset;
    dataset.stats.total_pages = dataset.pages.len() as u64;
    dataset.stats.total_links = dataset.links.len() as u64;
    dataset.stats.total_data_points = dataset
        .fields
        .values()
        .filter(|f| !is_empty_value(&f.value))
        .count() as u64;
}

fn merge_page(
    session: &mut Session,
    raw_url: &str,
    content: &str,
    origin: &BatchOrigin<'_>,
    phase: Phase,
    report: &mut MergeReport,
) {
    let url = canonicalize_url(raw_url);
    if url.is_empty() {
        return;
    }
    let fp = fingerprint(content);
    let chars = content.chars().count();

    match session.dataset.pages.get_mut(&url) {
        Some(existing) if existing.fingerprint == fp => {
            report.pages_unchanged += 1;
        }
        Some(existing) => {
            existing.content = content.to_string();
            existing.fingerprint = fp;
            existing.source = origin.scraper_id.to_string();
            existing.execution_id = origin.execution_id.to_string();
            existing.extracted_at = origin.observed_at;
            existing.quality_contribution = page_contribution(chars);
            existing.revision += 1;
            let revision = existing.revision;
            session.audit.push(
                AuditEntry::new(
                    AuditKind::PageReplaced,
                    format!("{url} replaced by {} (revision {revision})", origin.scraper_id),
                    origin.observed_at,
                )
                .for_execution(origin.execution_id),
            );
            report.pages_updated += 1;
        }
        None => {
            session.dataset.pages.insert(
                url.clone(),
                PageRecord {
                    url,
                    content: content.to_string(),
                    fingerprint: fp,
                    source: origin.scraper_id.to_string(),
                    execution_id: origin.execution_id.to_string(),
                    extracted_at: origin.observed_at,
                    phase,
                    quality_contribution: page_contribution(chars),
                    revision: 0,
                },
            );
            *session.dataset.stats.pages_by_phase.entry(phase).or_insert(0) += 1;
            report.pages_added += 1;
        }
    }
}

fn merge_field(
    session: &mut Session,
    field: &ExtractedField,
    origin: &BatchOrigin<'_>,
    schema: &TargetSchema,
    report: &mut MergeReport,
) {
    // Empty observations carry nothing and never displace a value.
    if is_empty_value(&field.value) {
        return;
    }
    report.data_points += 1;

    let incoming = FieldCandidate {
        value: field.value.clone(),
        provenance: Provenance {
            scraper_id: origin.scraper_id.to_string(),
            execution_id: origin.execution_id.to_string(),
            source_url: field.source_url.as_deref().map(canonicalize_url),
            observed_at: origin.observed_at,
        },
    };

    let current = match session.dataset.fields.get(&field.name) {
        Some(current) if !is_empty_value(&current.value) => current.clone(),
        _ => {
            session.dataset.fields.insert(
                field.name.clone(),
                ResolvedField {
                    value: incoming.value,
                    provenance: incoming.provenance,
                },
            );
            report.fields_set += 1;
            return;
        }
    };

    if current.value == incoming.value {
        return;
    }

    // A value already adjudicated against the current one is not reopened,
    // except under prefer_recent where the latest observation always wins.
    let rule = schema.rule_for(&field.name);
    let settled = rule != ResolutionRule::PreferRecent
        && session.conflicts.iter().any(|c| {
            c.field == field.name
                && !c.is_pending()
                && c.has_candidate(&incoming.value)
                && c.resolved_value.as_ref() == Some(&current.value)
        });
    if settled {
        return;
    }

    if let Some(pending) = session
        .conflicts
        .iter_mut()
        .find(|c| c.field == field.name && c.is_pending())
    {
        if !pending.has_candidate(&incoming.value) {
            pending.candidates.push(incoming);
            report.conflicts.push(pending.clone());
        }
        return;
    }

    let existing = FieldCandidate {
        value: current.value.clone(),
        provenance: current.provenance.clone(),
    };
    let now = origin.observed_at;

    match rule {
        ResolutionRule::Manual => {
            let conflict = DataConflict {
                id: Uuid::new_v4(),
                field: field.name.clone(),
                candidates: vec![existing, incoming],
                resolution: ResolutionType::Pending,
                resolved_value: None,
                resolved_by: None,
                resolved_at: None,
                opened_at: now,
            };
            session.audit.push(
                AuditEntry::new(
                    AuditKind::ConflictOpened,
                    format!("{}: {} disagrees with current value", field.name, origin.scraper_id),
                    now,
                )
                .for_execution(origin.execution_id),
            );
            report.conflicts.push(conflict.clone());
            session.conflicts.push(conflict);
        }
        rule @ (ResolutionRule::PreferNonEmpty | ResolutionRule::PreferRecent) => {
            let (winner, rule_name) = match rule {
                ResolutionRule::PreferRecent => (incoming.clone(), "prefer_recent"),
                _ => (existing.clone(), "prefer_non_empty"),
            };
            session.dataset.fields.insert(
                field.name.clone(),
                ResolvedField {
                    value: winner.value.clone(),
                    provenance: winner.provenance,
                },
            );
            session.conflicts.push(DataConflict {
                id: Uuid::new_v4(),
                field: field.name.clone(),
                candidates: vec![existing, incoming],
                resolution: ResolutionType::Automatic,
                resolved_value: Some(winner.value),
                resolved_by: Some(format!("rule:{rule_name}")),
                resolved_at: Some(now),
                opened_at: now,
            });
            session.audit.push(
                AuditEntry::new(
                    AuditKind::FieldAutoResolved,
                    format!("{} settled by {rule_name}", field.name),
                    now,
                )
                .for_execution(origin.execution_id),
            );
            report.auto_resolved += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ScrapedPage;
    use serde_json::json;

    fn session() -> Session {
        let mut s = Session::new("alice", "acme.com", 500, Utc::now());
        s.phase = Phase::Scraping;
        s
    }

    fn origin<'a>(scraper_id: &'a str, execution_id: &'a str) -> BatchOrigin<'a> {
        BatchOrigin {
            scraper_id,
            execution_id,
            observed_at: Utc::now(),
        }
    }

    fn page(url: &str, content: &str) -> ScrapedPage {
        ScrapedPage {
            url: url.into(),
            content: content.into(),
        }
    }

    fn field(name: &str, value: serde_json::Value) -> ExtractedField {
        ExtractedField {
            name: name.into(),
            value,
            source_url: None,
        }
    }

    #[test]
    fn merging_same_batch_twice_is_a_no_op() {
        let schema = TargetSchema::default();
        let mut s = session();
        let batch = ScrapeBatch {
            pages: vec![page("https://acme.com/", "home"), page("https://acme.com/about", "about")],
            fields: vec![field("company_name", json!("Acme"))],
            links: vec!["https://acme.com/careers".into()],
            cost_cents: 5,
        };

        merge_batch(&mut s, &batch, &origin("basic", "e1"), &schema);
        let after_first = s.dataset.clone();
        let report = merge_batch(&mut s, &batch, &origin("basic", "e1"), &schema);

        assert_eq!(s.dataset.stats, after_first.stats);
        assert_eq!(s.dataset.pages.len(), 2);
        assert_eq!(report.pages_added, 0);
        assert_eq!(report.pages_unchanged, 2);
        assert_eq!(report.links_discovered, 0);
        assert!(s.conflicts.is_empty());
    }

    #[test]
    fn duplicate_url_with_identical_content_adds_two_of_three() {
        let schema = TargetSchema::default();
        let mut s = session();
        merge_batch(
            &mut s,
            &ScrapeBatch {
                pages: vec![page("https://acme.com/about", "about")],
                ..Default::default()
            },
            &origin("basic", "e1"),
            &schema,
        );

        let report = merge_batch(
            &mut s,
            &ScrapeBatch {
                pages: vec![
                    page("https://acme.com/about/", "about"),
                    page("https://acme.com/team", "team"),
                    page("https://acme.com/pricing", "pricing"),
                ],
                ..Default::default()
            },
            &origin("deep", "e2"),
            &schema,
        );
        assert_eq!(report.pages_added, 2);
        assert_eq!(s.dataset.stats.total_pages, 3);
        assert_eq!(s.dataset.stats.pages_by_phase[&Phase::Scraping], 3);
    }

    #[test]
    fn changed_content_replaces_in_place_and_audits() {
        let schema = TargetSchema::default();
        let mut s = session();
        let first = ScrapeBatch {
            pages: vec![page("https://acme.com/", "v1")],
            ..Default::default()
        };
        let second = ScrapeBatch {
            pages: vec![page("https://acme.com/", "version two")],
            ..Default::default()
        };
        merge_batch(&mut s, &first, &origin("basic", "e1"), &schema);
        let report = merge_batch(&mut s, &second, &origin("deep", "e2"), &schema);

        assert_eq!(report.pages_updated, 1);
        assert_eq!(s.dataset.pages.len(), 1);
        let record = &s.dataset.pages["https://acme.com/"];
        assert_eq!(record.content, "version two");
        assert_eq!(record.source, "deep");
        assert_eq!(record.revision, 1);
        assert_eq!(s.audit.last().unwrap().kind, AuditKind::PageReplaced);
    }

    #[test]
    fn manual_field_disagreement_opens_pending_conflict() {
        let schema = TargetSchema::default();
        let mut s = session();
        merge_batch(
            &mut s,
            &ScrapeBatch {
                fields: vec![field("employee_count", json!(250))],
                ..Default::default()
            },
            &origin("basic", "e1"),
            &schema,
        );
        let report = merge_batch(
            &mut s,
            &ScrapeBatch {
                fields: vec![field("employee_count", json!(300))],
                ..Default::default()
            },
            &origin("deep", "e2"),
            &schema,
        );

        assert_eq!(report.conflicts_opened(), 1);
        let conflict = &s.conflicts[0];
        assert!(conflict.is_pending());
        assert_eq!(conflict.candidates.len(), 2);
        assert_eq!(conflict.candidates[0].provenance.scraper_id, "basic");
        assert_eq!(conflict.candidates[1].provenance.scraper_id, "deep");
        assert_eq!(s.dataset.fields["employee_count"].value, json!(250));

        // same disagreement again adds nothing
        let again = merge_batch(
            &mut s,
            &ScrapeBatch {
                fields: vec![field("employee_count", json!(300))],
                ..Default::default()
            },
            &origin("deep", "e2"),
            &schema,
        );
        assert_eq!(again.conflicts_opened(), 0);
        assert_eq!(s.conflicts.len(), 1);
        assert_eq!(s.conflicts[0].candidates.len(), 2);
    }

    #[test]
    fn third_value_joins_the_pending_conflict() {
        let schema = TargetSchema::default();
        let mut s = session();
        for (scraper, value) in [("a", 10), ("b", 20), ("c", 30)] {
            merge_batch(
                &mut s,
                &ScrapeBatch {
                    fields: vec![field("founded_year", json!(value))],
                    ..Default::default()
                },
                &origin(scraper, scraper),
                &schema,
            );
        }
        assert_eq!(s.conflicts.len(), 1);
        assert_eq!(s.conflicts[0].candidates.len(), 3);
    }

    #[test]
    fn prefer_recent_replaces_automatically() {
        let schema = TargetSchema::default();
        let mut s = session();
        for (scraper, text) in [("basic", "Widgets"), ("deep", "Widgets and gadgets")] {
            merge_batch(
                &mut s,
                &ScrapeBatch {
                    fields: vec![field("description", json!(text))],
                    ..Default::default()
                },
                &origin(scraper, scraper),
                &schema,
            );
        }
        assert_eq!(s.dataset.fields["description"].value, json!("Widgets and gadgets"));
        assert_eq!(s.dataset.fields["description"].provenance.scraper_id, "deep");
        let conflict = &s.conflicts[0];
        assert_eq!(conflict.resolution, ResolutionType::Automatic);
        assert_eq!(conflict.resolved_by.as_deref(), Some("rule:prefer_recent"));
    }

    #[test]
    fn prefer_recent_follows_a_value_that_comes_back() {
        let schema = TargetSchema::default();
        let mut s = session();
        let observations = [("basic", "Widgets"), ("deep", "Gadgets"), ("basic", "Widgets")];
        for (i, (scraper, text)) in observations.into_iter().enumerate() {
            merge_batch(
                &mut s,
                &ScrapeBatch {
                    fields: vec![field("description", json!(text))],
                    ..Default::default()
                },
                &origin(scraper, &format!("e{i}")),
                &schema,
            );
        }
        assert_eq!(s.dataset.fields["description"].value, json!("Widgets"));
        assert_eq!(s.dataset.fields["description"].provenance.scraper_id, "basic");
        assert_eq!(s.conflicts.len(), 2);
        assert_eq!(s.conflicts[1].resolved_value, Some(json!("Widgets")));
    }

    #[test]
    fn prefer_non_empty_keeps_first_value_and_records_it_once() {
        let schema = TargetSchema::default();
        let mut s = session();
        let batches = [("basic", json!("")), ("basic", json!("Acme")), ("deep", json!("ACME Inc"))];
        for (scraper, value) in batches {
            merge_batch(
                &mut s,
                &ScrapeBatch {
                    fields: vec![field("company_name", value)],
                    ..Default::default()
                },
                &origin(scraper, scraper),
                &schema,
            );
        }
        assert_eq!(s.dataset.fields["company_name"].value, json!("Acme"));
        assert_eq!(s.conflicts.len(), 1);
        assert_eq!(s.conflicts[0].resolution, ResolutionType::Automatic);

        // replaying the losing observation does not stack more records
        let report = merge_batch(
            &mut s,
            &ScrapeBatch {
                fields: vec![field("company_name", json!("ACME Inc"))],
                ..Default::default()
            },
            &origin("deep", "deep"),
            &schema,
        );
        assert_eq!(report.auto_resolved, 0);
        assert_eq!(s.conflicts.len(), 1);
    }

    #[test]
    fn empty_observation_never_displaces_a_value() {
        let schema = TargetSchema::default();
        let mut s = session();
        for value in [json!("Acme"), json!(null), json!("   ")] {
            merge_batch(
                &mut s,
                &ScrapeBatch {
                    fields: vec![field("industry", value)],
                    ..Default::default()
                },
                &origin("basic", "e"),
                &schema,
            );
        }
        assert_eq!(s.dataset.fields["industry"].value, json!("Acme"));
        assert!(s.conflicts.is_empty());
        assert_eq!(s.dataset.stats.total_data_points, 1);
    }
}
