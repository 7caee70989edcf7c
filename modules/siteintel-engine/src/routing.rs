//! Next-step advice: which scraper buys the most quality per cent.
//!
//! Gain estimates start from a prior derived from the scraper's profile and
//! are smoothed toward what its runs in this session actually delivered.
//! Advice is recorded but never enforced.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use siteintel_common::{
    Cents, Confidence, Exclusion, Recommendation, RouteCandidate, RoutingDecision, RunStatus,
    Session, StopReason, TargetSchema,
};

use crate::ledger;
use crate::quality::{self, QualityAssessor};
use crate::registry::{ScraperProfile, ScraperRegistry};

/// Candidates promising less than this many overall-score points are skipped.
pub const MIN_GAIN: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct RoutingAdvisor {
    pub quality_target: f64,
    pub max_run_cost_cents: Option<Cents>,
}

impl Default for RoutingAdvisor {
    fn default() -> Self {
        Self {
            quality_target: 90.0,
            max_run_cost_cents: None,
        }
    }
}

/// Cost a new run of `profile` is expected to incur in this session.
pub fn estimated_cost(session: &Session, profile: &ScraperProfile) -> Cents {
    let costs: Vec<Cents> = session
        .completed_runs(&profile.id)
        .map(|r| r.cost_cents)
        .collect();
    if costs.is_empty() {
        profile.estimated_cost_cents
    } else {
        let total: Cents = costs.iter().sum();
        // round half up
        (total + costs.len() as Cents / 2) / costs.len() as Cents
    }
}

impl RoutingAdvisor {
    /// Quality points the profile would add judged only by what it claims to provide.
    fn prior_gain(
        &self,
        session: &Session,
        profile: &ScraperProfile,
        schema: &TargetSchema,
        registry: &ScraperRegistry,
    ) -> f64 {
        let dataset = &session.dataset;
        let assessor = QualityAssessor::new(schema, registry);

        let coverage_gain = if schema.is_empty() {
            0.0
        } else {
            let fills = profile
                .provides_fields
                .iter()
                .filter(|f| schema.contains(f) && !dataset.has_value(f))
                .count();
            100.0 * fills as f64 / schema.len() as f64
        };

        let chars = dataset.total_content_chars();
        let depth_gain = quality::depth_score(chars + profile.depth_yield_chars as usize)
            - quality::depth_score(chars);

        let source_now = assessor.source_quality(dataset);
        let source_gain = if dataset.contributing_sources().contains(profile.id.as_str()) {
            0.0
        } else {
            let miss = (1.0 - source_now / 100.0) * (1.0 - profile.fidelity.clamp(0.0, 1.0));
            100.0 * (1.0 - miss) - source_now
        };

        quality::overall(coverage_gain, depth_gain, source_gain)
    }

    pub fn evaluate(
        &self,
        session: &Session,
        profile: &ScraperProfile,
        schema: &TargetSchema,
        registry: &ScraperRegistry,
    ) -> RouteCandidate {
        let observed: Vec<f64> = session
            .completed_runs(&profile.id)
            .map(|r| r.quality_contribution.max(0.0))
            .collect();
        let n = observed.len();

        // Bayesian smoothing: the prior counts as one observation
        let prior = self.prior_gain(session, profile, schema, registry);
        let gain = quality::round1((prior + observed.iter().sum::<f64>()) / (1.0 + n as f64));
        let cost = estimated_cost(session, profile);
        let gain_per_cent = gain / cost.max(1) as f64;

        let attempts = session
            .history
            .iter()
            .filter(|r| r.scraper_id == profile.id && r.status != RunStatus::Skipped)
            .count();

        let excluded = if profile.max_runs.is_some_and(|max| attempts >= max as usize) {
            Some(Exclusion::Exhausted)
        } else if self.max_run_cost_cents.is_some_and(|ceiling| cost > ceiling) {
            Some(Exclusion::RunCeiling)
        } else if !ledger::has_budget(session, cost) {
            Some(Exclusion::Budget)
        } else if gain < MIN_GAIN {
            Some(Exclusion::LowGain)
        } else {
            None
        };

        RouteCandidate {
            scraper_id: profile.id.clone(),
            estimated_gain: gain,
            estimated_cost_cents: cost,
            gain_per_cent,
            confidence: Confidence::from_prior_runs(n),
            excluded,
        }
    }

    pub fn recommend(
        &self,
        session: &Session,
        schema: &TargetSchema,
        registry: &ScraperRegistry,
        now: DateTime<Utc>,
    ) -> RoutingDecision {
        let quality_now = session.overall_quality();
        let mut candidates: Vec<RouteCandidate> = registry
            .profiles()
            .map(|p| self.evaluate(session, p, schema, registry))
            .collect();
        candidates.sort_by(|a, b| {
            b.gain_per_cent
                .total_cmp(&a.gain_per_cent)
                .then(b.estimated_gain.total_cmp(&a.estimated_gain))
                .then(a.scraper_id.cmp(&b.scraper_id))
        });

        let stop = |reason: StopReason, text: String, alternatives: Vec<RouteCandidate>| RoutingDecision {
            id: Uuid::new_v4(),
            recommendation: Recommendation::Stop { reason },
            reason: text,
            alternatives,
            estimated_gain: 0.0,
            estimated_cost_cents: 0,
            confidence: Confidence::Certain,
            quality_at_decision: quality_now,
            actual_gain: None,
            actual_cost_cents: None,
            acted_execution_id: None,
            decided_at: now,
        };

        if quality_now >= self.quality_target {
            return stop(
                StopReason::QualityTargetReached,
                format!("quality {quality_now} meets target {}", self.quality_target),
                candidates,
            );
        }

        let Some(best) = candidates.iter().find(|c| c.excluded.is_none()).cloned() else {
            // Budget is the blocker when something worthwhile exists but does not fit.
            let budget_blocked = candidates.iter().any(|c| {
                c.estimated_gain >= MIN_GAIN && c.excluded == Some(Exclusion::Budget)
            });
            return if budget_blocked || session.available_budget() == 0 {
                stop(
                    StopReason::BudgetExhausted,
                    format!(
                        "nothing fits the available {}c of {}c ({}c reserved)",
                        session.available_budget(),
                        session.budget_cents,
                        session.reserved_cents()
                    ),
                    candidates,
                )
            } else {
                stop(
                    StopReason::NoPositiveGain,
                    "no scraper is expected to improve quality".to_string(),
                    candidates,
                )
            };
        };

        let eligible = candidates.iter().filter(|c| c.excluded.is_none()).count();
        RoutingDecision {
            id: Uuid::new_v4(),
            recommendation: Recommendation::Run {
                scraper_id: best.scraper_id.clone(),
            },
            reason: format!(
                "{} offers {} points for {}c ({:.3}/c), best of {eligible} eligible",
                best.scraper_id, best.estimated_gain, best.estimated_cost_cents, best.gain_per_cent
            ),
            estimated_gain: best.estimated_gain,
            estimated_cost_cents: best.estimated_cost_cents,
            confidence: best.confidence,
            alternatives: candidates,
            quality_at_decision: quality_now,
            actual_gain: None,
            actual_cost_cents: None,
            acted_execution_id: None,
            decided_at: now,
        }
    }
}

/// Attach a finished run's real outcome to the latest decision if that
/// decision recommended this scraper and has not been acted on yet.
pub fn record_outcome(
    session: &mut Session,
    scraper_id: &str,
    execution_id: &str,
    actual_gain: f64,
    actual_cost_cents: Cents,
) -> bool {
    let Some(decision) = session.routing.last_mut() else {
        return false;
    };
    if decision.acted_execution_id.is_some() || decision.recommended_scraper() != Some(scraper_id) {
        return false;
    }
    decision.actual_gain = Some(quality::round1(actual_gain));
    decision.actual_cost_cents = Some(actual_cost_cents);
    decision.acted_execution_id = Some(execution_id.to_string());
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdvisorAccuracy {
    pub decisions: usize,
    pub acted_on: usize,
    pub mean_abs_gain_error: Option<f64>,
    pub mean_abs_cost_error_cents: Option<f64>,
}

/// How close acted-upon estimates came to what happened.
pub fn accuracy(session: &Session) -> AdvisorAccuracy {
    let acted: Vec<(f64, f64)> = session
        .routing
        .iter()
        .filter_map(|d| {
            let gain = d.actual_gain?;
            let cost = d.actual_cost_cents?;
            Some((
                (gain - d.estimated_gain).abs(),
                (cost as f64 - d.estimated_cost_cents as f64).abs(),
            ))
        })
        .collect();

    let mean = |values: Vec<f64>| -> Option<f64> {
        if values.is_empty() {
            None
        } else {
            Some(quality::round1(values.iter().sum::<f64>() / values.len() as f64))
        }
    };

    AdvisorAccuracy {
        decisions: session.routing.len(),
        acted_on: acted.len(),
        mean_abs_gain_error: mean(acted.iter().map(|(g, _)| *g).collect()),
        mean_abs_cost_error_cents: mean(acted.iter().map(|(_, c)| *c).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::record_cost;
    use crate::testing::{profile, MockScraper};
    use siteintel_common::{QualityAssessment, QualityLevel, ScraperRun};
    use std::sync::Arc;

    fn registry(profiles: Vec<ScraperProfile>) -> ScraperRegistry {
        profiles.into_iter().fold(ScraperRegistry::new(), |r, p| {
            r.with(p, Arc::new(MockScraper::new()))
        })
    }

    fn session(budget: Cents, spent: Cents) -> Session {
        let mut s = Session::new("alice", "acme.com", budget, Utc::now());
        if spent > 0 {
            record_cost(&mut s.ledger, budget, "seed", "seed", spent, Utc::now());
        }
        s
    }

    fn with_quality(mut s: Session, overall: f64) -> Session {
        s.quality = Some(QualityAssessment {
            field_coverage: 0.0,
            content_depth: 0.0,
            freshness_hours: None,
            source_quality: 0.0,
            overall,
            level: QualityLevel::from_score(overall),
            missing_fields: vec![],
            recommendations: vec![],
            assessed_at: Utc::now(),
        });
        s
    }

    fn completed(scraper: &str, cost: Cents, contribution: f64) -> ScraperRun {
        let mut run = ScraperRun::started(&Uuid::new_v4().to_string(), scraper, vec![], Utc::now());
        run.status = RunStatus::Complete;
        run.cost_cents = cost;
        run.quality_contribution = contribution;
        run
    }

    #[test]
    fn stops_when_only_scraper_exceeds_remaining_budget() {
        // budget 5.00, spent 4.80, scraper estimated 0.50
        let registry = registry(vec![profile("deep", 50, 0.9, &["employee_count", "leadership"])]);
        let decision = RoutingAdvisor::default().recommend(
            &session(500, 480),
            &TargetSchema::default(),
            &registry,
            Utc::now(),
        );
        assert!(decision.is_stop());
        assert_eq!(
            decision.recommendation,
            Recommendation::Stop {
                reason: StopReason::BudgetExhausted
            }
        );
        assert_eq!(decision.alternatives[0].excluded, Some(Exclusion::Budget));
    }

    #[test]
    fn in_flight_reservation_shrinks_what_fits() {
        let registry = registry(vec![profile("deep", 300, 0.9, &["employee_count", "leadership"])]);
        let mut s = session(500, 0);
        let idle = RoutingAdvisor::default().recommend(&s, &TargetSchema::default(), &registry, Utc::now());
        assert_eq!(idle.recommended_scraper(), Some("deep"));

        s.history
            .push(ScraperRun::started("e1", "deep", vec!["https://acme.com/".into()], Utc::now()).reserving(300));
        let busy = RoutingAdvisor::default().recommend(&s, &TargetSchema::default(), &registry, Utc::now());
        assert_eq!(
            busy.recommendation,
            Recommendation::Stop {
                reason: StopReason::BudgetExhausted
            }
        );
        assert_eq!(busy.alternatives[0].excluded, Some(Exclusion::Budget));
        assert!(busy.reason.contains("300c reserved"), "{}", busy.reason);
    }

    #[test]
    fn picks_best_gain_per_cent_within_budget() {
        let registry = registry(vec![
            profile("cheap", 5, 0.5, &["company_name", "description"]),
            profile("pricey", 200, 0.9, &["company_name", "description", "industry", "leadership"]),
            profile("huge", 10_000, 0.99, &["employee_count"]),
        ]);
        let s = session(500, 0);
        let decision = RoutingAdvisor::default().recommend(&s, &TargetSchema::default(), &registry, Utc::now());

        assert_eq!(decision.recommended_scraper(), Some("cheap"));
        assert_eq!(decision.confidence, Confidence::Uncertain);
        assert!(decision.estimated_cost_cents <= s.remaining_budget());
        let huge = decision.alternatives.iter().find(|c| c.scraper_id == "huge").unwrap();
        assert_eq!(huge.excluded, Some(Exclusion::Budget));
    }

    #[test]
    fn never_recommends_over_remaining_budget() {
        let registry = registry(vec![
            profile("a", 30, 0.9, &["company_name"]),
            profile("b", 60, 0.9, &["industry"]),
            profile("c", 90, 0.9, &["leadership"]),
        ]);
        for spent in [0, 20, 45, 70, 95, 100] {
            let s = session(100, spent);
            let decision = RoutingAdvisor::default().recommend(&s, &TargetSchema::default(), &registry, Utc::now());
            if let Some(id) = decision.recommended_scraper() {
                let cost = decision.alternatives.iter().find(|c| c.scraper_id == id).unwrap().estimated_cost_cents;
                assert!(cost <= s.remaining_budget(), "spent {spent}: {id} costs {cost}");
            }
        }
    }

    #[test]
    fn stops_at_quality_target() {
        let registry = registry(vec![profile("basic", 5, 0.5, &["company_name"])]);
        let s = with_quality(session(500, 0), 91.0);
        let decision = RoutingAdvisor::default().recommend(&s, &TargetSchema::default(), &registry, Utc::now());
        assert_eq!(
            decision.recommendation,
            Recommendation::Stop {
                reason: StopReason::QualityTargetReached
            }
        );
    }

    #[test]
    fn history_smooths_estimate_and_firms_confidence() {
        let p = profile("basic", 10, 0.5, &["company_name"]);
        let registry = registry(vec![p.clone()]);
        let mut s = session(500, 0);
        s.history.push(completed("basic", 4, 0.0));
        s.history.push(completed("basic", 6, 0.0));

        let candidate = RoutingAdvisor::default().evaluate(&s, &p, &TargetSchema::default(), &registry);
        assert_eq!(candidate.estimated_cost_cents, 5);
        assert_eq!(candidate.confidence, Confidence::Probable);
        let fresh = RoutingAdvisor::default().evaluate(&session(500, 0), &p, &TargetSchema::default(), &registry);
        assert!(candidate.estimated_gain < fresh.estimated_gain);
    }

    #[test]
    fn exhausted_scrapers_are_skipped() {
        let mut p = profile("basic", 5, 0.5, &["company_name"]);
        p.max_runs = Some(1);
        let registry = registry(vec![p]);
        let mut s = session(500, 0);
        s.history.push(completed("basic", 5, 3.0));
        let decision = RoutingAdvisor::default().recommend(&s, &TargetSchema::default(), &registry, Utc::now());
        assert_eq!(
            decision.recommendation,
            Recommendation::Stop {
                reason: StopReason::NoPositiveGain
            }
        );
    }

    #[test]
    fn outcome_lands_on_matching_open_decision_only() {
        let registry = registry(vec![profile("basic", 5, 0.5, &["company_name"])]);
        let mut s = session(500, 0);
        let decision = RoutingAdvisor::default().recommend(&s, &TargetSchema::default(), &registry, Utc::now());
        s.routing.push(decision);

        assert!(!record_outcome(&mut s, "other", "e0", 1.0, 1));
        assert!(record_outcome(&mut s, "basic", "e1", 12.34, 7));
        assert!(!record_outcome(&mut s, "basic", "e2", 3.0, 7));

        let acc = accuracy(&s);
        assert_eq!(acc.decisions, 1);
        assert_eq!(acc.acted_on, 1);
        assert_eq!(acc.mean_abs_cost_error_cents, Some(2.0));
    }
}
