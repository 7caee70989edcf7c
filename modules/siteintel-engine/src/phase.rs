//! Lifecycle transitions on a session record.
//!
//! These only edit the record; the orchestrator persists them through the
//! versioned write like every other mutation.

use chrono::{DateTime, Utc};

use siteintel_common::{
    AuditEntry, AuditKind, MergedDataset, Phase, Recommendation, RoutingDecision,
    Session, StopReason,
};

use crate::error::{EngineError, Result};

fn change_phase(session: &mut Session, to: Phase, how: &str, now: DateTime<Utc>) {
    let from = session.phase;
    session.phase = to;
    session.audit.push(AuditEntry::new(
        AuditKind::PhaseChanged,
        format!("{from} -> {to} ({how})"),
        now,
    ));
}

/// Approve leaving `phase`. The caller names the phase it is approving so a
/// stale approval cannot skip a stage.
pub fn approve(session: &mut Session, phase: Phase, now: DateTime<Utc>) -> Result<Phase> {
    if session.phase != phase {
        return Err(EngineError::PhaseMismatch {
            session_id: session.id,
            expected: phase,
            actual: session.phase,
        });
    }
    let next = phase.successor().ok_or(EngineError::InvalidTransition {
        session_id: session.id,
        phase,
    })?;
    change_phase(session, next, "approved", now);
    Ok(next)
}

/// The one ungated edge: scraping moves on once the advisor says the quality
/// target is met or the budget is spent.
pub fn auto_advance(session: &mut Session, decision: &RoutingDecision, now: DateTime<Utc>) -> bool {
    let criteria_met = matches!(
        decision.recommendation,
        Recommendation::Stop {
            reason: StopReason::QualityTargetReached | StopReason::BudgetExhausted
        }
    );
    if session.phase != Phase::Scraping || !criteria_met {
        return false;
    }
    change_phase(session, Phase::Extraction, &decision.reason, now);
    true
}

fn terminate(session: &mut Session, to: Phase, reason: &str, now: DateTime<Utc>) -> Result<()> {
    if session.phase.is_terminal() {
        return Err(EngineError::InvalidTransition {
            session_id: session.id,
            phase: session.phase,
        });
    }
    change_phase(session, to, reason, now);
    session.phase_reason = Some(reason.to_string());
    Ok(())
}

pub fn abort(session: &mut Session, reason: &str, now: DateTime<Utc>) -> Result<()> {
    terminate(session, Phase::Aborted, reason, now)
}

pub fn fail(session: &mut Session, reason: &str, now: DateTime<Utc>) -> Result<()> {
    terminate(session, Phase::Failed, reason, now)
}

/// Back to discovery with an empty dataset. Identity, budget, spend and the
/// audit trail survive; spend already incurred is not refunded.
pub fn reset(session: &mut Session, now: DateTime<Utc>) {
    let from = session.phase;
    session.phase = Phase::Discovery;
    session.phase_reason = None;
    session.dataset = MergedDataset::default();
    session.history.clear();
    session.conflicts.clear();
    session.quality = None;
    session.routing.clear();
    session.audit.push(AuditEntry::new(
        AuditKind::SessionReset,
        format!("reset from {from}"),
        now,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use siteintel_common::{Confidence, PageRecord};
    use uuid::Uuid;

    fn session_in(phase: Phase) -> Session {
        let mut s = Session::new("alice", "acme.com", 500, Utc::now());
        s.phase = phase;
        s
    }

    fn stop(reason: StopReason) -> RoutingDecision {
        RoutingDecision {
            id: Uuid::new_v4(),
            recommendation: Recommendation::Stop { reason },
            reason: "test".into(),
            alternatives: vec![],
            estimated_gain: 0.0,
            estimated_cost_cents: 0,
            confidence: Confidence::Certain,
            quality_at_decision: 0.0,
            actual_gain: None,
            actual_cost_cents: None,
            acted_execution_id: None,
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn approval_walks_one_step() {
        let mut s = session_in(Phase::Discovery);
        assert_eq!(approve(&mut s, Phase::Discovery, Utc::now()).unwrap(), Phase::SitemapSelection);
        assert_eq!(s.audit.last().unwrap().kind, AuditKind::PhaseChanged);
    }

    #[test]
    fn stale_approval_is_rejected() {
        let mut s = session_in(Phase::Scraping);
        assert!(matches!(
            approve(&mut s, Phase::Discovery, Utc::now()),
            Err(EngineError::PhaseMismatch { actual: Phase::Scraping, .. })
        ));
        assert_eq!(s.phase, Phase::Scraping);
    }

    #[test]
    fn terminal_phases_cannot_be_approved_or_aborted() {
        let mut s = session_in(Phase::Complete);
        assert!(matches!(
            approve(&mut s, Phase::Complete, Utc::now()),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(abort(&mut s, "done anyway", Utc::now()).is_err());
    }

    #[test]
    fn abort_and_fail_reachable_from_any_live_phase() {
        for phase in [Phase::Discovery, Phase::Scraping, Phase::Generation] {
            let mut s = session_in(phase);
            abort(&mut s, "user cancelled", Utc::now()).unwrap();
            assert_eq!(s.phase, Phase::Aborted);
            assert_eq!(s.phase_reason.as_deref(), Some("user cancelled"));

            let mut s = session_in(phase);
            fail(&mut s, "adapter misconfigured", Utc::now()).unwrap();
            assert_eq!(s.phase, Phase::Failed);
        }
    }

    #[test]
    fn scraping_advances_on_target_or_budget_only() {
        let mut s = session_in(Phase::Scraping);
        assert!(!auto_advance(&mut s, &stop(StopReason::NoPositiveGain), Utc::now()));
        assert!(auto_advance(&mut s, &stop(StopReason::BudgetExhausted), Utc::now()));
        assert_eq!(s.phase, Phase::Extraction);

        let mut s = session_in(Phase::Extraction);
        assert!(!auto_advance(&mut s, &stop(StopReason::QualityTargetReached), Utc::now()));
    }

    #[test]
    fn reset_clears_dataset_but_keeps_identity_and_spend() {
        let mut s = session_in(Phase::Enrichment);
        let id = s.id;
        s.ledger.total_cents = 120;
        s.dataset.pages.insert(
            "https://acme.com/".into(),
            PageRecord {
                url: "https://acme.com/".into(),
                content: "x".into(),
                fingerprint: "f".into(),
                source: "basic".into(),
                execution_id: "e".into(),
                extracted_at: Utc::now(),
                phase: Phase::Scraping,
                quality_contribution: 0.0,
                revision: 0,
            },
        );

        reset(&mut s, Utc::now());
        assert_eq!(s.id, id);
        assert_eq!(s.phase, Phase::Discovery);
        assert!(s.dataset.pages.is_empty());
        assert_eq!(s.ledger.total_cents, 120);
        assert_eq!(s.audit.last().unwrap().kind, AuditKind::SessionReset);
    }
}
