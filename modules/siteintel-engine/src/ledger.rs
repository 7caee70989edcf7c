//! Spend against a session's budget, in cents.
//!
//! Completed work is always charged, even past the ceiling; the ceiling only
//! gates authorising new runs. A run holds its estimate as a reservation
//! while it is in flight, so concurrent starts cannot jointly overspend.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use siteintel_common::{Cents, CostEntry, CostLedger, Session};

use crate::error::{EngineError, Result};

/// Whether a run estimated at `cost_cents` fits next to what is already
/// charged and reserved.
pub fn has_budget(session: &Session, cost_cents: Cents) -> bool {
    session
        .ledger
        .total_cents
        .saturating_add(session.reserved_cents())
        .saturating_add(cost_cents)
        <= session.budget_cents
}

/// Refuse a new run before it starts if its estimate does not fit.
pub fn authorize(
    session: &Session,
    scraper_id: &str,
    estimated_cents: Cents,
    run_ceiling_cents: Option<Cents>,
) -> Result<()> {
    if let Some(ceiling) = run_ceiling_cents {
        if estimated_cents > ceiling {
            return Err(EngineError::RunCostCeiling {
                session_id: session.id,
                scraper_id: scraper_id.to_string(),
                estimated_cents,
                ceiling_cents: ceiling,
            });
        }
    }
    if !has_budget(session, estimated_cents) {
        return Err(EngineError::BudgetExceeded {
            session_id: session.id,
            scraper_id: scraper_id.to_string(),
            estimated_cents,
            spent_cents: session.ledger.total_cents,
            reserved_cents: session.reserved_cents(),
            budget_cents: session.budget_cents,
        });
    }
    Ok(())
}

/// Charge an execution. Recording the same execution id twice is a no-op and
/// returns `None`. The entry is flagged, never clamped, when it pushes spend
/// over the budget.
pub fn record_cost(
    ledger: &mut CostLedger,
    budget_cents: Cents,
    execution_id: &str,
    scraper_id: &str,
    cost_cents: Cents,
    now: DateTime<Utc>,
) -> Option<CostEntry> {
    if ledger.entries.iter().any(|e| e.execution_id == execution_id) {
        return None;
    }

    ledger.total_cents = ledger.total_cents.saturating_add(cost_cents);
    *ledger.by_scraper.entry(scraper_id.to_string()).or_insert(0) += cost_cents;
    let over_budget = ledger.total_cents > budget_cents;
    if over_budget {
        warn!(
            execution_id,
            scraper = scraper_id,
            spent = ledger.total_cents,
            limit = budget_cents,
            "Budget exceeded"
        );
    }

    let entry = CostEntry {
        execution_id: execution_id.to_string(),
        scraper_id: scraper_id.to_string(),
        cost_cents,
        over_budget,
        recorded_at: now,
    };
    ledger.entries.push(entry.clone());
    Some(entry)
}

/// Payload of cost snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerStatus {
    pub total_cents: Cents,
    pub budget_cents: Cents,
    pub remaining_cents: Cents,
    pub reserved_cents: Cents,
    pub by_scraper: std::collections::BTreeMap<String, Cents>,
    pub runs_charged: usize,
    pub over_budget: bool,
}

pub fn status(session: &Session) -> LedgerStatus {
    LedgerStatus {
        total_cents: session.ledger.total_cents,
        budget_cents: session.budget_cents,
        remaining_cents: session.remaining_budget(),
        reserved_cents: session.reserved_cents(),
        by_scraper: session.ledger.by_scraper.clone(),
        runs_charged: session.ledger.entries.len(),
        over_budget: session.ledger.total_cents > session.budget_cents,
    }
}

pub fn log_status(session: &Session) {
    info!(
        session_id = %session.id,
        spent_cents = session.ledger.total_cents,
        remaining_cents = session.remaining_budget(),
        reserved_cents = session.reserved_cents(),
        limit_cents = session.budget_cents,
        "Budget status"
    );
}
