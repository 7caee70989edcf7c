use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::Phase;

/// Money is tracked in integer cents so ledger sums are exact.
pub type Cents = u64;

// --- Session ---

/// The single durable record for one (owner, domain) research target.
///
/// Every mutation goes through the store's versioned write: the caller reads
/// version N, computes a new record, and the write succeeds only while the
/// stored version is still N. The store bumps `version` on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub owner: String,
    pub domain: String,
    pub phase: Phase,
    /// Why the session entered `failed` or `aborted`.
    #[serde(default)]
    pub phase_reason: Option<String>,
    pub version: i64,
    pub budget_cents: Cents,
    pub dataset: MergedDataset,
    pub history: Vec<ScraperRun>,
    pub conflicts: Vec<DataConflict>,
    pub ledger: CostLedger,
    pub quality: Option<QualityAssessment>,
    pub routing: Vec<RoutingDecision>,
    pub audit: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(owner: &str, domain: &str, budget_cents: Cents, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            domain: normalize_domain(domain),
            phase: Phase::Discovery,
            phase_reason: None,
            version: 0,
            budget_cents,
            dataset: MergedDataset::default(),
            history: Vec::new(),
            conflicts: Vec::new(),
            ledger: CostLedger::default(),
            quality: None,
            routing: Vec::new(),
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Budget not yet charged. Zero once spend reaches the ceiling.
    pub fn remaining_budget(&self) -> Cents {
        self.budget_cents.saturating_sub(self.ledger.total_cents)
    }

    /// Estimates held by runs that have started but not been charged yet.
    pub fn reserved_cents(&self) -> Cents {
        self.history
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| r.reserved_cents)
            .sum()
    }

    /// Budget left to authorize new runs: uncharged and unreserved.
    pub fn available_budget(&self) -> Cents {
        self.remaining_budget().saturating_sub(self.reserved_cents())
    }

    pub fn run(&self, execution_id: &str) -> Option<&ScraperRun> {
        self.history.iter().find(|r| r.execution_id == execution_id)
    }

    pub fn run_mut(&mut self, execution_id: &str) -> Option<&mut ScraperRun> {
        self.history
            .iter_mut()
            .find(|r| r.execution_id == execution_id)
    }

    /// Finished runs of one scraper, oldest first.
    pub fn completed_runs<'a>(&'a self, scraper_id: &'a str) -> impl Iterator<Item = &'a ScraperRun> {
        self.history
            .iter()
            .filter(move |r| r.scraper_id == scraper_id && r.status == RunStatus::Complete)
    }

    pub fn pending_conflicts(&self) -> impl Iterator<Item = &DataConflict> {
        self.conflicts.iter().filter(|c| c.is_pending())
    }

    pub fn overall_quality(&self) -> f64 {
        self.quality.as_ref().map(|q| q.overall).unwrap_or(0.0)
    }

    pub fn summary(&self) -> MergedSummary {
        MergedSummary {
            version: self.version,
            phase: self.phase,
            total_pages: self.dataset.stats.total_pages,
            total_data_points: self.dataset.stats.total_data_points,
            total_links: self.dataset.stats.total_links,
            overall_quality: self.overall_quality(),
            quality_level: self.quality.as_ref().map(|q| q.level),
            pending_conflicts: self.pending_conflicts().count(),
            total_spend_cents: self.ledger.total_cents,
            budget_cents: self.budget_cents,
        }
    }
}

/// Lowercase host without scheme, `www.` prefix, path, or trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    let trimmed = domain.trim().to_lowercase();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(&trimmed);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    host.strip_prefix("www.")
        .unwrap_or(host)
        .trim_end_matches('.')
        .to_string()
}

// --- Merged dataset ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedDataset {
    pub stats: DatasetStats,
    /// Keyed by canonical page URL. A URL appears at most once.
    pub pages: BTreeMap<String, PageRecord>,
    /// Keyed by logical field name.
    pub fields: BTreeMap<String, ResolvedField>,
    pub links: BTreeSet<String>,
}

impl MergedDataset {
    pub fn total_content_chars(&self) -> usize {
        self.pages.values().map(|p| p.content.chars().count()).sum()
    }

    pub fn latest_ingestion(&self) -> Option<DateTime<Utc>> {
        self.pages.values().map(|p| p.extracted_at).max()
    }

    /// Whether a field has a resolved, non-empty value.
    pub fn has_value(&self, field: &str) -> bool {
        self.fields
            .get(field)
            .map(|f| !is_empty_value(&f.value))
            .unwrap_or(false)
    }

    /// Distinct scraper ids that contributed at least one page or resolved field.
    pub fn contributing_sources(&self) -> BTreeSet<&str> {
        self.pages
            .values()
            .map(|p| p.source.as_str())
            .chain(self.fields.values().map(|f| f.provenance.scraper_id.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_pages: u64,
    pub total_data_points: u64,
    pub total_links: u64,
    /// New pages counted by the phase they were first ingested in.
    pub pages_by_phase: BTreeMap<Phase, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub content: String,
    /// sha256 of the content, hex-encoded.
    pub fingerprint: String,
    pub source: String,
    pub execution_id: String,
    pub extracted_at: DateTime<Utc>,
    pub phase: Phase,
    /// Points this page adds to the content-depth component.
    pub quality_contribution: f64,
    /// Bumped each time the content is replaced.
    pub revision: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub scraper_id: String,
    pub execution_id: String,
    pub source_url: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedField {
    pub value: serde_json::Value,
    pub provenance: Provenance,
}

/// Null, blank strings, and empty arrays/objects carry no information.
pub fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

// --- Conflicts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    Pending,
    Automatic,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCandidate {
    pub value: serde_json::Value,
    pub provenance: Provenance,
}

/// Two or more observations disagree on one logical field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConflict {
    pub id: Uuid,
    pub field: String,
    pub candidates: Vec<FieldCandidate>,
    pub resolution: ResolutionType,
    pub resolved_value: Option<serde_json::Value>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub opened_at: DateTime<Utc>,
}

impl DataConflict {
    pub fn is_pending(&self) -> bool {
        self.resolution == ResolutionType::Pending
    }

    pub fn has_candidate(&self, value: &serde_json::Value) -> bool {
        self.candidates.iter().any(|c| &c.value == value)
    }
}

// --- Execution history ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Complete => write!(f, "complete"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One execution attempt. Appended as `Running`, finalized once, then frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperRun {
    pub execution_id: String,
    pub scraper_id: String,
    pub status: RunStatus,
    pub urls: Vec<String>,
    pub pages_scraped: u32,
    pub data_points: u32,
    pub links_discovered: u32,
    /// Overall-score points this run added.
    pub quality_contribution: f64,
    pub cost_cents: Cents,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    /// Estimate held against the budget while the run is `Running`.
    #[serde(default)]
    pub reserved_cents: Cents,
    /// Adapter timeout the run was started with. Zero means the
    /// orchestrator default.
    #[serde(default)]
    pub timeout_secs: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScraperRun {
    pub fn started(
        execution_id: &str,
        scraper_id: &str,
        urls: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            scraper_id: scraper_id.to_string(),
            status: RunStatus::Running,
            urls,
            pages_scraped: 0,
            data_points: 0,
            links_discovered: 0,
            quality_contribution: 0.0,
            cost_cents: 0,
            duration_ms: 0,
            errors: Vec::new(),
            reserved_cents: 0,
            timeout_secs: 0,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn reserving(mut self, cents: Cents) -> Self {
        self.reserved_cents = cents;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Same scraper over the same canonical URL set.
    pub fn covers(&self, scraper_id: &str, urls: &[String]) -> bool {
        self.scraper_id == scraper_id && self.urls == urls
    }
}

/// Per-execution numbers reported on completion and cached for replays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub pages_added: u32,
    pub pages_updated: u32,
    pub pages_unchanged: u32,
    pub pages_failed: u32,
    pub data_points: u32,
    pub links_discovered: u32,
    pub conflicts_opened: u32,
    pub auto_resolved: u32,
    pub cost_cents: Cents,
    pub quality_before: f64,
    pub quality_after: f64,
    pub duration_ms: u64,
}

/// Snapshot of the session totals after a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedSummary {
    pub version: i64,
    pub phase: Phase,
    pub total_pages: u64,
    pub total_data_points: u64,
    pub total_links: u64,
    pub overall_quality: f64,
    pub quality_level: Option<QualityLevel>,
    pub pending_conflicts: usize,
    pub total_spend_cents: Cents,
    pub budget_cents: Cents,
}

/// Output of one execution, replayed verbatim for duplicate requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub execution_id: String,
    pub session_id: Uuid,
    pub scraper_id: String,
    pub status: RunStatus,
    pub stats: ExecutionStats,
    pub summary: MergedSummary,
    pub suggestions: Vec<String>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// --- Locks ---

/// Short-lived mutual exclusion over (session, scraper, URL set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLock {
    pub key: String,
    pub session_id: Uuid,
    pub scraper_id: String,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released: bool,
}

impl ExecutionLock {
    /// Held means neither released nor past its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.released && self.expires_at > now
    }
}

// --- Quality ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Low,
    Medium,
    High,
    Excellent,
}

impl QualityLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            QualityLevel::Excellent
        } else if score >= 70.0 {
            QualityLevel::High
        } else if score >= 50.0 {
            QualityLevel::Medium
        } else {
            QualityLevel::Low
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityLevel::Low => write!(f, "low"),
            QualityLevel::Medium => write!(f, "medium"),
            QualityLevel::High => write!(f, "high"),
            QualityLevel::Excellent => write!(f, "excellent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// 0-100: share of target-schema fields with a non-empty value.
    pub field_coverage: f64,
    /// 0-100: content volume against the baseline, capped.
    pub content_depth: f64,
    /// Hours since the latest page ingestion. Reported, not scored.
    pub freshness_hours: Option<f64>,
    /// 0-100: combined fidelity of contributing tools.
    pub source_quality: f64,
    pub overall: f64,
    pub level: QualityLevel,
    pub missing_fields: Vec<String>,
    pub recommendations: Vec<String>,
    pub assessed_at: DateTime<Utc>,
}

// --- Cost ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub execution_id: String,
    pub scraper_id: String,
    pub cost_cents: Cents,
    /// Spend crossed the budget ceiling when this entry was recorded.
    pub over_budget: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    pub total_cents: Cents,
    pub by_scraper: BTreeMap<String, Cents>,
    pub entries: Vec<CostEntry>,
}

// --- Routing ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Certain,
    Probable,
    Possible,
    Uncertain,
}

impl Confidence {
    /// More prior runs of a scraper in this session back a firmer estimate.
    pub fn from_prior_runs(runs: usize) -> Self {
        match runs {
            0 => Confidence::Uncertain,
            1 => Confidence::Possible,
            2 | 3 => Confidence::Probable,
            _ => Confidence::Certain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    QualityTargetReached,
    BudgetExhausted,
    NoPositiveGain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Recommendation {
    Run { scraper_id: String },
    Stop { reason: StopReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCandidate {
    pub scraper_id: String,
    pub estimated_gain: f64,
    pub estimated_cost_cents: Cents,
    pub gain_per_cent: f64,
    pub confidence: Confidence,
    /// Why the candidate was ruled out, if it was.
    pub excluded: Option<Exclusion>,
}

/// Reason a routing candidate was ruled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    /// Ran enough times that another pass adds nothing.
    Exhausted,
    /// Estimate is above the per-run cost ceiling.
    RunCeiling,
    /// Estimate does not fit the available budget.
    Budget,
    /// Estimated gain is below the minimum worth paying for.
    LowGain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub id: Uuid,
    pub recommendation: Recommendation,
    pub reason: String,
    pub alternatives: Vec<RouteCandidate>,
    pub estimated_gain: f64,
    pub estimated_cost_cents: Cents,
    pub confidence: Confidence,
    pub quality_at_decision: f64,
    pub actual_gain: Option<f64>,
    pub actual_cost_cents: Option<Cents>,
    pub acted_execution_id: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    pub fn recommended_scraper(&self) -> Option<&str> {
        match &self.recommendation {
            Recommendation::Run { scraper_id } => Some(scraper_id),
            Recommendation::Stop { .. } => None,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self.recommendation, Recommendation::Stop { .. })
    }
}

// --- Audit & snapshots ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    PageReplaced,
    FieldAutoResolved,
    ConflictOpened,
    ConflictResolved,
    PhaseChanged,
    RunOrphaned,
    BudgetOverrun,
    SessionReset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub kind: AuditKind,
    pub detail: String,
    pub execution_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, detail: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            execution_id: None,
            at: now,
        }
    }

    pub fn for_execution(mut self, execution_id: &str) -> Self {
        self.execution_id = Some(execution_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Quality,
    Cost,
    Routing,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Quality => "quality",
            SnapshotKind::Cost => "cost",
            SnapshotKind::Routing => "routing",
        }
    }
}

impl std::str::FromStr for SnapshotKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quality" => Ok(SnapshotKind::Quality),
            "cost" => Ok(SnapshotKind::Cost),
            "routing" => Ok(SnapshotKind::Routing),
            other => Err(format!("unknown snapshot kind: {other}")),
        }
    }
}

/// Append-only audit record of a quality, cost, or routing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub kind: SnapshotKind,
    pub version: i64,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}
