//! Session API.
//!
//! The orchestrator owns no state of its own. Everything durable lives in the
//! session record and goes through one read-version / compute / write-if-unchanged
//! loop ([`Orchestrator::mutate`]); executions are serialised per URL set by the
//! lock manager and otherwise run independently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use siteintel_common::{
    is_empty_value, AuditEntry, AuditKind, CachedResult, Cents, Config, ExecutionEvent,
    ExecutionStats, ExecutionUpdate, Phase, Provenance, QualityAssessment, ResolutionType,
    ResolvedField, RoutingDecision, RunStatus, ScraperRun, Session, SessionSnapshot, Severity,
    SnapshotKind, TargetSchema,
};
use siteintel_store::{LockStore, ResultCache, RetryPolicy, SessionStore, SnapshotLog, StoreError};

use crate::adapter::{
    BatchResult, FailureKind, ProgressReporter, ScrapeRequest, ScraperAdapter, ScraperConfig,
};
use crate::error::{EngineError, Result};
use crate::ledger;
use crate::lock::{canonical_url_set, Acquisition, LockManager, LockToken};
use crate::merge::{self, BatchOrigin};
use crate::phase;
use crate::quality::{round1, QualityAssessor};
use crate::registry::{ScraperProfile, ScraperRegistry};
use crate::routing::{self, AdvisorAccuracy, RoutingAdvisor};

const ORPHANED: &str = "orphaned: no completion recorded";

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Settings & dependencies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub lock_ttl: Duration,
    pub result_ttl: Duration,
    pub default_budget_cents: Cents,
    pub max_run_cost_cents: Option<Cents>,
    pub quality_target: f64,
    pub adapter_timeout: Duration,
    /// Extra acquisition attempts when a lock is held, before reporting `Busy`.
    pub lock_retry_attempts: u32,
    pub lock_retry_backoff: Duration,
    /// Re-read/recompute rounds on version conflicts.
    pub max_write_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            result_ttl: Duration::from_secs(300),
            default_budget_cents: 500,
            max_run_cost_cents: None,
            quality_target: 90.0,
            adapter_timeout: Duration::from_secs(300),
            lock_retry_attempts: 2,
            lock_retry_backoff: Duration::from_millis(50),
            max_write_attempts: 8,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            result_ttl: Duration::from_secs(config.result_cache_ttl_secs),
            default_budget_cents: config.default_budget_cents,
            max_run_cost_cents: config.max_run_cost_cents,
            quality_target: config.quality_target,
            adapter_timeout: Duration::from_secs(config.adapter_timeout_secs),
            lock_retry_attempts: config.lock_retry_attempts,
            ..Self::default()
        }
    }

    /// How long a `running` entry started with the default adapter timeout
    /// may go without completion before it is considered abandoned.
    pub fn orphan_after(&self) -> chrono::Duration {
        span(self.adapter_timeout + self.lock_ttl)
    }

    /// When `run` counts as abandoned, from the timeout it was started with.
    pub fn run_deadline(&self, run: &ScraperRun) -> DateTime<Utc> {
        let allowed = match run.timeout_secs {
            0 => self.orphan_after(),
            secs => span(Duration::from_secs(secs) + self.lock_ttl),
        };
        run.started_at + allowed
    }
}

fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::days(365))
}

#[derive(Clone, TypedBuilder)]
pub struct OrchestratorDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub locks: Arc<dyn LockStore>,
    pub results: Arc<dyn ResultCache>,
    pub snapshots: Arc<dyn SnapshotLog>,
    pub registry: Arc<ScraperRegistry>,
    #[builder(default)]
    pub schema: TargetSchema,
    #[builder(default)]
    pub settings: OrchestratorSettings,
    #[builder(default = Arc::new(SystemClock))]
    pub clock: Arc<dyn Clock>,
}

// ---------------------------------------------------------------------------
// Requests & handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub scraper_id: String,
    pub urls: Vec<String>,
    #[serde(default)]
    pub config: ScraperConfig,
    /// Caller-chosen id for idempotent replays. Generated when absent.
    #[serde(default)]
    pub execution_id: Option<String>,
}

#[derive(Debug)]
pub enum ExecutionStart {
    /// The execution id already finished inside the cache window.
    Cached(CachedResult),
    /// The execution id is known to the session but its result is no longer
    /// cached (still running, orphaned, or expired).
    Recorded(ScraperRun),
    /// Same session, scraper and URL set already in flight.
    Busy { remaining: Duration },
    Started(ExecutionHandle),
}

/// Event stream of one started execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub session_id: Uuid,
    pub execution_id: String,
    pub scraper_id: String,
    events: mpsc::UnboundedReceiver<ExecutionUpdate>,
}

impl ExecutionHandle {
    pub async fn next(&mut self) -> Option<ExecutionUpdate> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<ExecutionUpdate> {
        UnboundedReceiverStream::new(self.events)
    }

    /// Collect every update up to and including the final one.
    pub async fn wait(mut self) -> Vec<ExecutionUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = self.events.recv().await {
            let done = update.event.is_final();
            updates.push(update);
            if done {
                break;
            }
        }
        updates
    }
}

/// Manual pick for a pending conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Index into the conflict's candidate list.
    Candidate(usize),
    /// A value none of the tools reported.
    Value(serde_json::Value),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub locks_purged: u64,
    pub results_purged: u64,
}

/// Outcome of recording a run start.
enum Admission {
    Known(ScraperRun),
    InFlight { until: DateTime<Utc> },
    Admitted,
}

/// Latest deadline among unfinished runs of the same scraper over `urls`.
fn in_flight_until(
    session: &Session,
    settings: &OrchestratorSettings,
    scraper_id: &str,
    urls: &[String],
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    session
        .history
        .iter()
        .filter(|r| r.status == RunStatus::Running && r.covers(scraper_id, urls))
        .map(|r| settings.run_deadline(r))
        .filter(|deadline| *deadline > now)
        .max()
}

struct ExecutionContext {
    session_id: Uuid,
    execution_id: String,
    scraper_id: String,
    request: ScrapeRequest,
    lock: LockToken,
    timeout: Duration,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    deps: OrchestratorDeps,
    locks: LockManager,
    advisor: RoutingAdvisor,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let settings = &deps.settings;
        let locks = LockManager::new(deps.locks.clone(), settings.lock_ttl, settings.retry);
        let advisor = RoutingAdvisor {
            quality_target: settings.quality_target,
            max_run_cost_cents: settings.max_run_cost_cents,
        };
        Self {
            deps,
            locks,
            advisor,
        }
    }

    pub fn registry(&self) -> &ScraperRegistry {
        &self.deps.registry
    }

    pub fn schema(&self) -> &TargetSchema {
        &self.deps.schema
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.deps.settings
    }

    fn now(&self) -> DateTime<Utc> {
        self.deps.clock.now()
    }

    fn assessor(&self) -> QualityAssessor<'_> {
        QualityAssessor::new(&self.deps.schema, &self.deps.registry)
    }

    // --- persistence plumbing ---

    async fn load(&self, session_id: Uuid) -> Result<Session> {
        let sessions = &self.deps.sessions;
        self.deps
            .settings
            .retry
            .run("get_session", || sessions.get(session_id))
            .await
            .map_err(|(e, attempts)| EngineError::persistence(e, attempts))?
            .ok_or(EngineError::SessionNotFound(session_id))
    }

    /// The only write path for sessions. `apply` runs against a fresh copy of
    /// the stored record and is re-run from scratch after a version conflict,
    /// so it must derive everything from the record it is given. A closure
    /// that leaves the record untouched causes no write and no version bump.
    async fn mutate<T, F>(&self, session_id: Uuid, op: &str, mut apply: F) -> Result<(Session, T)>
    where
        F: FnMut(&mut Session) -> Result<T>,
    {
        let attempts = self.deps.settings.max_write_attempts.max(1);
        let sessions = &self.deps.sessions;

        for attempt in 1..=attempts {
            let current = self.load(session_id).await?;
            let mut next = current.clone();
            let value = apply(&mut next)?;
            if next == current {
                return Ok((current, value));
            }
            next.updated_at = self.now();

            match self
                .deps
                .settings
                .retry
                .run(op, || sessions.save(&next, current.version))
                .await
            {
                Ok(saved) => return Ok((saved, value)),
                Err((StoreError::VersionConflict { expected, actual, .. }, _)) => {
                    debug!(
                        session_id = %session_id,
                        op,
                        attempt,
                        expected,
                        actual,
                        "Version conflict, re-reading session"
                    );
                }
                Err((e, tries)) => {
                    error!(session_id = %session_id, op, error = %e, attempts = tries, "Session write failed");
                    return Err(EngineError::persistence(e, tries));
                }
            }
        }

        Err(EngineError::VersionConflict {
            session_id,
            attempts,
        })
    }

    async fn snapshot<P: Serialize>(&self, session: &Session, kind: SnapshotKind, payload: &P) {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(session_id = %session.id, kind = kind.as_str(), error = %e, "Snapshot not serializable");
                return;
            }
        };
        let snapshot = SessionSnapshot {
            session_id: session.id,
            kind,
            version: session.version,
            payload,
            recorded_at: self.now(),
        };
        let log = &self.deps.snapshots;
        if let Err((e, attempts)) = self
            .deps
            .settings
            .retry
            .run("append_snapshot", || log.append(&snapshot))
            .await
        {
            warn!(session_id = %session.id, kind = kind.as_str(), error = %e, attempts, "Snapshot append failed");
        }
    }

    // --- lifecycle ---

    pub async fn create_or_get_session(
        &self,
        owner: &str,
        domain: &str,
        budget_cents: Option<Cents>,
    ) -> Result<Session> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(EngineError::InvalidRequest("owner must not be empty".into()));
        }
        let candidate = Session::new(
            owner,
            domain,
            budget_cents.unwrap_or(self.deps.settings.default_budget_cents),
            self.now(),
        );
        if candidate.domain.is_empty() {
            return Err(EngineError::InvalidRequest("domain must not be empty".into()));
        }

        let sessions = &self.deps.sessions;
        let session = self
            .deps
            .settings
            .retry
            .run("create_or_get_session", || sessions.create_or_get(&candidate))
            .await
            .map_err(|(e, attempts)| EngineError::persistence(e, attempts))?;

        if session.id == candidate.id {
            info!(session_id = %session.id, owner, domain = %session.domain, "Session created");
        }
        Ok(session)
    }

    /// The session with any abandoned `running` entries marked failed.
    pub async fn get_session(&self, session_id: Uuid) -> Result<Session> {
        let now = self.now();
        let settings = &self.deps.settings;
        let (session, orphaned) = self
            .mutate(session_id, "reconcile_orphans", |s| {
                Ok(reconcile_orphans(s, settings, now))
            })
            .await?;
        if orphaned > 0 {
            warn!(session_id = %session_id, orphaned, "Marked abandoned runs as failed");
        }
        Ok(session)
    }

    pub async fn get_history(&self, session_id: Uuid) -> Result<Vec<ScraperRun>> {
        Ok(self.get_session(session_id).await?.history)
    }

    pub async fn get_quality(&self, session_id: Uuid) -> Result<Option<QualityAssessment>> {
        Ok(self.load(session_id).await?.quality)
    }

    pub async fn approve_phase(&self, session_id: Uuid, phase: Phase) -> Result<Session> {
        let now = self.now();
        let (session, next) = self
            .mutate(session_id, "approve_phase", |s| phase::approve(s, phase, now))
            .await?;
        info!(session_id = %session_id, from = %phase, to = %next, "Phase approved");
        Ok(session)
    }

    pub async fn abort_session(&self, session_id: Uuid, reason: &str) -> Result<Session> {
        let now = self.now();
        let (session, ()) = self
            .mutate(session_id, "abort_session", |s| phase::abort(s, reason, now))
            .await?;
        self.locks.release_session(session_id).await?;
        info!(session_id = %session_id, reason, "Session aborted");
        Ok(session)
    }

    pub async fn fail_session(&self, session_id: Uuid, reason: &str) -> Result<Session> {
        let now = self.now();
        let (session, ()) = self
            .mutate(session_id, "fail_session", |s| phase::fail(s, reason, now))
            .await?;
        self.locks.release_session(session_id).await?;
        error!(session_id = %session_id, reason, "Session failed");
        Ok(session)
    }

    /// Back to discovery with an empty dataset. Spend and audit survive; locks
    /// and cached results of the session are dropped.
    pub async fn reset_session(&self, session_id: Uuid) -> Result<Session> {
        let now = self.now();
        let (session, ()) = self
            .mutate(session_id, "reset_session", |s| {
                phase::reset(s, now);
                Ok(())
            })
            .await?;

        let released = self.locks.release_session(session_id).await?;
        let results = &self.deps.results;
        let cleared = self
            .deps
            .settings
            .retry
            .run("clear_session_results", || results.clear_session(session_id))
            .await
            .map_err(|(e, attempts)| EngineError::persistence(e, attempts))?;

        info!(
            session_id = %session_id,
            locks_released = released,
            results_cleared = cleared,
            "Session reset"
        );
        Ok(session)
    }

    // --- executions ---

    fn authorize_run(&self, session: &Session, profile: &ScraperProfile) -> Result<Cents> {
        if !session.phase.allows_execution() {
            return Err(EngineError::ExecutionNotAllowed {
                session_id: session.id,
                phase: session.phase,
            });
        }
        let estimate = routing::estimated_cost(session, profile);
        ledger::authorize(
            session,
            &profile.id,
            estimate,
            self.deps.settings.max_run_cost_cents,
        )?;
        Ok(estimate)
    }

    async fn acquire_lock(&self, session_id: Uuid, scraper_id: &str, urls: &[String]) -> Result<Acquisition> {
        let settings = &self.deps.settings;
        let mut retries = 0;
        loop {
            match self.locks.acquire(session_id, scraper_id, urls, self.now()).await? {
                Acquisition::Busy { remaining } if retries < settings.lock_retry_attempts => {
                    retries += 1;
                    debug!(
                        session_id = %session_id,
                        scraper = scraper_id,
                        retry = retries,
                        remaining_ms = remaining.as_millis() as u64,
                        "Lock held, retrying"
                    );
                    tokio::time::sleep(settings.lock_retry_backoff * retries).await;
                }
                other => return Ok(other),
            }
        }
    }

    async fn cached(&self, execution_id: &str) -> Result<Option<CachedResult>> {
        let results = &self.deps.results;
        let now = self.now();
        self.deps
            .settings
            .retry
            .run("get_cached_result", || results.get(execution_id, now))
            .await
            .map_err(|(e, attempts)| EngineError::persistence(e, attempts))
    }

    pub async fn cached_result(&self, session_id: Uuid, execution_id: &str) -> Result<Option<CachedResult>> {
        Ok(self
            .cached(execution_id)
            .await?
            .filter(|c| c.session_id == session_id))
    }

    /// Start a scraper run, or explain why none was started.
    ///
    /// The call returns as soon as the run is recorded; the adapter runs on a
    /// spawned task and reports through the returned handle.
    pub async fn request_execution(
        &self,
        session_id: Uuid,
        request: ExecutionRequest,
    ) -> Result<ExecutionStart> {
        if let Some(execution_id) = &request.execution_id {
            if let Some(cached) = self.cached_result(session_id, execution_id).await? {
                debug!(session_id = %session_id, execution_id = %execution_id, "Replaying cached result");
                return Ok(ExecutionStart::Cached(cached));
            }
        }

        let registry = &self.deps.registry;
        let profile = registry
            .profile(&request.scraper_id)
            .ok_or_else(|| EngineError::UnknownScraper(request.scraper_id.clone()))?;
        let adapter = registry
            .adapter(&request.scraper_id)
            .ok_or_else(|| EngineError::UnknownScraper(request.scraper_id.clone()))?;
        let urls = canonical_url_set(&request.urls);
        if urls.is_empty() {
            return Err(EngineError::EmptyUrlSet {
                scraper_id: request.scraper_id.clone(),
            });
        }

        let settings = &self.deps.settings;
        let session = self.get_session(session_id).await?;
        if let Some(run) = request.execution_id.as_deref().and_then(|id| session.run(id)) {
            return Ok(ExecutionStart::Recorded(run.clone()));
        }
        // A duplicate of an in-flight run is answered as busy, not refused.
        if in_flight_until(&session, settings, &profile.id, &urls, self.now()).is_none() {
            self.authorize_run(&session, profile)?;
        }

        let token = match self.acquire_lock(session_id, &profile.id, &urls).await? {
            Acquisition::Acquired(token) => token,
            Acquisition::Busy { remaining } => {
                info!(
                    session_id = %session_id,
                    scraper = %profile.id,
                    remaining_ms = remaining.as_millis() as u64,
                    "Execution busy"
                );
                return Ok(ExecutionStart::Busy { remaining });
            }
        };

        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let config = request.config.layered_over(&profile.defaults);
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(settings.adapter_timeout);
        let now = self.now();
        let started = self
            .mutate(session_id, "start_execution", |s| {
                if let Some(run) = s.run(&execution_id) {
                    return Ok(Admission::Known(run.clone()));
                }
                // The lock may have expired while an earlier run is still going.
                if let Some(until) = in_flight_until(s, settings, &profile.id, &urls, now) {
                    return Ok(Admission::InFlight { until });
                }
                let estimate = self.authorize_run(s, profile)?;
                debug!(session_id = %s.id, scraper = %profile.id, estimate_cents = estimate, "Run authorised");
                s.history.push(
                    ScraperRun::started(&execution_id, &profile.id, urls.clone(), now)
                        .reserving(estimate)
                        .with_timeout(timeout.as_secs()),
                );
                Ok(Admission::Admitted)
            })
            .await;

        let session = match started {
            Ok((session, Admission::Admitted)) => session,
            Ok((_, Admission::Known(run))) => {
                self.release_lock(&token).await;
                return Ok(ExecutionStart::Recorded(run));
            }
            Ok((_, Admission::InFlight { until })) => {
                self.release_lock(&token).await;
                let remaining = (until - now).to_std().unwrap_or_default();
                info!(
                    session_id = %session_id,
                    scraper = %profile.id,
                    remaining_ms = remaining.as_millis() as u64,
                    "Execution still in flight"
                );
                return Ok(ExecutionStart::Busy { remaining });
            }
            Err(e) => {
                self.release_lock(&token).await;
                return Err(e);
            }
        };

        let ctx = ExecutionContext {
            session_id,
            execution_id: execution_id.clone(),
            scraper_id: profile.id.clone(),
            request: ScrapeRequest {
                session_id,
                execution_id: execution_id.clone(),
                domain: session.domain.clone(),
                urls,
                config,
            },
            lock: token,
            timeout,
        };

        info!(
            session_id = %session_id,
            execution_id = %execution_id,
            scraper = %profile.id,
            urls = ctx.request.urls.len(),
            "Execution started"
        );

        let (reporter, events) = ProgressReporter::channel(&execution_id);
        let handle = ExecutionHandle {
            session_id,
            execution_id,
            scraper_id: profile.id.clone(),
            events,
        };
        tokio::spawn(self.clone().run_execution(ctx, adapter, reporter));

        Ok(ExecutionStart::Started(handle))
    }

    async fn release_lock(&self, token: &LockToken) {
        if let Err(e) = self.locks.release(token, self.now()).await {
            // The TTL frees it anyway.
            warn!(session_id = %token.session_id, error = %e, "Failed to release execution lock");
        }
    }

    async fn run_execution(
        self,
        ctx: ExecutionContext,
        adapter: Arc<dyn ScraperAdapter>,
        reporter: ProgressReporter,
    ) {
        reporter.progress(0, format!("starting {}", ctx.scraper_id));
        let started = std::time::Instant::now();

        let result = match tokio::time::timeout(ctx.timeout, adapter.execute(&ctx.request, &reporter)).await {
            Ok(result) => result,
            Err(_) => BatchResult::failure(
                FailureKind::Timeout,
                format!("no result within {}s", ctx.timeout.as_secs()),
            ),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if let BatchResult::PartialSuccess { errors, .. } = &result {
            for e in errors {
                reporter.notify(Severity::Warning, e.clone());
            }
        }
        reporter.progress(90, "merging results");

        let outcome = self.complete_execution(&ctx, &result, duration_ms).await;
        self.release_lock(&ctx.lock).await;

        match (outcome, &result) {
            (Ok(_), BatchResult::Failure(failure)) => {
                warn!(
                    session_id = %ctx.session_id,
                    execution_id = %ctx.execution_id,
                    scraper = %ctx.scraper_id,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Execution failed"
                );
                reporter.emit(ExecutionEvent::Error {
                    message: format!("{}: {}", failure.kind, failure.message),
                });
            }
            (Ok(cached), _) => {
                info!(
                    session_id = %ctx.session_id,
                    execution_id = %ctx.execution_id,
                    scraper = %ctx.scraper_id,
                    pages_added = cached.stats.pages_added,
                    cost_cents = cached.stats.cost_cents,
                    quality = cached.stats.quality_after,
                    duration_ms,
                    "Execution complete"
                );
                reporter.emit(ExecutionEvent::Complete {
                    stats: cached.stats,
                    summary: cached.summary,
                });
            }
            (Err(e), _) => {
                error!(
                    session_id = %ctx.session_id,
                    execution_id = %ctx.execution_id,
                    scraper = %ctx.scraper_id,
                    error = %e,
                    "Failed to record execution"
                );
                reporter.emit(ExecutionEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Merge, charge and finalise one adapter result in a single versioned write,
    /// then snapshot, consult the advisor and cache the outcome.
    async fn complete_execution(
        &self,
        ctx: &ExecutionContext,
        result: &BatchResult,
        duration_ms: u64,
    ) -> Result<CachedResult> {
        let now = self.now();
        let schema = &self.deps.schema;
        let assessor = self.assessor();
        let origin = BatchOrigin {
            scraper_id: &ctx.scraper_id,
            execution_id: &ctx.execution_id,
            observed_at: now,
        };
        let errors = result.errors();

        let (session, stats) = self
            .mutate(ctx.session_id, "complete_execution", |s| {
                let quality_before = s.overall_quality();
                let mut stats = ExecutionStats {
                    quality_before,
                    quality_after: quality_before,
                    duration_ms,
                    ..ExecutionStats::default()
                };

                // A reset dropped the run, or the session was closed meanwhile:
                // the work is paid for but its data is not wanted.
                let accepts_data = s.run(&ctx.execution_id).is_some() && !s.phase.is_terminal();

                if accepts_data {
                    if let Some(batch) = result.batch() {
                        let report = merge::merge_batch(s, batch, &origin, schema);
                        stats.pages_added = report.pages_added;
                        stats.pages_updated = report.pages_updated;
                        stats.pages_unchanged = report.pages_unchanged;
                        stats.data_points = report.data_points;
                        stats.links_discovered = report.links_discovered;
                        stats.conflicts_opened = report.conflicts_opened();
                        stats.auto_resolved = report.auto_resolved;
                        s.quality = Some(assessor.assess(&s.dataset, &s.history, now));
                    }
                }
                stats.pages_failed = match result {
                    BatchResult::Success(_) => 0,
                    BatchResult::PartialSuccess { errors, .. } => errors.len() as u32,
                    BatchResult::Failure(_) => ctx.request.urls.len() as u32,
                };

                let cost = result.cost_cents();
                stats.cost_cents = cost;
                if let Some(entry) = ledger::record_cost(
                    &mut s.ledger,
                    s.budget_cents,
                    &ctx.execution_id,
                    &ctx.scraper_id,
                    cost,
                    now,
                ) {
                    if entry.over_budget {
                        s.audit.push(
                            AuditEntry::new(
                                AuditKind::BudgetOverrun,
                                format!(
                                    "{} charged {}c, total {}c of {}c",
                                    ctx.scraper_id, cost, s.ledger.total_cents, s.budget_cents
                                ),
                                now,
                            )
                            .for_execution(&ctx.execution_id),
                        );
                    }
                }

                stats.quality_after = s.overall_quality();
                let gain = stats.quality_after - stats.quality_before;

                if let Some(run) = s.run_mut(&ctx.execution_id) {
                    if run.status == RunStatus::Running {
                        run.status = match (accepts_data, result) {
                            (false, _) => RunStatus::Skipped,
                            (true, BatchResult::Failure(_)) => RunStatus::Failed,
                            (true, _) => RunStatus::Complete,
                        };
                        run.pages_scraped = stats.pages_added + stats.pages_updated + stats.pages_unchanged;
                        run.data_points = stats.data_points;
                        run.links_discovered = stats.links_discovered;
                        run.quality_contribution = round1(gain);
                        run.cost_cents = cost;
                        run.duration_ms = duration_ms;
                        run.errors = errors.clone();
                        run.finished_at = Some(now);
                    }
                }
                routing::record_outcome(s, &ctx.scraper_id, &ctx.execution_id, gain, cost);
                Ok(stats)
            })
            .await?;

        if let Some(quality) = &session.quality {
            self.snapshot(&session, SnapshotKind::Quality, quality).await;
        }
        self.snapshot(&session, SnapshotKind::Cost, &ledger::status(&session))
            .await;
        ledger::log_status(&session);

        let mut session = session;
        if session.phase == Phase::Scraping {
            match self.advise(ctx.session_id, true).await {
                Ok((advised, _)) => session = advised,
                Err(e) => {
                    warn!(session_id = %ctx.session_id, error = %e, "Post-merge routing failed");
                }
            }
        }

        let cached = CachedResult {
            execution_id: ctx.execution_id.clone(),
            session_id: ctx.session_id,
            scraper_id: ctx.scraper_id.clone(),
            status: session
                .run(&ctx.execution_id)
                .map(|r| r.status)
                .unwrap_or(RunStatus::Skipped),
            stats,
            summary: session.summary(),
            suggestions: session
                .quality
                .as_ref()
                .map(|q| q.recommendations.clone())
                .unwrap_or_default(),
            errors,
            created_at: now,
            expires_at: now + span(self.deps.settings.result_ttl),
        };

        let results = &self.deps.results;
        if let Err((e, attempts)) = self
            .deps
            .settings
            .retry
            .run("put_cached_result", || results.put(&cached))
            .await
        {
            warn!(execution_id = %ctx.execution_id, error = %e, attempts, "Failed to cache execution result");
        }
        Ok(cached)
    }

    // --- routing & conflicts ---

    async fn advise(&self, session_id: Uuid, auto_advance: bool) -> Result<(Session, RoutingDecision)> {
        let now = self.now();
        let schema = &self.deps.schema;
        let registry = &self.deps.registry;

        let (session, decision) = self
            .mutate(session_id, "recommend_next", |s| {
                let decision = self.advisor.recommend(s, schema, registry, now);
                s.routing.push(decision.clone());
                if auto_advance && phase::auto_advance(s, &decision, now) {
                    info!(session_id = %s.id, reason = %decision.reason, "Scraping complete, advanced to extraction");
                }
                Ok(decision)
            })
            .await?;

        self.snapshot(&session, SnapshotKind::Routing, &decision).await;
        Ok((session, decision))
    }

    /// Consult the advisor. Advisory only: the decision is recorded, nothing runs.
    pub async fn recommend_next(&self, session_id: Uuid) -> Result<RoutingDecision> {
        let (_, decision) = self.advise(session_id, false).await?;
        debug!(
            session_id = %session_id,
            recommendation = ?decision.recommendation,
            gain = decision.estimated_gain,
            cost_cents = decision.estimated_cost_cents,
            "Routing decision"
        );
        Ok(decision)
    }

    pub async fn advisor_accuracy(&self, session_id: Uuid) -> Result<AdvisorAccuracy> {
        Ok(routing::accuracy(&self.load(session_id).await?))
    }

    pub async fn resolve_conflict(
        &self,
        session_id: Uuid,
        conflict_id: Uuid,
        choice: ConflictChoice,
        resolver: &str,
    ) -> Result<Session> {
        let now = self.now();
        let resolver = resolver.trim();
        let assessor = self.assessor();

        let (session, field) = self
            .mutate(session_id, "resolve_conflict", |s| {
                let conflict = s
                    .conflicts
                    .iter_mut()
                    .find(|c| c.id == conflict_id)
                    .ok_or(EngineError::ConflictNotFound {
                        session_id,
                        conflict_id,
                    })?;
                if !conflict.is_pending() {
                    return Err(EngineError::ConflictAlreadyResolved { conflict_id });
                }
                let invalid = |message: String| EngineError::InvalidResolution {
                    conflict_id,
                    message,
                };
                if resolver.is_empty() {
                    return Err(invalid("resolver must not be empty".into()));
                }

                let (value, provenance) = match &choice {
                    ConflictChoice::Candidate(i) => {
                        let candidate = conflict.candidates.get(*i).ok_or_else(|| {
                            invalid(format!(
                                "no candidate {i}, conflict has {}",
                                conflict.candidates.len()
                            ))
                        })?;
                        (candidate.value.clone(), candidate.provenance.clone())
                    }
                    ConflictChoice::Value(value) => {
                        if is_empty_value(value) {
                            return Err(invalid("override value must not be empty".into()));
                        }
                        let provenance = Provenance {
                            scraper_id: format!("manual:{resolver}"),
                            execution_id: conflict.id.to_string(),
                            source_url: None,
                            observed_at: now,
                        };
                        (value.clone(), provenance)
                    }
                };

                conflict.resolution = ResolutionType::Manual;
                conflict.resolved_value = Some(value.clone());
                conflict.resolved_by = Some(resolver.to_string());
                conflict.resolved_at = Some(now);
                let field = conflict.field.clone();

                s.dataset
                    .fields
                    .insert(field.clone(), ResolvedField { value, provenance });
                merge::recount(s);
                s.quality = Some(assessor.assess(&s.dataset, &s.history, now));
                s.audit.push(AuditEntry::new(
                    AuditKind::ConflictResolved,
                    format!("{field} resolved by {resolver}"),
                    now,
                ));
                Ok(field)
            })
            .await?;

        info!(session_id = %session_id, conflict_id = %conflict_id, field = %field, resolver, "Conflict resolved");
        if let Some(quality) = &session.quality {
            self.snapshot(&session, SnapshotKind::Quality, quality).await;
        }
        Ok(session)
    }

    // --- read-side extras ---

    pub async fn get_snapshots(
        &self,
        session_id: Uuid,
        kind: Option<SnapshotKind>,
    ) -> Result<Vec<SessionSnapshot>> {
        self.load(session_id).await?;
        let log = &self.deps.snapshots;
        self.deps
            .settings
            .retry
            .run("list_snapshots", || log.list(session_id, kind))
            .await
            .map_err(|(e, attempts)| EngineError::persistence(e, attempts))
    }

    /// Drop expired locks and cached results.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.now();
        let locks_purged = self.locks.purge_expired(now).await?;
        let results_purged = self.deps.results.purge_expired(now).await?;
        if locks_purged + results_purged > 0 {
            debug!(locks_purged, results_purged, "Sweep complete");
        }
        Ok(SweepReport {
            locks_purged,
            results_purged,
        })
    }
}

/// Mark `running` entries past their deadline as failed.
fn reconcile_orphans(session: &mut Session, settings: &OrchestratorSettings, now: DateTime<Utc>) -> usize {
    let mut orphaned = Vec::new();
    for run in session
        .history
        .iter_mut()
        .filter(|r| r.status == RunStatus::Running && settings.run_deadline(r) < now)
    {
        run.status = RunStatus::Failed;
        run.errors.push(ORPHANED.to_string());
        run.finished_at = Some(now);
        orphaned.push(run.execution_id.clone());
    }
    for execution_id in &orphaned {
        session.audit.push(
            AuditEntry::new(AuditKind::RunOrphaned, ORPHANED, now).for_execution(execution_id),
        );
    }
    orphaned.len()
}
