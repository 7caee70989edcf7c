// Test doubles for the orchestration engine.
//
// - MockScraper (ScraperAdapter): URL -> page content map, plus fixed fields/links
// - ScriptedScraper (ScraperAdapter): returns queued BatchResults in order
// - GatedScraper (ScraperAdapter): blocks until released, for concurrency tests
// - ManualClock (Clock): time only moves when told to
//
// Plus helpers for profiles and a fully in-memory orchestrator.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use siteintel_common::{Cents, TargetSchema};
use siteintel_store::MemoryStore;

use crate::adapter::{
    BatchResult, ExtractedField, FailureKind, ProgressReporter, ScrapeBatch, ScrapeRequest,
    ScrapedPage, ScraperAdapter, ScraperConfig,
};
use crate::orchestrator::{Clock, Orchestrator, OrchestratorDeps, OrchestratorSettings};
use crate::registry::{ScraperProfile, ScraperRegistry};

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

pub fn profile(id: &str, cost_cents: Cents, fidelity: f64, provides: &[&str]) -> ScraperProfile {
    ScraperProfile {
        id: id.to_string(),
        endpoint: None,
        estimated_cost_cents: cost_cents,
        fidelity,
        provides_fields: provides.iter().map(|s| s.to_string()).collect(),
        depth_yield_chars: 0,
        max_runs: None,
        defaults: ScraperConfig::default(),
    }
}

// ---------------------------------------------------------------------------
// MockScraper
// ---------------------------------------------------------------------------

/// Serves registered pages for requested URLs. Unknown URLs become per-URL
/// errors (partial success), or a failure when nothing matched.
/// Builder pattern: `.on_page()`, `.with_field()`, `.with_link()`, `.costing()`.
#[derive(Default)]
pub struct MockScraper {
    pages: HashMap<String, String>,
    fields: Vec<ExtractedField>,
    links: Vec<String>,
    cost_cents: Cents,
    calls: AtomicUsize,
}

impl MockScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_page(mut self, url: &str, content: &str) -> Self {
        self.pages.insert(url.to_string(), content.to_string());
        self
    }

    pub fn with_field(mut self, name: &str, value: serde_json::Value) -> Self {
        self.fields.push(ExtractedField {
            name: name.to_string(),
            value,
            source_url: None,
        });
        self
    }

    pub fn with_link(mut self, url: &str) -> Self {
        self.links.push(url.to_string());
        self
    }

    pub fn costing(mut self, cents: Cents) -> Self {
        self.cost_cents = cents;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScraperAdapter for MockScraper {
    async fn execute(&self, request: &ScrapeRequest, progress: &ProgressReporter) -> BatchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut pages = Vec::new();
        let mut errors = Vec::new();
        let total = request.urls.len().max(1);

        for (i, url) in request.urls.iter().enumerate() {
            match self.pages.get(url) {
                Some(content) => pages.push(ScrapedPage {
                    url: url.clone(),
                    content: content.clone(),
                }),
                None => errors.push(format!("{url}: not found")),
            }
            progress.progress((10 + 70 * (i + 1) / total) as u8, format!("fetched {url}"));
        }

        if pages.is_empty() && !request.urls.is_empty() && !self.pages.is_empty() {
            return BatchResult::Failure(crate::adapter::AdapterFailure {
                kind: FailureKind::Error,
                message: errors.join("; "),
                cost_cents: self.cost_cents,
            });
        }

        let batch = ScrapeBatch {
            pages,
            fields: self.fields.clone(),
            links: self.links.clone(),
            cost_cents: self.cost_cents,
        };
        if errors.is_empty() || self.pages.is_empty() {
            BatchResult::Success(batch)
        } else {
            BatchResult::PartialSuccess { batch, errors }
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedScraper
// ---------------------------------------------------------------------------

/// Returns queued results in order; the last one repeats once the queue runs dry.
pub struct ScriptedScraper {
    script: Mutex<VecDeque<BatchResult>>,
    last: Mutex<Option<BatchResult>>,
}

impl ScriptedScraper {
    pub fn new(results: Vec<BatchResult>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ScraperAdapter for ScriptedScraper {
    async fn execute(&self, _request: &ScrapeRequest, _progress: &ProgressReporter) -> BatchResult {
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(result) => {
                *last = Some(result.clone());
                result
            }
            None => last
                .clone()
                .unwrap_or_else(|| BatchResult::failure(FailureKind::Error, "script exhausted")),
        }
    }
}

// ---------------------------------------------------------------------------
// GatedScraper
// ---------------------------------------------------------------------------

/// Holds every execution until `release()` is called, then delegates.
pub struct GatedScraper<A> {
    inner: A,
    gate: Semaphore,
    entered: Semaphore,
}

impl<A: ScraperAdapter> GatedScraper<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
            entered: Semaphore::new(0),
        }
    }

    /// Let `n` held executions proceed.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Wait until an execution is parked at the gate.
    pub async fn wait_entered(&self) {
        let permit = tokio::time::timeout(Duration::from_secs(5), self.entered.acquire())
            .await
            .expect("no execution reached the gate")
            .expect("semaphore closed");
        permit.forget();
    }
}

#[async_trait]
impl<A: ScraperAdapter> ScraperAdapter for GatedScraper<A> {
    async fn execute(&self, request: &ScrapeRequest, progress: &ProgressReporter) -> BatchResult {
        self.entered.add_permits(1);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.inner.execute(request, progress).await
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// In-memory orchestrator
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

/// Orchestrator over one shared `MemoryStore`, a manual clock, the default
/// schema, and settings tuned for fast tests.
pub fn harness(registry: ScraperRegistry) -> TestHarness {
    harness_with(registry, TargetSchema::default(), test_settings())
}

pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        lock_retry_backoff: Duration::from_millis(5),
        retry: siteintel_store::RetryPolicy::immediate(3),
        ..OrchestratorSettings::default()
    }
}

pub fn harness_with(
    registry: ScraperRegistry,
    schema: TargetSchema,
    settings: OrchestratorSettings,
) -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let deps = OrchestratorDeps::builder()
        .sessions(store.clone())
        .locks(store.clone())
        .results(store.clone())
        .snapshots(store.clone())
        .registry(Arc::new(registry))
        .schema(schema)
        .settings(settings)
        .clock(clock.clone())
        .build();
    TestHarness {
        orchestrator: Orchestrator::new(deps),
        store,
        clock,
    }
}
