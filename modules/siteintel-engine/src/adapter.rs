//! The capability contract every collection tool satisfies.
//!
//! The engine never looks inside a tool: it hands over a URL set plus a
//! per-tool configuration and gets back a [`BatchResult`]. Partial success is
//! a normal outcome, not an error.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use siteintel_common::{Cents, ExecutionEvent, ExecutionUpdate, Severity};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScraperConfig {
    #[serde(default)]
    pub page_limit: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
}

impl ScraperConfig {
    /// Request values win; gaps are filled from the registry defaults.
    pub fn layered_over(&self, defaults: &ScraperConfig) -> ScraperConfig {
        let mut flags = defaults.flags.clone();
        flags.extend(self.flags.iter().map(|(k, v)| (k.clone(), *v)));
        ScraperConfig {
            page_limit: self.page_limit.or(defaults.page_limit),
            timeout_secs: self.timeout_secs.or(defaults.timeout_secs),
            flags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub session_id: Uuid,
    pub execution_id: String,
    pub domain: String,
    pub urls: Vec<String>,
    pub config: ScraperConfig,
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub url: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeBatch {
    #[serde(default)]
    pub pages: Vec<ScrapedPage>,
    #[serde(default)]
    pub fields: Vec<ExtractedField>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub cost_cents: Cents,
}

impl ScrapeBatch {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.fields.is_empty() && self.links.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Blocked,
    Error,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Blocked => write!(f, "blocked"),
            FailureKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Spend incurred before the failure. Still charged.
    #[serde(default)]
    pub cost_cents: Cents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchResult {
    Success(ScrapeBatch),
    PartialSuccess {
        batch: ScrapeBatch,
        errors: Vec<String>,
    },
    Failure(AdapterFailure),
}

impl BatchResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        BatchResult::Failure(AdapterFailure {
            kind,
            message: message.into(),
            cost_cents: 0,
        })
    }

    /// The mergeable part of the result, if any.
    pub fn batch(&self) -> Option<&ScrapeBatch> {
        match self {
            BatchResult::Success(batch) | BatchResult::PartialSuccess { batch, .. } => Some(batch),
            BatchResult::Failure(_) => None,
        }
    }

    pub fn errors(&self) -> Vec<String> {
        match self {
            BatchResult::Success(_) => Vec::new(),
            BatchResult::PartialSuccess { errors, .. } => errors.clone(),
            BatchResult::Failure(f) => vec![format!("{}: {}", f.kind, f.message)],
        }
    }

    pub fn cost_cents(&self) -> Cents {
        match self {
            BatchResult::Success(batch) | BatchResult::PartialSuccess { batch, .. } => {
                batch.cost_cents
            }
            BatchResult::Failure(f) => f.cost_cents,
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

struct EmitterState {
    seq: u64,
    tx: mpsc::UnboundedSender<ExecutionUpdate>,
}

/// Ordered event sink for one execution.
///
/// Sequence numbers are assigned and sent under one lock, so events reach the
/// consumer in seq order even when an adapter reports from several tasks.
/// A dropped receiver is fine: events are discarded, the execution carries on.
#[derive(Clone)]
pub struct ProgressReporter {
    execution_id: String,
    state: Arc<Mutex<EmitterState>>,
}

impl ProgressReporter {
    pub fn channel(execution_id: &str) -> (Self, mpsc::UnboundedReceiver<ExecutionUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            execution_id: execution_id.to_string(),
            state: Arc::new(Mutex::new(EmitterState { seq: 0, tx })),
        };
        (reporter, rx)
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.seq += 1;
        let update = ExecutionUpdate {
            execution_id: self.execution_id.clone(),
            seq: state.seq,
            event,
        };
        let _ = state.tx.send(update);
    }

    pub fn progress(&self, percentage: u8, message: impl Into<String>) {
        self.emit(ExecutionEvent::progress(percentage, message));
    }

    pub fn notify(&self, severity: Severity, message: impl Into<String>) {
        self.emit(ExecutionEvent::notification(severity, message));
    }
}

// ---------------------------------------------------------------------------
// ScraperAdapter
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ScraperAdapter: Send + Sync {
    /// Run the tool against the request's URL set. Never panics on tool
    /// errors; those come back as `BatchResult::Failure`.
    async fn execute(&self, request: &ScrapeRequest, progress: &ProgressReporter) -> BatchResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_config_overrides_registry_defaults() {
        let defaults = ScraperConfig {
            page_limit: Some(50),
            timeout_secs: Some(120),
            flags: BTreeMap::from([("render_js".to_string(), true), ("stealth".to_string(), false)]),
        };
        let request = ScraperConfig {
            page_limit: Some(5),
            timeout_secs: None,
            flags: BTreeMap::from([("stealth".to_string(), true)]),
        };
        let merged = request.layered_over(&defaults);
        assert_eq!(merged.page_limit, Some(5));
        assert_eq!(merged.timeout_secs, Some(120));
        assert_eq!(merged.flags["render_js"], true);
        assert_eq!(merged.flags["stealth"], true);
    }

    #[test]
    fn batch_result_decodes_tagged_json() {
        let partial: BatchResult = serde_json::from_value(json!({
            "status": "partial_success",
            "batch": { "pages": [{ "url": "https://acme.com/", "content": "hi" }], "cost_cents": 12 },
            "errors": ["https://acme.com/team: 404"]
        }))
        .unwrap();
        assert_eq!(partial.cost_cents(), 12);
        assert_eq!(partial.batch().unwrap().pages.len(), 1);
        assert_eq!(partial.errors().len(), 1);

        let failed: BatchResult = serde_json::from_value(json!({
            "status": "failure", "kind": "blocked", "message": "captcha"
        }))
        .unwrap();
        assert!(failed.batch().is_none());
        assert_eq!(failed.errors(), vec!["blocked: captcha".to_string()]);
    }

    #[tokio::test]
    async fn reporter_numbers_events_in_order() {
        let (reporter, mut rx) = ProgressReporter::channel("exec-1");
        reporter.progress(10, "start");
        reporter.notify(Severity::Warning, "slow");
        reporter.progress(90, "almost");
        drop(reporter);

        let mut seqs = Vec::new();
        while let Some(update) = rx.recv().await {
            seqs.push(update.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
