//! Scraping orchestration and additive merge.
//!
//! Scrapers are opaque [`adapter::ScraperAdapter`]s; the engine decides when
//! they may run, merges what they return into the session's dataset, scores
//! the result and advises which tool to run next.

pub mod adapter;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod merge;
pub mod orchestrator;
pub mod phase;
pub mod quality;
pub mod registry;
pub mod remote;
pub mod routing;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use adapter::{BatchResult, ProgressReporter, ScrapeBatch, ScrapeRequest, ScraperAdapter, ScraperConfig};
pub use error::{EngineError, Result};
pub use orchestrator::{
    Clock, ConflictChoice, ExecutionHandle, ExecutionRequest, ExecutionStart, Orchestrator,
    OrchestratorDeps, OrchestratorSettings, SweepReport, SystemClock,
};
pub use registry::{FileConfig, ScraperProfile, ScraperRegistry};
pub use routing::AdvisorAccuracy;
