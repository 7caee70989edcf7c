pub mod config;
pub mod events;
pub mod phase;
pub mod schema;
pub mod types;

pub use config::Config;
pub use events::{ExecutionEvent, ExecutionUpdate, Severity};
pub use phase::Phase;
pub use schema::{ResolutionRule, SchemaField, TargetSchema};
pub use types::*;
