//! Typed events emitted while an execution is in flight.
//!
//! Events of one execution are delivered in order and carry a per-execution
//! sequence number, so consumers interleaving several executions can still
//! restore each one's order.

use serde::{Deserialize, Serialize};

use crate::types::{ExecutionStats, MergedSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Progress {
        percentage: u8,
        message: String,
    },
    Complete {
        stats: ExecutionStats,
        summary: MergedSummary,
    },
    Error {
        message: String,
    },
    Notification {
        message: String,
        severity: Severity,
    },
}

impl ExecutionEvent {
    pub fn progress(percentage: u8, message: impl Into<String>) -> Self {
        ExecutionEvent::Progress {
            percentage: percentage.min(100),
            message: message.into(),
        }
    }

    pub fn notification(severity: Severity, message: impl Into<String>) -> Self {
        ExecutionEvent::Notification {
            message: message.into(),
            severity,
        }
    }

    /// `complete` and `error` end an execution's stream.
    pub fn is_final(&self) -> bool {
        matches!(self, ExecutionEvent::Complete { .. } | ExecutionEvent::Error { .. })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ExecutionEvent::Progress { .. } => "progress",
            ExecutionEvent::Complete { .. } => "complete",
            ExecutionEvent::Error { .. } => "error",
            ExecutionEvent::Notification { .. } => "notification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub execution_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub event: ExecutionEvent,
}
