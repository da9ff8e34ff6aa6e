//! Agent run records and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an agent run.
///
/// ```text
/// queued ──dispatch──▶ running ──normal_end──▶ completed
///                         │
///                         ├──stop_signal──▶ stopping ──▶ stopped
///                         └──error──────────────────────▶ failed
/// ```
///
/// The dispatcher writes `stopping`; only the executor writes `stopped`.
/// A terminal status is never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// A run the project-overlap check counts as "active".
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Transition guard: terminal states accept nothing, and a
    /// non-terminal may not regress to `queued`.
    pub fn may_transition_to(self, next: RunStatus) -> bool {
        if self == next {
            return false;
        }
        if self.is_terminal() {
            return false;
        }
        !matches!(next, RunStatus::Queued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Model configuration captured when a run starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    pub model: String,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub enable_context_manager: bool,
}

/// Durable record of one agent run. The `responses` snapshot is copied
/// from the coordination store's append-only list at finalize time so
/// the stream can be replayed after the transient state expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub responses: Vec<serde_json::Value>,
    pub metadata: RunMetadata,
    pub created_at: DateTime<Utc>,
}

impl AgentRun {
    pub fn new(thread_id: Uuid, metadata: RunMetadata) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            thread_id,
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            error: None,
            responses: Vec::new(),
            metadata,
            created_at: now,
        }
    }
}
