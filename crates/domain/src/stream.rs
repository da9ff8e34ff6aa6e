//! Stream items, control signals, and the agent-engine seam.
//!
//! A *stream item* is one JSON object emitted by the agent generator,
//! destined for the per-run append-only response list and for SSE
//! subscribers. Every item carries a `type` tag on the wire.

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{AppType, Message};

/// Status values carried by `type: "status"` items. `completed`,
/// `failed` and `stopped` are terminal for the producing run; `error`
/// only ever appears in subscriber-facing synthetic items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Running,
    Completed,
    Failed,
    Stopped,
    Error,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// One element of a run's output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamItem {
    Content {
        content: serde_json::Value,
    },
    ToolCall {
        tool_call: serde_json::Value,
    },
    Status {
        status: StreamStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Warning {
        message: String,
    },
    Ping,
}

impl StreamItem {
    pub fn content(value: serde_json::Value) -> Self {
        Self::Content { content: value }
    }

    pub fn status(status: StreamStatus, message: impl Into<Option<String>>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Terminal status carried by this item, if any.
    pub fn terminal_status(&self) -> Option<StreamStatus> {
        match self {
            Self::Status { status, .. } if status.is_terminal() => Some(*status),
            _ => None,
        }
    }
}

/// Messages exchanged on a run's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Stop,
    EndStream,
    Error,
}

impl ControlSignal {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::EndStream => "END_STREAM",
            Self::Error => "ERROR",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "STOP" => Some(Self::Stop),
            "END_STREAM" => Some(Self::EndStream),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Subscriber-facing status emitted when this signal closes a stream.
    pub fn terminal_stream_status(self) -> StreamStatus {
        match self {
            Self::Stop => StreamStatus::Stopped,
            Self::EndStream => StreamStatus::Completed,
            Self::Error => StreamStatus::Error,
        }
    }
}

/// Everything an engine needs to produce a run's stream.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub project_id: Uuid,
    pub account_id: String,
    pub model: String,
    pub enable_thinking: bool,
    pub reasoning_effort: Option<String>,
    pub enable_context_manager: bool,
    pub app_type: AppType,
    /// Thread history in `(created_at, message_id)` order.
    pub messages: Vec<Message>,
}

pub type ItemStream = Pin<Box<dyn futures_core::Stream<Item = StreamItem> + Send>>;

/// The opaque collaborator that interleaves LLM calls with tool
/// invocations inside the sandbox. The executor only ever sees the lazy
/// sequence of stream items; how they are produced is not its concern.
pub trait AgentEngine: Send + Sync {
    fn run(&self, ctx: EngineContext) -> ItemStream;
}
