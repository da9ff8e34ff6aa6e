//! Shared domain types for the Kiln agent-run orchestration server.
//!
//! Everything here is plain data plus the seams the rest of the workspace
//! programs against: the run state machine, the stream-item wire shapes,
//! the plan catalog, and the [`stream::AgentEngine`] trait that hides the
//! LLM+tools loop.

pub mod config;
pub mod entities;
pub mod error;
pub mod plans;
pub mod run;
pub mod stream;

pub use error::{Error, Result};
