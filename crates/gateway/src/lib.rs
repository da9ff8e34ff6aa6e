//! The Kiln gateway: HTTP edge, run dispatcher, run executor, and SSE
//! stream delivery, wired over the coordination store, the durable
//! store, the quota ledger, and the sandbox pool.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod runtime;
pub mod state;
