//! Durable storage seam.
//!
//! The [`db::Database`] trait is the only way the rest of the workspace
//! touches durable state. The in-memory implementation backs tests and
//! single-node deployments; a relational backend implements the same
//! trait, including the atomic token debit.

pub mod db;
pub mod memory;
pub mod vault;

pub use db::{Database, DebitOutcome};
pub use memory::MemoryDatabase;
pub use vault::KeyVault;
