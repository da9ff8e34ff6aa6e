//! Sandbox management: isolated remote execution environments where all
//! tool operations run.
//!
//! The provider seam ([`provider::SandboxProvider`]) hides the hosting
//! API; the pool ([`pool::SandboxPool`]) hands each user exactly one
//! sandbox, keeps warm instances per app type, and reclaims idle ones.

pub mod capability;
pub mod http;
pub mod lifecycle;
pub mod pool;
pub mod provider;
pub mod stub;

pub use capability::{ExecResult, FilesystemOps, ProcessOps};
pub use pool::{PoolStatus, SandboxPool, SnapshotNames};
pub use provider::{SandboxInfo, SandboxProvider, SandboxState};
pub use stub::StubProvider;
