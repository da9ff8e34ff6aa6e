//! Capability interfaces a sandbox exposes to the rest of the system.
//!
//! The executor and pool depend only on these two traits, never on a
//! concrete provider client.

use async_trait::async_trait;
use kiln_domain::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// File operations inside a sandbox workspace.
#[async_trait]
pub trait FilesystemOps: Send + Sync {
    async fn upload_file(&self, path: &str, contents: &[u8]) -> Result<()>;
    async fn download_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn list_dir(&self, path: &str) -> Result<Vec<String>>;
    async fn delete_file(&self, path: &str) -> Result<()>;
}

/// Process operations inside a sandbox.
#[async_trait]
pub trait ProcessOps: Send + Sync {
    /// One-shot command execution in the workspace directory.
    async fn exec(&self, command: &str) -> Result<ExecResult>;
    /// Named long-lived session (dev servers and the like).
    async fn create_session(&self, name: &str) -> Result<()>;
    async fn session_exec(&self, name: &str, command: &str) -> Result<ExecResult>;
    async fn session_logs(&self, name: &str) -> Result<String>;
}
