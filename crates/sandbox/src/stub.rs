//! In-memory sandbox provider.
//!
//! Backs tests and dev deployments where no hosting API is configured.
//! Supports scripted start latency and memory-quota failures so the
//! lifecycle and pool paths can be exercised end to end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use kiln_domain::{Error, Result};
use parking_lot::Mutex;

use crate::capability::{ExecResult, FilesystemOps, ProcessOps};
use crate::provider::{SandboxInfo, SandboxProvider, SandboxState};

struct StubEntry {
    info: SandboxInfo,
    /// Set when `start` was called; the sandbox reads as Running once
    /// this instant passes.
    ready_at: Option<Instant>,
}

#[derive(Default)]
struct StubInner {
    sandboxes: HashMap<String, StubEntry>,
    next_id: u64,
    /// Remaining scripted memory-quota failures for start/create.
    memory_quota_failures: u32,
    files: HashMap<(String, String), Vec<u8>>,
    exec_log: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct StubProvider {
    inner: Arc<Mutex<StubInner>>,
    start_delay: Duration,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sandboxes started via `start` become Running only after `delay`.
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::default(),
            start_delay: delay,
        }
    }

    /// Script the next `n` create/start calls to fail with the
    /// provider's memory-quota error.
    pub fn fail_next_with_memory_quota(&self, n: u32) {
        self.inner.lock().memory_quota_failures = n;
    }

    /// Commands executed across all sandboxes, for assertions.
    pub fn exec_log(&self) -> Vec<(String, String)> {
        self.inner.lock().exec_log.clone()
    }

    fn refresh_state(entry: &mut StubEntry) {
        if let Some(ready_at) = entry.ready_at {
            if Instant::now() >= ready_at {
                entry.info.state = SandboxState::Running;
                entry.ready_at = None;
            }
        }
    }

    fn take_memory_quota_failure(inner: &mut StubInner) -> bool {
        if inner.memory_quota_failures > 0 {
            inner.memory_quota_failures -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl SandboxProvider for StubProvider {
    async fn create(&self, snapshot: &str) -> Result<SandboxInfo> {
        let mut inner = self.inner.lock();
        if Self::take_memory_quota_failure(&mut inner) {
            return Err(Error::ResourceExhausted(
                "Total memory quota exceeded".into(),
            ));
        }
        inner.next_id += 1;
        let id = format!("sb-{}", inner.next_id);
        let info = SandboxInfo {
            id: id.clone(),
            state: SandboxState::Running,
            created_at: Utc::now(),
            preview_url: Some(format!("https://{id}.preview.local")),
        };
        tracing::debug!(sandbox_id = %id, snapshot, "stub sandbox created");
        inner.sandboxes.insert(
            id,
            StubEntry {
                info: info.clone(),
                ready_at: None,
            },
        );
        Ok(info)
    }

    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let mut inner = self.inner.lock();
        let entry = inner
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {sandbox_id}")))?;
        Self::refresh_state(entry);
        Ok(entry.info.clone())
    }

    async fn start(&self, sandbox_id: &str) -> Result<()> {
        let delay = self.start_delay;
        let mut inner = self.inner.lock();
        if Self::take_memory_quota_failure(&mut inner) {
            return Err(Error::ResourceExhausted(
                "Total memory quota exceeded".into(),
            ));
        }
        let entry = inner
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {sandbox_id}")))?;
        if entry.info.state != SandboxState::Running {
            entry.info.state = SandboxState::Creating;
            entry.ready_at = Some(Instant::now() + delay);
        }
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {sandbox_id}")))?;
        entry.info.state = SandboxState::Stopped;
        entry.ready_at = None;
        Ok(())
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.sandboxes.remove(sandbox_id);
        inner.files.retain(|(sid, _), _| sid != sandbox_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        let mut inner = self.inner.lock();
        let mut infos: Vec<SandboxInfo> = Vec::with_capacity(inner.sandboxes.len());
        for entry in inner.sandboxes.values_mut() {
            Self::refresh_state(entry);
            infos.push(entry.info.clone());
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(infos)
    }

    fn filesystem(&self, sandbox_id: &str) -> Arc<dyn FilesystemOps> {
        Arc::new(StubHandle {
            inner: self.inner.clone(),
            sandbox_id: sandbox_id.to_owned(),
        })
    }

    fn processes(&self, sandbox_id: &str) -> Arc<dyn ProcessOps> {
        Arc::new(StubHandle {
            inner: self.inner.clone(),
            sandbox_id: sandbox_id.to_owned(),
        })
    }
}

struct StubHandle {
    inner: Arc<Mutex<StubInner>>,
    sandbox_id: String,
}

#[async_trait]
impl FilesystemOps for StubHandle {
    async fn upload_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .files
            .insert((self.sandbox_id.clone(), path.to_owned()), contents.to_vec());
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .files
            .get(&(self.sandbox_id.clone(), path.to_owned()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("file {path}")))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .files
            .keys()
            .filter(|(sid, p)| sid == &self.sandbox_id && p.starts_with(path))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.inner
            .lock()
            .files
            .remove(&(self.sandbox_id.clone(), path.to_owned()));
        Ok(())
    }
}

#[async_trait]
impl ProcessOps for StubHandle {
    async fn exec(&self, command: &str) -> Result<ExecResult> {
        self.inner
            .lock()
            .exec_log
            .push((self.sandbox_id.clone(), command.to_owned()));
        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn create_session(&self, name: &str) -> Result<()> {
        self.inner
            .lock()
            .exec_log
            .push((self.sandbox_id.clone(), format!("session:{name}")));
        Ok(())
    }

    async fn session_exec(&self, name: &str, command: &str) -> Result<ExecResult> {
        self.exec(&format!("[{name}] {command}")).await
    }

    async fn session_logs(&self, _name: &str) -> Result<String> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_stop_delete() {
        let provider = StubProvider::new();
        let info = provider.create("snap").await.unwrap();
        assert_eq!(info.state, SandboxState::Running);

        provider.stop(&info.id).await.unwrap();
        assert_eq!(provider.get(&info.id).await.unwrap().state, SandboxState::Stopped);

        provider.delete(&info.id).await.unwrap();
        assert!(provider.get(&info.id).await.is_err());
    }

    #[tokio::test]
    async fn start_becomes_running_after_delay() {
        let provider = StubProvider::with_start_delay(Duration::from_millis(30));
        let info = provider.create("snap").await.unwrap();
        provider.stop(&info.id).await.unwrap();

        provider.start(&info.id).await.unwrap();
        assert_eq!(provider.get(&info.id).await.unwrap().state, SandboxState::Creating);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.get(&info.id).await.unwrap().state, SandboxState::Running);
    }

    #[tokio::test]
    async fn scripted_memory_quota_failures() {
        let provider = StubProvider::new();
        provider.fail_next_with_memory_quota(1);
        let err = provider.create("snap").await.unwrap_err();
        assert!(crate::provider::is_memory_quota_error(&err));
        // Next call succeeds.
        assert!(provider.create("snap").await.is_ok());
    }

    #[tokio::test]
    async fn filesystem_and_exec_are_scoped_per_sandbox() {
        let provider = StubProvider::new();
        let a = provider.create("snap").await.unwrap();
        let b = provider.create("snap").await.unwrap();

        provider
            .filesystem(&a.id)
            .upload_file("/workspace/x.txt", b"hello")
            .await
            .unwrap();
        assert!(provider.filesystem(&b.id).download_file("/workspace/x.txt").await.is_err());

        provider.processes(&a.id).exec("ls").await.unwrap();
        let log = provider.exec_log();
        assert_eq!(log, vec![(a.id.clone(), "ls".to_string())]);
    }
}
