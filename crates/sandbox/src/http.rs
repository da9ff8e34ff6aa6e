//! HTTP sandbox provider client.
//!
//! Speaks a Daytona-style REST API: sandboxes are created from named
//! snapshots, started/stopped asynchronously, and expose file and
//! process endpoints. All calls carry the provider API key.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_domain::{Error, Result};
use serde::Deserialize;

use crate::capability::{ExecResult, FilesystemOps, ProcessOps};
use crate::provider::{SandboxInfo, SandboxProvider};

#[derive(Clone)]
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/sandboxes{path}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.api_key)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_error(status, &body))
    }
}

fn map_error(status: reqwest::StatusCode, body: &str) -> Error {
    if body.to_lowercase().contains("memory quota") {
        return Error::ResourceExhausted(body.to_owned());
    }
    match status.as_u16() {
        401 | 403 => Error::UpstreamAuth(format!("sandbox provider rejected credentials: {body}")),
        404 => Error::NotFound(format!("sandbox provider: {body}")),
        429 => Error::ResourceExhausted(format!("sandbox provider rate limited: {body}")),
        500..=599 => Error::UpstreamTransient(format!("sandbox provider {status}: {body}")),
        _ => Error::Internal(format!("sandbox provider {status}: {body}")),
    }
}

fn transport(e: reqwest::Error) -> Error {
    Error::UpstreamTransient(format!("sandbox provider unreachable: {e}"))
}

#[async_trait]
impl SandboxProvider for HttpProvider {
    async fn create(&self, snapshot: &str) -> Result<SandboxInfo> {
        let response = self
            .request(reqwest::Method::POST, self.url(""))
            .json(&serde_json::json!({ "snapshot": snapshot }))
            .send()
            .await
            .map_err(transport)?;
        Ok(Self::check(response).await?.json().await.map_err(transport)?)
    }

    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let response = self
            .request(reqwest::Method::GET, self.url(&format!("/{sandbox_id}")))
            .send()
            .await
            .map_err(transport)?;
        Ok(Self::check(response).await?.json().await.map_err(transport)?)
    }

    async fn start(&self, sandbox_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, self.url(&format!("/{sandbox_id}/start")))
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, self.url(&format!("/{sandbox_id}/stop")))
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, self.url(&format!("/{sandbox_id}")))
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        #[derive(Deserialize)]
        struct ListResponse {
            sandboxes: Vec<SandboxInfo>,
        }
        let response = self
            .request(reqwest::Method::GET, self.url(""))
            .send()
            .await
            .map_err(transport)?;
        let body: ListResponse = Self::check(response).await?.json().await.map_err(transport)?;
        Ok(body.sandboxes)
    }

    fn filesystem(&self, sandbox_id: &str) -> Arc<dyn FilesystemOps> {
        Arc::new(HttpHandle {
            provider: self.clone(),
            sandbox_id: sandbox_id.to_owned(),
        })
    }

    fn processes(&self, sandbox_id: &str) -> Arc<dyn ProcessOps> {
        Arc::new(HttpHandle {
            provider: self.clone(),
            sandbox_id: sandbox_id.to_owned(),
        })
    }
}

struct HttpHandle {
    provider: HttpProvider,
    sandbox_id: String,
}

impl HttpHandle {
    fn url(&self, tail: &str) -> String {
        self.provider.url(&format!("/{}{tail}", self.sandbox_id))
    }
}

#[async_trait]
impl FilesystemOps for HttpHandle {
    async fn upload_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let response = self
            .provider
            .request(reqwest::Method::POST, self.url("/files"))
            .query(&[("path", path)])
            .body(contents.to_vec())
            .send()
            .await
            .map_err(transport)?;
        HttpProvider::check(response).await?;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        let response = self
            .provider
            .request(reqwest::Method::GET, self.url("/files"))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(transport)?;
        Ok(HttpProvider::check(response)
            .await?
            .bytes()
            .await
            .map_err(transport)?
            .to_vec())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct ListDirResponse {
            entries: Vec<String>,
        }
        let response = self
            .provider
            .request(reqwest::Method::GET, self.url("/files/list"))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(transport)?;
        let body: ListDirResponse = HttpProvider::check(response)
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(body.entries)
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let response = self
            .provider
            .request(reqwest::Method::DELETE, self.url("/files"))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(transport)?;
        HttpProvider::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessOps for HttpHandle {
    async fn exec(&self, command: &str) -> Result<ExecResult> {
        let response = self
            .provider
            .request(reqwest::Method::POST, self.url("/exec"))
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await
            .map_err(transport)?;
        Ok(HttpProvider::check(response)
            .await?
            .json()
            .await
            .map_err(transport)?)
    }

    async fn create_session(&self, name: &str) -> Result<()> {
        let response = self
            .provider
            .request(reqwest::Method::POST, self.url("/sessions"))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(transport)?;
        HttpProvider::check(response).await?;
        Ok(())
    }

    async fn session_exec(&self, name: &str, command: &str) -> Result<ExecResult> {
        let response = self
            .provider
            .request(
                reqwest::Method::POST,
                self.url(&format!("/sessions/{name}/exec")),
            )
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await
            .map_err(transport)?;
        Ok(HttpProvider::check(response)
            .await?
            .json()
            .await
            .map_err(transport)?)
    }

    async fn session_logs(&self, name: &str) -> Result<String> {
        let response = self
            .provider
            .request(
                reqwest::Method::GET,
                self.url(&format!("/sessions/{name}/logs")),
            )
            .send()
            .await
            .map_err(transport)?;
        HttpProvider::check(response).await?.text().await.map_err(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping() {
        assert!(matches!(
            map_error(reqwest::StatusCode::UNAUTHORIZED, "bad key"),
            Error::UpstreamAuth(_)
        ));
        assert!(matches!(
            map_error(reqwest::StatusCode::NOT_FOUND, "gone"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            map_error(reqwest::StatusCode::BAD_GATEWAY, "upstream hiccup"),
            Error::UpstreamTransient(_)
        ));
        // Memory-quota bodies override the status class.
        assert!(matches!(
            map_error(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                "Total memory quota exceeded"
            ),
            Error::ResourceExhausted(_)
        ));
    }

    #[test]
    fn url_construction_trims_trailing_slash() {
        let provider = HttpProvider::new("https://sandboxes.example/", "key");
        assert_eq!(
            provider.url("/sb-1/start"),
            "https://sandboxes.example/api/sandboxes/sb-1/start"
        );
    }
}
