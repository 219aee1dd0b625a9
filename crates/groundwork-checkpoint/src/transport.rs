//! HTTP transport to the coordination service.
//!
//! All checkpoint PATCH bodies are JSON, gzip-compressed, and carry an
//! `Authorization: token <token>` header. The token is obtained from the
//! token source on every request; the source itself handles renewal and
//! caching.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use groundwork_types::urn::{StackId, UpdateId};
use groundwork_types::wire::{
    CapabilitiesResponse, PatchCheckpointDeltaRequest, PatchCheckpointRequest,
    PatchCheckpointVerbatimRequest,
};

use crate::errors::{CheckpointError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Supplier of the bearer token attached to every request.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// The current token. Implementations renew and cache internally.
    async fn get_token(&self) -> anyhow::Result<String>;
}

/// A fixed token, for tests and short-lived operations.
pub struct StaticTokenSource(pub String);

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn get_token(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// The update a persister writes checkpoints for.
#[derive(Debug, Clone)]
pub struct UpdateIdentifier {
    pub stack: StackId,
    pub update_id: UpdateId,
}

impl UpdateIdentifier {
    fn checkpoint_path(&self, suffix: &str) -> String {
        format!(
            "/api/stacks/{}/{}/{}/update/{}/{}",
            self.stack.owner, self.stack.project, self.stack.stack, self.update_id, suffix
        )
    }
}

/// HTTP client for one update's checkpoint endpoints.
pub struct ServiceClient {
    http: reqwest::Client,
    base_url: String,
    update: UpdateIdentifier,
    token_source: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("http", &self.http)
            .field("base_url", &self.base_url)
            .field("update", &self.update)
            .field("token_source", &"<dyn TokenSource>")
            .finish()
    }
}

impl ServiceClient {
    /// Build a client rooted at `base_url` (no trailing slash) for the
    /// given update.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        update: UpdateIdentifier,
        token_source: Arc<dyn TokenSource>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into(),
            update,
            token_source,
        }
    }

    /// Fetch the service's capability list.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Http`] or [`CheckpointError::Api`] on
    /// failure; callers may retry.
    pub async fn get_capabilities(&self) -> Result<CapabilitiesResponse> {
        let url = format!("{}/api/capabilities", self.base_url);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CheckpointError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// Ship a regular checkpoint.
    ///
    /// # Errors
    ///
    /// See [`CheckpointError`].
    pub async fn patch_checkpoint(&self, request: &PatchCheckpointRequest) -> Result<()> {
        self.patch("checkpoint", request).await
    }

    /// Ship a verbatim checkpoint.
    ///
    /// # Errors
    ///
    /// See [`CheckpointError`].
    pub async fn patch_checkpoint_verbatim(
        &self,
        request: &PatchCheckpointVerbatimRequest,
    ) -> Result<()> {
        self.patch("checkpointverbatim", request).await
    }

    /// Ship a delta checkpoint.
    ///
    /// # Errors
    ///
    /// See [`CheckpointError`].
    pub async fn patch_checkpoint_delta(
        &self,
        request: &PatchCheckpointDeltaRequest,
    ) -> Result<()> {
        self.patch("checkpointdelta", request).await
    }

    async fn patch<T: Serialize>(&self, suffix: &str, body: &T) -> Result<()> {
        let token = self
            .token_source
            .get_token()
            .await
            .map_err(CheckpointError::Token)?;

        let json = serde_json::to_vec(body)?;
        let compressed = gzip(&json)?;
        tracing::debug!(
            endpoint = suffix,
            raw_bytes = json.len(),
            compressed_bytes = compressed.len(),
            "shipping checkpoint request"
        );

        let url = format!("{}{}", self.base_url, self.update.checkpoint_path(suffix));
        let response = self
            .http
            .patch(&url)
            .header(reqwest::header::AUTHORIZATION, format!("token {token}"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::CONTENT_ENCODING, "gzip")
            .body(compressed)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckpointError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}
