//! Layout extraction: turn one cleaned page (or image) into Markdown.
//!
//! The service is external and may be slow. [`LayoutExtractor::analyze`]
//! carries no timeout of its own; a caller that needs one wraps the call.
//! Every failure comes back as [`UnitError::ExternalServiceFailure`] (or
//! `ExtractionFailure` when the input could not even be read) so the driver
//! can record it against the unit.

use crate::config::LayoutSettings;
use crate::error::{Doc2MdError, UnitError};
use crate::pipeline::document::DocumentBackend;
use crate::pipeline::vision::VisionLayoutExtractor;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Converts a single-page document or an image file to Markdown.
#[async_trait]
pub trait LayoutExtractor: Send + Sync {
    async fn analyze(&self, path: &Path) -> Result<String, UnitError>;
}

/// Build the extractor selected by `settings`.
pub fn build_extractor(
    settings: &LayoutSettings,
    documents: Arc<dyn DocumentBackend>,
) -> Result<Arc<dyn LayoutExtractor>, Doc2MdError> {
    info!("layout extraction: {settings}");
    match settings {
        LayoutSettings::Azure { endpoint, api_key } => Ok(Arc::new(AzureLayoutExtractor::new(
            endpoint.clone(),
            api_key.clone(),
        )?)),
        LayoutSettings::Vision(config) => Ok(Arc::new(VisionLayoutExtractor::new(
            config.clone(),
            documents,
        )?)),
    }
}

// ── Azure AI Document Intelligence ───────────────────────────────────────

const AZURE_API_VERSION: &str = "2024-11-30";
const AZURE_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// `prebuilt-layout` analysis with Markdown output.
///
/// Submitting a document starts a long-running operation; the result is
/// polled from the URL returned in the `Operation-Location` header.
pub struct AzureLayoutExtractor {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    poll_interval: Duration,
}

impl AzureLayoutExtractor {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self, Doc2MdError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Doc2MdError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            poll_interval: Duration::from_secs(1),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/documentintelligence/documentModels/prebuilt-layout:analyze?api-version={}&outputContentFormat=markdown",
            self.endpoint, AZURE_API_VERSION
        )
    }

    async fn submit(&self, body: Vec<u8>) -> Result<String, UnitError> {
        let response = self
            .client
            .post(self.analyze_url())
            .header(AZURE_KEY_HEADER, &self.api_key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| UnitError::service(format!("submit failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UnitError::service(format!("submit returned {status}: {text}")));
        }
        response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| UnitError::service("response has no Operation-Location header"))
    }

    async fn poll(&self, operation_url: &str) -> Result<String, UnitError> {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let response = self
                .client
                .get(operation_url)
                .header(AZURE_KEY_HEADER, &self.api_key)
                .send()
                .await
                .map_err(|e| UnitError::service(format!("poll failed: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(UnitError::service(format!("poll returned {status}: {text}")));
            }
            let operation: AnalyzeOperation = response
                .json()
                .await
                .map_err(|e| UnitError::service(format!("unreadable analysis result: {e}")))?;
            if let Some(markdown) = operation.into_outcome()? {
                return Ok(markdown);
            }
        }
    }
}

#[async_trait]
impl LayoutExtractor for AzureLayoutExtractor {
    async fn analyze(&self, path: &Path) -> Result<String, UnitError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))?;
        let operation_url = self.submit(body).await?;
        debug!(path = %path.display(), "layout analysis submitted");
        self.poll(&operation_url).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOperation {
    status: String,
    analyze_result: Option<AnalyzeResult>,
    error: Option<ServiceErrorBody>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResult {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ServiceErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl AnalyzeOperation {
    /// `Ok(None)` while the operation is still running.
    fn into_outcome(self) -> Result<Option<String>, UnitError> {
        match self.status.as_str() {
            "succeeded" => self
                .analyze_result
                .map(|r| Some(r.content))
                .ok_or_else(|| UnitError::service("analysis succeeded without a result")),
            "failed" | "canceled" => {
                let (code, message) = self
                    .error
                    .map(|e| (e.code.unwrap_or_default(), e.message.unwrap_or_default()))
                    .unwrap_or_default();
                Err(UnitError::service(format!(
                    "analysis {}: {code} {message}",
                    self.status
                )))
            }
            _ => Ok(None),
        }
    }
}
