use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::core::config::Settings;

/// Outcome of one extraction attempt. The gateway never fails: an
/// unsupported mime type, upstream error or blank result all come back
/// as `failed = true` with empty text.
#[derive(Debug, Clone)]
pub(crate) struct ExtractedText {
    pub(crate) text: String,
    pub(crate) failed: bool,
}

impl ExtractedText {
    fn success(text: String) -> Self {
        Self { text, failed: false }
    }

    fn failure() -> Self {
        Self { text: String::new(), failed: true }
    }
}

#[async_trait]
pub(crate) trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> ExtractedText;
}

/// Gateway to the external text extraction service.
#[derive(Debug, Clone)]
pub(crate) struct HttpExtractor {
    client: Client,
    base_url: String,
    api_key: String,
    supported_mime_types: Vec<String>,
}

impl HttpExtractor {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.extractor().timeout_seconds);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .context("Failed to build extractor HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.extractor().base_url.trim_end_matches('/').to_string(),
            api_key: settings.extractor().api_key.clone(),
            supported_mime_types: settings.extractor().supported_mime_types.clone(),
        })
    }

    fn supports(&self, mime_type: &str) -> bool {
        self.supported_mime_types.iter().any(|supported| supported == mime_type)
    }

    async fn call_upstream(&self, bytes: &[u8], mime_type: &str) -> Result<String> {
        let part = Part::bytes(bytes.to_vec())
            .file_name("document")
            .mime_str(mime_type)
            .context("Invalid mime type for multipart part")?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/extract", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .multipart(form)
            .send()
            .await
            .context("Failed to call extractor service")?;

        let status = response.status();
        let body: Value =
            response.json().await.context("Failed to read extractor response body")?;

        if !status.is_success() {
            anyhow::bail!("extractor returned status {status}: {body}");
        }

        let text = body
            .get("text")
            .and_then(Value::as_str)
            .context("Extractor response missing text field")?;
        Ok(text.to_string())
    }
}

#[async_trait]
impl TextExtractor for HttpExtractor {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> ExtractedText {
        if !self.supports(mime_type) {
            tracing::warn!(mime_type, "Unsupported mime type, skipping extraction");
            return ExtractedText::failure();
        }

        // Plain text needs no upstream round-trip.
        if mime_type == "text/plain" {
            let text = String::from_utf8_lossy(bytes).into_owned();
            if text.trim().is_empty() {
                return ExtractedText::failure();
            }
            return ExtractedText::success(text);
        }

        if self.base_url.is_empty() {
            tracing::warn!("Extractor base URL not configured, treating page as unextractable");
            return ExtractedText::failure();
        }

        match self.call_upstream(bytes, mime_type).await {
            Ok(text) if !text.trim().is_empty() => ExtractedText::success(text),
            Ok(_) => {
                tracing::warn!(mime_type, "Extractor returned empty text");
                ExtractedText::failure()
            }
            Err(err) => {
                tracing::warn!(mime_type, error = %err, "Extraction failed");
                ExtractedText::failure()
            }
        }
    }
}
