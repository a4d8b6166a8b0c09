//! HTTP client for the generative-AI analysis service.
//!
//! Posts the compressed artifact as base64 together with the response schema
//! the service must follow, then validates the reply into an
//! [`AnalysisReport`]. Failures are classified so the executor only retries
//! what can succeed on a second attempt.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use mf_core::config::AnalysisConfig;
use mf_pipeline::{AnalysisReport, AnalysisService};
use serde::Serialize;
use serde_json::{json, Value};

/// Longest slice of an error body carried into error messages.
const BODY_SNIPPET: usize = 200;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpAnalysisService {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpAnalysisService {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> mf_core::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| mf_core::Error::Validation(format!("analysis client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        })
    }

    /// Build a client from configuration. Returns `None` when no endpoint is
    /// configured.
    pub fn from_config(config: &AnalysisConfig) -> mf_core::Result<Option<Self>> {
        let Some(ref endpoint) = config.endpoint else {
            return Ok(None);
        };
        Self::new(
            endpoint.clone(),
            config.api_key.clone(),
            config.model.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
        .map(Some)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, body: &AnalysisRequest<'_>) -> mf_core::Result<Value> {
        let mut req = self.http.post(&self.endpoint).json(body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| mf_core::Error::analysis_transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = format!("service returned {status}: {}", snippet(&body));
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(mf_core::Error::analysis_transient(message))
            } else {
                Err(mf_core::Error::analysis(message))
            };
        }

        resp.json::<Value>()
            .await
            .map_err(|e| mf_core::Error::analysis(format!("undecodable response body: {e}")))
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    fn name(&self) -> &str {
        "http"
    }

    async fn analyze(&self, artifact: &Path) -> mf_core::Result<AnalysisReport> {
        let bytes = tokio::fs::read(artifact).await?;
        let request = AnalysisRequest {
            model: &self.model,
            media: MediaPayload {
                mime_type: mime_type(artifact),
                data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            },
            response_schema: response_schema(),
        };

        tracing::debug!(
            artifact = %artifact.display(),
            bytes = bytes.len(),
            endpoint = %self.endpoint,
            "Requesting analysis"
        );

        let value = self.post(&request).await?;
        AnalysisReport::from_json(value)
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AnalysisRequest<'a> {
    model: &'a str,
    media: MediaPayload,
    response_schema: Value,
}

#[derive(Debug, Serialize)]
struct MediaPayload {
    mime_type: &'static str,
    data: String,
}

/// JSON schema the service's reply must follow.
pub fn response_schema() -> Value {
    json!({
        "type": "object",
        "required": ["summary", "scenes", "audio", "entities"],
        "properties": {
            "summary": { "type": "string" },
            "scenes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["start_secs", "end_secs", "description"],
                    "properties": {
                        "start_secs": { "type": "number" },
                        "end_secs": { "type": "number" },
                        "description": { "type": "string" }
                    }
                }
            },
            "audio": {
                "type": "object",
                "properties": {
                    "speech": { "type": "boolean" },
                    "music": { "type": "boolean" },
                    "transcript": { "type": "string" }
                }
            },
            "entities": { "type": "array", "items": { "type": "string" } }
        }
    })
}

fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(BODY_SNIPPET) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
