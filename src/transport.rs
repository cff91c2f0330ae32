//! HTTP clients for the remote analysis endpoints.
//!
//! Two endpoints are consumed: frame analysis (JSON body with a base64 JPEG
//! payload) and audio transcription (multipart upload). Credentials are
//! injected explicitly rather than read from ambient storage, so tests can
//! run against fake tokens and callers keep the dependency visible.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::TransportError;
use crate::source::{Sample, SessionId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Bearer credentials passed down from the owning view.
///
/// An absent token is not a precondition failure; the call goes out without
/// an Authorization header and the server classifies it.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    bearer: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { bearer: None }
    }

    fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }
}

/// Transport seam of the capture loop: one report call per acquired sample.
///
/// The decoded metrics value is opaque to the loop and passed through to the
/// sink unchanged.
#[async_trait]
pub trait ReportTransport: Send + Sync + 'static {
    async fn report(&self, session: &SessionId, sample: &Sample) -> Result<Value, TransportError>;
}

/// Error body shape returned by the backend.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn status_error(status: u16, body: String) -> TransportError {
    let message = if let Ok(parsed) = serde_json::from_str::<ApiErrorResponse>(&body) {
        parsed.error.message
    } else {
        body
    };
    TransportError::Status { status, message }
}

/// Client for the analyze-frame endpoint.
///
/// Sends `{ "session_id": ..., "frame_data": <base64 jpeg> }` and returns the
/// metrics object as-is.
pub struct FrameAnalysisClient {
    endpoint: String,
    credentials: Credentials,
}

impl FrameAnalysisClient {
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
        }
    }
}

#[async_trait]
impl ReportTransport for FrameAnalysisClient {
    async fn report(&self, session: &SessionId, sample: &Sample) -> Result<Value, TransportError> {
        let body = serde_json::json!({
            "session_id": session.as_str(),
            "frame_data": BASE64.encode(&sample.data),
        });

        let response = self
            .credentials
            .apply(http_client().post(&self.endpoint).json(&body))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::error!("Frame analysis failed ({}): {}", status.as_u16(), text);
            return Err(status_error(status.as_u16(), text));
        }

        let metrics: Value = response
            .json()
            .await
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;

        if !metrics.is_object() {
            log::warn!("Frame analysis returned a non-object body: {}", metrics);
            return Err(TransportError::MalformedResponse(
                "expected a metrics object".to_string(),
            ));
        }

        log::debug!("Frame analysis ok: {} bytes sent", sample.data.len());
        Ok(metrics)
    }
}

/// Client for the transcribe-audio endpoint(s).
///
/// Endpoints are tried in order (primary first, then legacy); the first
/// success wins and all failures aggregate into one error.
pub struct TranscriptionClient {
    endpoints: Vec<String>,
    credentials: Credentials,
}

impl TranscriptionClient {
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            credentials,
        }
    }

    /// Add a legacy endpoint tried after the primary one fails.
    pub fn with_fallback(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    async fn try_endpoint(
        &self,
        endpoint: &str,
        sample: &Sample,
    ) -> Result<Value, TransportError> {
        let part = Part::bytes(sample.data.clone())
            .file_name(sample.upload_filename())
            .mime_str(&sample.mime)
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        let form = Form::new().part("file", part);

        let response = self
            .credentials
            .apply(http_client().post(endpoint).multipart(form))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !status.is_success() {
            log::error!("Transcription failed ({}): {}", status.as_u16(), text);
            return Err(status_error(status.as_u16(), text));
        }

        let transcript = decode_transcript(&text)?;
        log::info!("Transcription ok: {} chars", transcript.len());
        Ok(Value::String(transcript))
    }
}

/// Accepts the response shapes the backend has been observed to return:
/// `{ "transcript": ... }`, `{ "transcription": ... }`, or a bare JSON
/// string.
fn decode_transcript(body: &str) -> Result<String, TransportError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;

    match &value {
        Value::String(s) => Ok(s.clone()),
        Value::Object(map) => map
            .get("transcript")
            .or_else(|| map.get("transcription"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::MalformedResponse(
                    "no transcript or transcription field".to_string(),
                )
            }),
        _ => Err(TransportError::MalformedResponse(
            "unrecognized transcript body".to_string(),
        )),
    }
}

#[async_trait]
impl ReportTransport for TranscriptionClient {
    async fn report(&self, _session: &SessionId, sample: &Sample) -> Result<Value, TransportError> {
        let mut failures = Vec::new();
        for endpoint in &self.endpoints {
            match self.try_endpoint(endpoint, sample).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    log::warn!("Transcription endpoint {} failed: {}", endpoint, err);
                    failures.push(err);
                }
            }
        }
        match failures.pop() {
            Some(only) if failures.is_empty() => Err(only),
            Some(last) => {
                failures.push(last);
                Err(TransportError::Exhausted(failures))
            }
            None => Err(TransportError::Network("no endpoints configured".to_string())),
        }
    }
}

/// Typed view over the frame-analysis metrics object.
///
/// The loop itself passes metrics through opaquely; this mirrors how the UI
/// reads them, with absent scores defaulting to zero.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubScore {
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

impl SubScore {
    pub fn score_or_zero(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameMetrics {
    #[serde(default)]
    pub posture: SubScore,
    #[serde(default)]
    pub eye_contact: SubScore,
    #[serde(default)]
    pub facial_expression: SubScore,
    #[serde(default)]
    pub hand_gestures: SubScore,
    #[serde(default)]
    pub head_movement: SubScore,
    #[serde(default)]
    pub overall_score: f64,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub real_time_suggestions: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl FrameMetrics {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Confidence score scaled to a percentage for display.
    pub fn confidence_percent(&self) -> f64 {
        self.confidence_score * 100.0
    }
}
