//! Error taxonomy for the capture loop.
//!
//! Device failures are fatal to `start()` and classified so the caller can
//! show an actionable message (permission vs hardware vs unsupported).
//! Transport failures are delivered through the sink and never stop a
//! periodic loop. A result that arrives after `stop()` is discarded, not
//! surfaced.

use thiserror::Error;

/// Failure to acquire or read from a capture device.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("capture device access denied: {0}")]
    PermissionDenied(String),

    #[error("no capture device found: {0}")]
    NotFound(String),

    #[error("capture device not supported: {0}")]
    Unsupported(String),

    /// A second concurrent use of an exclusive device was rejected.
    #[error("capture device is already in use")]
    Busy,

    #[error("capture backend error: {0}")]
    Backend(String),
}

/// Failure of a report call to the remote analysis endpoint.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("analysis endpoint error ({status}): {message}")]
    Status { status: u16, message: String },

    /// Response body was present but did not have a recognized shape.
    /// Delivered like any other transport failure, logged distinctly.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Every endpoint in an ordered fallback chain failed.
    #[error("all endpoints failed: {}", format_chain(.0))]
    Exhausted(Vec<TransportError>),
}

fn format_chain(errors: &[TransportError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level error surfaced to the owner of a capture session.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(#[from] DeviceError),

    #[error("report failed: {0}")]
    Transport(#[from] TransportError),

    #[error("session id must be non-empty")]
    InvalidSessionId,
}

impl CaptureError {
    /// Short category tag used in logs and the error history.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::DeviceUnavailable(_) => "device",
            CaptureError::Transport(TransportError::MalformedResponse(_)) => "malformed",
            CaptureError::Transport(_) => "transport",
            CaptureError::InvalidSessionId => "session",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_name_the_failure_class() {
        let err = DeviceError::PermissionDenied("microphone".to_string());
        assert!(err.to_string().contains("denied"));

        let err = DeviceError::NotFound("no input device".to_string());
        assert!(err.to_string().contains("no capture device"));
    }

    #[test]
    fn exhausted_chain_lists_every_failure() {
        let err = TransportError::Exhausted(vec![
            TransportError::Network("connection refused".to_string()),
            TransportError::Status {
                status: 404,
                message: "not found".to_string(),
            },
        ]);
        let display = err.to_string();
        assert!(display.contains("connection refused"));
        assert!(display.contains("404"));
    }

    #[test]
    fn malformed_response_has_its_own_kind() {
        let err = CaptureError::Transport(TransportError::MalformedResponse("no fields".into()));
        assert_eq!(err.kind(), "malformed");

        let err = CaptureError::Transport(TransportError::Network("down".into()));
        assert_eq!(err.kind(), "transport");
    }
}
