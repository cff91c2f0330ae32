//! Capture source abstraction.
//!
//! A `CaptureSource` wraps a live media device (camera, microphone) and hands
//! out samples on request. The source declares its own trigger mode: a camera
//! yields frames on a fixed interval, a stopped recording yields exactly one
//! buffer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::DeviceError;

/// Opaque identifier correlating all reports in one capture cycle to a
/// server-side interview/recording session. Must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self, crate::error::CaptureError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::error::CaptureError::InvalidSessionId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the loop schedules sampling for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Sample repeatedly at a fixed interval (camera frames).
    Periodic(Duration),
    /// Produce exactly one sample per activation (a stopped recording).
    SingleShot,
}

/// One captured media fragment.
#[derive(Clone)]
pub struct Sample {
    pub data: Vec<u8>,
    /// MIME type of `data`, e.g. `image/jpeg` or `audio/wav`.
    pub mime: String,
    pub captured_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            data,
            mime: mime.into(),
            captured_at: Utc::now(),
        }
    }

    /// Filename used when the sample is uploaded as a multipart file.
    pub fn upload_filename(&self) -> String {
        let ext = match self.mime.as_str() {
            "audio/wav" => "wav",
            "audio/webm" => "webm",
            "audio/mp4" => "mp4",
            "image/jpeg" => "jpg",
            "image/png" => "png",
            _ => "bin",
        };
        format!("recording.{}", ext)
    }
}

// Keep raw payload bytes out of the logs.
impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("len", &self.data.len())
            .field("mime", &self.mime)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// Outcome of one acquisition attempt.
#[derive(Debug, Clone)]
pub enum Acquired {
    Ready(Sample),
    /// The source has no valid sample yet (video dimensions still zero,
    /// empty recording buffer). A tick skip, not an error.
    NotReady,
}

/// A live capture device from which samples are acquired.
///
/// The loop calls `open()` exactly once at start; failures there are fatal
/// and classified. `acquire()` is called once per tick (periodic) or once in
/// total (single-shot). The device is released when the source is dropped;
/// implementations backing an exclusive device must reject a second
/// concurrent `open()` with [`DeviceError::Busy`] rather than share the
/// handle.
#[async_trait]
pub trait CaptureSource: Send + Sync + 'static {
    fn trigger(&self) -> TriggerMode;

    /// Acquire the underlying device. Called once before any tick is
    /// scheduled.
    async fn open(&mut self) -> Result<(), DeviceError>;

    /// Acquire the current sample.
    async fn acquire(&mut self) -> Result<Acquired, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_rejects_empty_and_whitespace() {
        assert!(SessionId::new("").is_err());
        assert!(SessionId::new("   ").is_err());
        assert_eq!(SessionId::new("abc-123").unwrap().as_str(), "abc-123");
    }

    #[test]
    fn sample_debug_does_not_dump_payload() {
        let sample = Sample::new(vec![0u8; 4096], "image/jpeg");
        let dbg = format!("{:?}", sample);
        assert!(dbg.contains("len: 4096"));
        assert!(!dbg.contains("[0,"));
    }

    #[test]
    fn upload_filename_follows_mime() {
        assert_eq!(
            Sample::new(vec![], "audio/wav").upload_filename(),
            "recording.wav"
        );
        assert_eq!(
            Sample::new(vec![], "audio/webm").upload_filename(),
            "recording.webm"
        );
        assert_eq!(
            Sample::new(vec![], "application/octet-stream").upload_filename(),
            "recording.bin"
        );
    }
}
