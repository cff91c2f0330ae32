//! Concrete capture sources.
//!
//! Camera frame capture lives on the host side (the browser owns the video
//! element); it reaches the loop through the [`CaptureSource`] trait. The
//! microphone source here records from the default input device and yields
//! one WAV buffer when the recording is stopped.
//!
//! [`CaptureSource`]: crate::source::CaptureSource

pub mod microphone;

pub use microphone::MicrophoneSource;
