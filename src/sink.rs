//! Result delivery to the owning view.
//!
//! The loop pushes decoded results and classified errors into a
//! caller-supplied [`ResultSink`]. Nothing is delivered after `stop()`.

use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::CaptureError;
use crate::source::Sample;

/// One reported observation: the server's decoded metrics, passed through
/// unchanged, plus the capture time of the sample that produced it.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub captured_at: chrono::DateTime<chrono::Utc>,
    pub metrics: Value,
}

/// Caller-supplied callbacks for loop output.
///
/// Implementations must not block; they are invoked on the loop task.
/// Periodic-mode errors arrive once per failing tick, so UI-facing sinks
/// should rate-limit notifications (see [`ThrottledSink`]).
pub trait ResultSink: Send + Sync + 'static {
    fn on_result(&self, result: CaptureResult);

    fn on_error(&self, error: CaptureError);

    /// Single-shot transport failure: the raw sample is handed back so the
    /// caller can offer a manual recovery path (e.g. download the buffer).
    fn on_fallback(&self, sample: Sample) {
        log::warn!("No fallback handler registered, dropping {:?}", sample);
    }
}

/// Everything a [`ChannelSink`] forwards.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Result(CaptureResult),
    Error(CaptureError),
    Fallback(Sample),
}

/// Sink that forwards loop output over an mpsc channel.
///
/// Uses `try_send` so a slow consumer can never stall the loop; overflow is
/// logged and dropped.
pub struct ChannelSink {
    tx: mpsc::Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<SinkEvent>) -> Self {
        Self { tx }
    }

    fn forward(&self, event: SinkEvent) {
        if let Err(e) = self.tx.try_send(event) {
            log::warn!("Sink channel full or closed, dropping event: {}", e);
        }
    }
}

impl ResultSink for ChannelSink {
    fn on_result(&self, result: CaptureResult) {
        self.forward(SinkEvent::Result(result));
    }

    fn on_error(&self, error: CaptureError) {
        self.forward(SinkEvent::Error(error));
    }

    fn on_fallback(&self, sample: Sample) {
        self.forward(SinkEvent::Fallback(sample));
    }
}

/// Decorator that forwards at most one error per window to the inner sink.
///
/// Every occurrence is still logged; results and fallbacks pass through
/// untouched. Keeps a flaky network from producing a notification per tick.
pub struct ThrottledSink<S> {
    inner: S,
    window: Duration,
    state: Mutex<ThrottleState>,
}

struct ThrottleState {
    last_forwarded: Option<std::time::Instant>,
    suppressed: u64,
}

impl<S: ResultSink> ThrottledSink<S> {
    pub fn new(inner: S, window: Duration) -> Self {
        Self {
            inner,
            window,
            state: Mutex::new(ThrottleState {
                last_forwarded: None,
                suppressed: 0,
            }),
        }
    }

    fn should_forward(&self) -> (bool, u64) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = std::time::Instant::now();
        match state.last_forwarded {
            Some(prev) if now.duration_since(prev) < self.window => {
                state.suppressed += 1;
                (false, state.suppressed)
            }
            _ => {
                state.last_forwarded = Some(now);
                let suppressed = state.suppressed;
                state.suppressed = 0;
                (true, suppressed)
            }
        }
    }
}

impl<S: ResultSink> ResultSink for ThrottledSink<S> {
    fn on_result(&self, result: CaptureResult) {
        self.inner.on_result(result);
    }

    fn on_error(&self, error: CaptureError) {
        let (forward, suppressed) = self.should_forward();
        if forward {
            if suppressed > 0 {
                log::info!("Forwarding error after suppressing {} earlier ones", suppressed);
            }
            self.inner.on_error(error);
        } else {
            log::warn!("Suppressed repeat error: {}", error);
        }
    }

    fn on_fallback(&self, sample: Sample) {
        self.inner.on_fallback(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        errors: Arc<AtomicUsize>,
        results: Arc<AtomicUsize>,
    }

    impl ResultSink for CountingSink {
        fn on_result(&self, _: CaptureResult) {
            self.results.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _: CaptureError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn transport_error() -> CaptureError {
        CaptureError::Transport(TransportError::Network("down".to_string()))
    }

    #[test]
    fn throttled_sink_forwards_first_error_and_suppresses_repeats() {
        let errors = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(AtomicUsize::new(0));
        let sink = ThrottledSink::new(
            CountingSink {
                errors: errors.clone(),
                results: results.clone(),
            },
            Duration::from_secs(60),
        );

        for _ in 0..5 {
            sink.on_error(transport_error());
        }
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn throttled_sink_never_throttles_results() {
        let errors = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(AtomicUsize::new(0));
        let sink = ThrottledSink::new(
            CountingSink {
                errors: errors.clone(),
                results: results.clone(),
            },
            Duration::from_secs(60),
        );

        for _ in 0..3 {
            sink.on_result(CaptureResult {
                captured_at: chrono::Utc::now(),
                metrics: serde_json::json!({}),
            });
        }
        assert_eq!(results.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn channel_sink_forwards_and_drops_on_overflow() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);

        sink.on_error(transport_error());
        sink.on_error(transport_error()); // dropped, channel full

        assert!(matches!(rx.recv().await, Some(SinkEvent::Error(_))));
        assert!(rx.try_recv().is_err());
    }
}
