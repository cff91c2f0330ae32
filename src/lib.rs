//! Capture-and-report loop for interview practice sessions.
//!
//! Owns a capture source (camera frame or microphone buffer), a trigger
//! (fixed interval or single-shot), a transport call to a remote analysis
//! endpoint, and a result sink. Guarantees: at most one report in flight per
//! session, ticks are skipped rather than queued while a report is
//! outstanding, and `stop()` immediately suppresses further sampling and any
//! late-arriving delivery.

pub mod effects;
pub mod error;
pub mod metrics;
pub mod settings;
pub mod sink;
pub mod source;
pub mod sources;
pub mod state_machine;
pub mod transport;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use effects::{CaptureDriver, EffectDriver};
use metrics::MetricsCollector;
use state_machine::{reduce, Effect, Event, State};

pub use error::{CaptureError, DeviceError, TransportError};
pub use metrics::{ErrorRecord, LoopStats};
pub use settings::{load_settings, save_settings, CaptureSettings};
pub use sink::{CaptureResult, ChannelSink, ResultSink, SinkEvent, ThrottledSink};
pub use source::{Acquired, CaptureSource, Sample, SessionId, TriggerMode};
pub use sources::MicrophoneSource;
pub use transport::{
    Credentials, FrameAnalysisClient, FrameMetrics, ReportTransport, SubScore,
    TranscriptionClient,
};

/// Per-session loop configuration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Auto-stop guard against runaway sessions; `None` disables it.
    pub max_runtime: Option<Duration>,
    /// Capacity of the internal event channel.
    pub channel_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_runtime: None,
            channel_capacity: 32,
        }
    }
}

impl From<&CaptureSettings> for LoopConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            max_runtime: settings.max_session(),
            ..Self::default()
        }
    }
}

/// Handle to a running capture session.
///
/// `stop()` is idempotent and takes effect synchronously: no further ticks
/// are scheduled and nothing is delivered afterwards, even from a transport
/// call already in flight. Dropping the handle stops the session.
pub struct LoopHandle {
    token: CancellationToken,
    done: CancellationToken,
    events: mpsc::Sender<Event>,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl LoopHandle {
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            log::info!("Stop requested");
            self.token.cancel();
            // Best effort; the cancellation token already gates everything.
            let _ = self.events.try_send(Event::StopRequested);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled() || self.token.is_cancelled()
    }

    /// Resolves once the loop task has fully wound down (single-shot
    /// completion, auto-stop, or an explicit `stop()`).
    pub async fn stopped(&self) {
        self.done.cancelled().await
    }

    pub fn stats(&self) -> LoopStats {
        with_metrics(&self.metrics, |m| m.snapshot())
    }

    pub fn error_history(&self) -> Vec<ErrorRecord> {
        with_metrics(&self.metrics, |m| m.error_history())
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// The capture-and-report loop entry point.
pub struct CaptureLoop;

impl CaptureLoop {
    /// Open the source's device and start sampling according to its trigger
    /// mode. Device-acquisition failures are fatal here and classified; all
    /// later failures flow through the sink.
    pub async fn start<S, T>(
        mut source: S,
        transport: T,
        session_id: SessionId,
        config: LoopConfig,
        sink: Arc<dyn ResultSink>,
    ) -> Result<LoopHandle, CaptureError>
    where
        S: CaptureSource,
        T: ReportTransport,
    {
        source.open().await?;
        let mode = source.trigger();

        let token = CancellationToken::new();
        let done = CancellationToken::new();
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let (tx, rx) = mpsc::channel::<Event>(config.channel_capacity.max(1));

        let driver: Arc<dyn EffectDriver> = CaptureDriver::new(
            Arc::new(tokio::sync::Mutex::new(source)),
            Arc::new(transport),
            session_id.clone(),
            token.clone(),
        );

        if tx
            .send(Event::Start {
                mode,
                max_runtime: config.max_runtime,
            })
            .await
            .is_err()
        {
            // Receiver is alive until the loop task takes it; this cannot
            // happen in practice but must not panic if it does.
            log::error!("Event channel closed before the loop started");
        }

        tokio::spawn(run_capture_loop(
            rx,
            tx.clone(),
            driver,
            sink,
            metrics.clone(),
            token.clone(),
            done.clone(),
            session_id,
        ));

        Ok(LoopHandle {
            token,
            done,
            events: tx,
            metrics,
        })
    }
}

/// Run the loop for one session: receive events, reduce, execute effects.
/// Delivery effects are handled here so they can be gated on cancellation;
/// everything else is spawned through the driver.
#[allow(clippy::too_many_arguments)]
async fn run_capture_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    driver: Arc<dyn EffectDriver>,
    sink: Arc<dyn ResultSink>,
    metrics: Arc<Mutex<MetricsCollector>>,
    token: CancellationToken,
    done: CancellationToken,
    session: SessionId,
) {
    let mut state = State::default();
    log::info!("Capture loop started for session {}", session);

    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => {
                log::debug!("Capture loop cancelled for session {}", session);
                break;
            }
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };

        record_scheduling_metrics(&metrics, &state, &event);

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        if old_discriminant != std::mem::discriminant(&next) {
            log::debug!("State transition: {:?} -> {:?}", state, next);
        }
        state = next;

        for effect in effects {
            match effect {
                Effect::Deliver { result } => {
                    if !token.is_cancelled() {
                        with_metrics(&metrics, |m| m.report_ok());
                        sink.on_result(result);
                    }
                }
                Effect::DeliverError { error } => {
                    if !token.is_cancelled() {
                        with_metrics(&metrics, |m| m.report_failed(&error));
                        sink.on_error(error);
                    }
                }
                Effect::Fallback { sample } => {
                    if !token.is_cancelled() {
                        sink.on_fallback(sample);
                    }
                }
                other => driver.spawn(other, tx.clone()),
            }
        }

        if matches!(state, State::Stopped) {
            break;
        }
    }

    done.cancel();
    log::info!("Capture loop ended for session {}", session);
}

/// Tick accounting happens at the loop edge, before the reducer consumes the
/// event, so skip reasons can be attributed to the state that caused them.
fn record_scheduling_metrics(
    metrics: &Arc<Mutex<MetricsCollector>>,
    state: &State,
    event: &Event,
) {
    match (state, event) {
        (State::Running { attempt, .. }, Event::Tick) => with_metrics(metrics, |m| {
            m.tick_seen();
            if attempt.is_some() {
                m.tick_skipped_in_flight();
            }
        }),
        (
            State::Running {
                attempt: Some(current),
                ..
            },
            Event::SampleNotReady { attempt },
        ) if current == attempt => with_metrics(metrics, |m| m.tick_skipped_not_ready()),
        _ => {}
    }
}

fn with_metrics<R>(metrics: &Arc<Mutex<MetricsCollector>>, f: impl FnOnce(&mut MetricsCollector) -> R) -> R {
    let mut guard = match metrics.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}
