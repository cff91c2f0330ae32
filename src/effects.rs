//! Effect driver for the capture loop.
//!
//! Executes the effects produced by the state machine on spawned tokio
//! tasks; completion events are sent back over the loop's channel. Every
//! task checks the session's cancellation token so `stop()` aborts pending
//! work promptly instead of letting it complete in the background.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::source::{Acquired, CaptureSource, SessionId};
use crate::state_machine::{Effect, Event};
use crate::transport::ReportTransport;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectDriver: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Real effect driver: acquires from the capture source and reports through
/// the transport.
pub struct CaptureDriver<S, T> {
    source: Arc<Mutex<S>>,
    transport: Arc<T>,
    session: SessionId,
    token: CancellationToken,
}

impl<S, T> CaptureDriver<S, T>
where
    S: CaptureSource,
    T: ReportTransport,
{
    pub fn new(
        source: Arc<Mutex<S>>,
        transport: Arc<T>,
        session: SessionId,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            transport,
            session,
            token,
        })
    }
}

impl<S, T> EffectDriver for CaptureDriver<S, T>
where
    S: CaptureSource,
    T: ReportTransport,
{
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartTicker { every } => {
                let token = self.token.clone();
                tokio::spawn(async move {
                    // First tick one interval after start; ticks that pass
                    // while the loop is busy are dropped, not replayed.
                    let start = tokio::time::Instant::now() + every;
                    let mut interval = tokio::time::interval_at(start, every);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                log::debug!("Ticker stopping - session cancelled");
                                break;
                            }
                            _ = interval.tick() => {}
                        }
                        if tx.send(Event::Tick).await.is_err() {
                            log::debug!("Ticker stopping - channel closed");
                            break;
                        }
                    }
                });
            }

            Effect::Acquire { attempt } => {
                let source = self.source.clone();
                let token = self.token.clone();
                tokio::spawn(async move {
                    let acquired = {
                        let mut guard = source.lock().await;
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                log::debug!("Acquire abandoned for attempt {}", attempt);
                                return;
                            }
                            result = guard.acquire() => result,
                        }
                    };

                    let event = match acquired {
                        Ok(Acquired::Ready(sample)) => Event::SampleReady { attempt, sample },
                        Ok(Acquired::NotReady) => Event::SampleNotReady { attempt },
                        Err(error) => {
                            log::error!("Sample acquisition failed: {}", error);
                            Event::SampleFailed { attempt, error }
                        }
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::Report { attempt, sample } => {
                let transport = self.transport.clone();
                let session = self.session.clone();
                let token = self.token.clone();
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            log::debug!("Report abandoned for attempt {}", attempt);
                            return;
                        }
                        result = transport.report(&session, &sample) => result,
                    };

                    let event = match outcome {
                        Ok(metrics) => Event::ReportOk {
                            attempt,
                            metrics,
                            captured_at: sample.captured_at,
                        },
                        Err(error) => {
                            log::error!("Report failed for attempt {}: {}", attempt, error);
                            Event::ReportFail {
                                attempt,
                                error,
                                sample: Some(sample),
                            }
                        }
                    };
                    let _ = tx.send(event).await;
                });
            }

            // Delivery is handled at the loop edge, gated on cancellation.
            Effect::Deliver { .. } | Effect::DeliverError { .. } | Effect::Fallback { .. } => {
                unreachable!("delivery effects are handled in run_capture_loop")
            }
        }
    }
}
