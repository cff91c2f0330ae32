//! State machine for the capture-and-report loop.
//!
//! The loop uses a single-writer pattern: all transitions go through the
//! `reduce()` function, which returns a new state and a list of effects to
//! execute. The reducer enforces the core invariants directly:
//!
//! - at most one report attempt in flight per session (ticks that see an
//!   outstanding attempt are skipped, never queued);
//! - events carrying a stale attempt id are dropped silently;
//! - after a stop request, an in-flight attempt's outcome is discarded
//!   rather than delivered.

use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CaptureError, DeviceError, TransportError};
use crate::sink::CaptureResult;
use crate::source::{Sample, TriggerMode};

/// Lifecycle of one capture session. All transitions go through the reducer.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    Running {
        mode: TriggerMode,
        /// Attempt currently being acquired or reported, if any.
        attempt: Option<Uuid>,
        started_at: Instant,
        /// Auto-stop guard against runaway sessions; `None` disables it.
        max_runtime: Option<Duration>,
    },
    /// Stop was requested while an attempt was outstanding; its outcome is
    /// awaited only to be discarded.
    Stopping { attempt: Uuid },
    Stopped,
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

/// Events driving the loop. Sent by the handle (start/stop), the ticker, and
/// the acquire/report effect tasks.
#[derive(Debug, Clone)]
pub enum Event {
    Start {
        mode: TriggerMode,
        max_runtime: Option<Duration>,
    },
    /// One scheduled opportunity to sample and report.
    Tick,
    StopRequested,

    // Acquisition outcomes
    SampleReady {
        attempt: Uuid,
        sample: Sample,
    },
    SampleNotReady {
        attempt: Uuid,
    },
    SampleFailed {
        attempt: Uuid,
        error: DeviceError,
    },

    // Report outcomes
    ReportOk {
        attempt: Uuid,
        metrics: Value,
        captured_at: chrono::DateTime<chrono::Utc>,
    },
    ReportFail {
        attempt: Uuid,
        error: TransportError,
        /// Present in single-shot mode so the raw buffer can be offered back
        /// to the caller.
        sample: Option<Sample>,
    },
}

/// Effects to be executed after a state transition. Acquire/report/ticker
/// effects run on spawned tasks; delivery effects are handled at the loop
/// edge so they can be gated on cancellation.
#[derive(Debug, Clone)]
pub enum Effect {
    StartTicker { every: Duration },
    Acquire { attempt: Uuid },
    Report { attempt: Uuid, sample: Sample },
    Deliver { result: CaptureResult },
    DeliverError { error: CaptureError },
    Fallback { sample: Sample },
}

/// Reducer function: (state, event) -> (next_state, effects)
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    // Current attempt id, if any; events tagged with anything else are stale.
    let current_attempt: Option<Uuid> = match state {
        Running { attempt, .. } => *attempt,
        Stopping { attempt } => Some(*attempt),
        Idle | Stopped => None,
    };
    let is_stale = |eid: Uuid| current_attempt != Some(eid);

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, Start { mode, max_runtime }) => match mode {
            TriggerMode::Periodic(every) => (
                Running {
                    mode,
                    attempt: None,
                    started_at: Instant::now(),
                    max_runtime,
                },
                vec![StartTicker { every }],
            ),
            TriggerMode::SingleShot => {
                let attempt = Uuid::new_v4();
                (
                    Running {
                        mode,
                        attempt: Some(attempt),
                        started_at: Instant::now(),
                        max_runtime,
                    },
                    vec![Acquire { attempt }],
                )
            }
        },
        (Idle, StopRequested) => (Stopped, vec![]),

        // -----------------
        // Running: tick scheduling
        // -----------------
        (
            Running {
                mode,
                attempt,
                started_at,
                max_runtime,
            },
            Tick,
        ) => {
            if let Some(max) = max_runtime {
                if started_at.elapsed() >= *max {
                    log::warn!(
                        "Session auto-stopped after {:?} (max runtime reached)",
                        started_at.elapsed()
                    );
                    return match attempt {
                        Some(id) => (Stopping { attempt: *id }, vec![]),
                        None => (Stopped, vec![]),
                    };
                }
            }
            match attempt {
                // Strict at-most-one concurrency: skip the tick entirely.
                Some(id) => {
                    log::debug!("Tick skipped, attempt {} still in flight", id);
                    (state.clone(), vec![])
                }
                None => {
                    let attempt = Uuid::new_v4();
                    (
                        Running {
                            mode: *mode,
                            attempt: Some(attempt),
                            started_at: *started_at,
                            max_runtime: *max_runtime,
                        },
                        vec![Acquire { attempt }],
                    )
                }
            }
        }

        // -----------------
        // Running: acquisition outcomes
        // -----------------
        (
            Running {
                attempt: Some(current),
                ..
            },
            SampleReady { attempt, sample },
        ) if *current == attempt => {
            log::debug!("Sample acquired for attempt {}: {:?}", attempt, sample);
            (state.clone(), vec![Report { attempt, sample }])
        }
        (
            Running {
                mode,
                attempt: Some(current),
                started_at,
                max_runtime,
            },
            SampleNotReady { attempt },
        ) if *current == attempt => match mode {
            // Precondition not yet met; skip the tick, not an error.
            TriggerMode::Periodic(_) => {
                log::debug!("Source not ready, skipping tick (attempt {})", attempt);
                (
                    Running {
                        mode: *mode,
                        attempt: None,
                        started_at: *started_at,
                        max_runtime: *max_runtime,
                    },
                    vec![],
                )
            }
            // A single-shot source with nothing to report (empty recording
            // buffer) ends the session quietly.
            TriggerMode::SingleShot => {
                log::warn!("Single-shot source produced no data, stopping");
                (Stopped, vec![])
            }
        },
        (
            Running {
                mode,
                attempt: Some(current),
                started_at,
                max_runtime,
            },
            SampleFailed { attempt, error },
        ) if *current == attempt => {
            let effect = DeliverError {
                error: CaptureError::DeviceUnavailable(error),
            };
            match mode {
                TriggerMode::Periodic(_) => (
                    Running {
                        mode: *mode,
                        attempt: None,
                        started_at: *started_at,
                        max_runtime: *max_runtime,
                    },
                    vec![effect],
                ),
                TriggerMode::SingleShot => (Stopped, vec![effect]),
            }
        }

        // -----------------
        // Running: report outcomes
        // -----------------
        (
            Running {
                mode,
                attempt: Some(current),
                started_at,
                max_runtime,
            },
            ReportOk {
                attempt,
                metrics,
                captured_at,
            },
        ) if *current == attempt => {
            let deliver = Deliver {
                result: CaptureResult {
                    captured_at,
                    metrics,
                },
            };
            match mode {
                TriggerMode::Periodic(_) => (
                    Running {
                        mode: *mode,
                        attempt: None,
                        started_at: *started_at,
                        max_runtime: *max_runtime,
                    },
                    vec![deliver],
                ),
                TriggerMode::SingleShot => (Stopped, vec![deliver]),
            }
        }
        (
            Running {
                mode,
                attempt: Some(current),
                started_at,
                max_runtime,
            },
            ReportFail {
                attempt,
                error,
                sample,
            },
        ) if *current == attempt => {
            let deliver_error = DeliverError {
                error: CaptureError::Transport(error),
            };
            match mode {
                // Failures are isolated to their tick; the loop keeps going.
                TriggerMode::Periodic(_) => (
                    Running {
                        mode: *mode,
                        attempt: None,
                        started_at: *started_at,
                        max_runtime: *max_runtime,
                    },
                    vec![deliver_error],
                ),
                // No automatic retry: surface the error once and hand the raw
                // buffer back for manual recovery.
                TriggerMode::SingleShot => {
                    let mut effects = vec![deliver_error];
                    if let Some(sample) = sample {
                        effects.push(Fallback { sample });
                    }
                    (Stopped, effects)
                }
            }
        }

        // -----------------
        // Stop
        // -----------------
        (Running { attempt, .. }, StopRequested) => match attempt {
            Some(id) => (Stopping { attempt: *id }, vec![]),
            None => (Stopped, vec![]),
        },

        // -----------------
        // Stopping: discard the in-flight outcome, whatever it is
        // -----------------
        (Stopping { attempt }, ReportOk { attempt: id, .. }) if *attempt == id => {
            log::debug!("Discarding late result for attempt {} after stop", id);
            (Stopped, vec![])
        }
        (Stopping { attempt }, ReportFail { attempt: id, .. }) if *attempt == id => {
            log::debug!("Discarding late failure for attempt {} after stop", id);
            (Stopped, vec![])
        }
        (Stopping { attempt }, SampleReady { attempt: id, .. }) if *attempt == id => {
            (Stopped, vec![])
        }
        (Stopping { attempt }, SampleNotReady { attempt: id }) if *attempt == id => {
            (Stopped, vec![])
        }
        (Stopping { attempt }, SampleFailed { attempt: id, .. }) if *attempt == id => {
            (Stopped, vec![])
        }
        (Stopping { .. }, StopRequested) => (state.clone(), vec![]),
        (Stopping { .. }, Tick) => (state.clone(), vec![]),

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, SampleReady { attempt, .. }) if is_stale(attempt) => (state.clone(), vec![]),
        (_, SampleNotReady { attempt }) if is_stale(attempt) => (state.clone(), vec![]),
        (_, SampleFailed { attempt, .. }) if is_stale(attempt) => (state.clone(), vec![]),
        (_, ReportOk { attempt, .. }) if is_stale(attempt) => (state.clone(), vec![]),
        (_, ReportFail { attempt, .. }) if is_stale(attempt) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(1000);

    fn running_with_attempt(attempt: Option<Uuid>) -> State {
        State::Running {
            mode: TriggerMode::Periodic(TICK),
            attempt,
            started_at: Instant::now(),
            max_runtime: None,
        }
    }

    fn single_shot_with_attempt(attempt: Uuid) -> State {
        State::Running {
            mode: TriggerMode::SingleShot,
            attempt: Some(attempt),
            started_at: Instant::now(),
            max_runtime: None,
        }
    }

    fn sample() -> Sample {
        Sample::new(vec![1, 2, 3], "image/jpeg")
    }

    fn ok_report(attempt: Uuid) -> Event {
        Event::ReportOk {
            attempt,
            metrics: serde_json::json!({ "overall_score": 8.0 }),
            captured_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn periodic_start_schedules_ticker_only() {
        let (next, effects) = reduce(
            &State::Idle,
            Event::Start {
                mode: TriggerMode::Periodic(TICK),
                max_runtime: None,
            },
        );
        assert!(matches!(next, State::Running { attempt: None, .. }));
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::StartTicker { every } if every == TICK));
    }

    #[test]
    fn single_shot_start_acquires_immediately() {
        let (next, effects) = reduce(
            &State::Idle,
            Event::Start {
                mode: TriggerMode::SingleShot,
                max_runtime: None,
            },
        );
        assert!(matches!(next, State::Running { attempt: Some(_), .. }));
        assert!(matches!(effects.as_slice(), [Effect::Acquire { .. }]));
    }

    #[test]
    fn tick_with_no_attempt_starts_acquisition() {
        let state = running_with_attempt(None);
        let (next, effects) = reduce(&state, Event::Tick);
        assert!(matches!(next, State::Running { attempt: Some(_), .. }));
        assert!(matches!(effects.as_slice(), [Effect::Acquire { .. }]));
    }

    #[test]
    fn tick_with_attempt_in_flight_is_skipped_entirely() {
        let attempt = Uuid::new_v4();
        let state = running_with_attempt(Some(attempt));
        let (next, effects) = reduce(&state, Event::Tick);
        // Same attempt still pending, nothing scheduled.
        assert!(matches!(next, State::Running { attempt: Some(id), .. } if id == attempt));
        assert!(effects.is_empty());
    }

    #[test]
    fn sample_ready_issues_report_for_same_attempt() {
        let attempt = Uuid::new_v4();
        let state = running_with_attempt(Some(attempt));
        let (next, effects) = reduce(
            &state,
            Event::SampleReady {
                attempt,
                sample: sample(),
            },
        );
        assert!(matches!(next, State::Running { attempt: Some(_), .. }));
        assert!(
            matches!(effects.as_slice(), [Effect::Report { attempt: id, .. }] if *id == attempt)
        );
    }

    #[test]
    fn not_ready_clears_attempt_without_error() {
        let attempt = Uuid::new_v4();
        let state = running_with_attempt(Some(attempt));
        let (next, effects) = reduce(&state, Event::SampleNotReady { attempt });
        assert!(matches!(next, State::Running { attempt: None, .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn report_ok_delivers_and_keeps_periodic_loop_running() {
        let attempt = Uuid::new_v4();
        let state = running_with_attempt(Some(attempt));
        let (next, effects) = reduce(&state, ok_report(attempt));
        assert!(matches!(next, State::Running { attempt: None, .. }));
        assert!(matches!(effects.as_slice(), [Effect::Deliver { .. }]));
    }

    #[test]
    fn report_fail_delivers_error_and_keeps_periodic_loop_running() {
        let attempt = Uuid::new_v4();
        let state = running_with_attempt(Some(attempt));
        let (next, effects) = reduce(
            &state,
            Event::ReportFail {
                attempt,
                error: TransportError::Network("timeout".to_string()),
                sample: None,
            },
        );
        assert!(matches!(next, State::Running { attempt: None, .. }));
        assert!(matches!(effects.as_slice(), [Effect::DeliverError { .. }]));
    }

    #[test]
    fn single_shot_report_ok_delivers_then_stops() {
        let attempt = Uuid::new_v4();
        let state = single_shot_with_attempt(attempt);
        let (next, effects) = reduce(&state, ok_report(attempt));
        assert!(matches!(next, State::Stopped));
        assert!(matches!(effects.as_slice(), [Effect::Deliver { .. }]));
    }

    #[test]
    fn single_shot_report_fail_surfaces_error_and_fallback_once() {
        let attempt = Uuid::new_v4();
        let state = single_shot_with_attempt(attempt);
        let (next, effects) = reduce(
            &state,
            Event::ReportFail {
                attempt,
                error: TransportError::Status {
                    status: 502,
                    message: "bad gateway".to_string(),
                },
                sample: Some(sample()),
            },
        );
        assert!(matches!(next, State::Stopped));
        assert_eq!(effects.len(), 2);
        assert!(matches!(effects[0], Effect::DeliverError { .. }));
        assert!(matches!(effects[1], Effect::Fallback { .. }));
    }

    #[test]
    fn single_shot_empty_buffer_stops_without_error() {
        let attempt = Uuid::new_v4();
        let state = single_shot_with_attempt(attempt);
        let (next, effects) = reduce(&state, Event::SampleNotReady { attempt });
        assert!(matches!(next, State::Stopped));
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_with_no_attempt_in_flight_stops_immediately() {
        let state = running_with_attempt(None);
        let (next, effects) = reduce(&state, Event::StopRequested);
        assert!(matches!(next, State::Stopped));
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_with_attempt_in_flight_waits_to_discard() {
        let attempt = Uuid::new_v4();
        let state = running_with_attempt(Some(attempt));
        let (next, effects) = reduce(&state, Event::StopRequested);
        assert!(matches!(next, State::Stopping { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn late_result_after_stop_is_discarded_not_delivered() {
        let attempt = Uuid::new_v4();
        let state = State::Stopping { attempt };
        let (next, effects) = reduce(&state, ok_report(attempt));
        assert!(matches!(next, State::Stopped));
        assert!(effects.is_empty());
    }

    #[test]
    fn late_failure_after_stop_is_discarded_not_delivered() {
        let attempt = Uuid::new_v4();
        let state = State::Stopping { attempt };
        let (next, effects) = reduce(
            &state,
            Event::ReportFail {
                attempt,
                error: TransportError::Network("slow".to_string()),
                sample: Some(sample()),
            },
        );
        assert!(matches!(next, State::Stopped));
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_attempt_events_are_ignored() {
        let attempt = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let state = running_with_attempt(Some(attempt));

        let (next, effects) = reduce(&state, ok_report(stale));
        assert!(matches!(next, State::Running { attempt: Some(id), .. } if id == attempt));
        assert!(effects.is_empty());

        let (next, effects) = reduce(
            &state,
            Event::SampleReady {
                attempt: stale,
                sample: sample(),
            },
        );
        assert!(matches!(next, State::Running { attempt: Some(id), .. } if id == attempt));
        assert!(effects.is_empty());
    }

    #[test]
    fn repeated_stop_is_a_no_op() {
        let (next, effects) = reduce(&State::Stopped, Event::StopRequested);
        assert!(matches!(next, State::Stopped));
        assert!(effects.is_empty());

        let attempt = Uuid::new_v4();
        let state = State::Stopping { attempt };
        let (next, effects) = reduce(&state, Event::StopRequested);
        assert!(matches!(next, State::Stopping { .. }));
        assert!(effects.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn max_runtime_auto_stops_the_session() {
        let state = State::Running {
            mode: TriggerMode::Periodic(TICK),
            attempt: None,
            started_at: Instant::now(),
            max_runtime: Some(Duration::from_secs(120)),
        };
        tokio::time::advance(Duration::from_secs(121)).await;
        let (next, effects) = reduce(&state, Event::Tick);
        assert!(matches!(next, State::Stopped));
        assert!(effects.is_empty());
    }
}
