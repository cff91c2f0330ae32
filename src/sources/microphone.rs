//! Microphone capture source using CPAL, writing WAV via hound.
//!
//! The CPAL stream is not `Send`, so it lives on a dedicated audio thread;
//! the source talks to it over channels. The device is claimed at `open()`
//! and released when the source is dropped. A second concurrent open is
//! rejected instead of silently sharing the device.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use hound::{WavSpec, WavWriter};

use crate::error::DeviceError;
use crate::source::{Acquired, CaptureSource, Sample, TriggerMode};

/// Exclusive-use flag for the default input device.
static MIC_IN_USE: AtomicBool = AtomicBool::new(false);

/// Claims the microphone; released exactly once when the guard drops.
struct MicClaim;

impl MicClaim {
    fn take() -> Result<Self, DeviceError> {
        if MIC_IN_USE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeviceError::Busy);
        }
        Ok(Self)
    }
}

impl Drop for MicClaim {
    fn drop(&mut self) {
        MIC_IN_USE.store(false, Ordering::SeqCst);
    }
}

enum Command {
    Finish {
        reply: std_mpsc::Sender<FinishedRecording>,
    },
    Shutdown,
}

struct FinishedRecording {
    wav: Vec<u8>,
    sample_count: usize,
}

struct AudioWorker {
    commands: std_mpsc::Sender<Command>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Single-shot capture source backed by the default input device.
///
/// Recording starts at `open()` and runs until `acquire()`, which finalizes
/// the buffer and returns it as an in-memory WAV sample. An empty buffer is
/// reported as not-ready, matching how an empty recording blob is treated
/// upstream.
pub struct MicrophoneSource {
    worker: Option<AudioWorker>,
    _claim: Option<MicClaim>,
    consumed: bool,
}

impl MicrophoneSource {
    pub fn new() -> Self {
        Self {
            worker: None,
            _claim: None,
            consumed: false,
        }
    }
}

impl Default for MicrophoneSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureSource for MicrophoneSource {
    fn trigger(&self) -> TriggerMode {
        TriggerMode::SingleShot
    }

    async fn open(&mut self) -> Result<(), DeviceError> {
        let claim = MicClaim::take()?;

        let (command_tx, command_rx) = std_mpsc::channel();
        let (init_tx, init_rx) = std_mpsc::channel::<Result<(), DeviceError>>();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || audio_thread_main(command_rx, init_tx))
            .map_err(|e| DeviceError::Backend(format!("audio thread spawn failed: {}", e)))?;

        let init = tokio::task::spawn_blocking(move || {
            init_rx.recv_timeout(Duration::from_secs(5))
        })
        .await
        .map_err(|e| DeviceError::Backend(format!("audio init task failed: {}", e)))?;

        match init {
            Ok(Ok(())) => {
                log::info!("Microphone recording started");
                self.worker = Some(AudioWorker {
                    commands: command_tx,
                    thread: Some(thread),
                });
                self._claim = Some(claim);
                Ok(())
            }
            Ok(Err(e)) => {
                log::error!("Microphone init failed: {}", e);
                Err(e)
            }
            Err(_) => Err(DeviceError::Backend(
                "audio thread did not report readiness".to_string(),
            )),
        }
    }

    async fn acquire(&mut self) -> Result<Acquired, DeviceError> {
        if self.consumed {
            return Ok(Acquired::NotReady);
        }
        let worker = match &self.worker {
            Some(w) => w,
            None => {
                return Err(DeviceError::Backend(
                    "microphone source not opened".to_string(),
                ))
            }
        };

        self.consumed = true;

        let (reply_tx, reply_rx) = std_mpsc::channel();
        worker
            .commands
            .send(Command::Finish { reply: reply_tx })
            .map_err(|_| DeviceError::Backend("audio thread gone".to_string()))?;

        let finished = tokio::task::spawn_blocking(move || {
            reply_rx.recv_timeout(Duration::from_secs(5))
        })
        .await
        .map_err(|e| DeviceError::Backend(format!("audio finish task failed: {}", e)))?
        .map_err(|_| DeviceError::Backend("audio thread did not finalize".to_string()))?;

        if finished.sample_count == 0 {
            log::warn!("No audio data recorded");
            return Ok(Acquired::NotReady);
        }

        log::info!(
            "Recording finalized: {} samples, {} bytes of WAV",
            finished.sample_count,
            finished.wav.len()
        );
        Ok(Acquired::Ready(Sample::new(finished.wav, "audio/wav")))
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.commands.send(Command::Shutdown);
            if let Some(thread) = worker.thread {
                let _ = thread.join();
            }
        }
    }
}

fn audio_thread_main(
    commands: std_mpsc::Receiver<Command>,
    init_tx: std_mpsc::Sender<Result<(), DeviceError>>,
) {
    let (stream, config, samples, is_recording) = match build_capture_stream() {
        Ok(parts) => parts,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = init_tx.send(Err(DeviceError::Backend(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }
    let _ = init_tx.send(Ok(()));

    // Stream keeps capturing until a command arrives; a disconnected sender
    // means the source was dropped without a Shutdown.
    while let Ok(command) = commands.recv() {
        match command {
            Command::Finish { reply } => {
                is_recording.store(false, Ordering::SeqCst);
                let captured = match samples.lock() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                let sample_count = captured.len();
                match encode_wav(&captured, &config) {
                    Ok(wav) => {
                        let _ = reply.send(FinishedRecording { wav, sample_count });
                    }
                    Err(e) => {
                        log::error!("WAV encode failed: {}", e);
                        let _ = reply.send(FinishedRecording {
                            wav: Vec::new(),
                            sample_count: 0,
                        });
                    }
                }
                break;
            }
            Command::Shutdown => break,
        }
    }
    drop(stream);
}

type CaptureParts = (
    cpal::Stream,
    StreamConfig,
    Arc<Mutex<Vec<i16>>>,
    Arc<AtomicBool>,
);

fn build_capture_stream() -> Result<CaptureParts, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| DeviceError::NotFound("no default input device".to_string()))?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = device
        .default_input_config()
        .map_err(|e| classify_config_error(&e.to_string()))?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let samples = Arc::new(Mutex::new(Vec::<i16>::new()));
    let is_recording = Arc::new(AtomicBool::new(true));

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, &samples, &is_recording),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, &samples, &is_recording),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, &samples, &is_recording),
        other => Err(DeviceError::Unsupported(format!(
            "sample format {:?}",
            other
        ))),
    }?;

    Ok((stream, config, samples, is_recording))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    samples: &Arc<Mutex<Vec<i16>>>,
    is_recording: &Arc<AtomicBool>,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    let samples = samples.clone();
    let is_recording = is_recording.clone();
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !is_recording.load(Ordering::SeqCst) {
                    return;
                }
                let mut guard = match samples.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.extend(data.iter().map(|&s| sample_to_i16(s)));
            },
            err_fn,
            None,
        )
        .map_err(|e| classify_build_error(&e))
}

fn classify_build_error(err: &cpal::BuildStreamError) -> DeviceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            DeviceError::NotFound("input device is no longer available".to_string())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => {
            DeviceError::Unsupported("stream configuration not supported".to_string())
        }
        other => classify_config_error(&other.to_string()),
    }
}

// Backend messages are the only signal for permission problems, so fall back
// to matching on them.
fn classify_config_error(message: &str) -> DeviceError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") {
        DeviceError::PermissionDenied(message.to_string())
    } else {
        DeviceError::Backend(message.to_string())
    }
}

/// Convert any sample type to i16 for WAV writing.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

fn encode_wav(samples: &[i16], config: &StreamConfig) -> Result<Vec<u8>, hound::Error> {
    let spec = WavSpec {
        channels: config.channels,
        sample_rate: config.sample_rate.0,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        // Clamping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn encode_wav_produces_a_riff_header() {
        let config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(16_000),
            buffer_size: cpal::BufferSize::Default,
        };
        let wav = encode_wav(&[0, 100, -100, 0], &config).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }

    #[test]
    fn mic_claim_rejects_second_concurrent_use() {
        let first = MicClaim::take().unwrap();
        assert!(matches!(MicClaim::take(), Err(DeviceError::Busy)));
        drop(first);
        // Released exactly once; a new claim succeeds again.
        let second = MicClaim::take().unwrap();
        drop(second);
    }

    #[test]
    fn permission_messages_classify_as_denied() {
        assert!(matches!(
            classify_config_error("Permission denied by the OS"),
            DeviceError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_config_error("some backend thing"),
            DeviceError::Backend(_)
        ));
    }
}
