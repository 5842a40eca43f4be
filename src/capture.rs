//! Microphone capture
//!
//! All cpal work happens on a dedicated thread because input streams are not
//! `Send`. The thread converts whatever the device produces into mono 16-bit
//! frames and pushes them into a bounded channel; when the consumer lags,
//! frames are dropped rather than letting live audio back up.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SessionError;

/// Frames buffered between the capture thread and the uplink.
pub const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Sample rate reported when no real device is opened.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Processing switches requested from the capture stack.
///
/// cpal exposes no echo-cancellation, noise-suppression, or gain-control
/// toggles, so these are recorded and logged; actual processing stays with
/// the OS audio stack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// One block of mono 16-bit samples from the microphone.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Receiving end of the capture frame stream.
pub type FrameReceiver = mpsc::Receiver<AudioFrame>;

/// Something that can open a microphone-like frame stream.
///
/// The session controller takes this as a seam so tests and headless runs
/// can substitute [`NullCapture`] for real hardware.
pub trait CaptureSource: Send + Sync + 'static {
    fn open(
        &self,
        options: CaptureOptions,
    ) -> Result<(CaptureHandle, FrameReceiver), SessionError>;
}

/// Keeps the capture device alive until released.
///
/// Dropping the handle releases the device too; `release()` is the
/// explicit spelling.
#[derive(Debug)]
pub struct CaptureHandle {
    shutdown_tx: std::sync::mpsc::Sender<()>,
    sample_rate: u32,
}

impl CaptureHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn release(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Default capture source backed by the system's default input device.
pub struct MicrophoneCapture;

impl CaptureSource for MicrophoneCapture {
    fn open(
        &self,
        options: CaptureOptions,
    ) -> Result<(CaptureHandle, FrameReceiver), SessionError> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || capture_thread(options, frames_tx, ready_tx, shutdown_rx))
            .map_err(|e| {
                SessionError::MicrophoneUnavailable(format!(
                    "failed to spawn capture thread: {}",
                    e
                ))
            })?;

        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => Ok((
                CaptureHandle {
                    shutdown_tx,
                    sample_rate,
                },
                frames_rx,
            )),
            Ok(Err(e)) => Err(SessionError::MicrophoneUnavailable(e)),
            Err(_) => Err(SessionError::MicrophoneUnavailable(
                "capture thread exited before reporting".to_string(),
            )),
        }
    }
}

fn capture_thread(
    options: CaptureOptions,
    frames_tx: mpsc::Sender<AudioFrame>,
    ready_tx: std::sync::mpsc::Sender<Result<u32, String>>,
    shutdown_rx: std::sync::mpsc::Receiver<()>,
) {
    let (stream, sample_rate) = match build_stream(options, frames_tx) {
        Ok(built) => built,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(format!("failed to start input stream: {}", e)));
        return;
    }
    let _ = ready_tx.send(Ok(sample_rate));

    // Block until the handle is released or dropped, then let the stream go.
    let _ = shutdown_rx.recv();
    drop(stream);
    log::debug!("Microphone released");
}

fn build_stream(
    options: CaptureOptions,
    frames_tx: mpsc::Sender<AudioFrame>,
) -> Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| "no input device available".to_string())?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let config = device
        .default_input_config()
        .map_err(|e| format!("no default input config: {}", e))?;
    let sample_rate = config.sample_rate().0;
    let channels = config.channels();

    log::info!(
        "Using audio input device: {} ({} Hz, {} channel(s))",
        name,
        sample_rate,
        channels
    );
    log::debug!(
        "Requested capture processing: aec={} ns={} agc={}",
        options.echo_cancellation,
        options.noise_suppression,
        options.auto_gain_control
    );

    let stream = match config.sample_format() {
        SampleFormat::I16 => {
            build_typed::<i16>(&device, &config.into(), channels, sample_rate, frames_tx)
        }
        SampleFormat::U16 => {
            build_typed::<u16>(&device, &config.into(), channels, sample_rate, frames_tx)
        }
        SampleFormat::F32 => {
            build_typed::<f32>(&device, &config.into(), channels, sample_rate, frames_tx)
        }
        other => Err(format!("unsupported sample format {:?}", other)),
    }?;

    Ok((stream, sample_rate))
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: u16,
    sample_rate: u32,
    frames_tx: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream, String>
where
    T: cpal::SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples = downmix(data, channels);
                let _ = frames_tx.try_send(AudioFrame {
                    samples,
                    sample_rate,
                });
            },
            |e| log::error!("Audio input stream error: {}", e),
            None,
        )
        .map_err(|e| format!("failed to build input stream: {}", e))
}

/// Collapse interleaved channels to mono by averaging.
fn downmix<T>(data: &[T], channels: u16) -> Vec<i16>
where
    T: Sample,
    f32: FromSample<T>,
{
    if channels <= 1 {
        return data.iter().map(|s| sample_to_i16(*s)).collect();
    }
    data.chunks(channels as usize)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
            let avg = sum / frame.len() as f32;
            (avg.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
        })
        .collect()
}

fn sample_to_i16<T>(sample: T) -> i16
where
    T: Sample,
    f32: FromSample<T>,
{
    let f = f32::from_sample(sample);
    (f.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Capture source that opens no device at all.
///
/// The frame stream ends immediately, which the uplink treats as an idle
/// microphone rather than a failure. Used by tests and headless runs.
pub struct NullCapture;

impl CaptureSource for NullCapture {
    fn open(
        &self,
        _options: CaptureOptions,
    ) -> Result<(CaptureHandle, FrameReceiver), SessionError> {
        let (_frames_tx, frames_rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = std::sync::mpsc::channel();
        Ok((
            CaptureHandle {
                shutdown_tx,
                sample_rate: DEFAULT_SAMPLE_RATE,
            },
            frames_rx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_options_default_all_on() {
        let options = CaptureOptions::default();
        assert!(options.echo_cancellation);
        assert!(options.noise_suppression);
        assert!(options.auto_gain_control);
    }

    #[test]
    fn test_capture_options_partial_json() {
        let options: CaptureOptions =
            serde_json::from_str(r#"{"noise_suppression": false}"#).unwrap();
        assert!(options.echo_cancellation);
        assert!(!options.noise_suppression);
        assert!(options.auto_gain_control);
    }

    #[test]
    fn test_sample_to_i16_float_range() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);
        // out-of-range input clamps instead of wrapping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-3.0f32), -i16::MAX);
    }

    #[test]
    fn test_sample_to_i16_integer_inputs() {
        // u16 equilibrium maps to silence
        assert_eq!(sample_to_i16(32768u16), 0);
        // i16 survives the float round trip within one step
        let out = sample_to_i16(16000i16);
        assert!((out - 16000).abs() <= 1, "got {}", out);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        assert_eq!(downmix(&[0.25f32], 1), vec![8191]);
    }

    #[test]
    fn test_downmix_stereo_averages() {
        let mixed = downmix(&[0.5f32, -0.5, 1.0, 1.0], 2);
        assert_eq!(mixed, vec![0, i16::MAX]);
    }

    #[tokio::test]
    async fn test_null_capture_stream_ends_immediately() {
        let (handle, mut frames) = NullCapture.open(CaptureOptions::default()).unwrap();
        assert_eq!(handle.sample_rate(), DEFAULT_SAMPLE_RATE);
        assert!(frames.recv().await.is_none());
        handle.release();
    }
}
