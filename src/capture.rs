//! Microphone capture pipeline.
//!
//! Bridges a live input device to the encode path: the device callback
//! downmixes to mono, resamples to the configured capture rate when the
//! device cannot open at it, and delivers fixed-size blocks as
//! `EngineEvent::Captured`. The callback runs on the device's own thread and
//! never blocks on network I/O — it only pushes to an unbounded channel.
//!
//! cpal streams are not `Send`, so each open handle parks its stream on a
//! dedicated OS thread and stops it through a shutdown channel.

use crate::events::EngineEvent;
use crate::pcm;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure opening or running the capture device.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The user or OS refused microphone access. Never retried automatically.
    #[error("microphone access denied")]
    PermissionDenied,
    /// No compatible input device exists.
    #[error("no usable input device")]
    DeviceUnavailable,
    /// The stream could not be built or started.
    #[error("input stream failed: {0}")]
    Stream(String),
}

/// Device constraints for one capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub block_frames: usize,
    pub device_name: Option<String>,
}

/// Seam between the controller and the microphone.
pub trait CaptureSource: Send + Sync {
    /// Acquire the device and start delivering `EngineEvent::Captured`
    /// blocks tagged with `epoch`.
    fn open(
        &self,
        config: &CaptureConfig,
        epoch: u64,
        events: UnboundedSender<EngineEvent>,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// Exclusive handle on an open capture device.
pub trait CaptureHandle: Send {
    /// Stop the device and release its OS resources. Idempotent.
    fn close(&mut self);
}

/// Real microphone capture via cpal.
pub struct CpalCapture;

impl CaptureSource for CpalCapture {
    fn open(
        &self,
        config: &CaptureConfig,
        epoch: u64,
        events: UnboundedSender<EngineEvent>,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = config.clone();

        let join = std::thread::Builder::new()
            .name("tutorlive-capture".to_string())
            .spawn(move || match build_input_stream(&config, epoch, events) {
                Ok(stream) => {
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(map_play_error(e)));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));
                    // Parked until close() drops or signals the stop channel.
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("capture stream released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                info!("capture device open");
                Ok(Box::new(CpalCaptureHandle {
                    stop: Some(stop_tx),
                    join: Some(join),
                }))
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(CaptureError::Stream(
                "timed out opening input stream".to_string(),
            )),
        }
    }
}

struct CpalCaptureHandle {
    stop: Option<std_mpsc::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input_stream(
    config: &CaptureConfig,
    epoch: u64,
    events: UnboundedSender<EngineEvent>,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = match &config.device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| CaptureError::Stream(e.to_string()))?
            .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            .ok_or(CaptureError::DeviceUnavailable)?,
        None => host
            .default_input_device()
            .ok_or(CaptureError::DeviceUnavailable)?,
    };

    // Prefer a native config at the capture rate; otherwise take the default
    // and resample in the block chunker.
    let supported = match find_config_with_rate(&device, config.sample_rate) {
        Some(supported) => supported,
        None => device.default_input_config().map_err(map_config_error)?,
    };
    let device_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.config();
    if device_rate != config.sample_rate {
        warn!(
            device_rate,
            target = config.sample_rate,
            "device cannot open at the capture rate, resampling"
        );
    }

    let mut chunker = BlockChunker::new(config, channels, device_rate, epoch, events.clone());
    let err_fn = move |err: cpal::StreamError| {
        let _ = events.send(EngineEvent::CaptureLost {
            epoch,
            reason: err.to_string(),
        });
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| chunker.push(data),
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let frames: Vec<f32> = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                chunker.push(&frames);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let frames: Vec<f32> = data
                    .iter()
                    .map(|&s| (s as f32 / u16::MAX as f32) * 2.0 - 1.0)
                    .collect();
                chunker.push(&frames);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(CaptureError::Stream(format!(
                "unsupported input sample format: {other:?}"
            )))
        }
    }
    .map_err(map_build_error)?;

    Ok(stream)
}

fn find_config_with_rate(device: &cpal::Device, rate: u32) -> Option<cpal::SupportedStreamConfig> {
    let configs = device.supported_input_configs().ok()?;
    for range in configs {
        if range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0 {
            return Some(range.with_sample_rate(SampleRate(rate)));
        }
    }
    None
}

/// Accumulates mono samples and emits fixed-size blocks at the target rate.
struct BlockChunker {
    channels: usize,
    device_rate: u32,
    target_rate: u32,
    /// Frames at the device rate consumed per emitted block.
    device_block: usize,
    block_frames: usize,
    pending: Vec<f32>,
    epoch: u64,
    events: UnboundedSender<EngineEvent>,
}

impl BlockChunker {
    fn new(
        config: &CaptureConfig,
        channels: usize,
        device_rate: u32,
        epoch: u64,
        events: UnboundedSender<EngineEvent>,
    ) -> Self {
        let device_block = ((config.block_frames as u64 * device_rate as u64)
            / config.sample_rate.max(1) as u64)
            .max(1) as usize;
        Self {
            channels: channels.max(1),
            device_rate,
            target_rate: config.sample_rate,
            device_block,
            block_frames: config.block_frames,
            pending: Vec::with_capacity(device_block * 2),
            epoch,
            events,
        }
    }

    fn push(&mut self, interleaved: &[f32]) {
        if self.channels == 1 {
            self.pending.extend_from_slice(interleaved);
        } else {
            for frame in interleaved.chunks_exact(self.channels) {
                let sum: f32 = frame.iter().sum();
                self.pending.push(sum / self.channels as f32);
            }
        }

        while self.pending.len() >= self.device_block {
            let block: Vec<f32> = self.pending.drain(..self.device_block).collect();
            let samples = if self.device_rate == self.target_rate {
                block
            } else {
                let mut resampled = pcm::resample(&block, self.device_rate, self.target_rate);
                resampled.resize(self.block_frames, 0.0);
                resampled
            };
            if self
                .events
                .send(EngineEvent::Captured {
                    epoch: self.epoch,
                    samples,
                })
                .is_err()
            {
                // Controller gone; nothing left to deliver to.
                return;
            }
        }
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> CaptureError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => CaptureError::DeviceUnavailable,
        other => classify(other.to_string()),
    }
}

fn map_play_error(err: cpal::PlayStreamError) -> CaptureError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => CaptureError::DeviceUnavailable,
        other => classify(other.to_string()),
    }
}

fn map_config_error(err: cpal::DefaultStreamConfigError) -> CaptureError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => CaptureError::DeviceUnavailable,
        other => classify(other.to_string()),
    }
}

fn classify(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("denied") || lower.contains("permission") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::Stream(message)
    }
}
