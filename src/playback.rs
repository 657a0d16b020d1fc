//! Playback scheduling.
//!
//! Inbound reply chunks are decoded and scheduled back to back on the output
//! device's frame clock: each segment starts at `max(cursor, now)` and the
//! cursor advances by the segment's duration, so consecutive segments render
//! with no gap and no overlap. The in-flight segment set is the sole state
//! mutated from more than one call path (enqueue, interrupt, and the render
//! callback's natural completion) and lives behind one mutex; whichever
//! remover locks first wins and the other is a no-op.

use crate::pcm::{self, AudioChunk, DecodeError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure opening or running the output device.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no usable output device")]
    DeviceUnavailable,
    #[error("output stream failed: {0}")]
    Stream(String),
}

/// Opens the output device and binds the scheduler's renderer into its
/// real-time callback.
pub trait OutputDevice: Send + Sync {
    fn open(
        &self,
        scheduler: &PlaybackScheduler,
        preferred_rate: u32,
    ) -> Result<Box<dyn OutputHandle>, PlaybackError>;
}

/// Exclusive handle on an open output device.
pub trait OutputHandle: Send {
    /// Stop the device and release its OS resources. Idempotent.
    fn close(&mut self);
}

/// A decoded buffer and its scheduled start on the device frame clock.
struct Segment {
    start: u64,
    samples: Vec<f32>,
}

struct SchedulerState {
    rate: u32,
    /// Frames rendered so far; advanced only by the render callback.
    clock: u64,
    /// Next segment start, unset after an interrupt so the next enqueue
    /// restarts from "now".
    cursor: Option<u64>,
    segments: Vec<Segment>,
    dropped: u64,
    audible_tx: watch::Sender<bool>,
}

/// Schedules decoded reply audio for gapless, interruptible playback.
pub struct PlaybackScheduler {
    state: Arc<Mutex<SchedulerState>>,
    audible_rx: watch::Receiver<bool>,
}

impl PlaybackScheduler {
    pub fn new(output_rate: u32) -> Self {
        let (audible_tx, audible_rx) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                rate: output_rate,
                clock: 0,
                cursor: None,
                segments: Vec::new(),
                dropped: 0,
                audible_tx,
            })),
            audible_rx,
        }
    }

    /// The render half handed to the output device callback.
    pub fn renderer(&self) -> Renderer {
        Renderer {
            state: self.state.clone(),
        }
    }

    /// Called by the output device once it knows its actual operating rate.
    /// Must happen before any enqueue; the transport is not yet connected
    /// while the device is being opened, so that ordering holds.
    pub fn set_output_rate(&self, rate: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.rate = rate;
        }
    }

    /// Decode a chunk and schedule it to start at `max(cursor, now)`.
    ///
    /// If the device clock has already passed the cursor (an idle gap),
    /// playback resumes immediately instead of accruing phantom latency; if
    /// chunks arrive faster than real time they queue back to back. On a
    /// decode failure the chunk is dropped, the drop counter is bumped, and
    /// the session continues.
    pub fn enqueue(&self, chunk: &AudioChunk) -> Result<(), DecodeError> {
        let rate = self.state.lock().map(|s| s.rate).unwrap_or(0);
        let samples = match pcm::decode(&chunk.bytes, chunk.sample_rate, rate) {
            Ok(samples) => samples,
            Err(e) => {
                if let Ok(mut state) = self.state.lock() {
                    state.dropped += 1;
                }
                return Err(e);
            }
        };
        if samples.is_empty() {
            return Ok(());
        }
        if let Ok(mut state) = self.state.lock() {
            let start = state.cursor.unwrap_or(state.clock).max(state.clock);
            state.cursor = Some(start + samples.len() as u64);
            let was_empty = state.segments.is_empty();
            state.segments.push(Segment { start, samples });
            if was_empty {
                set_audible(&state.audible_tx, true);
            }
        }
        Ok(())
    }

    /// Hard-stop every in-flight segment and reset the cursor so the next
    /// enqueue restarts from "now". Safe concurrently with enqueue and with
    /// the render callback.
    pub fn interrupt(&self) {
        if let Ok(mut state) = self.state.lock() {
            let flushed = state.segments.len();
            state.segments.clear();
            state.cursor = None;
            set_audible(&state.audible_tx, false);
            if flushed > 0 {
                debug!(flushed, "playback interrupted");
            }
        }
    }

    /// "Is anything currently audible" — flips true when a reply burst
    /// starts and false only once the in-flight set drains to empty, so
    /// internal gaps between consecutive segments don't flicker.
    pub fn audible(&self) -> watch::Receiver<bool> {
        self.audible_rx.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().map(|s| s.segments.len()).unwrap_or(0)
    }

    pub fn cursor_frames(&self) -> Option<u64> {
        self.state.lock().ok().and_then(|s| s.cursor)
    }

    pub fn clock_frames(&self) -> u64 {
        self.state.lock().map(|s| s.clock).unwrap_or(0)
    }

    /// Count of inbound chunks dropped for failing to decode.
    pub fn dropped_chunks(&self) -> u64 {
        self.state.lock().map(|s| s.dropped).unwrap_or(0)
    }
}

fn set_audible(tx: &watch::Sender<bool>, value: bool) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

/// Fills output buffers from the scheduled segment set and advances the
/// frame clock. Driven by the device callback; driven manually in tests.
#[derive(Clone)]
pub struct Renderer {
    state: Arc<Mutex<SchedulerState>>,
}

impl Renderer {
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let begin = state.clock;
        let end = begin + out.len() as u64;
        for segment in &state.segments {
            let segment_end = segment.start + segment.samples.len() as u64;
            if segment_end <= begin || segment.start >= end {
                continue;
            }
            let from = segment.start.max(begin);
            let to = segment_end.min(end);
            for t in from..to {
                out[(t - begin) as usize] += segment.samples[(t - segment.start) as usize];
            }
        }
        state.clock = end;
        let had_segments = !state.segments.is_empty();
        state
            .segments
            .retain(|segment| segment.start + segment.samples.len() as u64 > end);
        if had_segments && state.segments.is_empty() {
            set_audible(&state.audible_tx, false);
        }
    }
}

/// Real output device via cpal. The stream lives on a dedicated OS thread
/// because cpal streams are not `Send`.
pub struct CpalOutput;

impl OutputDevice for CpalOutput {
    fn open(
        &self,
        scheduler: &PlaybackScheduler,
        preferred_rate: u32,
    ) -> Result<Box<dyn OutputHandle>, PlaybackError> {
        let renderer = scheduler.renderer();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, PlaybackError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let join = std::thread::Builder::new()
            .name("tutorlive-playback".to_string())
            .spawn(move || match build_output_stream(renderer, preferred_rate) {
                Ok((stream, rate)) => {
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(map_play_error(e)));
                        return;
                    }
                    let _ = ready_tx.send(Ok(rate));
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("output stream released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| PlaybackError::Stream(e.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(rate)) => {
                scheduler.set_output_rate(rate);
                info!(rate, "output device open");
                Ok(Box::new(CpalOutputHandle {
                    stop: Some(stop_tx),
                    join: Some(join),
                }))
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(PlaybackError::Stream(
                "timed out opening output stream".to_string(),
            )),
        }
    }
}

struct CpalOutputHandle {
    stop: Option<std_mpsc::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl OutputHandle for CpalOutputHandle {
    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for CpalOutputHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream(
    renderer: Renderer,
    preferred_rate: u32,
) -> Result<(cpal::Stream, u32), PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(PlaybackError::DeviceUnavailable)?;

    let supported = match find_config_with_rate(&device, preferred_rate) {
        Some(supported) => supported,
        None => device.default_output_config().map_err(map_config_error)?,
    };
    let rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.config();
    if rate != preferred_rate {
        warn!(rate, preferred_rate, "output device opened at its native rate");
    }

    let err_fn = |err: cpal::StreamError| warn!("output stream error: {err}");
    let mut scratch: Vec<f32> = Vec::new();

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                scratch.resize(frames, 0.0);
                renderer.render(&mut scratch);
                for (i, frame) in data.chunks_exact_mut(channels.max(1)).enumerate() {
                    frame.fill(scratch[i]);
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                scratch.resize(frames, 0.0);
                renderer.render(&mut scratch);
                for (i, frame) in data.chunks_exact_mut(channels.max(1)).enumerate() {
                    let value = (scratch[i].clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    frame.fill(value);
                }
            },
            err_fn,
            None,
        ),
        other => {
            return Err(PlaybackError::Stream(format!(
                "unsupported output sample format: {other:?}"
            )))
        }
    }
    .map_err(map_build_error)?;

    Ok((stream, rate))
}

fn find_config_with_rate(device: &cpal::Device, rate: u32) -> Option<cpal::SupportedStreamConfig> {
    let configs = device.supported_output_configs().ok()?;
    for range in configs {
        if range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0 {
            return Some(range.with_sample_rate(SampleRate(rate)));
        }
    }
    None
}

fn map_build_error(err: cpal::BuildStreamError) -> PlaybackError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => PlaybackError::DeviceUnavailable,
        other => PlaybackError::Stream(other.to_string()),
    }
}

fn map_play_error(err: cpal::PlayStreamError) -> PlaybackError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => PlaybackError::DeviceUnavailable,
        other => PlaybackError::Stream(other.to_string()),
    }
}

fn map_config_error(err: cpal::DefaultStreamConfigError) -> PlaybackError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => PlaybackError::DeviceUnavailable,
        other => PlaybackError::Stream(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::encode;

    // A 1 kHz scheduler keeps the frame arithmetic readable.
    fn scheduler() -> (PlaybackScheduler, Renderer) {
        let scheduler = PlaybackScheduler::new(1_000);
        let renderer = scheduler.renderer();
        (scheduler, renderer)
    }

    fn chunk(value: f32, frames: usize) -> AudioChunk {
        AudioChunk::new(encode(&vec![value; frames]), 1_000)
    }

    #[test]
    fn segments_are_contiguous_and_never_overlap() {
        let (scheduler, renderer) = scheduler();
        scheduler.enqueue(&chunk(0.25, 100)).unwrap();
        scheduler.enqueue(&chunk(-0.5, 50)).unwrap();
        assert_eq!(scheduler.cursor_frames(), Some(150));

        let mut out = vec![0.0f32; 200];
        renderer.render(&mut out);
        for (i, sample) in out.iter().enumerate() {
            let expected = if i < 100 {
                0.25
            } else if i < 150 {
                -0.5
            } else {
                0.0
            };
            // Any overlap would show up as a summed value here.
            assert!((sample - expected).abs() < 1e-3, "frame {i}: {sample}");
        }
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn cursor_is_monotonically_non_decreasing() {
        let (scheduler, renderer) = scheduler();
        let mut previous = 0;
        for _ in 0..5 {
            scheduler.enqueue(&chunk(0.1, 30)).unwrap();
            let cursor = scheduler.cursor_frames().unwrap();
            assert!(cursor >= previous);
            previous = cursor;
            let mut out = vec![0.0f32; 10];
            renderer.render(&mut out);
        }
    }

    #[test]
    fn clock_catch_up_after_an_idle_gap() {
        let (scheduler, renderer) = scheduler();
        scheduler.enqueue(&chunk(0.25, 100)).unwrap();
        // Render well past the segment: the device clock overtakes the cursor.
        let mut out = vec![0.0f32; 300];
        renderer.render(&mut out);
        assert_eq!(scheduler.clock_frames(), 300);

        // The next chunk must start at "now", not at the stale cursor.
        scheduler.enqueue(&chunk(0.5, 100)).unwrap();
        assert_eq!(scheduler.cursor_frames(), Some(400));
        let mut out = vec![0.0f32; 100];
        renderer.render(&mut out);
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-3));
    }

    #[test]
    fn interrupt_empties_the_in_flight_set_immediately() {
        let (scheduler, _renderer) = scheduler();
        for _ in 0..3 {
            scheduler.enqueue(&chunk(0.2, 50)).unwrap();
        }
        assert_eq!(scheduler.in_flight(), 3);
        scheduler.interrupt();
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.cursor_frames(), None);
        assert!(!*scheduler.audible().borrow());
    }

    #[test]
    fn enqueue_after_interrupt_restarts_from_now() {
        let (scheduler, renderer) = scheduler();
        scheduler.enqueue(&chunk(0.25, 500)).unwrap();
        let mut out = vec![0.0f32; 100];
        renderer.render(&mut out);
        scheduler.interrupt();

        scheduler.enqueue(&chunk(0.5, 100)).unwrap();
        // Starts at the clock (100), not at the flushed cursor (500).
        assert_eq!(scheduler.cursor_frames(), Some(200));
        let mut out = vec![0.0f32; 100];
        renderer.render(&mut out);
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-3));
    }

    #[test]
    fn audible_flips_per_burst_not_per_segment() {
        let (scheduler, renderer) = scheduler();
        let audible = scheduler.audible();
        assert!(!*audible.borrow());

        scheduler.enqueue(&chunk(0.2, 100)).unwrap();
        scheduler.enqueue(&chunk(0.2, 100)).unwrap();
        assert!(*audible.borrow());

        // First segment finishes; the burst is still audible.
        let mut out = vec![0.0f32; 100];
        renderer.render(&mut out);
        assert!(*audible.borrow());

        // Set drains to empty; only now does the signal drop.
        let mut out = vec![0.0f32; 100];
        renderer.render(&mut out);
        assert!(!*audible.borrow());
    }

    #[test]
    fn undecodable_chunks_are_dropped_and_counted() {
        let (scheduler, _renderer) = scheduler();
        let bad = AudioChunk::new(vec![0x01, 0x02, 0x03], 1_000);
        assert!(scheduler.enqueue(&bad).is_err());
        assert_eq!(scheduler.dropped_chunks(), 1);
        assert_eq!(scheduler.in_flight(), 0);

        // A healthy chunk afterwards still plays.
        scheduler.enqueue(&chunk(0.1, 10)).unwrap();
        assert_eq!(scheduler.in_flight(), 1);
    }

    #[test]
    fn empty_chunk_schedules_nothing() {
        let (scheduler, _renderer) = scheduler();
        scheduler.enqueue(&AudioChunk::new(Vec::new(), 1_000)).unwrap();
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.cursor_frames(), None);
    }

    #[test]
    fn inbound_rate_is_resampled_to_the_output_rate() {
        let (scheduler, renderer) = scheduler();
        // 2 kHz source into a 1 kHz scheduler halves the frame count.
        let source = AudioChunk::new(encode(&vec![0.25f32; 200]), 2_000);
        scheduler.enqueue(&source).unwrap();
        assert_eq!(scheduler.cursor_frames(), Some(100));
        let mut out = vec![0.0f32; 100];
        renderer.render(&mut out);
        assert!((out[50] - 0.25).abs() < 1e-3);
    }
}
