//! PCM sample codec
//!
//! Converts between the floating-point frames the capture device produces and
//! the 16-bit little-endian wire representation, and decodes inbound reply
//! audio back to floating-point frames at the output device's operating rate.

use thiserror::Error;

/// Error decoding an inbound audio payload.
///
/// A partial decode is never surfaced as success; callers drop the offending
/// chunk and continue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload length is not a whole number of 16-bit samples.
    #[error("truncated PCM payload: {0} bytes")]
    Truncated(usize),
    /// A zero sample rate cannot be decoded or resampled.
    #[error("invalid sample rate: {0} Hz")]
    BadRate(u32),
}

/// An immutable audio payload plus its sample-rate tag.
///
/// Bytes are single-channel 16-bit little-endian PCM. Chunks are moved
/// between pipeline stages, never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(bytes: Vec<u8>, sample_rate: u32) -> Self {
        Self { bytes, sample_rate }
    }
}

/// Encode floating-point frames in [-1, 1] as s16le bytes.
///
/// Samples outside the representable range are clamped. Pure and
/// deterministic; empty input encodes to an empty payload.
pub fn encode(frames: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frames.len() * 2);
    for &sample in frames {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode s16le bytes to floating-point frames at `target_rate`,
/// resampling when `source_rate` differs.
pub fn decode(bytes: &[u8], source_rate: u32, target_rate: u32) -> Result<Vec<f32>, DecodeError> {
    if source_rate == 0 {
        return Err(DecodeError::BadRate(source_rate));
    }
    if target_rate == 0 {
        return Err(DecodeError::BadRate(target_rate));
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::Truncated(bytes.len()));
    }

    let frames: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect();

    if source_rate == target_rate {
        Ok(frames)
    } else {
        Ok(resample(&frames, source_rate, target_rate))
    }
}

/// Linear resampling between two rates. Good enough for speech; the remote
/// model tolerates far worse than interpolation error.
pub fn resample(frames: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || frames.is_empty() {
        return frames.to_vec();
    }
    let out_len = (frames.len() as u64 * to as u64 / from as u64) as usize;
    let step = from as f64 / to as f64;
    let last = frames.len() - 1;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let index = (pos as usize).min(last);
        let frac = (pos - index as f64) as f32;
        let a = frames[index];
        let b = frames[(index + 1).min(last)];
        out.push(a + (b - a) * frac);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_round_trips_exactly() {
        let frames = vec![0.0f32; 480];
        let bytes = encode(&frames);
        let decoded = decode(&bytes, 16_000, 16_000).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn sine_round_trips_within_quantization_error() {
        let frames: Vec<f32> = (0..480)
            .map(|i| (i as f32 * std::f32::consts::TAU / 48.0).sin())
            .collect();
        let decoded = decode(&encode(&frames), 16_000, 16_000).unwrap();
        let tolerance = 1.0 / i16::MAX as f32;
        for (a, b) in frames.iter().zip(&decoded) {
            assert!((a - b).abs() <= tolerance, "{a} vs {b}");
        }
    }

    #[test]
    fn out_of_range_samples_clamp() {
        let bytes = encode(&[2.0, -2.0]);
        assert_eq!(
            bytes,
            [i16::MAX.to_le_bytes(), (-i16::MAX).to_le_bytes()].concat()
        );
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(encode(&[]).is_empty());
        assert!(decode(&[], 16_000, 24_000).unwrap().is_empty());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        assert_eq!(decode(&[0x00, 0x01, 0x02], 16_000, 16_000), Err(DecodeError::Truncated(3)));
    }

    #[test]
    fn zero_rate_is_an_error() {
        assert_eq!(decode(&[0, 0], 0, 16_000), Err(DecodeError::BadRate(0)));
        assert_eq!(decode(&[0, 0], 16_000, 0), Err(DecodeError::BadRate(0)));
    }

    #[test]
    fn decode_resamples_to_the_target_rate() {
        let frames = vec![0.5f32; 240];
        let doubled = decode(&encode(&frames), 24_000, 48_000).unwrap();
        assert_eq!(doubled.len(), 480);
        let halved = decode(&encode(&frames), 24_000, 12_000).unwrap();
        assert_eq!(halved.len(), 120);
    }

    #[test]
    fn resample_preserves_a_constant_signal() {
        let frames = vec![0.25f32; 160];
        for sample in resample(&frames, 16_000, 24_000) {
            assert!((sample - 0.25).abs() < 1e-6);
        }
    }
}
