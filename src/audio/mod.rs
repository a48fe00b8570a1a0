//! Audio primitives shared by the tone sources and detectors
//!
//! All audio in the engine is signed 16-bit little-endian PCM sampled at
//! 8 kHz. Sources emit fixed 20 ms frames; consumers accept frames of any
//! size that is a multiple of the sample width for their channel mode.

pub mod waveform;

pub use waveform::{ToneSpec, Waveform, WaveformCache};

use bytes::Bytes;

/// Fixed engine sample rate in Hz
pub const SAMPLE_RATE: u32 = 8000;

/// Samples per emitted frame (20 ms at 8 kHz)
pub const FRAME_SAMPLES: usize = 160;

/// Bytes per emitted frame
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Source output byte rate (16-bit mono at 8 kHz)
pub const BYTE_RATE: u32 = 16000;

/// Duration of one frame in milliseconds
pub const FRAME_MSEC: u64 = 20;

/// One PCM frame with its position in the emitting stream
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw signed 16-bit little-endian PCM
    pub data: Bytes,
    /// Samples emitted by the stream before this frame
    pub timestamp: u64,
}

impl AudioFrame {
    pub fn new(data: Bytes, timestamp: u64) -> Self {
        Self { data, timestamp }
    }

    /// Number of samples in this frame
    pub fn samples(&self) -> usize {
        self.data.len() / 2
    }
}

/// Channel selection for consumers fed with mono or interleaved stereo PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMode {
    #[default]
    Mono,
    /// Use the first sample of each stereo pair
    Left,
    /// Use the second sample of each stereo pair
    Right,
    /// Sum both samples of each stereo pair
    Mixed,
}

impl ChannelMode {
    /// Bytes consumed from the input stream per processed sample
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            ChannelMode::Mono => 2,
            _ => 4,
        }
    }
}

/// Encode a slice of samples into a little-endian PCM frame
pub fn encode_frame(samples: &[i16]) -> Bytes {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(buf)
}
