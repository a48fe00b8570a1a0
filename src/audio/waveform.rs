//! Waveform synthesis and interning
//!
//! A waveform holds exactly one period of a periodic signal (or a block of
//! comfort noise) as 16-bit PCM. Position 0 of the buffer is the period
//! length in samples; positions 1..=N hold the samples, and readers advance
//! cyclically over that range. Waveforms are synthesized on first reference
//! and interned for the lifetime of the cache, keyed by their normalized
//! frequency descriptor.

use std::f64::consts::PI;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, warn};

use crate::audio::SAMPLE_RATE;
use crate::{Error, Result};

/// Comfort noise level selected by the bare "noise" token
const DEFAULT_NOISE_LEVEL: u8 = 10;

/// Peak amplitude of synthesized sinusoids
const TONE_AMPLITUDE: f64 = 5000.0;

/// A parsed frequency descriptor.
///
/// The textual grammar is `"noise" | F1 | F1 "+" F2 | F1 "*" F2` with
/// positive integer frequencies in Hz. An explicit noise level may be given
/// as a negative integer (`-12` selects level 12). Dual descriptors are
/// normalized so the higher frequency comes first; descriptors differing
/// only in operand order compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToneSpec {
    /// Single sinusoid
    Single(u32),
    /// Additive mix of two sinusoids, `f1 >= f2`
    Dual(u32, u32),
    /// Carrier `f1` amplitude-modulated by `f2` at depth 0.5
    Modulated(u32, u32),
    /// Uniform pseudo-random noise, level 1..=15
    Noise(u8),
}

impl ToneSpec {
    /// Parse a descriptor like "425", "350+440", "2000*125" or "noise"
    pub fn parse(desc: &str) -> Result<Self> {
        let desc = desc.trim();
        if desc.is_empty() {
            return Err(Error::parse("empty tone descriptor"));
        }
        if desc == "noise" {
            return Ok(ToneSpec::Noise(DEFAULT_NOISE_LEVEL));
        }
        // a separator can only follow the first frequency, never lead it
        let sep = desc[1..].find(&['+', '*'][..]).map(|p| p + 1);
        match sep {
            None => {
                let f1: i64 = desc
                    .parse()
                    .map_err(|_| Error::parse(format!("invalid tone descriptor '{}'", desc)))?;
                if f1 == 0 {
                    return Err(Error::parse(format!("invalid tone descriptor '{}'", desc)));
                }
                if f1 < 0 {
                    // negative values select a noise level, clamped like -15
                    let level = (-f1).min(15) as u8;
                    return Ok(ToneSpec::Noise(level));
                }
                Ok(ToneSpec::Single(f1 as u32))
            }
            Some(pos) => {
                let modulated = desc.as_bytes()[pos] == b'*';
                let f1: u32 = desc[..pos]
                    .parse()
                    .map_err(|_| Error::parse(format!("invalid tone descriptor '{}'", desc)))?;
                let f2: u32 = desc[pos + 1..]
                    .parse()
                    .map_err(|_| Error::parse(format!("invalid tone descriptor '{}'", desc)))?;
                if f1 == 0 || f2 == 0 {
                    return Err(Error::parse(format!("invalid tone descriptor '{}'", desc)));
                }
                // order components so equal mixes compare equal
                let (f1, f2) = if f1 >= f2 { (f1, f2) } else { (f2, f1) };
                if modulated {
                    Ok(ToneSpec::Modulated(f1, f2))
                } else {
                    Ok(ToneSpec::Dual(f1, f2))
                }
            }
        }
    }
}

/// One period of PCM, length-prefixed: `data[0]` is the period length N,
/// `data[1..=N]` are the samples.
#[derive(Debug, Clone)]
pub struct Waveform {
    data: Arc<[i16]>,
}

impl Waveform {
    /// Wrap an already length-prefixed buffer
    pub fn from_prefixed(data: Vec<i16>) -> Self {
        debug_assert!(!data.is_empty() && data[0] as usize == data.len() - 1);
        Self { data: data.into() }
    }

    /// Wrap a static length-prefixed table
    pub fn from_table(table: &[i16]) -> Self {
        Self::from_prefixed(table.to_vec())
    }

    /// Normalize raw little-endian PCM into the length-prefixed convention
    pub fn from_raw_pcm(raw: &[u8]) -> Option<Self> {
        let n = raw.len() / 2;
        if n == 0 {
            return None;
        }
        let mut data = Vec::with_capacity(n + 1);
        data.push(n as i16);
        for pair in raw.chunks_exact(2) {
            data.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        Some(Self::from_prefixed(data))
    }

    /// Period length in samples
    pub fn period(&self) -> usize {
        self.data[0] as usize
    }

    /// Sample at cyclic position, 1..=period
    pub fn sample(&self, pos: usize) -> i16 {
        self.data[pos]
    }

    /// True if both handles refer to the same interned buffer
    pub fn same_buffer(&self, other: &Waveform) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

// Fill a buffer with one synthesized period. Returns None if the buffer
// cannot be allocated; callers substitute silence.
fn synthesize(spec: ToneSpec) -> Option<Waveform> {
    let len: usize = match spec {
        ToneSpec::Noise(_) => SAMPLE_RATE as usize / 8,
        // even frequencies fit exact periodicity in half the buffer
        ToneSpec::Single(f) if f % 2 == 0 => SAMPLE_RATE as usize / 2,
        _ => SAMPLE_RATE as usize,
    };
    let mut data: Vec<i16> = Vec::new();
    if data.try_reserve_exact(len + 1).is_err() {
        warn!("Cannot allocate {} samples for waveform {:?}", len + 1, spec);
        return None;
    }
    data.push(len as i16);
    match spec {
        ToneSpec::Noise(level) => {
            debug!("Building comfort noise at level {}", level);
            let ofs = (65535u32 >> level) as i32;
            let mut rng = rand::thread_rng();
            for _ in 0..len {
                data.push(rng.gen_range(-ofs..=ofs) as i16);
            }
        }
        ToneSpec::Single(f1) => {
            debug!("Building tone of {} Hz", f1);
            let samp = 2.0 * PI / SAMPLE_RATE as f64;
            for x in 0..len {
                let y = (x as f64 * samp * f1 as f64).sin();
                data.push((y * TONE_AMPLITUDE).round() as i16);
            }
        }
        ToneSpec::Dual(f1, f2) => {
            debug!("Building tone of {} + {} Hz", f1, f2);
            let samp = 2.0 * PI / SAMPLE_RATE as f64;
            for x in 0..len {
                let y = (x as f64 * samp * f1 as f64).sin() + (x as f64 * samp * f2 as f64).sin();
                data.push((y * TONE_AMPLITUDE).round() as i16);
            }
        }
        ToneSpec::Modulated(f1, f2) => {
            debug!("Building tone of {} Hz modulated by {} Hz", f1, f2);
            let samp = 2.0 * PI / SAMPLE_RATE as f64;
            for x in 0..len {
                let y = (x as f64 * samp * f1 as f64).sin()
                    * (1.0 + 0.5 * (x as f64 * samp * f2 as f64).sin());
                data.push((y * TONE_AMPLITUDE).round() as i16);
            }
        }
    }
    Some(Waveform::from_prefixed(data))
}

/// Process-wide cache of interned waveforms keyed by normalized descriptor.
///
/// The first lookup of a descriptor synthesizes its period buffer under the
/// map entry lock, so concurrent requests for the same descriptor cannot
/// synthesize twice. Subsequent lookups return the same shared buffer.
#[derive(Debug, Default)]
pub struct WaveformCache {
    entries: DashMap<ToneSpec, Waveform>,
}

impl WaveformCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a textual descriptor, synthesizing on first reference.
    /// Returns None for unparseable descriptors; callers fall back to silence.
    pub fn get(&self, desc: &str) -> Option<Waveform> {
        match ToneSpec::parse(desc) {
            Ok(spec) => self.get_spec(spec),
            Err(e) => {
                warn!("Invalid tone description '{}': {}", desc, e);
                None
            }
        }
    }

    /// Look up a parsed descriptor, synthesizing on first reference
    pub fn get_spec(&self, spec: ToneSpec) -> Option<Waveform> {
        if let Some(w) = self.entries.get(&spec) {
            return Some(w.clone());
        }
        match self.entries.entry(spec) {
            Entry::Occupied(e) => Some(e.get().clone()),
            Entry::Vacant(e) => {
                let wave = synthesize(spec)?;
                e.insert(wave.clone());
                Some(wave)
            }
        }
    }

    /// Number of interned waveforms
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
