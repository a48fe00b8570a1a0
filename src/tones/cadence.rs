//! Cadences: ordered tone/silence segments with repeat control
//!
//! A cadence is a non-empty list of segments played in turn. Each segment
//! holds a duration in samples, an optional waveform (absence means silence)
//! and a flag selecting whether it participates on repeat passes. Built-in
//! cadences cover the standard call-progress tones, continuity probes and
//! the 16 DTMF digits.

use std::sync::Arc;

use tracing::debug;

use crate::audio::{Waveform, WaveformCache};
use crate::{Error, Result};

/// DTMF digit tone length in samples (120 ms)
pub const DTMF_LEN: u32 = 960;
/// Silence around a DTMF digit in samples (40 ms)
pub const DTMF_GAP: u32 = 320;

// 421.052Hz (19 samples @ 8kHz) sine wave, pretty close to standard 425Hz
static TONE_421HZ: [i16; 20] = [
    19, 3246, 6142, 8371, 9694, 9965, 9157, 7357, 4759, 1645, -1645, -4759, -7357, -9157, -9965,
    -9694, -8371, -6142, -3246, 0,
];

// 1000Hz (8 samples @ 8kHz) standard digital milliwatt
static TONE_1000HZ: [i16; 9] = [8, 8828, 20860, 20860, 8828, -8828, -20860, -20860, -8828];

// 941.176Hz (2*8.5 samples @ 8kHz) sine wave, approximates 950Hz
static TONE_941HZ: [i16; 18] = [
    17, 6736, 9957, 7980, 1838, -5623, -9617, -8952, -3614, 3614, 8952, 9617, 5623, -1838, -7980,
    -9957, -6736, 0,
];

// 1454.545Hz (2*5.5 samples @ 8kHz) sine wave, approximates 1400Hz
static TONE_1454HZ: [i16; 12] = [
    11, 9096, 7557, -2816, -9898, -5407, 5407, 9898, 2816, -7557, -9096, 0,
];

// 1777.777Hz (2*4.5 samples @ 8kHz) sine wave, approximates 1800Hz
static TONE_1777HZ: [i16; 10] = [9, 9848, 3420, -8659, -6429, 6429, 8659, -3420, -9848, 0];

/// One fragment of a cadence
#[derive(Debug, Clone)]
pub struct Segment {
    /// Duration in samples
    pub samples: u32,
    /// Period buffer to play, or silence when absent
    pub waveform: Option<Waveform>,
    /// Whether this segment participates on repeat passes
    pub repeat: bool,
}

impl Segment {
    pub fn tone(samples: u32, waveform: Waveform) -> Self {
        Self {
            samples,
            waveform: Some(waveform),
            repeat: true,
        }
    }

    pub fn silence(samples: u32) -> Self {
        Self {
            samples,
            waveform: None,
            repeat: true,
        }
    }

    fn oneshot(mut self) -> Self {
        self.repeat = false;
        self
    }

    /// Decode a segment description of the form `[!]desc[/duration_ms]`.
    ///
    /// A leading `!` marks the segment as not participating on repeat
    /// passes. The default duration is 1000 ms; a positive duration is
    /// rounded up to the next multiple of 20 ms. A frequency of `0` yields
    /// silence.
    pub fn decode(desc: &str, cache: &WaveformCache) -> Result<Self> {
        if desc.is_empty() {
            return Err(Error::parse("empty segment descriptor"));
        }
        let (repeat, rest) = match desc.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, desc),
        };
        let mut samples: u32 = 8000;
        let freq = match rest.find('/') {
            Some(pos) => {
                if let Ok(duration) = rest[pos + 1..].parse::<u32>() {
                    if duration > 0 {
                        // round up to a multiple of 20 ms
                        samples = (duration + 19) / 20 * 160;
                    }
                }
                &rest[..pos]
            }
            None => rest,
        };
        // silence?
        if freq.parse::<i64>() == Ok(0) {
            return Ok(Self {
                samples,
                waveform: None,
                repeat,
            });
        }
        let waveform = cache
            .get(freq)
            .ok_or_else(|| Error::parse(format!("invalid tone description '{}'", desc)))?;
        Ok(Self {
            samples,
            waveform: Some(waveform),
            repeat,
        })
    }
}

/// An ordered, non-empty sequence of segments
#[derive(Debug, Clone)]
pub struct Cadence {
    segments: Vec<Segment>,
    repeat_all: bool,
}

impl Cadence {
    /// Build a cadence, enforcing that it holds at least one segment with
    /// a non-zero sample count
    pub fn new(segments: Vec<Segment>) -> Result<Self> {
        if segments.is_empty() || segments.iter().all(|s| s.samples == 0) {
            return Err(Error::invalid_state("cadence has no playable segment"));
        }
        if segments.iter().any(|s| s.samples == 0) {
            return Err(Error::invalid_state("cadence has a zero-length segment"));
        }
        let repeat_all = segments.iter().all(|s| s.repeat);
        Ok(Self {
            segments,
            repeat_all,
        })
    }

    /// Parse a comma-separated list of segment descriptors
    pub fn parse(desc: &str, cache: &WaveformCache) -> Result<Self> {
        let mut segments = Vec::new();
        for part in desc.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            segments.push(Segment::decode(part, cache)?);
        }
        Self::new(segments)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True iff every segment participates on repeat passes
    pub fn repeat_all(&self) -> bool {
        self.repeat_all
    }

    /// Samples emitted over one full pass
    pub fn total_samples(&self) -> u64 {
        self.segments.iter().map(|s| s.samples as u64).sum()
    }
}

/// A named cadence in the registry
#[derive(Debug)]
pub struct ToneDesc {
    name: String,
    alias: Option<String>,
    cadence: Cadence,
}

impl ToneDesc {
    /// Build a descriptor; the alias comes from the fixed table, prefixed
    /// the same way as the name
    pub fn new(cadence: Cadence, name: &str, prefix: &str) -> Self {
        let full = format!("{}{}", prefix, name);
        let alias = alias_for(name).map(|a| format!("{}{}", prefix, a));
        debug!("ToneDesc({})", full);
        Self {
            name: full,
            alias,
            cadence,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    /// Tone name/alias match. When the alias matched, `name` is rewritten
    /// to the canonical name.
    pub fn is_name(&self, name: &mut String) -> bool {
        if *name == self.name {
            return true;
        }
        match &self.alias {
            Some(alias) if alias == name => {
                *name = self.name.clone();
                true
            }
            _ => false,
        }
    }
}

/// Short alias for a built-in tone name
fn alias_for(name: &str) -> Option<String> {
    let alias = match name {
        "dial" => "dt",
        "busy" => "bs",
        "ring" => "rt",
        "specdial" => "sd",
        "congestion" => "cg",
        "outoforder" => "oo",
        "info" => "in",
        "milliwatt" => "mw",
        "noise" => "cn",
        "probe/0" => "probe",
        "cotv" => "co1",
        "cots" => "co2",
        "callwaiting" => "cw",
        _ => {
            // single DTMF digits alias to the bare digit
            return name
                .strip_prefix("dtmf/")
                .filter(|d| d.len() == 1)
                .map(str::to_string);
        }
    };
    Some(alias.to_string())
}

/// The `(high, low)` frequency pair of a DTMF digit
pub fn dtmf_frequencies(digit: char) -> Option<(u32, u32)> {
    let low = match digit {
        '1' | '2' | '3' | 'a' | 'A' => 697,
        '4' | '5' | '6' | 'b' | 'B' => 770,
        '7' | '8' | '9' | 'c' | 'C' => 852,
        '*' | '0' | '#' | 'd' | 'D' => 941,
        _ => return None,
    };
    let high = match digit {
        '1' | '4' | '7' | '*' => 1209,
        '2' | '5' | '8' | '0' => 1336,
        '3' | '6' | '9' | '#' => 1477,
        _ => 1633,
    };
    Some((high, low))
}

/// The waveform of a DTMF digit, interned through the cache
fn dtmf_waveform(digit: char, cache: &WaveformCache) -> Option<Waveform> {
    let (high, low) = dtmf_frequencies(digit)?;
    cache.get_spec(crate::audio::ToneSpec::Dual(high, low))
}

/// Build a gap/tone/gap cadence for one DTMF digit. The segments do not
/// participate on repeat passes, so a digit source ends after one pass.
fn dtmf_cadence(digit: char, cache: &WaveformCache) -> Option<Cadence> {
    let wave = dtmf_waveform(digit, cache)?;
    Cadence::new(vec![
        Segment::silence(DTMF_GAP).oneshot(),
        Segment::tone(DTMF_LEN, wave).oneshot(),
        Segment::silence(DTMF_GAP).oneshot(),
    ])
    .ok()
}

/// Build a cadence out of an entire string of DTMF digits. Unknown
/// characters become silence of the same length.
pub fn build_dtmf_string(digits: &str, cache: &WaveformCache) -> Option<Cadence> {
    if digits.is_empty() {
        return None;
    }
    let mut segments = Vec::with_capacity(2 * digits.len() + 1);
    for c in digits.chars() {
        segments.push(Segment::silence(DTMF_GAP));
        segments.push(Segment {
            samples: DTMF_LEN,
            waveform: dtmf_waveform(c, cache),
            repeat: true,
        });
    }
    segments.push(Segment::silence(DTMF_GAP));
    Cadence::new(segments).ok()
}

fn t421() -> Waveform {
    Waveform::from_table(&TONE_421HZ)
}

/// The language-independent built-in tone set
pub(crate) fn default_tone_set(cache: &WaveformCache) -> Vec<Arc<ToneDesc>> {
    let mut set = Vec::new();
    let mut push = |name: &str, segments: Vec<Segment>| {
        if let Ok(cadence) = Cadence::new(segments) {
            set.push(Arc::new(ToneDesc::new(cadence, name, "")));
        }
    };
    push("dial", vec![Segment::tone(8000, t421())]);
    push("busy", vec![Segment::tone(4000, t421()), Segment::silence(4000)]);
    push("ring", vec![Segment::tone(8000, t421()), Segment::silence(32000)]);
    push("specdial", vec![Segment::tone(7600, t421()), Segment::silence(400)]);
    push(
        "congestion",
        vec![Segment::tone(2000, t421()), Segment::silence(2000)],
    );
    push(
        "outoforder",
        vec![
            Segment::tone(800, t421()),
            Segment::silence(800),
            Segment::tone(800, t421()),
            Segment::silence(800),
            Segment::tone(800, t421()),
            Segment::silence(800),
            Segment::tone(1600, t421()),
            Segment::silence(1600),
        ],
    );
    push(
        "info",
        vec![
            Segment::tone(2640, Waveform::from_table(&TONE_941HZ)),
            Segment::silence(240),
            Segment::tone(2640, Waveform::from_table(&TONE_1454HZ)),
            Segment::silence(240),
            Segment::tone(2640, Waveform::from_table(&TONE_1777HZ)),
            Segment::silence(8000),
        ],
    );
    push(
        "milliwatt",
        vec![Segment::tone(8000, Waveform::from_table(&TONE_1000HZ))],
    );
    push("silence", vec![Segment::silence(8000)]);
    if let Some(noise) = cache.get("noise") {
        push("noise", vec![Segment::tone(2000, noise)]);
    }
    let probes = ["2000+125", "2000*125", "2000*1000", "2010", "1780"];
    let probe_names = ["probe/0", "probe/1", "probe/2", "cotv", "cots"];
    for (name, desc) in probe_names.into_iter().zip(probes) {
        if let Some(wave) = cache.get(desc) {
            push(name, vec![Segment::tone(8000, wave)]);
        }
    }
    set
}

/// The built-in oneshot tone set: call waiting, the 16 DTMF digits, then
/// the default set again so oneshot requests resolve every built-in name
pub(crate) fn oneshot_tone_set(cache: &WaveformCache) -> Vec<Arc<ToneDesc>> {
    let mut set = Vec::new();
    if let Ok(cadence) = Cadence::new(vec![
        Segment::silence(160),
        Segment::tone(800, t421()),
        Segment::silence(800),
        Segment::tone(800, t421()),
        Segment::silence(160),
    ]) {
        set.push(Arc::new(ToneDesc::new(cadence, "callwaiting", "")));
    }
    for digit in "0123456789*#abcd".chars() {
        if let Some(cadence) = dtmf_cadence(digit, cache) {
            let name = format!("dtmf/{}", digit);
            set.push(Arc::new(ToneDesc::new(cadence, &name, "")));
        }
    }
    set.extend(default_tone_set(cache));
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_timings() {
        let cache = WaveformCache::new();
        let set = default_tone_set(&cache);
        let find = |name: &str| {
            set.iter()
                .find(|d| d.name() == name)
                .unwrap_or_else(|| panic!("missing builtin {}", name))
        };
        let busy = find("busy");
        let segs = busy.cadence().segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].samples, 4000);
        assert!(segs[0].waveform.is_some());
        assert_eq!(segs[1].samples, 4000);
        assert!(segs[1].waveform.is_none());

        let ring = find("ring");
        assert_eq!(ring.cadence().total_samples(), 40000);
        assert!(ring.cadence().repeat_all());

        let info = find("info");
        assert_eq!(info.cadence().segments().len(), 6);
        assert_eq!(info.cadence().segments()[4].samples, 2640);
    }

    #[test]
    fn test_dtmf_cadence_is_finite() {
        let cache = WaveformCache::new();
        let set = oneshot_tone_set(&cache);
        let five = set.iter().find(|d| d.name() == "dtmf/5").unwrap();
        let segs = five.cadence().segments();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].samples, DTMF_GAP);
        assert_eq!(segs[1].samples, DTMF_LEN);
        assert_eq!(segs[2].samples, DTMF_GAP);
        assert!(!five.cadence().repeat_all());
        assert_eq!(five.alias(), Some("5"));
    }

    #[test]
    fn test_alias_canonicalizes() {
        let cache = WaveformCache::new();
        let set = default_tone_set(&cache);
        let busy = set.iter().find(|d| d.name() == "busy").unwrap();
        let mut name = "bs".to_string();
        assert!(busy.is_name(&mut name));
        assert_eq!(name, "busy");
        let mut other = "dial".to_string();
        assert!(!busy.is_name(&mut other));
        assert_eq!(other, "dial");
    }

    #[test]
    fn test_segment_decode() {
        let cache = WaveformCache::new();
        // default duration is one second
        let seg = Segment::decode("425", &cache).unwrap();
        assert_eq!(seg.samples, 8000);
        assert!(seg.repeat);
        assert!(seg.waveform.is_some());
        // durations round up to 20 ms multiples
        let seg = Segment::decode("425/330", &cache).unwrap();
        assert_eq!(seg.samples, 2720);
        let seg = Segment::decode("425/340", &cache).unwrap();
        assert_eq!(seg.samples, 2720);
        // non-repeating silence
        let seg = Segment::decode("!0/500", &cache).unwrap();
        assert_eq!(seg.samples, 4000);
        assert!(!seg.repeat);
        assert!(seg.waveform.is_none());
        // garbage is rejected
        assert!(Segment::decode("hello/100", &cache).is_err());
    }

    #[test]
    fn test_cadence_parse() {
        let cache = WaveformCache::new();
        let cadence = Cadence::parse("425/500,0/500", &cache).unwrap();
        assert_eq!(cadence.segments().len(), 2);
        assert_eq!(cadence.total_samples(), 8000);
        assert!(cadence.repeat_all());
        let cadence = Cadence::parse("!950/330,425", &cache).unwrap();
        assert!(!cadence.repeat_all());
        assert!(Cadence::parse("425,junk", &cache).is_err());
        assert!(Cadence::parse("", &cache).is_err());
    }

    #[test]
    fn test_dtmf_string_builder() {
        let cache = WaveformCache::new();
        let cadence = build_dtmf_string("12", &cache).unwrap();
        // gap, tone, gap, tone, gap
        assert_eq!(cadence.segments().len(), 5);
        assert_eq!(cadence.total_samples(), (3 * DTMF_GAP + 2 * DTMF_LEN) as u64);
        // unknown digits become silence of the same length
        let cadence = build_dtmf_string("x", &cache).unwrap();
        assert!(cadence.segments()[1].waveform.is_none());
        assert!(build_dtmf_string("", &cache).is_none());
    }

    #[test]
    fn test_dtmf_frequencies() {
        assert_eq!(dtmf_frequencies('5'), Some((1336, 770)));
        assert_eq!(dtmf_frequencies('*'), Some((1209, 941)));
        assert_eq!(dtmf_frequencies('D'), Some((1633, 941)));
        assert_eq!(dtmf_frequencies('x'), None);
    }
}
