//! Paced tone sources
//!
//! A tone source owns a cadence and a worker that renders it into 320-byte
//! PCM frames, broadcast to subscribers every 20 ms against absolute
//! deadlines so pacing does not drift. Repeating sources resolved from the
//! registry may be shared between concurrent requests for the same
//! canonical name; temporary sources play ad-hoc descriptors, DTMF strings
//! or raw PCM once.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::audio::{encode_frame, AudioFrame, Waveform, FRAME_BYTES, FRAME_MSEC, FRAME_SAMPLES};
use crate::tones::cadence::{build_dtmf_string, Cadence, Segment, ToneDesc};
use crate::tones::registry::ToneRegistry;

/// Frames buffered per subscriber before it starts lagging
const FRAME_BACKLOG: usize = 32;

/// Compute an average byte rate without 32-bit overflow
fn byte_rate(start: Instant, bytes: u64) -> u64 {
    let usec = start.elapsed().as_micros() as u64;
    if usec == 0 || bytes == 0 {
        return 0;
    }
    (bytes * 1_000_000 + usec / 2) / usec
}

/// The cadence a source plays, by origin
enum SourceCadence {
    /// A registered (or built-in) named cadence
    Registered(Arc<ToneDesc>),
    /// Built on the fly from a DTMF string or a single tone descriptor
    Built(Cadence),
    /// Wraps caller-supplied raw linear PCM
    Raw(Cadence),
}

impl SourceCadence {
    fn cadence(&self) -> &Cadence {
        match self {
            SourceCadence::Registered(desc) => desc.cadence(),
            SourceCadence::Built(c) | SourceCadence::Raw(c) => c,
        }
    }
}

/// Playback position inside a cadence
struct Cursor {
    /// Current segment index
    idx: usize,
    /// Samples consumed from the current segment
    samp: u32,
    /// Position inside the waveform period, 1..=N
    dpos: usize,
    /// True until the cadence wraps for the first time
    first_pass: bool,
    /// Cleared when the cadence terminates
    alive: bool,
}

impl Cursor {
    fn new() -> Self {
        Self {
            idx: 0,
            samp: 0,
            dpos: 1,
            first_pass: true,
            alive: true,
        }
    }

    /// Move to the next playable segment. At the end of the cadence the
    /// repeat counter is decremented (zero repeats forever) and on later
    /// passes non-repeatable segments are skipped; when only such segments
    /// remain the cursor dies.
    fn advance(&mut self, cadence: &Cadence, repeat: &AtomicU32) {
        let segments = cadence.segments();
        let n = segments.len();
        let start = self.idx;
        let mut idx = start + 1;
        loop {
            if idx >= n {
                let r = repeat.load(Ordering::Acquire);
                if r > 0 {
                    repeat.store(r - 1, Ordering::Release);
                    if r == 1 {
                        self.alive = false;
                        return;
                    }
                }
                idx = 0;
                self.first_pass = false;
                continue;
            }
            if idx == start {
                if !self.first_pass && !segments[start].repeat {
                    self.alive = false;
                }
                break;
            }
            if self.first_pass || segments[idx].repeat {
                break;
            }
            idx += 1;
        }
        self.idx = idx;
    }

    /// Render the next frame. Returns false once the cadence has ended;
    /// the remainder of the final frame is silence.
    fn fill(&mut self, cadence: &Cadence, repeat: &AtomicU32, out: &mut [i16]) -> bool {
        let segments = cadence.segments();
        for slot in out.iter_mut() {
            if self.alive && self.samp >= segments[self.idx].samples {
                self.samp = 0;
                let before = self.idx;
                self.advance(cadence, repeat);
                // keep waveform phase when a segment wraps onto itself
                if self.idx != before {
                    self.dpos = 1;
                }
            }
            if !self.alive {
                *slot = 0;
                continue;
            }
            match &segments[self.idx].waveform {
                Some(wave) => {
                    if self.dpos > wave.period() {
                        self.dpos = 1;
                    }
                    *slot = wave.sample(self.dpos);
                }
                None => *slot = 0,
            }
            self.samp += 1;
            self.dpos += 1;
        }
        self.alive
    }
}

/// A cooperative real-time tone producer
pub struct ToneSource {
    name: String,
    cadence: SourceCadence,
    /// Remaining cadence passes; zero repeats forever
    repeat: AtomicU32,
    stopped: AtomicBool,
    running: AtomicBool,
    /// Bytes emitted so far
    total: AtomicU64,
    started: Mutex<Option<Instant>>,
    frames: broadcast::Sender<AudioFrame>,
}

impl ToneSource {
    fn build(name: String, cadence: SourceCadence, repeat: u32) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_BACKLOG);
        Arc::new(Self {
            name,
            cadence,
            repeat: AtomicU32::new(repeat),
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            total: AtomicU64::new(0),
            started: Mutex::new(None),
            frames,
        })
    }

    /// Build a source for a registered cadence; repeats until stopped or
    /// the cadence runs out of repeatable segments
    pub fn new(desc: Arc<ToneDesc>) -> Arc<Self> {
        let name = desc.name().to_string();
        debug!("ToneSource '{}'", name);
        Self::build(name, SourceCadence::Registered(desc), 0)
    }

    /// Build a temporary source from an ad-hoc descriptor.
    ///
    /// A leading `*` makes the source repeat until stopped; otherwise it
    /// plays one pass. `rawdata` wraps caller-supplied linear PCM,
    /// `dtmfstr/<digits>` builds a digit string cadence,
    /// `cadence/<desc>` a user-defined cadence, a registered or oneshot
    /// name plays that tone, and anything else is decoded as a single
    /// `[!]desc[/ms]` segment.
    pub fn temporary(
        desc: &mut String,
        prefix: &str,
        rawdata: Option<Bytes>,
        registry: &ToneRegistry,
    ) -> Option<Arc<Self>> {
        if desc.is_empty() {
            return None;
        }
        let name = desc.clone();
        let mut repeat = 1;
        let mut spec = desc.as_str();
        if let Some(rest) = spec.strip_prefix('*') {
            repeat = 0;
            spec = rest;
        }
        if spec == "rawdata" {
            let raw = match rawdata.as_ref().and_then(|d| Waveform::from_raw_pcm(d)) {
                Some(wave) => wave,
                None => {
                    warn!(
                        "Temporary source '{}' with invalid raw data size {}",
                        name,
                        rawdata.map(|d| d.len()).unwrap_or(0)
                    );
                    return None;
                }
            };
            let samples = raw.period() as u32;
            let cadence = Cadence::new(vec![Segment::tone(samples, raw)]).ok()?;
            return Some(Self::build(name, SourceCadence::Raw(cadence), repeat));
        }
        // try the named tones first, oneshot names included
        let mut lookup = spec.to_string();
        if let Some(tone) = registry.resolve(&mut lookup, prefix, true) {
            return Some(Self::build(name, SourceCadence::Registered(tone), repeat));
        }
        // an entire string of DTMFs
        if let Some(digits) = spec.strip_prefix("dtmfstr/") {
            let cadence = build_dtmf_string(digits, registry.cache())?;
            return Some(Self::build(name, SourceCadence::Built(cadence), repeat));
        }
        // or an entire user defined cadence of tones
        if let Some(rest) = spec.strip_prefix("cadence/") {
            let cadence = Cadence::parse(rest, registry.cache()).ok()?;
            return Some(Self::build(name, SourceCadence::Built(cadence), repeat));
        }
        // now try to build a single tone
        let segment = Segment::decode(spec, registry.cache()).ok()?;
        let cadence = Cadence::new(vec![segment]).ok()?;
        Some(Self::build(name, SourceCadence::Built(cadence), repeat))
    }

    /// Canonical name of the cadence this source plays
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to the emitted frames
    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.frames.subscribe()
    }

    /// Request termination; honored at the next frame boundary
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Set the number of remaining cadence passes; zero repeats forever.
    /// Takes effect at the next segment advance.
    pub fn set_repeat(&self, passes: u32) {
        self.repeat.store(passes, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bytes emitted since startup
    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Average output byte rate since startup, for diagnostics
    pub fn current_byte_rate(&self) -> u64 {
        match *self.started.lock().unwrap() {
            Some(start) => byte_rate(start, self.total_bytes()),
            None => 0,
        }
    }

    /// Start the paced emission worker. The worker holds only a weak
    /// reference, so the source ends once every caller drops its handle.
    pub fn startup(self: &Arc<Self>) {
        let start = Instant::now();
        *self.started.lock().unwrap() = Some(start);
        self.running.store(true, Ordering::Release);
        let weak = Arc::downgrade(self);
        tokio::spawn(run(weak, start));
    }
}

async fn run(weak: Weak<ToneSource>, start: Instant) {
    let mut cursor = Cursor::new();
    let mut deadline = start;
    let mut buf = [0i16; FRAME_SAMPLES];
    loop {
        // cancellation check once per frame
        let alive = match weak.upgrade() {
            Some(src) if !src.stopped.load(Ordering::Acquire) => {
                cursor.fill(src.cadence.cadence(), &src.repeat, &mut buf)
            }
            _ => break,
        };
        tokio::time::sleep_until(deadline).await;
        match weak.upgrade() {
            Some(src) if !src.stopped.load(Ordering::Acquire) => {
                let timestamp = src.total.load(Ordering::Acquire) / 2;
                let _ = src.frames.send(AudioFrame::new(encode_frame(&buf), timestamp));
                src.total.fetch_add(FRAME_BYTES as u64, Ordering::AcqRel);
            }
            _ => break,
        }
        deadline += Duration::from_millis(FRAME_MSEC);
        if !alive {
            break;
        }
    }
    if let Some(src) = weak.upgrade() {
        src.running.store(false, Ordering::Release);
        let total = src.total_bytes();
        debug!(
            "Tone source '{}' ended, total={} ({} b/s)",
            src.name,
            total,
            byte_rate(start, total)
        );
    }
}

/// Pool of live sources indexed by canonical cadence name.
///
/// Repeat-all cadences are shared: a request that resolves to the name of
/// a live, running source still referenced by another caller returns that
/// source instead of building a new one.
pub struct SourcePool {
    registry: Arc<ToneRegistry>,
    sources: DashMap<String, Weak<ToneSource>>,
}

impl SourcePool {
    pub fn new(registry: Arc<ToneRegistry>) -> Self {
        Self {
            registry,
            sources: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ToneRegistry> {
        &self.registry
    }

    /// Resolve a tone request and return a running source for it,
    /// canonicalizing `name` in place. Returns None when the name does not
    /// resolve.
    pub fn get_tone(&self, name: &mut String, prefix: &str) -> Option<Arc<ToneSource>> {
        let tone = self.registry.resolve(name, prefix, true);
        let shareable = tone
            .as_ref()
            .map(|t| t.cadence().repeat_all())
            .unwrap_or(false);
        if shareable {
            if let Some(entry) = self.sources.get(name.as_str()) {
                if let Some(src) = entry.value().upgrade() {
                    // must be running and held by at least one other caller
                    if src.is_running() && Arc::strong_count(&src) > 1 {
                        return Some(src);
                    }
                }
            }
        }
        let source = ToneSource::new(tone?);
        self.sources
            .insert(name.clone(), Arc::downgrade(&source));
        source.startup();
        Some(source)
    }

    /// Drop pool entries whose sources have ended
    pub fn prune(&self) {
        self.sources.retain(|_, weak| weak.strong_count() > 0);
    }
}
