//! Per-stream inband tone detector
//!
//! A consumer is attached to one PCM stream and driven by whoever delivers
//! its frames; all detection runs inline with frame arrival. Samples pass
//! through a differentiator into the active filter banks, and every 8th
//! sample (one millisecond) the enabled decision checks run. Detection
//! results leave through the injected event sink.

use tracing::{debug, info};

use crate::audio::ChannelMode;
use crate::detect::filter::{
    update_power, BandFilter, PARAMS_CED, PARAMS_CNG, PARAMS_COT_S, PARAMS_COT_V,
    PARAMS_DTMF_HIGH, PARAMS_DTMF_LOW,
};
use crate::events::{EventMessage, EventSink};

// the values below are squares, computations are in power, not amplitude

/// Minimum square of signal energy to even consider detecting
const THRESHOLD2_ABS: f64 = 1e6;
/// Relative square of spectral power from total signal power
const THRESHOLD2_REL_FAX: f64 = 0.95;
/// Same for continuity test tones
const THRESHOLD2_REL_COT: f64 = 0.90;
/// Sum of tones (low+high) from total
const THRESHOLD2_REL_ALL: f64 = 0.60;
/// Each tone from threshold from total
const THRESHOLD2_REL_DTMF: f64 = 0.33;
/// Hysteresis after tone detection
const THRESHOLD2_REL_HIST: f64 = 0.75;

/// Minimum DTMF detect time in millisecond checks
const DETECT_DTMF_MSEC: u32 = 32;

/// DTMF digit by low, high band indexes
const DTMF_TABLE: [[char; 4]; 4] = [
    ['1', '2', '3', 'A'],
    ['4', '5', '6', 'B'],
    ['7', '8', '9', 'C'],
    ['*', '0', '#', 'D'],
];

/// Match a complete `*caller*called*` DNIS string
fn parse_dnis(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix('*')?.strip_suffix('*')?;
    let (caller, called) = rest.split_once('*')?;
    let valid = |part: &str| part.chars().all(|c| c.is_ascii_digit() || c == '#');
    if valid(caller) && valid(called) {
        Some((caller, called))
    } else {
        None
    }
}

/// Inband detector for one audio stream
pub struct ToneConsumer {
    id: String,
    name: String,
    mode: ChannelMode,
    det_fax: bool,
    det_cont: bool,
    det_dtmf: bool,
    det_dnis: bool,
    fax: BandFilter,
    cont: BandFilter,
    dtmf_low: [BandFilter; 4],
    dtmf_high: [BandFilter; 4],
    /// Recent raw samples for the differentiator
    xv: [f64; 3],
    /// Total signal power estimate
    power: f64,
    dtmf_tone: Option<char>,
    dtmf_count: u32,
    /// Sample counter driving the millisecond checks
    clock: u32,
    dnis: String,
    fax_divert: Option<String>,
    fax_caller: Option<String>,
    fax_called: Option<String>,
    target: Option<String>,
    sink: EventSink,
}

impl ToneConsumer {
    /// Build a consumer for a stream. The stream name selects the channel
    /// mode and active detectors: `tone/<mode>/<filter-list>` with mode one
    /// of mono/mixed/left/right and filters a comma separated subset of
    /// fax, rfax, cotv, cots, dtmf, callsetup; empty or `*` selects the
    /// defaults (fax and dtmf).
    pub fn new(id: impl Into<String>, name: impl Into<String>, sink: EventSink) -> Self {
        let id = id.into();
        let name = name.into();
        debug!("ToneConsumer({},'{}')", id, name);
        let mut consumer = Self {
            id,
            name: name.clone(),
            mode: ChannelMode::Mono,
            det_fax: true,
            det_cont: false,
            det_dtmf: true,
            det_dnis: false,
            fax: BandFilter::new(PARAMS_CNG),
            cont: BandFilter::new(PARAMS_COT_V),
            dtmf_low: PARAMS_DTMF_LOW.map(BandFilter::new),
            dtmf_high: PARAMS_DTMF_HIGH.map(BandFilter::new),
            xv: [0.0; 3],
            power: 0.0,
            dtmf_tone: None,
            dtmf_count: 0,
            clock: 0,
            dnis: String::new(),
            fax_divert: None,
            fax_caller: None,
            fax_called: None,
            target: None,
            sink,
        };
        let mut spec = name.as_str();
        spec = spec.strip_prefix("tone/").unwrap_or(spec);
        if let Some(rest) = spec.strip_prefix("mixed/") {
            consumer.mode = ChannelMode::Mixed;
            spec = rest;
        } else if let Some(rest) = spec.strip_prefix("left/") {
            consumer.mode = ChannelMode::Left;
            spec = rest;
        } else if let Some(rest) = spec.strip_prefix("right/") {
            consumer.mode = ChannelMode::Right;
            spec = rest;
        } else {
            spec = spec.strip_prefix("mono/").unwrap_or(spec);
        }
        if !spec.is_empty() && spec != "*" {
            // individual detection requested
            consumer.det_fax = false;
            consumer.det_cont = false;
            consumer.det_dtmf = false;
            consumer.det_dnis = false;
            for filter in spec.split(',').filter(|s| !s.is_empty()) {
                match filter {
                    "fax" => consumer.det_fax = true,
                    "cotv" => consumer.det_cont = true,
                    "dtmf" => consumer.det_dtmf = true,
                    "rfax" => {
                        // detection of receiving Fax requested
                        consumer.fax.assign(PARAMS_CED);
                        consumer.det_fax = true;
                    }
                    "cots" => {
                        // detection of COT Send tone requested
                        consumer.cont.assign(PARAMS_COT_S);
                        consumer.det_cont = true;
                    }
                    "callsetup" => {
                        // call setup info in the form *ANI*DNIS*
                        consumer.det_dnis = true;
                    }
                    _ => {}
                }
            }
        }
        consumer
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Re-init filter state and candidate tracking
    pub fn reset(&mut self) {
        self.xv[1] = 0.0;
        self.xv[2] = 0.0;
        self.power = 0.0;
        self.fax.reset();
        self.cont.reset();
        for f in &mut self.dtmf_low {
            f.reset();
        }
        for f in &mut self.dtmf_high {
            f.reset();
        }
        self.dtmf_tone = None;
        self.dtmf_count = 0;
    }

    /// Copy parameters required for automatic fax call diversion
    pub fn set_fax_divert(&mut self, msg: &EventMessage) {
        if let Some(target) = msg.get("notify") {
            self.target = Some(target.to_string());
        }
        if self.id.is_empty() {
            self.id = self.target.clone().unwrap_or_default();
        }
        let Some(divert) = msg.get("fax_divert") else {
            return;
        };
        self.det_fax = true;
        // an empty or false value disables diverting
        if divert.is_empty() || matches!(divert, "false" | "no" | "off" | "0") {
            self.fax_divert = None;
            return;
        }
        self.fax_divert = Some(divert.to_string());
        self.fax_caller = msg
            .get("fax_caller")
            .or_else(|| msg.get("caller"))
            .map(str::to_string)
            .or_else(|| self.fax_caller.take());
        self.fax_called = msg
            .get("fax_called")
            .or_else(|| msg.get("called"))
            .map(str::to_string)
            .or_else(|| self.fax_called.take());
    }

    /// Check if we detected a DTMF
    fn check_dtmf(&mut self) {
        let candidate = self.dtmf_tone.take();
        let (mut l, mut max_l) = (0usize, self.dtmf_low[0].power());
        for (i, f) in self.dtmf_low.iter().enumerate().skip(1) {
            if max_l < f.power() {
                max_l = f.power();
                l = i;
            }
        }
        let (mut h, mut max_h) = (0usize, self.dtmf_high[0].power());
        for (i, f) in self.dtmf_high.iter().enumerate().skip(1) {
            if max_h < f.power() {
                max_h = f.power();
                h = i;
            }
        }
        let mut limit_all = self.power * THRESHOLD2_REL_ALL;
        let mut limit_one = limit_all * THRESHOLD2_REL_DTMF;
        if candidate.is_some() {
            limit_all *= THRESHOLD2_REL_HIST;
            limit_one *= THRESHOLD2_REL_HIST;
        }
        if max_l < limit_one || max_h < limit_one || (max_l + max_h) < limit_all {
            return;
        }
        let digit = DTMF_TABLE[l][h];
        if candidate != Some(digit) {
            debug!(
                "DTMF '{}' new candidate on {}, lo={:.1}, hi={:.1}, total={:.1}",
                digit, self.id, max_l, max_h, self.power
            );
            self.dtmf_tone = Some(digit);
            self.dtmf_count = 1;
            return;
        }
        self.dtmf_tone = candidate;
        // the counter keeps climbing past the latch point so continued
        // matches of the same digit do not re-emit
        let dwell = self.dtmf_count;
        self.dtmf_count += 1;
        if dwell != DETECT_DTMF_MSEC {
            return;
        }
        info!(
            "{}DTMF '{}' detected on {}, lo={:.1}, hi={:.1}, total={:.1}",
            if self.det_dnis { "DNIS/" } else { "" },
            digit,
            self.id,
            max_l,
            max_h,
            self.power
        );
        if self.det_dnis {
            self.dnis.push(digit);
            if let Some((caller, called)) = parse_dnis(&self.dnis) {
                let msg = EventMessage::new("chan.notify")
                    .param("id", &self.id)
                    .param_opt("targetid", self.target.as_deref())
                    .param("operation", "setup")
                    .param("caller", caller)
                    .param("called", called);
                self.det_dnis = false;
                let _ = self.sink.send(msg);
            }
            return;
        }
        let msg = EventMessage::new("chan.masquerade")
            .param("id", &self.id)
            .param("message", "chan.dtmf")
            .param("text", digit.to_string())
            .param("detected", "inband");
        let _ = self.sink.send(msg);
    }

    /// Check if we detected a Fax CNG or CED tone
    fn check_fax(&mut self) {
        if self.fax.power() < self.power * THRESHOLD2_REL_FAX {
            return;
        }
        if self.fax.power() > self.power {
            debug!(
                "Overshoot on {}, signal={:.2}, total={:.2}",
                self.id,
                self.fax.power(),
                self.power
            );
            self.reset();
            return;
        }
        info!(
            "Fax detected on {}, signal={:.1}, total={:.1}",
            self.id,
            self.fax.power(),
            self.power
        );
        // prepare for new detection
        self.reset();
        self.det_fax = false;
        let mut msg = EventMessage::new("chan.masquerade").param("id", &self.id);
        if let Some(divert) = &self.fax_divert {
            info!("Diverting call {} to: {}", self.id, divert);
            msg = msg
                .param("message", "call.execute")
                .param("callto", divert.clone())
                .param("reason", "fax");
        } else {
            msg = msg.param("message", "call.fax").param("detected", "inband");
        }
        msg = msg
            .param_opt("caller", self.fax_caller.as_deref())
            .param_opt("called", self.fax_called.as_deref());
        let _ = self.sink.send(msg);
    }

    /// Check if we detected a Continuity Test tone
    fn check_cont(&mut self) {
        if self.cont.power() < self.power * THRESHOLD2_REL_COT {
            return;
        }
        if self.cont.power() > self.power {
            debug!(
                "Overshoot on {}, signal={:.2}, total={:.2}",
                self.id,
                self.cont.power(),
                self.power
            );
            self.reset();
            return;
        }
        info!(
            "Continuity detected on {}, signal={:.1}, total={:.1}",
            self.id,
            self.cont.power(),
            self.power
        );
        // prepare for new detection
        self.reset();
        self.det_cont = false;
        let msg = EventMessage::new("chan.masquerade")
            .param("id", &self.id)
            .param("message", "chan.dtmf")
            .param("text", "O")
            .param("detected", "inband");
        let _ = self.sink.send(msg);
    }

    /// Feed a block of little-endian PCM to the filters. Frames are
    /// processed in delivery order; detection checks run inline.
    pub fn consume(&mut self, data: &[u8]) {
        let width = self.mode.bytes_per_sample();
        for chunk in data.chunks_exact(width) {
            self.xv[0] = self.xv[1];
            self.xv[1] = self.xv[2];
            self.xv[2] = match self.mode {
                ChannelMode::Mono | ChannelMode::Left => {
                    i16::from_le_bytes([chunk[0], chunk[1]]) as f64
                }
                ChannelMode::Right => i16::from_le_bytes([chunk[2], chunk[3]]) as f64,
                ChannelMode::Mixed => {
                    i16::from_le_bytes([chunk[0], chunk[1]]) as f64
                        + i16::from_le_bytes([chunk[2], chunk[3]]) as f64
                }
            };
            let dx = self.xv[2] - self.xv[0];
            update_power(&mut self.power, self.xv[2]);

            // update all active detectors
            if self.det_fax {
                self.fax.update(dx);
            }
            if self.det_cont {
                self.cont.update(dx);
            }
            if self.det_dtmf || self.det_dnis {
                for j in 0..4 {
                    self.dtmf_low[j].update(dx);
                    self.dtmf_high[j].update(dx);
                }
            }
            // only do checks every millisecond
            self.clock = self.clock.wrapping_add(1);
            if self.clock % 8 != 0 {
                continue;
            }
            // is it enough total power to accept a signal?
            if self.power >= THRESHOLD2_ABS {
                if self.det_dtmf || self.det_dnis {
                    self.check_dtmf();
                }
                if self.det_fax {
                    self.check_fax();
                }
                if self.det_cont {
                    self.check_cont();
                }
            } else {
                self.dtmf_tone = None;
                self.dtmf_count = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use std::f64::consts::PI;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Synthesize `ms` milliseconds of summed sinusoids as mono PCM
    fn tone_pcm(freqs: &[f64], amplitude: f64, ms: usize) -> Vec<u8> {
        let n = ms * 8;
        let mut out = Vec::with_capacity(n * 2);
        for x in 0..n {
            let t = x as f64 / 8000.0;
            let v: f64 = freqs.iter().map(|f| amplitude * (2.0 * PI * f * t).sin()).sum();
            out.extend_from_slice(&(v as i16).to_le_bytes());
        }
        out
    }

    fn silence_pcm(ms: usize) -> Vec<u8> {
        vec![0u8; ms * 16]
    }

    fn drain(rx: &mut UnboundedReceiver<EventMessage>) -> Vec<EventMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_dtmf_digit_five() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/dtmf", tx);
        consumer.consume(&tone_pcm(&[770.0, 1336.0], 7500.0, 200));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1, "expected exactly one event");
        let msg = &events[0];
        assert_eq!(msg.kind, "chan.masquerade");
        assert_eq!(msg.get("id"), Some("test/1"));
        assert_eq!(msg.get("message"), Some("chan.dtmf"));
        assert_eq!(msg.get("text"), Some("5"));
        assert_eq!(msg.get("detected"), Some("inband"));
    }

    #[test]
    fn test_dtmf_reemits_after_gap() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/dtmf", tx);
        let digit = tone_pcm(&[697.0, 1209.0], 7500.0, 120);
        consumer.consume(&digit);
        consumer.consume(&silence_pcm(40));
        consumer.consume(&digit);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|m| m.get("text") == Some("1")));
    }

    #[test]
    fn test_silence_produces_nothing() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/*", tx);
        consumer.consume(&silence_pcm(1000));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_under_energy_produces_nothing() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/dtmf", tx);
        // well formed DTMF but below the absolute energy threshold
        consumer.consume(&tone_pcm(&[770.0, 1336.0], 100.0, 200));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_fax_cng_one_shot() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/fax", tx);
        consumer.consume(&tone_pcm(&[1100.0], 15000.0, 500));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let msg = &events[0];
        assert_eq!(msg.kind, "chan.masquerade");
        assert_eq!(msg.get("message"), Some("call.fax"));
        assert_eq!(msg.get("detected"), Some("inband"));
        // no further fax event from the same consumer for any input
        consumer.consume(&tone_pcm(&[1100.0], 15000.0, 500));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_fax_divert() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/fax", tx);
        let setup = EventMessage::new("chan.attach")
            .param("notify", "peer/1")
            .param("fax_divert", "fax/queue")
            .param("caller", "2001")
            .param("called", "2002");
        consumer.set_fax_divert(&setup);
        consumer.consume(&tone_pcm(&[1100.0], 15000.0, 500));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let msg = &events[0];
        assert_eq!(msg.get("message"), Some("call.execute"));
        assert_eq!(msg.get("callto"), Some("fax/queue"));
        assert_eq!(msg.get("reason"), Some("fax"));
        assert_eq!(msg.get("caller"), Some("2001"));
        assert_eq!(msg.get("called"), Some("2002"));
    }

    #[test]
    fn test_ced_detection_with_rfax() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/rfax", tx);
        consumer.consume(&tone_pcm(&[2100.0], 15000.0, 500));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("message"), Some("call.fax"));
    }

    #[test]
    fn test_continuity_verified() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/cotv", tx);
        consumer.consume(&tone_pcm(&[2010.0], 15000.0, 500));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let msg = &events[0];
        assert_eq!(msg.get("message"), Some("chan.dtmf"));
        assert_eq!(msg.get("text"), Some("O"));
        // continuity detection disarms after the event
        consumer.consume(&tone_pcm(&[2010.0], 15000.0, 500));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_continuity_send() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/cots", tx);
        consumer.consume(&tone_pcm(&[1780.0], 15000.0, 500));
        assert_eq!(drain(&mut rx).len(), 1);
        // the verified tone must not trip the send detector
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/2", "tone/mono/cots", tx);
        consumer.consume(&tone_pcm(&[2010.0], 15000.0, 500));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_dnis_setup() {
        let (tx, mut rx) = event_channel();
        let mut consumer = ToneConsumer::new("test/1", "tone/mono/callsetup", tx);
        for digit in "*123*4567*".chars() {
            let (high, low) = crate::tones::cadence::dtmf_frequencies(digit).unwrap();
            consumer.consume(&tone_pcm(&[low as f64, high as f64], 7500.0, 120));
            consumer.consume(&silence_pcm(40));
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1, "expected exactly one setup event");
        let msg = &events[0];
        assert_eq!(msg.kind, "chan.notify");
        assert_eq!(msg.get("operation"), Some("setup"));
        assert_eq!(msg.get("caller"), Some("123"));
        assert_eq!(msg.get("called"), Some("4567"));
    }

    #[test]
    fn test_stereo_channel_selection() {
        let (tx, mut rx) = event_channel();
        let mut left = ToneConsumer::new("test/l", "tone/left/dtmf", tx);
        let (tx, mut rx_r) = event_channel();
        let mut right = ToneConsumer::new("test/r", "tone/right/dtmf", tx);
        // tone on the left channel, silence on the right
        let mono = tone_pcm(&[770.0, 1336.0], 7500.0, 200);
        let mut stereo = Vec::with_capacity(mono.len() * 2);
        for pair in mono.chunks_exact(2) {
            stereo.extend_from_slice(pair);
            stereo.extend_from_slice(&[0, 0]);
        }
        left.consume(&stereo);
        right.consume(&stereo);
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(drain(&mut rx_r).is_empty());
    }

    #[test]
    fn test_name_selects_mode_and_filters() {
        let (tx, _rx) = event_channel();
        let consumer = ToneConsumer::new("x", "tone/mixed/fax,dtmf", tx.clone());
        assert_eq!(consumer.mode, ChannelMode::Mixed);
        assert!(consumer.det_fax);
        assert!(consumer.det_dtmf);
        assert!(!consumer.det_cont);
        assert!(!consumer.det_dnis);
        // defaults with a bare or starred name
        let consumer = ToneConsumer::new("x", "tone/mono/*", tx.clone());
        assert!(consumer.det_fax && consumer.det_dtmf);
        assert!(!consumer.det_cont && !consumer.det_dnis);
        let consumer = ToneConsumer::new("x", "tone/", tx);
        assert_eq!(consumer.mode, ChannelMode::Mono);
        assert!(consumer.det_fax && consumer.det_dtmf);
    }

    #[test]
    fn test_dnis_matcher() {
        assert_eq!(parse_dnis("*123*4567*"), Some(("123", "4567")));
        assert_eq!(parse_dnis("***"), Some(("", "")));
        assert_eq!(parse_dnis("*12#*34*"), Some(("12#", "34")));
        assert_eq!(parse_dnis("*123*"), None);
        assert_eq!(parse_dnis("123*456*"), None);
        assert_eq!(parse_dnis("*1*2*3*"), None);
    }
}
