//! Tonewire - In-band Telephony Tone Engine
//!
//! A tone generation and detection engine for 8 kHz 16-bit PCM telephony
//! media streams: cadenced call-progress and DTMF tone sources, and inband
//! detectors for DTMF digits, fax CNG/CED tones and continuity test tones.

pub mod audio;
pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod tones;
pub mod utils;

pub use error::{Error, Result};

/// Engine version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
