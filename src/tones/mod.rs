//! Cadenced tone definitions, the tone registry and paced tone sources

pub mod cadence;
pub mod registry;
pub mod source;

pub use cadence::{Cadence, Segment, ToneDesc};
pub use registry::{ToneRegistry, DEFAULT_LANG};
pub use source::{SourcePool, ToneSource};
