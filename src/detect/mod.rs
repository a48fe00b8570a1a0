//! Inband tone detection: filter bank and per-stream consumers

pub mod consumer;
pub mod filter;

pub use consumer::ToneConsumer;
pub use filter::{BandFilter, FilterParams};
