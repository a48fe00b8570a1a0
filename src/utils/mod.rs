//! Utility helpers

pub mod logger;

pub use logger::setup_logging;
