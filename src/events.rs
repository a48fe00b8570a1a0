//! Structured event messages emitted towards the engine message bus
//!
//! Detection results leave the engine as [`EventMessage`] values pushed into
//! an injected sink channel. A message carries a string kind, string-keyed
//! parameters and a UTC timestamp; the surrounding engine routes it from
//! there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Channel end the engine pushes events into
pub type EventSink = mpsc::UnboundedSender<EventMessage>;

/// Build an event channel pair
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<EventMessage>) {
    mpsc::unbounded_channel()
}

/// One structured message for the external bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub kind: String,
    pub params: Vec<(String, String)>,
    pub time: DateTime<Utc>,
}

impl EventMessage {
    pub fn new<S: Into<String>>(kind: S) -> Self {
        Self {
            kind: kind.into(),
            params: Vec::new(),
            time: Utc::now(),
        }
    }

    /// Append a parameter
    pub fn param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Append a parameter only when the value is present and non-empty
    pub fn param_opt<K: Into<String>>(mut self, key: K, value: Option<&str>) -> Self {
        if let Some(v) = value {
            if !v.is_empty() {
                self.params.push((key.into(), v.to_string()));
            }
        }
        self
    }

    /// First value stored under a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
