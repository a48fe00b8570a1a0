//! Configuration management for the tone engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Tone sets applied to the registry at startup
    #[serde(default)]
    pub tones: Vec<ToneSetConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Language tried when a tone request carries no usable prefix
    pub default_language: Option<String>,
    /// Divert target applied to consumers that detect a fax call
    pub fax_divert: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
    Full,
}

/// One `(language, name -> description)` set of cadence registrations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToneSetConfig {
    /// Absent or equal to the implicit default registers language
    /// independent tones
    pub language: Option<String>,
    /// Cadence descriptions by tone name
    #[serde(default)]
    pub tones: BTreeMap<String, String>,
}

impl EngineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("TONEWIRE").separator("_"))
            .build()?;
        let engine_config = settings.try_deserialize()?;
        Ok(engine_config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::internal(format!("Serialize: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(Error::parse(format!("Invalid log level '{}'", other))),
        }
        for set in &self.tones {
            if let Some(lang) = &set.language {
                if lang.contains('/') || lang.contains(',') {
                    return Err(Error::parse(format!("Invalid tone language '{}'", lang)));
                }
            }
            for name in set.tones.keys() {
                if name.trim().is_empty() {
                    return Err(Error::parse("Empty tone name"));
                }
            }
        }
        Ok(())
    }
}
