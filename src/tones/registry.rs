//! Tone registry: named cadences keyed by language
//!
//! The registry holds two tables: a default, language-independent one and a
//! localized one keyed by `lang/name`. Lookups canonicalize the requested
//! name (trim, lowercase, alias expansion, language prefix) so callers can
//! use the rewritten name as a deduplication key. Registration replaces any
//! prior entry under the same canonical key.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::audio::WaveformCache;
use crate::config::ToneSetConfig;
use crate::tones::cadence::{self, Cadence, ToneDesc};
use crate::Result;

/// The implicit default language; tones registered under it land in the
/// default table, and requests with this prefix resolve only against it
pub const DEFAULT_LANG: &str = "itu";

#[derive(Default)]
struct Tables {
    /// Language-independent entries, keyed by canonical name
    defaults: HashMap<String, Arc<ToneDesc>>,
    /// Localized entries, keyed by `lang/name`
    localized: HashMap<String, Arc<ToneDesc>>,
}

/// Registry of named cadences with language-aware lookup
pub struct ToneRegistry {
    cache: Arc<WaveformCache>,
    tables: RwLock<Tables>,
    /// Built-in oneshot table: DTMF digits, call waiting and the defaults
    oneshot: Vec<Arc<ToneDesc>>,
    /// Configured default language, tried before the default table
    default_lang: RwLock<Option<String>>,
}

impl ToneRegistry {
    /// Build a registry preloaded with the built-in tone set
    pub fn new(cache: Arc<WaveformCache>) -> Self {
        let mut tables = Tables::default();
        for desc in cadence::default_tone_set(&cache) {
            tables.defaults.insert(desc.name().to_string(), desc);
        }
        let oneshot = cadence::oneshot_tone_set(&cache);
        Self {
            cache,
            tables: RwLock::new(tables),
            oneshot,
            default_lang: RwLock::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<WaveformCache> {
        &self.cache
    }

    /// Set the language tried when a request carries no usable prefix
    pub fn set_default_lang(&self, lang: Option<String>) {
        let lang = lang.filter(|l| !l.is_empty() && l != DEFAULT_LANG);
        *self.default_lang.write().unwrap() = lang;
    }

    /// Register a cadence under a name and optional language. Replaces any
    /// prior entry with the same canonical key.
    pub fn register(&self, language: Option<&str>, name: &str, desc: &str) -> Result<()> {
        let cadence = Cadence::parse(desc, &self.cache)?;
        let lang = language.unwrap_or("");
        let mut tables = self.tables.write().unwrap();
        let (prefix, table) = if lang.is_empty() || lang == DEFAULT_LANG {
            (String::new(), &mut tables.defaults)
        } else {
            (format!("{}/", lang), &mut tables.localized)
        };
        let tone = Arc::new(ToneDesc::new(cadence, name, &prefix));
        let key = tone.name().to_string();
        if table.insert(key.clone(), tone).is_some() {
            info!("Replacing tone '{}'", key);
        } else {
            debug!("Registered tone '{}'", key);
        }
        Ok(())
    }

    /// Apply a list of configured tone sets. Invalid entries are logged and
    /// skipped; the rest of the load continues.
    pub fn load(&self, sets: &[ToneSetConfig]) {
        for set in sets {
            for (name, desc) in &set.tones {
                if let Err(e) = self.register(set.language.as_deref(), name, desc) {
                    warn!(
                        "Invalid tone description '{}' for '{}' (lang '{}'): {}",
                        desc,
                        name,
                        set.language.as_deref().unwrap_or(""),
                        e
                    );
                }
            }
        }
    }

    fn find_default(&self, name: &mut String) -> Option<Arc<ToneDesc>> {
        let tables = self.tables.read().unwrap();
        for desc in tables.defaults.values() {
            if desc.is_name(name) {
                return Some(desc.clone());
            }
        }
        None
    }

    fn find_localized(&self, name: &mut String, prefix: &str) -> Option<Arc<ToneDesc>> {
        let mut prefixed = format!("{}/{}", prefix, name);
        let tables = self.tables.read().unwrap();
        for desc in tables.localized.values() {
            if desc.is_name(&mut prefixed) {
                *name = prefixed;
                return Some(desc.clone());
            }
        }
        None
    }

    fn find_oneshot(&self, name: &mut String) -> Option<Arc<ToneDesc>> {
        for desc in &self.oneshot {
            if desc.is_name(name) {
                return Some(desc.clone());
            }
        }
        None
    }

    /// Resolve a tone request against the tables.
    ///
    /// Lookup order: explicit language prefix, configured default language,
    /// default table, then (when `oneshot`) the built-in oneshot table. The
    /// request is rewritten in place to its canonical name when resolution
    /// succeeds, so the caller can use it as a deduplication key.
    pub fn resolve(&self, request: &mut String, prefix: &str, oneshot: bool) -> Option<Arc<ToneDesc>> {
        let trimmed = request.trim().to_lowercase();
        if trimmed.is_empty() {
            return None;
        }
        *request = trimmed;
        if prefix == DEFAULT_LANG {
            // default tone explicitly required
            let found = self.find_default(request);
            if found.is_none() && oneshot {
                return self.find_oneshot(request);
            }
            return found;
        }
        let mut found = None;
        if !prefix.is_empty() {
            found = self.find_localized(request, prefix);
        }
        if found.is_none() {
            let lang = self.default_lang.read().unwrap().clone();
            if let Some(lang) = lang {
                if lang != prefix {
                    found = self.find_localized(request, &lang);
                }
            }
        }
        if found.is_none() {
            found = self.find_default(request);
        }
        if found.is_some() {
            return found;
        }
        if oneshot {
            return self.find_oneshot(request);
        }
        None
    }
}
