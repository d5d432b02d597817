//! # Engine Settings
//!
//! Tunables for the consent engine, separate from the property
//! `Configuration` the engine resolves consent for.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Property options (highest priority)                                │
//! │     Configuration.options: migration, maxListeners, watcherInterval,   │
//! │     watcherTimeout, cacheTtl                                           │
//! │                                                                         │
//! │  2. Environment Variables                                              │
//! │     CONSENT_CACHE_TTL=300                                              │
//! │     CONSENT_MAX_LISTENERS=20                                           │
//! │                                                                         │
//! │  3. TOML Config File                                                   │
//! │     ~/.config/consent-tag/consent.toml (Linux)                         │
//! │     ~/Library/Application Support/com.consent.tag/consent.toml (macOS) │
//! │                                                                         │
//! │  4. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # consent.toml
//! cache_ttl_secs = 300
//! cache_key = "_swb_consent_"
//! public_cache_key = "_ketch_consent_v1_"
//! watcher_interval_ms = 2000
//! watcher_timeout_ms = 10000
//! max_listeners = 20
//! show_parameter = "swb_show"
//! migration = "3"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use consent_core::{
    CONSENT_CACHE_KEY, DEFAULT_CACHE_TTL_SECS, PUBLIC_CONSENT_KEY, SHOW_PARAMETER,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Option keys read from `Configuration.options`.
pub mod option_keys {
    pub const MIGRATION: &str = "migration";
    pub const MAX_LISTENERS: &str = "maxListeners";
    pub const WATCHER_INTERVAL: &str = "watcherInterval";
    pub const WATCHER_TIMEOUT: &str = "watcherTimeout";
    pub const CACHE_TTL: &str = "cacheTtl";
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Cached consent older than this is refetched.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: i64,

    /// Cache key of the consent record.
    #[serde(default = "default_cache_key")]
    pub cache_key: String,

    /// Cache key of the public consent map.
    #[serde(default = "default_public_cache_key")]
    pub public_cache_key: String,

    /// Polling interval of the identity watcher (milliseconds).
    #[serde(default = "default_watcher_interval")]
    pub watcher_interval_ms: u64,

    /// The identity watcher stops polling after this long (milliseconds).
    #[serde(default = "default_watcher_timeout")]
    pub watcher_timeout_ms: u64,

    /// Listener count per event above which a warning is logged.
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,

    /// Query parameter forcing an experience.
    #[serde(default = "default_show_parameter")]
    pub show_parameter: String,

    /// Migration option forwarded on set-consent requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<String>,
}

fn default_cache_ttl() -> i64 {
    DEFAULT_CACHE_TTL_SECS
}
fn default_cache_key() -> String {
    CONSENT_CACHE_KEY.to_string()
}
fn default_public_cache_key() -> String {
    PUBLIC_CONSENT_KEY.to_string()
}
fn default_watcher_interval() -> u64 {
    2000
}
fn default_watcher_timeout() -> u64 {
    10_000
}
fn default_max_listeners() -> usize {
    20
}
fn default_show_parameter() -> String {
    SHOW_PARAMETER.to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            cache_ttl_secs: default_cache_ttl(),
            cache_key: default_cache_key(),
            public_cache_key: default_public_cache_key(),
            watcher_interval_ms: default_watcher_interval(),
            watcher_timeout_ms: default_watcher_timeout(),
            max_listeners: default_max_listeners(),
            show_parameter: default_show_parameter(),
            migration: None,
        }
    }
}

impl EngineSettings {
    /// Loads settings from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (consent.toml)
    /// 3. Environment variables
    ///
    /// Property options are applied separately by the engine builder.
    pub fn load(config_path: Option<PathBuf>) -> EngineResult<Self> {
        let mut settings = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine settings from file");
                let contents = std::fs::read_to_string(&path)?;
                settings = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Settings file not found, using defaults");
            }
        }

        settings.apply_env_overrides();
        settings.validate()?;

        Ok(settings)
    }

    /// Loads settings or returns defaults if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine settings: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Validates the settings.
    pub fn validate(&self) -> EngineResult<()> {
        if self.cache_ttl_secs < 0 {
            return Err(EngineError::InvalidSettings(
                "cache_ttl_secs must not be negative".into(),
            ));
        }

        if self.cache_key.is_empty() || self.public_cache_key.is_empty() {
            return Err(EngineError::InvalidSettings("cache keys must not be empty".into()));
        }

        if self.cache_key == self.public_cache_key {
            return Err(EngineError::InvalidSettings(format!(
                "cache_key and public_cache_key must differ, both are '{}'",
                self.cache_key
            )));
        }

        if self.watcher_interval_ms == 0 {
            return Err(EngineError::InvalidSettings(
                "watcher_interval_ms must be greater than 0".into(),
            ));
        }

        if self.max_listeners == 0 {
            return Err(EngineError::InvalidSettings(
                "max_listeners must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies per-property overrides from `Configuration.options`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_options(&mut self, options: &BTreeMap<String, String>) {
        if let Some(migration) = options.get(option_keys::MIGRATION) {
            self.migration = Some(migration.clone()).filter(|m| !m.is_empty());
        }

        parse_option(options, option_keys::MAX_LISTENERS, &mut self.max_listeners);
        parse_option(options, option_keys::WATCHER_INTERVAL, &mut self.watcher_interval_ms);
        parse_option(options, option_keys::WATCHER_TIMEOUT, &mut self.watcher_timeout_ms);
        parse_option(options, option_keys::CACHE_TTL, &mut self.cache_ttl_secs);
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(ttl) = std::env::var("CONSENT_CACHE_TTL") {
            if let Ok(t) = ttl.parse() {
                debug!(ttl = t, "Overriding cache TTL from environment");
                self.cache_ttl_secs = t;
            }
        }

        if let Ok(key) = std::env::var("CONSENT_CACHE_KEY") {
            self.cache_key = key;
        }

        if let Ok(key) = std::env::var("CONSENT_PUBLIC_CACHE_KEY") {
            self.public_cache_key = key;
        }

        if let Ok(interval) = std::env::var("CONSENT_WATCHER_INTERVAL_MS") {
            if let Ok(i) = interval.parse() {
                self.watcher_interval_ms = i;
            }
        }

        if let Ok(timeout) = std::env::var("CONSENT_WATCHER_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse() {
                self.watcher_timeout_ms = t;
            }
        }

        if let Ok(max) = std::env::var("CONSENT_MAX_LISTENERS") {
            if let Ok(m) = max.parse() {
                self.max_listeners = m;
            }
        }

        if let Ok(migration) = std::env::var("CONSENT_MIGRATION") {
            debug!(migration = %migration, "Overriding migration option from environment");
            self.migration = Some(migration);
        }
    }

    /// Returns the default settings file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "consent", "tag")
            .map(|dirs| dirs.config_dir().join("consent.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn watcher_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_interval_ms)
    }

    pub fn watcher_timeout(&self) -> Duration {
        Duration::from_millis(self.watcher_timeout_ms)
    }
}

fn parse_option<T: std::str::FromStr>(
    options: &BTreeMap<String, String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = options.get(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparseable engine option"),
        }
    }
}
