//! # Engine Error Types
//!
//! Error types for engine operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Engine Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Resolution    │  │    Network      │  │     Settings            │ │
//! │  │ (ConsentError)  │  │                 │  │                         │ │
//! │  │  NoIdentities   │  │  Api            │  │  InvalidSettings        │ │
//! │  │  NoPurposes     │  │  (operation,    │  │  SettingsLoadFailed     │ │
//! │  │  NoJurisdiction │  │   message)      │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │    Internal     │   Storage failures never appear here: the        │
//! │  │  ChannelError   │   cache backends absorb them.                    │
//! │  │  Internal       │                                                   │
//! │  └─────────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `EngineError` is `Clone`: one in-flight consent fetch is shared by every
//! caller waiting on it, and each of them receives the same result.

use consent_core::ConsentError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error type covering all engine failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    // =========================================================================
    // Resolution Errors
    // =========================================================================
    /// A named consent resolution failure.
    #[error(transparent)]
    Consent(#[from] ConsentError),

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// The consent API rejected or failed a call.
    #[error("Consent API {operation} failed: {message}")]
    Api { operation: String, message: String },

    // =========================================================================
    // Settings Errors
    // =========================================================================
    /// Engine settings failed validation.
    #[error("Invalid engine settings: {0}")]
    InvalidSettings(String),

    /// Engine settings file could not be read or parsed.
    #[error("Failed to load settings: {0}")]
    SettingsLoadFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Creates an Api error.
    pub fn api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Api {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns the underlying consent error, if any.
    pub fn as_consent_error(&self) -> Option<&ConsentError> {
        match self {
            EngineError::Consent(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if the consent API failed.
    ///
    /// Nothing in the engine retries these; the next call refetches.
    pub fn is_network_error(&self) -> bool {
        matches!(self, EngineError::Api { .. })
    }

    /// Returns true for missing identities, purposes, environment,
    /// jurisdiction or location.
    pub fn is_resolution_error(&self) -> bool {
        self.as_consent_error()
            .is_some_and(ConsentError::is_resolution_error)
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidSettings(_)
                | EngineError::SettingsLoadFailed(_)
                | EngineError::Consent(ConsentError::InvalidConfiguration(_))
        )
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::SettingsLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::SettingsLoadFailed(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert!(EngineError::api("getConsent", "503").is_network_error());
        assert!(!EngineError::api("getConsent", "503").is_resolution_error());

        let no_ids: EngineError = ConsentError::NoIdentities.into();
        assert!(no_ids.is_resolution_error());
        assert_eq!(no_ids.as_consent_error(), Some(&ConsentError::NoIdentities));

        let invalid: EngineError = ConsentError::InvalidConfiguration("org".into()).into();
        assert!(invalid.is_config_error());
        assert!(!invalid.is_resolution_error());
    }

    #[test]
    fn test_display_is_transparent_for_consent_errors() {
        let err: EngineError = ConsentError::EmptyConsent.into();
        assert_eq!(err.to_string(), "empty consent");
        assert_eq!(
            EngineError::api("setConsent", "timeout").to_string(),
            "Consent API setConsent failed: timeout"
        );
    }
}
