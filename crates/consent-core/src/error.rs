//! # Error Types
//!
//! Named failures for consent resolution.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  consent-core errors (this file)                                       │
//! │  └── ConsentError     - Resolution and validation failures             │
//! │                                                                         │
//! │  consent-store errors (separate crate)                                 │
//! │  └── StoreError       - Absorbed at the Cacher boundary                │
//! │                                                                         │
//! │  consent-engine errors (separate crate)                                │
//! │  └── EngineError      - ConsentError + API failures                    │
//! │                                                                         │
//! │  Flow: ConsentError → EngineError → bootstrap logs it and fails open   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. One variant per named failure, so callers can match on it
//! 3. Errors are `Clone` so a shared in-flight fetch can hand them out

use thiserror::Error;

// =============================================================================
// Consent Error
// =============================================================================

/// Consent resolution failures.
///
/// Resolution failures reject the enclosing operation. The bootstrap is
/// expected to log them and carry on without showing an experience.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsentError {
    /// Configuration is missing required organization/property identifiers.
    ///
    /// ## When This Occurs
    /// - Building an engine from a configuration without organization or property
    /// - Updating consent when environment or jurisdiction is unresolved
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An operation requiring identities was attempted with none known.
    #[error("no identities")]
    NoIdentities,

    /// Configuration lacks purposes or the scoping fields needed to fetch consent.
    #[error("no purposes")]
    NoPurposes,

    /// No environment could be resolved.
    #[error("no environment")]
    NoEnvironment,

    /// No jurisdiction could be resolved.
    ///
    /// ## Resolution Order
    /// ```text
    /// query override ─► explicit code ─► document attribute ─►
    /// data-layer variable ─► region table ─► default code ─► NoJurisdiction
    /// ```
    #[error("no jurisdiction")]
    NoJurisdiction,

    /// GeoIP lookup returned no usable location.
    #[error("unrecognized location")]
    UnrecognizedLocation,

    /// An update was attempted with a consent containing no purposes.
    #[error("empty consent")]
    EmptyConsent,

    /// Command routing: no such action on the engine surface.
    #[error("action not found: {0}")]
    ActionNotFound(String),

    /// Command routing: a callback argument was expected.
    #[error("expected function for {0}")]
    ExpectedFunction(String),
}

impl ConsentError {
    /// Returns true for failures caused by missing inputs (identities,
    /// purposes, environment, jurisdiction, location).
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            ConsentError::NoIdentities
                | ConsentError::NoPurposes
                | ConsentError::NoEnvironment
                | ConsentError::NoJurisdiction
                | ConsentError::UnrecognizedLocation
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with ConsentError.
pub type CoreResult<T> = Result<T, ConsentError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(ConsentError::NoIdentities.to_string(), "no identities");
        assert_eq!(
            ConsentError::InvalidConfiguration("missing property".into()).to_string(),
            "invalid configuration: missing property"
        );
        assert_eq!(
            ConsentError::ActionNotFound("frobnicate".into()).to_string(),
            "action not found: frobnicate"
        );
    }

    #[test]
    fn test_resolution_errors() {
        assert!(ConsentError::NoIdentities.is_resolution_error());
        assert!(ConsentError::NoJurisdiction.is_resolution_error());
        assert!(ConsentError::UnrecognizedLocation.is_resolution_error());

        assert!(!ConsentError::EmptyConsent.is_resolution_error());
        assert!(!ConsentError::InvalidConfiguration("x".into()).is_resolution_error());
    }
}
