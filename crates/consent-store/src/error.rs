//! # Storage Error Types
//!
//! Error types for storage backends.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  StorageArea (quota, unavailable)                                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← Adds key and backend context               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Cacher backend ← logs at warn! and reports a miss / failed write      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  CacheChain tries the next backend                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `StoreError` never reaches engine code.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The value does not fit in the storage area.
    ///
    /// ## When This Occurs
    /// - Cookie value over the 4096 byte limit
    /// - localStorage quota exhausted
    #[error("Quota exceeded for '{key}': {size} bytes (limit {limit})")]
    QuotaExceeded {
        key: String,
        size: usize,
        limit: usize,
    },

    /// A stored value could not be decoded.
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// A value could not be (de)serialized as JSON.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The storage area cannot be used (disabled, private mode, ...).
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Creates a QuotaExceeded error.
    pub fn quota(key: impl Into<String>, size: usize, limit: usize) -> Self {
        StoreError::QuotaExceeded {
            key: key.into(),
            size,
            limit,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for StoreError {
    fn from(err: base64::DecodeError) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for StoreError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_message() {
        let err = StoreError::quota("_swb_consent_", 5000, 4096);
        assert_eq!(
            err.to_string(),
            "Quota exceeded for '_swb_consent_': 5000 bytes (limit 4096)"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let err: StoreError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
