//! # consent-core: Pure Consent Logic
//!
//! This crate holds every consent decision the tag makes as pure functions
//! with zero I/O dependencies: request building, cache validity, response
//! normalization, merging, default grants, experience selection and page
//! resolution.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Consent Tag Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Host Page / Native Shell                     │   │
//! │  │    plugins ──► listeners ──► native bridge ──► experiences      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                consent-engine (async orchestration)             │   │
//! │  │    cells, events, single-flight fetch, identity collection      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ consent-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  consent  │  │experience │  │  resolve  │  │   │
//! │  │   │  Consent  │  │  requests │  │ selection │  │ env/juris │  │   │
//! │  │   │  Config   │  │  merging  │  │  banner/  │  │  region   │  │   │
//! │  │   │ protocol  │  │  defaults │  │  modal    │  │ identity  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO STORAGE • NO NETWORK • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                consent-store (cookie / local / session)         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Consent, Configuration, identity descriptors
//! - [`protocol`] - Consent API request/response shapes
//! - [`consent`] - Request building, cache decisions, merge rules
//! - [`experience`] - Which experience to show, and how
//! - [`resolve`] - Environment, jurisdiction and region resolution
//! - [`identity`] - Identity value decoding
//! - [`path`] - Property-path lookups over JSON snapshots
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use consent_core::consent::{apply_provisional, merge_missing};
//! use consent_core::Consent;
//!
//! let mut current = Consent::new().with_purpose("analytics", false);
//! let provisional = Consent::new().with_purpose("analytics", true);
//!
//! // Staged values override the fetched ones.
//! assert!(apply_provisional(&mut current, &provisional));
//! assert_eq!(current.allowed("analytics"), Some(true));
//!
//! // Older values only fill gaps.
//! let older = Consent::new()
//!     .with_purpose("analytics", false)
//!     .with_purpose("ads", false);
//! merge_missing(&mut current, &older);
//! assert_eq!(current.allowed("analytics"), Some(true));
//! assert_eq!(current.allowed("ads"), Some(false));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod consent;
pub mod error;
pub mod experience;
pub mod identity;
pub mod path;
pub mod protocol;
pub mod resolve;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{ConsentError, CoreResult};
pub use experience::{ConsentExperienceType, ExperienceClosedReason, ExperienceType};
pub use resolve::PageContext;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Query parameter forcing an experience to show.
pub const SHOW_PARAMETER: &str = "swb_show";

/// Value of [`SHOW_PARAMETER`] selecting the preference experience.
pub const PREFERENCES_SHOW_VALUE: &str = "preferences";

/// Query parameter overriding the environment.
pub const ENV_PARAMETER: &str = "swb_env";

/// Query parameter overriding the visitor region.
pub const REGION_PARAMETER: &str = "swb_region";

/// Query parameter overriding the jurisdiction.
pub const JURISDICTION_PARAMETER: &str = "swb_p";

/// Environment used when nothing else matches.
pub const PRODUCTION_ENVIRONMENT: &str = "production";

/// Cached consent lifetime.
///
/// A server-backed record older than this is refetched.
pub const DEFAULT_CACHE_TTL_SECS: i64 = 300;

/// Storage key of the cached consent record.
pub const CONSENT_CACHE_KEY: &str = "_swb_consent_";

/// Storage key of the public consent map read by other scripts.
pub const PUBLIC_CONSENT_KEY: &str = "_ketch_consent_v1_";
