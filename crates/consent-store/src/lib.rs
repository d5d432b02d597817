//! # consent-store: Cache Chain for the Consent Tag
//!
//! This crate persists consent on the visitor's device through an ordered
//! chain of storage backends.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Consent Data Flow                                │
//! │                                                                         │
//! │  ConsentEngine::fetch_consent / update_consent                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   consent-store (THIS CRATE)                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │ ConsentCache  │    │  CacheChain   │    │   Backends   │  │   │
//! │  │   │  (cache.rs)   │    │  (chain.rs)   │    │ (cacher.rs)  │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ cached record │───►│ priority read │───►│ cookie       │  │   │
//! │  │   │ public map    │    │ verified write│    │ localStorage │  │   │
//! │  │   │               │    │               │    │ session      │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────┬───────┘  │   │
//! │  │                                                     │          │   │
//! │  └─────────────────────────────────────────────────────┼──────────┘   │
//! │                                                        ▼              │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │          StorageArea (document.cookie, Storage objects)         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`area`] - Raw string storage areas
//! - [`cacher`] - The `Cacher` contract and its backends
//! - [`chain`] - Priority-ordered chain of backends
//! - [`cache`] - Cached consent record and public consent map
//! - [`error`] - Storage error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use consent_store::{CacheChain, ConsentCache, MemoryStorage};
//!
//! let chain = CacheChain::standard(
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(MemoryStorage::new()),
//! );
//! let cache = ConsentCache::new(Arc::new(chain));
//! let record = cache.get_cached_consent(&request).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod area;
pub mod cache;
pub mod cacher;
pub mod chain;
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

pub use area::{MemoryStorage, StorageArea};
pub use cache::ConsentCache;
pub use cacher::{Cacher, CookieCacher, StorageCacher};
pub use chain::CacheChain;
pub use error::{StoreError, StoreResult};
