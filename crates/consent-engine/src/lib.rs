//! # consent-engine: Consent Resolution and Synchronization
//!
//! The async side of the consent tag. It owns the lazily resolved state
//! cells, the event bus, identity collection and the single-flight consent
//! fetch, and it drives the pure decisions in `consent-core`.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  IdentityWatcher ──► set_identities ──► identities cell ──┐             │
//! │                            │                              │             │
//! │                            ▼                              ▼             │
//! │  get_consent ──► fetch_consent ──► ConsentCache      EventBus ──► page  │
//! │       │               │               ▲               ▲   │   listeners │
//! │       │               ▼               │               │   └──► native   │
//! │       │          ConsentApi ──────────┘               │       bridge    │
//! │       ▼                                               │                 │
//! │  consent cell ────────────────────────────────────────┘                 │
//! │       │                                                                 │
//! │       └──► showConsentExperience / showPreferenceExperience ──► plugins │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - `ConsentEngine` and its builder
//! - [`cell`] - Single-slot async value holder
//! - [`events`] - Named pub/sub with native forwarding
//! - [`bridge`] - Native app shell integration
//! - [`identity`] - Identity sources and watchers
//! - [`api`] - Consent service trait and in-memory implementation
//! - [`plugin`] - Plugin registration
//! - [`config`] - Engine settings
//! - [`error`] - Engine error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use consent_engine::{ConsentEngineBuilder, MemoryConsentApi};
//! use consent_core::Configuration;
//!
//! # async fn example(config: Configuration) -> consent_engine::EngineResult<()> {
//! let engine = ConsentEngineBuilder::new(config)
//!     .with_api(Arc::new(MemoryConsentApi::new()))
//!     .build()?;
//!
//! let consent = engine.get_consent().await?;
//! println!("analytics allowed: {:?}", consent.allowed("analytics"));
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod bridge;
pub mod cell;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod plugin;

pub use api::{ConsentApi, MemoryConsentApi};
pub use bridge::{HandlerBridge, NativeBridge, RecordingBridge};
pub use cell::FutureCell;
pub use config::EngineSettings;
pub use engine::{ConsentEngine, ConsentEngineBuilder, HostBindings};
pub use error::{EngineError, EngineResult};
pub use events::{names, Event, EventBus, Listener};
pub use identity::{IdentitySource, IdentityWatcher, PollingWatcher, SnapshotSource, StaticWatcher};
pub use plugin::{Plugin, PluginHooks};
