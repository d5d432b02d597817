//! # Cache Chain
//!
//! Composes backends into a single [`Cacher`].
//!
//! ## Chain Semantics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  get_item:     cookie ──miss──► localStorage ──miss──► sessionStorage   │
//! │                  │hit               │hit                   │hit/miss    │
//! │                  ▼                  ▼                      ▼            │
//! │               return             return              return / None     │
//! │                                                                         │
//! │  set_item:     cookie ──fail──► localStorage ──fail──► sessionStorage   │
//! │                  │ok+verified       │ok+verified            │           │
//! │                  ▼                  ▼                       ▼           │
//! │                 true               true              true / false      │
//! │                                                                         │
//! │  A write counts only if reading it back returns an equal value.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::area::StorageArea;
use crate::cacher::{Cacher, CookieCacher, StorageCacher};

/// Backends queried in priority order.
#[derive(Clone, Default)]
pub struct CacheChain {
    backends: Vec<Arc<dyn Cacher>>,
}

impl CacheChain {
    pub fn new(backends: Vec<Arc<dyn Cacher>>) -> Self {
        CacheChain { backends }
    }

    /// The standard chain: cookie, then localStorage, then sessionStorage.
    pub fn standard(
        cookies: Arc<dyn StorageArea>,
        local: Arc<dyn StorageArea>,
        session: Arc<dyn StorageArea>,
    ) -> Self {
        CacheChain::new(vec![
            Arc::new(CookieCacher::new(cookies)),
            Arc::new(StorageCacher::local(local)),
            Arc::new(StorageCacher::session(session)),
        ])
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[async_trait]
impl Cacher for CacheChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn get_item(&self, key: &str) -> Option<Value> {
        for backend in &self.backends {
            if let Some(value) = backend.get_item(key).await {
                debug!(backend = backend.name(), key, "Cache hit");
                return Some(value);
            }
        }
        None
    }

    async fn set_item(&self, key: &str, value: &Value) -> bool {
        for backend in &self.backends {
            if !backend.set_item(key, value).await {
                continue;
            }
            if backend.get_item(key).await.as_ref() == Some(value) {
                debug!(backend = backend.name(), key, "Cache write verified");
                return true;
            }
            warn!(backend = backend.name(), key, "Cache write did not read back");
        }
        false
    }

    /// Removes `key` from every backend. True if any backend succeeded.
    async fn remove_item(&self, key: &str) -> bool {
        let mut removed = false;
        for backend in &self.backends {
            removed |= backend.remove_item(key).await;
        }
        removed
    }
}
