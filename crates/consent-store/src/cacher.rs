//! # Cacher Backends
//!
//! The [`Cacher`] trait is the JSON-valued storage contract the engine
//! depends on. Each backend wraps one [`StorageArea`] and absorbs every
//! failure at its own boundary.
//!
//! ## Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Backend          Encoding              Limit        On failure         │
//! │  ───────────────  ────────────────────  ───────────  ────────────────── │
//! │  CookieCacher     base64(JSON)          4096 bytes   warn!, miss/false  │
//! │  StorageCacher    JSON                  area quota   warn!, miss/false  │
//! │   (local/session)                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Falsy values (`null`, `false`, `""`, `0`) read back as a miss.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, warn};

use crate::area::StorageArea;
use crate::error::{StoreError, StoreResult};

/// Largest encoded cookie value the cookie backend will write.
pub const MAX_COOKIE_BYTES: usize = 4096;

/// JSON-valued storage with absorbed failures.
#[async_trait]
pub trait Cacher: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Returns the stored value, `None` on a miss, a falsy value or any
    /// backend failure.
    async fn get_item(&self, key: &str) -> Option<Value>;

    /// Stores `value`. Returns false on any backend failure.
    async fn set_item(&self, key: &str, value: &Value) -> bool;

    /// Removes `key`. Returns false on any backend failure.
    async fn remove_item(&self, key: &str) -> bool;
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn absorb<T>(backend: &str, operation: &str, key: &str, result: StoreResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(backend, operation, key, error = %err, "Storage backend failure absorbed");
            None
        }
    }
}

// =============================================================================
// Cookie Backend
// =============================================================================

/// Cookie-backed cacher. Values are stored as base64-encoded JSON.
pub struct CookieCacher {
    area: Arc<dyn StorageArea>,
}

impl CookieCacher {
    pub fn new(area: Arc<dyn StorageArea>) -> Self {
        CookieCacher { area }
    }

    fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        let Some(raw) = self.area.get(key)? else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        let decoded = String::from_utf8(STANDARD.decode(raw.as_bytes())?)?;
        Ok(Some(serde_json::from_str(&decoded)?))
    }

    fn write(&self, key: &str, value: &Value) -> StoreResult<()> {
        let encoded = STANDARD.encode(serde_json::to_string(value)?);
        if encoded.len() > MAX_COOKIE_BYTES {
            return Err(StoreError::quota(key, encoded.len(), MAX_COOKIE_BYTES));
        }
        self.area.set(key, &encoded)
    }
}

#[async_trait]
impl Cacher for CookieCacher {
    fn name(&self) -> &str {
        "cookie"
    }

    async fn get_item(&self, key: &str) -> Option<Value> {
        absorb(self.name(), "get", key, self.read(key))
            .flatten()
            .filter(is_truthy)
    }

    async fn set_item(&self, key: &str, value: &Value) -> bool {
        absorb(self.name(), "set", key, self.write(key, value)).is_some()
    }

    async fn remove_item(&self, key: &str) -> bool {
        absorb(self.name(), "remove", key, self.area.remove(key)).is_some()
    }
}

// =============================================================================
// Web Storage Backends
// =============================================================================

/// Which web storage area a [`StorageCacher`] wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageKind {
    Local,
    Session,
}

/// `localStorage` / `sessionStorage` cacher. Values are stored as JSON.
pub struct StorageCacher {
    kind: StorageKind,
    area: Arc<dyn StorageArea>,
}

impl StorageCacher {
    pub fn local(area: Arc<dyn StorageArea>) -> Self {
        StorageCacher {
            kind: StorageKind::Local,
            area,
        }
    }

    pub fn session(area: Arc<dyn StorageArea>) -> Self {
        StorageCacher {
            kind: StorageKind::Session,
            area,
        }
    }

    fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        match self.area.get(key)? {
            Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_str(&raw)?)),
            _ => Ok(None),
        }
    }

    fn write(&self, key: &str, value: &Value) -> StoreResult<()> {
        self.area.set(key, &serde_json::to_string(value)?)
    }
}

#[async_trait]
impl Cacher for StorageCacher {
    fn name(&self) -> &str {
        match self.kind {
            StorageKind::Local => "localStorage",
            StorageKind::Session => "sessionStorage",
        }
    }

    async fn get_item(&self, key: &str) -> Option<Value> {
        let value = absorb(self.name(), "get", key, self.read(key))
            .flatten()
            .filter(is_truthy);
        debug!(backend = self.name(), key, hit = value.is_some(), "Storage read");
        value
    }

    async fn set_item(&self, key: &str, value: &Value) -> bool {
        absorb(self.name(), "set", key, self.write(key, value)).is_some()
    }

    async fn remove_item(&self, key: &str) -> bool {
        absorb(self.name(), "remove", key, self.area.remove(key)).is_some()
    }
}
