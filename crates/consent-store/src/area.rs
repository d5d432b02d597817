//! # Storage Areas
//!
//! A storage area is the raw string key/value surface behind a backend:
//! the document cookie jar, `localStorage` or `sessionStorage`. Hosts
//! implement [`StorageArea`] over the real page objects; [`MemoryStorage`]
//! serves tests and the shell.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{StoreError, StoreResult};

/// Synchronous string storage, as the page exposes it.
pub trait StorageArea: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    fn remove(&self, key: &str) -> StoreResult<()>;
}

/// In-memory storage area with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
    disabled: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects writes that would push the total stored bytes past `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        MemoryStorage {
            quota: Some(bytes),
            ..Default::default()
        }
    }

    /// An area that fails every operation, like storage blocked by the
    /// browser.
    pub fn disabled() -> Self {
        MemoryStorage {
            disabled: true,
            ..Default::default()
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        if self.disabled {
            return Err(StoreError::Unavailable("storage disabled".into()));
        }
        self.items
            .lock()
            .map_err(|_| StoreError::Unavailable("storage lock poisoned".into()))
    }
}

impl StorageArea for MemoryStorage {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut items = self.lock()?;

        if let Some(limit) = self.quota {
            let others: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let size = others + key.len() + value.len();
            if size > limit {
                return Err(StoreError::quota(key, size, limit));
            }
        }

        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
