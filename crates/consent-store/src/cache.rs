//! # Consent Cache
//!
//! Typed access to the two keys the tag keeps in the cache chain: the
//! cached consent record and the public consent map.
//!
//! ## Key Space
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  _swb_consent_        ConsentRecord (scope, identities, purposes,      │
//! │                       vendors, collectedAt)                            │
//! │  _ketch_consent_v1_   purpose → "granted" | "denied"                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Staleness is the caller's concern. This module only distinguishes a
//! real record from "nothing usable".

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use consent_core::consent::public_consent;
use consent_core::protocol::{ConsentRecord, GetConsentRequest};
use consent_core::{Consent, CONSENT_CACHE_KEY, PUBLIC_CONSENT_KEY};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cacher::Cacher;

/// Consent record cache over any [`Cacher`].
#[derive(Clone)]
pub struct ConsentCache {
    cacher: Arc<dyn Cacher>,
    cache_key: String,
    public_key: String,
}

impl ConsentCache {
    /// Uses the standard keys.
    pub fn new(cacher: Arc<dyn Cacher>) -> Self {
        Self::with_keys(cacher, CONSENT_CACHE_KEY, PUBLIC_CONSENT_KEY)
    }

    pub fn with_keys(
        cacher: Arc<dyn Cacher>,
        cache_key: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        ConsentCache {
            cacher,
            cache_key: cache_key.into(),
            public_key: public_key.into(),
        }
    }

    /// Returns the cached record, or a synthetic empty record for `request`.
    ///
    /// The synthetic record has no purposes, `collectedAt == 0`, and the
    /// scope and identities of `request`. It is returned when nothing is
    /// cached, the cached value is an empty object, cannot be parsed, or has
    /// no `collectedAt`.
    pub async fn get_cached_consent(&self, request: &GetConsentRequest) -> ConsentRecord {
        let Some(value) = self.cacher.get_item(&self.cache_key).await else {
            return ConsentRecord::empty_for(request);
        };

        let record = match serde_json::from_value::<ConsentRecord>(value) {
            Ok(record) => record,
            Err(err) => {
                warn!(key = %self.cache_key, error = %err, "Discarding unreadable cached consent");
                return ConsentRecord::empty_for(request);
            }
        };

        if record.is_blank() || record.is_synthetic() {
            debug!(key = %self.cache_key, "Cached consent is empty");
            return ConsentRecord::empty_for(request);
        }

        record
    }

    /// Stamps `collectedAt` with the current time and writes the record.
    pub async fn set_cached_consent(&self, record: ConsentRecord) -> bool {
        self.set_cached_consent_at(record, Utc::now().timestamp()).await
    }

    /// Stamps `collectedAt = now` and writes the record.
    ///
    /// A blank record is a no-op and returns false.
    pub async fn set_cached_consent_at(&self, mut record: ConsentRecord, now: i64) -> bool {
        if record.is_blank() {
            return false;
        }
        record.collected_at = now;

        match serde_json::to_value(&record) {
            Ok(value) => self.cacher.set_item(&self.cache_key, &value).await,
            Err(err) => {
                warn!(key = %self.cache_key, error = %err, "Cannot serialize consent record");
                false
            }
        }
    }

    /// Writes the public `purpose -> granted|denied` map.
    pub async fn set_public_consent(&self, consent: &Consent) -> bool {
        let map: serde_json::Map<String, Value> = public_consent(consent)
            .into_iter()
            .map(|(code, state)| (code, Value::String(state)))
            .collect();
        self.cacher
            .set_item(&self.public_key, &Value::Object(map))
            .await
    }

    /// Reads the public consent map.
    pub async fn get_public_consent(&self) -> Option<BTreeMap<String, String>> {
        let value = self.cacher.get_item(&self.public_key).await?;
        serde_json::from_value(value).ok()
    }

    /// Removes both keys.
    pub async fn clear(&self) -> bool {
        let record = self.cacher.remove_item(&self.cache_key).await;
        let public = self.cacher.remove_item(&self.public_key).await;
        record && public
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::{MemoryStorage, StorageArea};
    use crate::cacher::StorageCacher;
    use crate::chain::CacheChain;
    use consent_core::protocol::PurposeAllowedLegalBasis;
    use serde_json::json;

    fn request() -> GetConsentRequest {
        GetConsentRequest {
            organization_code: "org".into(),
            property_code: "site".into(),
            environment_code: "production".into(),
            jurisdiction_code: "gdpr".into(),
            identities: BTreeMap::from([("swb_web".to_string(), "abc".to_string())]),
            purposes: BTreeMap::new(),
        }
    }

    fn cache() -> (ConsentCache, Arc<MemoryStorage>) {
        let local = Arc::new(MemoryStorage::new());
        let cacher: Arc<dyn Cacher> = Arc::new(StorageCacher::local(local.clone()));
        (ConsentCache::new(cacher), local)
    }

    fn assert_synthetic(record: &ConsentRecord) {
        assert!(record.purposes.is_empty());
        assert_eq!(record.collected_at, 0);
        assert_eq!(record.organization_code, "org");
        assert_eq!(record.property_code, "site");
        assert_eq!(record.environment_code, "production");
        assert_eq!(record.jurisdiction_code, "gdpr");
        assert_eq!(record.identities, request().identities);
    }

    #[tokio::test]
    async fn test_empty_store_yields_synthetic_record() {
        let (cache, _) = cache();
        assert_synthetic(&cache.get_cached_consent(&request()).await);
    }

    #[tokio::test]
    async fn test_empty_object_yields_synthetic_record() {
        let (cache, local) = cache();
        local.set(CONSENT_CACHE_KEY, "{}").unwrap();
        assert_synthetic(&cache.get_cached_consent(&request()).await);
    }

    #[tokio::test]
    async fn test_missing_collected_at_yields_synthetic_record() {
        let (cache, local) = cache();
        let stored = json!({
            "organizationCode": "other",
            "purposes": {"analytics": {"allowed": "true", "legalBasisCode": "x"}}
        });
        local.set(CONSENT_CACHE_KEY, &stored.to_string()).unwrap();
        assert_synthetic(&cache.get_cached_consent(&request()).await);
    }

    #[tokio::test]
    async fn test_set_stamps_and_returns_verbatim() {
        let (cache, _) = cache();
        let mut record = ConsentRecord::empty_for(&request());
        record
            .purposes
            .insert("analytics".into(), PurposeAllowedLegalBasis::new(true, "consent_optin"));

        assert!(cache.set_cached_consent_at(record.clone(), 1_700_000_000).await);

        let cached = cache.get_cached_consent(&request()).await;
        assert_eq!(cached.collected_at, 1_700_000_000);
        assert_eq!(cached.purposes, record.purposes);
    }

    #[tokio::test]
    async fn test_blank_record_is_noop() {
        let (cache, local) = cache();
        assert!(!cache.set_cached_consent(ConsentRecord::default()).await);
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_public_consent_map() {
        let local = Arc::new(MemoryStorage::new());
        let chain = CacheChain::new(vec![Arc::new(StorageCacher::local(local))]);
        let cache = ConsentCache::new(Arc::new(chain));

        let consent = Consent::new()
            .with_purpose("analytics", true)
            .with_purpose("ads", false);
        assert!(cache.set_public_consent(&consent).await);

        let public = cache.get_public_consent().await.unwrap();
        assert_eq!(public["analytics"], "granted");
        assert_eq!(public["ads"], "denied");

        assert!(cache.clear().await);
        assert!(cache.get_public_consent().await.is_none());
    }
}
