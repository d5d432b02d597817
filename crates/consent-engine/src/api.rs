//! # Consent API
//!
//! The network collaborator the engine reads and writes consent through.
//!
//! ```text
//! ┌──────────────┐   get_consent / set_consent    ┌───────────────────────┐
//! │ConsentEngine │ ─────────────────────────────► │ dyn ConsentApi        │
//! │              │   invoke_right                 │  • HTTP client (host) │
//! │              │   get_location                 │  • MemoryConsentApi   │
//! │              │   get_full_configuration       │                       │
//! └──────────────┘ ◄───────────────────────────── └───────────────────────┘
//! ```
//!
//! Failures surface as [`EngineError::Api`]. Nothing here retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use consent_core::protocol::{
    GetConsentRequest, GetConsentResponse, GetFullConfigurationRequest, GetLocationResponse,
    InvokeRightRequest, IpInfo, PurposeValue, SetConsentRequest,
};
use consent_core::{Configuration, Identities};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Remote consent service.
#[async_trait]
pub trait ConsentApi: Send + Sync {
    async fn get_consent(&self, request: &GetConsentRequest) -> EngineResult<GetConsentResponse>;

    async fn set_consent(&self, request: &SetConsentRequest) -> EngineResult<()>;

    async fn invoke_right(&self, request: &InvokeRightRequest) -> EngineResult<()>;

    async fn get_location(&self) -> EngineResult<GetLocationResponse>;

    async fn get_full_configuration(
        &self,
        request: &GetFullConfigurationRequest,
    ) -> EngineResult<Configuration>;
}

// =============================================================================
// In-Memory Implementation
// =============================================================================

#[derive(Default)]
struct MemoryState {
    consents: HashMap<Identities, GetConsentResponse>,
    location: Option<IpInfo>,
    configuration: Option<Configuration>,
    set_requests: Vec<SetConsentRequest>,
    rights: Vec<InvokeRightRequest>,
}

/// Consent service held in memory.
///
/// Consent written through `set_consent` is returned by later `get_consent`
/// calls for the same identities, like the real service.
#[derive(Default)]
pub struct MemoryConsentApi {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
    failing: AtomicBool,
    get_calls: AtomicUsize,
    set_calls: AtomicUsize,
    location_calls: AtomicUsize,
}

impl MemoryConsentApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the stored consent of an identity set.
    pub fn with_response(self, identities: Identities, response: GetConsentResponse) -> Self {
        self.lock().consents.insert(identities, response);
        self
    }

    pub fn with_location(self, location: IpInfo) -> Self {
        self.lock().location = Some(location);
        self
    }

    pub fn with_configuration(self, configuration: Configuration) -> Self {
        self.lock().configuration = Some(configuration);
        self
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every subsequent call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn location_calls(&self) -> usize {
        self.location_calls.load(Ordering::SeqCst)
    }

    /// Set-consent requests received, oldest first.
    pub fn set_requests(&self) -> Vec<SetConsentRequest> {
        self.lock().set_requests.clone()
    }

    /// Right invocations received, oldest first.
    pub fn rights(&self) -> Vec<InvokeRightRequest> {
        self.lock().rights.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn round_trip(&self, operation: &str) -> EngineResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::api(operation, "service unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ConsentApi for MemoryConsentApi {
    async fn get_consent(&self, request: &GetConsentRequest) -> EngineResult<GetConsentResponse> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip("getConsent").await?;

        let stored = self.lock().consents.get(&request.identities).cloned();
        debug!(found = stored.is_some(), "Memory API getConsent");

        Ok(stored.unwrap_or_else(|| GetConsentResponse {
            organization_code: request.organization_code.clone(),
            property_code: request.property_code.clone(),
            environment_code: request.environment_code.clone(),
            jurisdiction_code: request.jurisdiction_code.clone(),
            identities: request.identities.clone(),
            ..Default::default()
        }))
    }

    async fn set_consent(&self, request: &SetConsentRequest) -> EngineResult<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip("setConsent").await?;

        let mut state = self.lock();
        let response = GetConsentResponse {
            organization_code: request.organization_code.clone(),
            property_code: request.property_code.clone(),
            environment_code: request.environment_code.clone(),
            jurisdiction_code: request.jurisdiction_code.clone(),
            identities: request.identities.clone(),
            purposes: request
                .purposes
                .iter()
                .map(|(code, entry)| (code.clone(), PurposeValue::Detailed(entry.clone())))
                .collect(),
            vendors: request.vendors.clone(),
            collected_at: request.collected_at,
        };
        state.consents.insert(request.identities.clone(), response);
        state.set_requests.push(request.clone());
        Ok(())
    }

    async fn invoke_right(&self, request: &InvokeRightRequest) -> EngineResult<()> {
        self.round_trip("invokeRight").await?;
        self.lock().rights.push(request.clone());
        Ok(())
    }

    async fn get_location(&self) -> EngineResult<GetLocationResponse> {
        self.location_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip("getLocation").await?;
        Ok(GetLocationResponse {
            location: self.lock().location.clone(),
        })
    }

    async fn get_full_configuration(
        &self,
        request: &GetFullConfigurationRequest,
    ) -> EngineResult<Configuration> {
        self.round_trip("getFullConfiguration").await?;
        self.lock().configuration.clone().ok_or_else(|| {
            EngineError::api(
                "getFullConfiguration",
                format!(
                    "no configuration for {}/{}",
                    request.organization_code, request.property_code
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use consent_core::protocol::PurposeAllowedLegalBasis;

    fn ids(value: &str) -> Identities {
        BTreeMap::from([("swb_web".to_string(), value.to_string())])
    }

    fn get_request(identities: Identities) -> GetConsentRequest {
        GetConsentRequest {
            organization_code: "org".into(),
            property_code: "web".into(),
            environment_code: "production".into(),
            jurisdiction_code: "gdpr".into(),
            identities,
            purposes: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_set_then_get_round_trips_through_store() {
        let api = MemoryConsentApi::new();
        let request = SetConsentRequest {
            organization_code: "org".into(),
            property_code: "web".into(),
            environment_code: "production".into(),
            jurisdiction_code: "gdpr".into(),
            identities: ids("u1"),
            purposes: BTreeMap::from([(
                "analytics".to_string(),
                PurposeAllowedLegalBasis::new(true, "consent_optin"),
            )]),
            vendors: None,
            collected_at: Some(100),
            migration_option: None,
        };
        api.set_consent(&request).await.unwrap();

        let response = api.get_consent(&get_request(ids("u1"))).await.unwrap();
        assert_eq!(response.purposes.len(), 1);
        assert_eq!(response.collected_at, Some(100));

        let other = api.get_consent(&get_request(ids("u2"))).await.unwrap();
        assert!(other.purposes.is_empty());
        assert_eq!(other.identities, ids("u2"));

        assert_eq!(api.get_calls(), 2);
        assert_eq!(api.set_calls(), 1);
        assert_eq!(api.set_requests(), vec![request]);
    }

    #[tokio::test]
    async fn test_failing_api() {
        let api = MemoryConsentApi::new();
        api.set_failing(true);

        let err = api.get_consent(&get_request(ids("u1"))).await.unwrap_err();
        assert!(err.is_network_error());
        assert_eq!(api.get_calls(), 1);

        api.set_failing(false);
        assert!(api.get_location().await.unwrap().location.is_none());
    }
}
