//! # Consent API Payloads
//!
//! Request and response shapes exchanged with the consent API, plus the
//! record persisted in the cache chain.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Consent API Messages                               │
//! │                                                                         │
//! │  READ                                                                  │
//! │  ────                                                                  │
//! │  tag ───► GetConsentRequest { scope, identities, purposes→legalBasis } │
//! │  tag ◄─── GetConsentResponse { purposes → "true" | {allowed, basis} }  │
//! │                                                                         │
//! │  WRITE                                                                 │
//! │  ─────                                                                 │
//! │  tag ───► SetConsentRequest { scope, identities, purposes→{allowed} }  │
//! │                                                                         │
//! │  RIGHTS                                                                │
//! │  ──────                                                                │
//! │  tag ───► InvokeRightRequest { scope, identities, rightCode, user }    │
//! │                                                                         │
//! │  LOCATION / CONFIGURATION                                              │
//! │  ────────────────────────                                              │
//! │  tag ◄─── GetLocationResponse { location: IpInfo }                     │
//! │  tag ───► GetFullConfigurationRequest { scope, hash }                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cache Record
//! [`ConsentRecord`] is a superset of a request/response: it carries the
//! scope, the identities, normalized purposes and `collectedAt`. A record
//! with `collectedAt == 0` is synthetic and never real consent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ConsentScope, Identities};

// =============================================================================
// Purpose Entries
// =============================================================================

/// Purpose entry of a get-consent request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurposeLegalBasis {
    pub legal_basis_code: String,
}

/// Normalized purpose entry: `allowed` is the string `"true"` or `"false"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurposeAllowedLegalBasis {
    pub allowed: String,

    #[serde(default)]
    pub legal_basis_code: String,
}

impl PurposeAllowedLegalBasis {
    pub fn new(allowed: bool, legal_basis_code: impl Into<String>) -> Self {
        PurposeAllowedLegalBasis {
            allowed: allowed.to_string(),
            legal_basis_code: legal_basis_code.into(),
        }
    }

    /// Coerces the string form to a boolean.
    pub fn is_allowed(&self) -> bool {
        self.allowed == "true"
    }
}

/// A purpose value as the server may return it.
///
/// Older deployments answer with a bare `"true"`/`"false"`; newer ones with
/// an object. Both normalize to [`PurposeAllowedLegalBasis`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PurposeValue {
    Bare(String),
    Detailed(PurposeAllowedLegalBasis),
}

// =============================================================================
// Get Consent
// =============================================================================

/// Request for the stored consent of a set of identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConsentRequest {
    pub organization_code: String,
    pub property_code: String,
    pub environment_code: String,
    pub jurisdiction_code: String,
    pub identities: Identities,
    pub purposes: BTreeMap<String, PurposeLegalBasis>,
}

impl GetConsentRequest {
    /// Legal basis code the request carries for a purpose.
    pub fn legal_basis(&self, code: &str) -> Option<&str> {
        self.purposes.get(code).map(|p| p.legal_basis_code.as_str())
    }
}

/// Server answer to a [`GetConsentRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConsentResponse {
    #[serde(default)]
    pub organization_code: String,
    #[serde(default)]
    pub property_code: String,
    #[serde(default)]
    pub environment_code: String,
    #[serde(default)]
    pub jurisdiction_code: String,
    #[serde(default)]
    pub identities: Identities,
    #[serde(default)]
    pub purposes: BTreeMap<String, PurposeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_at: Option<i64>,
}

// =============================================================================
// Set Consent
// =============================================================================

/// Request persisting consent for a set of identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConsentRequest {
    pub organization_code: String,
    pub property_code: String,
    pub environment_code: String,
    pub jurisdiction_code: String,
    pub identities: Identities,
    pub purposes: BTreeMap<String, PurposeAllowedLegalBasis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_option: Option<String>,
}

// =============================================================================
// Cached Record
// =============================================================================

/// Consent record as stored in the cache chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    #[serde(default)]
    pub organization_code: String,
    #[serde(default)]
    pub property_code: String,
    #[serde(default)]
    pub environment_code: String,
    #[serde(default)]
    pub jurisdiction_code: String,
    #[serde(default)]
    pub identities: Identities,
    #[serde(default)]
    pub purposes: BTreeMap<String, PurposeAllowedLegalBasis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendors: Option<Vec<String>>,
    /// Unix seconds; 0 marks a synthetic record.
    #[serde(default)]
    pub collected_at: i64,
}

impl ConsentRecord {
    /// Synthetic empty record copying the scope and identities of a request.
    pub fn empty_for(request: &GetConsentRequest) -> Self {
        ConsentRecord {
            organization_code: request.organization_code.clone(),
            property_code: request.property_code.clone(),
            environment_code: request.environment_code.clone(),
            jurisdiction_code: request.jurisdiction_code.clone(),
            identities: request.identities.clone(),
            purposes: BTreeMap::new(),
            vendors: None,
            collected_at: 0,
        }
    }

    /// True when this record was never collected from a real consent.
    pub fn is_synthetic(&self) -> bool {
        self.collected_at == 0
    }

    /// True when this record carries no scope, identities or purposes.
    pub fn is_blank(&self) -> bool {
        self.organization_code.is_empty()
            && self.property_code.is_empty()
            && self.environment_code.is_empty()
            && self.jurisdiction_code.is_empty()
            && self.identities.is_empty()
            && self.purposes.is_empty()
            && self.vendors.is_none()
    }

    /// True when the record is older than `ttl_secs` relative to `now`.
    pub fn is_stale(&self, now: i64, ttl_secs: i64) -> bool {
        self.collected_at < now - ttl_secs
    }
}

impl From<SetConsentRequest> for ConsentRecord {
    fn from(request: SetConsentRequest) -> Self {
        ConsentRecord {
            organization_code: request.organization_code,
            property_code: request.property_code,
            environment_code: request.environment_code,
            jurisdiction_code: request.jurisdiction_code,
            identities: request.identities,
            purposes: request.purposes,
            vendors: request.vendors,
            collected_at: request.collected_at.unwrap_or_default(),
        }
    }
}

// =============================================================================
// Rights
// =============================================================================

/// The person a right is invoked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSubject {
    pub email: String,
    #[serde(default)]
    pub first: String,
    #[serde(default)]
    pub last: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Data-subject request as the experience UI produces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RightInvocation {
    pub right: String,
    pub subject: DataSubject,
}

/// Request invoking a right on behalf of a data subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRightRequest {
    pub organization_code: String,
    pub property_code: String,
    pub environment_code: String,
    pub jurisdiction_code: String,
    pub identities: Identities,
    pub right_code: String,
    pub user: DataSubject,
    pub invoked_at: i64,
}

impl InvokeRightRequest {
    pub fn new(
        scope: ConsentScope,
        identities: Identities,
        invocation: RightInvocation,
        invoked_at: i64,
    ) -> Self {
        InvokeRightRequest {
            organization_code: scope.organization_code,
            property_code: scope.property_code,
            environment_code: scope.environment_code,
            jurisdiction_code: scope.jurisdiction_code,
            identities,
            right_code: invocation.right,
            user: invocation.subject,
            invoked_at,
        }
    }
}

// =============================================================================
// Location
// =============================================================================

/// GeoIP data for the visitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpInfo {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub region_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// Server answer to a location lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLocationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<IpInfo>,
}

// =============================================================================
// Configuration
// =============================================================================

/// Request for the full property configuration of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFullConfigurationRequest {
    pub organization_code: String,
    pub property_code: String,
    pub environment_code: String,
    pub jurisdiction_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}
