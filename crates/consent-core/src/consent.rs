//! # Consent Operations
//!
//! Pure functions behind the consent resolution engine: request building,
//! response normalization, projection onto configured purposes, merging and
//! implicit grants.
//!
//! ## Resolution Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Consent Resolution Pipeline                          │
//! │                                                                         │
//! │  build_get_request ──► cache_decision ──┬─► Use cached record          │
//! │                                          └─► API ─► normalize_response │
//! │                                                          │              │
//! │                    project_consent ◄─────────────────────┘              │
//! │                          │                                              │
//! │                          ▼                                              │
//! │                    apply_provisional                                    │
//! │                          │                                              │
//! │           (experience decided HERE, before defaults)                    │
//! │                          │                                              │
//! │                          ▼                                              │
//! │                    apply_default_grants ──► set or store                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use crate::error::{ConsentError, CoreResult};
use crate::protocol::{
    ConsentRecord, GetConsentRequest, GetConsentResponse, PurposeAllowedLegalBasis,
    PurposeLegalBasis, PurposeValue, SetConsentRequest,
};
use crate::types::{Configuration, Consent, Identities};

/// Public consent map value for a granted purpose.
pub const GRANTED: &str = "granted";

/// Public consent map value for a denied purpose.
pub const DENIED: &str = "denied";

// =============================================================================
// Requests
// =============================================================================

/// Builds the get-consent request for the current identities.
///
/// ## Errors
/// - [`ConsentError::NoIdentities`] when `identities` is empty
/// - [`ConsentError::NoPurposes`] when the scope is incomplete or no
///   purposes are configured
pub fn build_get_request(
    config: &Configuration,
    identities: &Identities,
) -> CoreResult<GetConsentRequest> {
    if identities.is_empty() {
        return Err(ConsentError::NoIdentities);
    }

    let scope = config.scope().ok_or(ConsentError::NoPurposes)?;
    if config.purposes.is_empty() {
        return Err(ConsentError::NoPurposes);
    }

    let purposes = config
        .purposes
        .iter()
        .map(|p| {
            (
                p.code.clone(),
                PurposeLegalBasis {
                    legal_basis_code: p.legal_basis_code.clone(),
                },
            )
        })
        .collect();

    Ok(GetConsentRequest {
        organization_code: scope.organization_code,
        property_code: scope.property_code,
        environment_code: scope.environment_code,
        jurisdiction_code: scope.jurisdiction_code,
        identities: identities.clone(),
        purposes,
    })
}

/// Builds the set-consent request for `consent`.
///
/// Only configured purposes with a value in `consent` are included. Returns
/// `Ok(None)` when that filtering leaves nothing to send.
///
/// ## Errors
/// - [`ConsentError::NoIdentities`] when `identities` is empty
/// - [`ConsentError::InvalidConfiguration`] when the scope is incomplete
/// - [`ConsentError::EmptyConsent`] when `consent` has no purposes
pub fn build_set_request(
    config: &Configuration,
    identities: &Identities,
    consent: &Consent,
    migration_option: Option<&str>,
) -> CoreResult<Option<SetConsentRequest>> {
    if identities.is_empty() {
        return Err(ConsentError::NoIdentities);
    }

    let scope = config.scope().ok_or_else(|| {
        ConsentError::InvalidConfiguration(
            "organization, property, environment and jurisdiction are required".into(),
        )
    })?;

    if consent.is_empty() {
        return Err(ConsentError::EmptyConsent);
    }

    let purposes: BTreeMap<String, PurposeAllowedLegalBasis> = config
        .purposes
        .iter()
        .filter_map(|p| {
            consent.allowed(&p.code).map(|allowed| {
                (
                    p.code.clone(),
                    PurposeAllowedLegalBasis::new(allowed, p.legal_basis_code.clone()),
                )
            })
        })
        .collect();

    if purposes.is_empty() {
        return Ok(None);
    }

    Ok(Some(SetConsentRequest {
        organization_code: scope.organization_code,
        property_code: scope.property_code,
        environment_code: scope.environment_code,
        jurisdiction_code: scope.jurisdiction_code,
        identities: identities.clone(),
        purposes,
        vendors: consent.vendors.clone(),
        collected_at: None,
        migration_option: migration_option.map(str::to_string),
    }))
}

// =============================================================================
// Cache Decision
// =============================================================================

/// Outcome of checking a cached record against the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    /// The record is fresh and belongs to these identities.
    Use,
    /// The record has no purposes.
    Empty,
    /// The record is older than the TTL and must be revalidated.
    Stale,
    /// The record was collected for different identities.
    IdentityMismatch,
}

impl CacheDecision {
    pub fn is_usable(&self) -> bool {
        matches!(self, CacheDecision::Use)
    }
}

impl std::fmt::Display for CacheDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheDecision::Use => write!(f, "use"),
            CacheDecision::Empty => write!(f, "empty"),
            CacheDecision::Stale => write!(f, "stale"),
            CacheDecision::IdentityMismatch => write!(f, "identity_mismatch"),
        }
    }
}

/// Decides whether a cached record may stand in for a server response.
///
/// First match wins: empty purposes, older than `now - ttl_secs`, identities
/// not equal to the request's.
pub fn cache_decision(
    record: &ConsentRecord,
    request: &GetConsentRequest,
    now: i64,
    ttl_secs: i64,
) -> CacheDecision {
    if record.purposes.is_empty() {
        CacheDecision::Empty
    } else if record.is_stale(now, ttl_secs) {
        CacheDecision::Stale
    } else if record.identities != request.identities {
        CacheDecision::IdentityMismatch
    } else {
        CacheDecision::Use
    }
}

// =============================================================================
// Normalization & Projection
// =============================================================================

/// Normalizes a server response into the cached record shape.
///
/// Bare `"true"`/`"false"` values become objects; missing legal basis codes
/// are filled from the outgoing request.
pub fn normalize_response(request: &GetConsentRequest, response: GetConsentResponse) -> ConsentRecord {
    let purposes = response
        .purposes
        .into_iter()
        .map(|(code, value)| {
            let basis = request.legal_basis(&code).unwrap_or_default().to_string();
            let normalized = match value {
                PurposeValue::Bare(allowed) => PurposeAllowedLegalBasis {
                    allowed,
                    legal_basis_code: basis,
                },
                PurposeValue::Detailed(mut detailed) => {
                    if detailed.legal_basis_code.is_empty() {
                        detailed.legal_basis_code = basis;
                    }
                    detailed
                }
            };
            (code, normalized)
        })
        .collect();

    ConsentRecord {
        organization_code: request.organization_code.clone(),
        property_code: request.property_code.clone(),
        environment_code: request.environment_code.clone(),
        jurisdiction_code: request.jurisdiction_code.clone(),
        identities: request.identities.clone(),
        purposes,
        vendors: response.vendors,
        collected_at: response.collected_at.unwrap_or_default(),
    }
}

/// Projects a record onto the configured purposes.
///
/// Purposes without an entry stay absent; defaulting happens later.
pub fn project_consent(config: &Configuration, record: &ConsentRecord) -> Consent {
    let purposes = config
        .purposes
        .iter()
        .filter_map(|p| {
            record
                .purposes
                .get(&p.code)
                .map(|entry| (p.code.clone(), entry.is_allowed()))
        })
        .collect();

    Consent {
        purposes,
        vendors: record.vendors.clone(),
        protocols: None,
    }
}

// =============================================================================
// Merging
// =============================================================================

/// Carries forward purposes from `older` that `newer` does not mention.
///
/// Keys already present in `newer` always win.
pub fn merge_missing(newer: &mut Consent, older: &Consent) {
    for (code, allowed) in &older.purposes {
        newer.purposes.entry(code.clone()).or_insert(*allowed);
    }
}

/// Overrides `consent` with every purpose staged in `provisional`.
///
/// Returns true when at least one value actually changed.
pub fn apply_provisional(consent: &mut Consent, provisional: &Consent) -> bool {
    let mut changed = false;
    for (code, allowed) in &provisional.purposes {
        if consent.purposes.insert(code.clone(), *allowed) != Some(*allowed) {
            changed = true;
        }
    }
    if provisional.vendors.is_some() && consent.vendors != provisional.vendors {
        consent.vendors = provisional.vendors.clone();
        changed = true;
    }
    changed
}

/// Grants every configured purpose that is absent and does not require
/// opt-in. Returns true when anything was filled.
pub fn apply_default_grants(config: &Configuration, consent: &mut Consent) -> bool {
    let mut filled = false;
    for purpose in &config.purposes {
        if !purpose.requires_opt_in && !consent.purposes.contains_key(&purpose.code) {
            consent.purposes.insert(purpose.code.clone(), true);
            filled = true;
        }
    }
    filled
}

/// Purpose-by-purpose equality: same cardinality and equal values.
pub fn same_purposes(a: &Consent, b: &Consent) -> bool {
    a.purposes.len() == b.purposes.len()
        && a
            .purposes
            .iter()
            .all(|(code, allowed)| b.purposes.get(code) == Some(allowed))
}

/// Denormalized consent readable by non-JS integrations.
pub fn public_consent(consent: &Consent) -> BTreeMap<String, String> {
    consent
        .purposes
        .iter()
        .map(|(code, allowed)| {
            let state = if *allowed { GRANTED } else { DENIED };
            (code.clone(), state.to_string())
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
