//! # Domain Types
//!
//! Core domain types used throughout the consent tag.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Consent      │   │  Configuration  │   │    Purpose      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  purposes       │   │  organization   │   │  code           │       │
//! │  │  vendors?       │   │  property       │   │  legalBasisCode │       │
//! │  │  protocols?     │   │  environment    │   │  requiresOptIn  │       │
//! │  └─────────────────┘   │  jurisdiction   │   └─────────────────┘       │
//! │                        │  purposes       │                              │
//! │  ┌─────────────────┐   │  identities     │   ┌─────────────────┐       │
//! │  │   Identities    │   │  experiences    │   │ IdentityDescr.  │       │
//! │  │  space → value  │   │  options        │   │  type/variable  │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Wire shapes are camelCase JSON, matching what the consent API and the
//! property configuration endpoint produce.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Identities
// =============================================================================

/// Identity space → identity value.
///
/// A `BTreeMap` so that two identity sets compare (and hash into keys)
/// independently of insertion order.
pub type Identities = BTreeMap<String, String>;

// =============================================================================
// Consent
// =============================================================================

/// Per-purpose consent grants plus optional vendor and protocol data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Consent {
    /// Purpose code → allowed.
    #[serde(default)]
    pub purposes: BTreeMap<String, bool>,

    /// Consented vendor identifiers, in server order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub vendors: Option<Vec<String>>,

    /// Protocol strings (e.g. TCF, USP) keyed by protocol name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub protocols: Option<BTreeMap<String, String>>,
}

impl Consent {
    /// Creates an empty consent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper to add a purpose grant.
    pub fn with_purpose(mut self, code: impl Into<String>, allowed: bool) -> Self {
        self.purposes.insert(code.into(), allowed);
        self
    }

    /// A consent is empty iff it carries no purposes.
    pub fn is_empty(&self) -> bool {
        self.purposes.is_empty()
    }

    /// Returns the grant for a purpose, if known.
    pub fn allowed(&self, code: &str) -> Option<bool> {
        self.purposes.get(code).copied()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Organization owning the property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub code: String,
}

/// Property (site or app) the tag runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Deployment environment (production, staging, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub code: String,

    /// Base64-encoded regular expression matched against the page URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Configuration hash for this environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Jurisdiction settings for the property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JurisdictionInfo {
    /// Explicit jurisdiction code, when the property pins one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Fallback when no region mapping applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_jurisdiction_code: Option<String>,

    /// Data-layer variable carrying a jurisdiction code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,

    /// Region code (e.g. `US-CA`) → jurisdiction code.
    #[serde(default)]
    pub jurisdictions: BTreeMap<String, String>,
}

/// A configured data-use category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Purpose {
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub name: Option<String>,

    pub legal_basis_code: String,

    /// Opt-in purposes are never implicitly granted.
    #[serde(default)]
    pub requires_opt_in: bool,
}

/// A data-subject right (access, deletion, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Right {
    pub code: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Where an identity value lives on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentityKind {
    Window,
    Cookie,
    LocalStorage,
    SessionStorage,
    QueryString,
    DataLayer,
}

/// How a raw identity value is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentityFormat {
    /// Value used as is.
    #[default]
    String,
    /// JSON document; `key` selects the identity within it.
    Json,
    /// `a=1&b=2`; `key` selects the identity.
    Query,
    /// `a=1;b=2`; `key` selects the identity.
    Semicolon,
}

/// Collection descriptor for one identity space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDescriptor {
    #[serde(rename = "type")]
    pub kind: IdentityKind,

    pub variable: String,

    #[serde(default)]
    pub format: IdentityFormat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Default display mode for the consent experience.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExperienceDefault {
    #[default]
    Banner,
    Modal,
}

/// Consent experience descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentExperience {
    pub code: String,

    #[serde(default)]
    pub experience_default: ExperienceDefault,
}

/// Preference experience descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceExperience {
    pub code: String,
}

/// Experience descriptors for the property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent: Option<ConsentExperience>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<PreferenceExperience>,
}

/// Resolved property configuration. Immutable per engine instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<Organization>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<Property>,

    /// Resolved environment, when the bootstrap pinned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,

    /// Candidate environments for URL-pattern matching.
    #[serde(default)]
    pub environments: Vec<Environment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<JurisdictionInfo>,

    #[serde(default)]
    pub purposes: Vec<Purpose>,

    #[serde(default)]
    pub rights: Vec<Right>,

    #[serde(default)]
    pub identities: BTreeMap<String, IdentityDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiences: Option<Experiences>,

    /// Free-form options (migration mode, listener limits, watcher timing).
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// The four codes every consent request is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentScope {
    pub organization_code: String,
    pub property_code: String,
    pub environment_code: String,
    pub jurisdiction_code: String,
}

fn non_empty(code: &str) -> Option<&str> {
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

impl Configuration {
    /// Organization code, if present and non-empty.
    pub fn organization_code(&self) -> Option<&str> {
        self.organization.as_ref().and_then(|o| non_empty(&o.code))
    }

    /// Property code, if present and non-empty.
    pub fn property_code(&self) -> Option<&str> {
        self.property.as_ref().and_then(|p| non_empty(&p.code))
    }

    /// Environment code, if present and non-empty.
    pub fn environment_code(&self) -> Option<&str> {
        self.environment.as_ref().and_then(|e| non_empty(&e.code))
    }

    /// Explicit jurisdiction code, if present and non-empty.
    pub fn jurisdiction_code(&self) -> Option<&str> {
        self.jurisdiction
            .as_ref()
            .and_then(|j| j.code.as_deref())
            .and_then(non_empty)
    }

    /// Returns the request scope when all four codes are known.
    pub fn scope(&self) -> Option<ConsentScope> {
        Some(ConsentScope {
            organization_code: self.organization_code()?.to_string(),
            property_code: self.property_code()?.to_string(),
            environment_code: self.environment_code()?.to_string(),
            jurisdiction_code: self.jurisdiction_code()?.to_string(),
        })
    }

    /// Looks up a configured purpose by code.
    pub fn purpose(&self, code: &str) -> Option<&Purpose> {
        self.purposes.iter().find(|p| p.code == code)
    }

    /// True when any configured purpose requires opt-in.
    pub fn any_requires_opt_in(&self) -> bool {
        self.purposes.iter().any(|p| p.requires_opt_in)
    }

    /// Default consent display mode (banner when unset).
    pub fn experience_default(&self) -> ExperienceDefault {
        self.experiences
            .as_ref()
            .and_then(|e| e.consent.as_ref())
            .map(|c| c.experience_default)
            .unwrap_or_default()
    }

    /// Reads a free-form option.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
