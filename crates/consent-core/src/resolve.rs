//! # Page Resolution
//!
//! Resolves environment, jurisdiction and region from the configuration and
//! an explicit [`PageContext`] instead of ambient page globals.
//!
//! ## Resolution Chains
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ENVIRONMENT                                                           │
//! │  swb_env ─► configured environment ─► URL pattern ─► "production"      │
//! │                                                  └─► NoEnvironment      │
//! │                                                                         │
//! │  JURISDICTION                                                          │
//! │  swb_p ─► explicit code ─► document attribute ─► data-layer variable   │
//! │        ─► region table ─► default code ─► NoJurisdiction               │
//! │                                                                         │
//! │  REGION                                                                │
//! │  swb_region ─► GeoIP (US ─► US-<region>) ─► UnrecognizedLocation       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::error::{ConsentError, CoreResult};
use crate::protocol::IpInfo;
use crate::types::{Configuration, Environment};
use crate::{
    ENV_PARAMETER, JURISDICTION_PARAMETER, PRODUCTION_ENVIRONMENT, REGION_PARAMETER,
};

// =============================================================================
// Page Context
// =============================================================================

/// The parts of the host page the engine is allowed to read.
#[derive(Debug, Clone, Default)]
pub struct PageContext {
    /// Current page URL.
    pub url: Option<Url>,

    /// Jurisdiction code declared on the document element, if any.
    pub jurisdiction_attribute: Option<String>,

    /// Snapshot of the data-layer array, oldest entry first.
    pub data_layer: Vec<Value>,
}

impl PageContext {
    /// Creates a context for a page URL.
    pub fn for_url(url: &str) -> Result<Self, url::ParseError> {
        Ok(PageContext {
            url: Some(Url::parse(url)?),
            ..Default::default()
        })
    }

    /// Value of a query parameter. `Some("")` when present without value.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url.as_ref().and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
        })
    }

    /// Latest data-layer entry defining `variable`, as a string.
    pub fn data_layer_value(&self, variable: &str) -> Option<String> {
        self.data_layer.iter().rev().find_map(|entry| match entry.get(variable)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
    }
}

// =============================================================================
// Environment
// =============================================================================

fn pattern_matches(encoded: &str, url: &str) -> bool {
    let Ok(bytes) = STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(source) = String::from_utf8(bytes) else {
        return false;
    };
    Regex::new(&source)
        .map(|re| re.is_match(url))
        .unwrap_or(false)
}

/// Resolves the deployment environment for the page.
pub fn resolve_environment(config: &Configuration, page: &PageContext) -> CoreResult<Environment> {
    if let Some(code) = page.query_param(ENV_PARAMETER) {
        if let Some(env) = config.environments.iter().find(|e| e.code == code) {
            return Ok(env.clone());
        }
    }

    if let Some(env) = config.environment.as_ref().filter(|e| !e.code.is_empty()) {
        return Ok(env.clone());
    }

    if let Some(url) = &page.url {
        let matched = config.environments.iter().find(|env| {
            env.pattern
                .as_deref()
                .is_some_and(|p| pattern_matches(p, url.as_str()))
        });
        if let Some(env) = matched {
            return Ok(env.clone());
        }
    }

    config
        .environments
        .iter()
        .find(|e| e.code == PRODUCTION_ENVIRONMENT)
        .cloned()
        .ok_or(ConsentError::NoEnvironment)
}

// =============================================================================
// Jurisdiction
// =============================================================================

/// Resolves the jurisdiction code for the page and visitor region.
pub fn resolve_jurisdiction(
    config: &Configuration,
    page: &PageContext,
    region: Option<&str>,
) -> CoreResult<String> {
    if let Some(code) = page.query_param(JURISDICTION_PARAMETER).filter(|c| !c.is_empty()) {
        return Ok(code);
    }

    if let Some(code) = config.jurisdiction_code() {
        return Ok(code.to_string());
    }

    if let Some(code) = page.jurisdiction_attribute.as_ref().filter(|c| !c.is_empty()) {
        return Ok(code.clone());
    }

    let Some(info) = config.jurisdiction.as_ref() else {
        return Err(ConsentError::NoJurisdiction);
    };

    if let Some(code) = info
        .variable
        .as_deref()
        .and_then(|variable| page.data_layer_value(variable))
    {
        return Ok(code);
    }

    if let Some(code) = region.and_then(|r| info.jurisdictions.get(r)) {
        return Ok(code.clone());
    }

    info.default_jurisdiction_code
        .clone()
        .filter(|c| !c.is_empty())
        .ok_or(ConsentError::NoJurisdiction)
}

// =============================================================================
// Region
// =============================================================================

/// Resolves the visitor region from an override or GeoIP data.
pub fn resolve_region(page: &PageContext, location: Option<&IpInfo>) -> CoreResult<String> {
    if let Some(region) = page.query_param(REGION_PARAMETER).filter(|r| !r.is_empty()) {
        return Ok(region);
    }

    let info = location
        .filter(|l| !l.country_code.is_empty())
        .ok_or(ConsentError::UnrecognizedLocation)?;

    if info.country_code == "US" && !info.region_code.is_empty() {
        Ok(format!("US-{}", info.region_code))
    } else {
        Ok(info.country_code.clone())
    }
}
