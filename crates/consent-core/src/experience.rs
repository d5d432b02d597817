//! # Experience Selection
//!
//! Decides whether a consent or preference experience must be shown, and
//! how the consent experience should be displayed.
//!
//! ## Decision Order (first match wins)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     select_experience(consent)                          │
//! │                                                                         │
//! │  a. experience already displayed this session  ──► None                 │
//! │  b. `swb_show` present:  "preferences"         ──► Preference           │
//! │                          anything else / empty ──► Consent              │
//! │  c. a configured purpose is ABSENT from consent ──► Consent             │
//! │  d. otherwise                                   ──► None                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Absent means "no key", not "false": a denied purpose is an answer.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::{Configuration, Consent, ExperienceDefault};
use crate::PREFERENCES_SHOW_VALUE;

/// Which experience to surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum ExperienceType {
    Consent,
    Preference,
}

impl std::fmt::Display for ExperienceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperienceType::Consent => write!(f, "consent"),
            ExperienceType::Preference => write!(f, "preference"),
        }
    }
}

/// Display hint for the consent experience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum ConsentExperienceType {
    Banner,
    Modal,
}

/// Why an experience went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum ExperienceClosedReason {
    SetConsent,
    InvokeRight,
    Close,
    WillNotShow,
}

impl std::fmt::Display for ExperienceClosedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperienceClosedReason::SetConsent => write!(f, "setConsent"),
            ExperienceClosedReason::InvokeRight => write!(f, "invokeRight"),
            ExperienceClosedReason::Close => write!(f, "close"),
            ExperienceClosedReason::WillNotShow => write!(f, "willNotShow"),
        }
    }
}

/// Decides which experience, if any, must be shown for `consent`.
///
/// `show_override` is the value of the page's show parameter: `None` when
/// the parameter is absent, `Some("")` when present without a value.
pub fn select_experience(
    config: &Configuration,
    consent: &Consent,
    show_override: Option<&str>,
    already_displayed: bool,
) -> Option<ExperienceType> {
    if already_displayed {
        return None;
    }

    if let Some(value) = show_override {
        return if value == PREFERENCES_SHOW_VALUE {
            Some(ExperienceType::Preference)
        } else {
            Some(ExperienceType::Consent)
        };
    }

    let missing = config
        .purposes
        .iter()
        .any(|p| !consent.purposes.contains_key(&p.code));

    if missing {
        Some(ExperienceType::Consent)
    } else {
        None
    }
}

/// Modal only when the property defaults to modal AND some purpose
/// requires opt-in; banner otherwise.
pub fn select_consent_experience(config: &Configuration) -> ConsentExperienceType {
    if config.experience_default() == ExperienceDefault::Modal && config.any_requires_opt_in() {
        ConsentExperienceType::Modal
    } else {
        ConsentExperienceType::Banner
    }
}
