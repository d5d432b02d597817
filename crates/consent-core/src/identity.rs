//! Identity value decoding.
//!
//! A descriptor's raw value may be a plain string or a container (JSON,
//! query string, semicolon list) from which `key` selects the identity.

use serde_json::Value;

use crate::path::resolve_string;
use crate::types::{IdentityDescriptor, IdentityFormat, Identities};

/// Decodes a raw page value according to its descriptor.
pub fn decode_identity(raw: &str, descriptor: &IdentityDescriptor) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    match descriptor.format {
        IdentityFormat::String => Some(raw.to_string()),
        IdentityFormat::Json => {
            let value: Value = serde_json::from_str(raw).ok()?;
            match descriptor.key.as_deref() {
                Some(key) => resolve_string(key, &value),
                None => resolve_string("", &value),
            }
        }
        IdentityFormat::Query => find_pair(raw, '&', descriptor.key.as_deref()?),
        IdentityFormat::Semicolon => find_pair(raw, ';', descriptor.key.as_deref()?),
    }
}

fn find_pair(raw: &str, separator: char, key: &str) -> Option<String> {
    raw.split(separator).find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k.trim() == key && !v.trim().is_empty() {
            Some(v.trim().to_string())
        } else {
            None
        }
    })
}

/// Merges newly observed identities into `known`.
///
/// Identities accumulate: nothing already known is removed. Returns true
/// when a value was added or changed.
pub fn merge_identities(known: &mut Identities, observed: &Identities) -> bool {
    let mut changed = false;
    for (space, value) in observed {
        if known.get(space) != Some(value) {
            known.insert(space.clone(), value.clone());
            changed = true;
        }
    }
    changed
}
