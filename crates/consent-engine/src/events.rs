//! # Event Bus
//!
//! Named pub/sub fabric owned by the engine.
//!
//! ## Events
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  CELL-BACKED (replayed to new listeners)   FREE-FORM                    │
//! │  ────────────────────────────────────────  ──────────────────────────── │
//! │  consent        [Consent]                  willShowExperience  [type]   │
//! │  environment    [Environment]              showConsentExperience ★      │
//! │  geoip          [IpInfo]                     [Consent, {displayHint}]   │
//! │  identities     [Identities]               showPreferenceExperience ★   │
//! │  jurisdiction   [code]                       [Consent]                  │
//! │  regionInfo     [region]                   hideExperience      [reason] │
//! │                                            rightInvoked        [request]│
//! │                                                                         │
//! │  ★ singleton: registering a listener replaces the previous one         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every emission is mirrored to the native bridge when the native side has
//! a handler for the event.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::bridge::{encode_native_args, NativeBridge};
use crate::engine::ConsentEngine;

/// Event names emitted by the engine.
pub mod names {
    pub const CONSENT: &str = "consent";
    pub const ENVIRONMENT: &str = "environment";
    pub const GEOIP: &str = "geoip";
    pub const IDENTITIES: &str = "identities";
    pub const JURISDICTION: &str = "jurisdiction";
    pub const REGION_INFO: &str = "regionInfo";
    pub const WILL_SHOW_EXPERIENCE: &str = "willShowExperience";
    pub const SHOW_CONSENT_EXPERIENCE: &str = "showConsentExperience";
    pub const SHOW_PREFERENCE_EXPERIENCE: &str = "showPreferenceExperience";
    pub const HIDE_EXPERIENCE: &str = "hideExperience";
    pub const RIGHT_INVOKED: &str = "rightInvoked";
}

/// One delivery to a listener.
pub struct Event<'a> {
    pub name: &'a str,
    pub args: &'a [Value],

    /// The emitting engine. Never forwarded to the native side.
    pub engine: Option<&'a ConsentEngine>,
}

impl Event<'_> {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Deserializes argument `index`.
    pub fn decode<T: DeserializeOwned>(&self, index: usize) -> Option<T> {
        serde_json::from_value(self.args.get(index)?.clone()).ok()
    }
}

/// Event callback.
pub type Listener = Arc<dyn Fn(&Event<'_>) + Send + Sync>;

struct Registration {
    listener: Listener,
    once: bool,
}

#[derive(Default)]
struct BusState {
    listeners: HashMap<String, Vec<Registration>>,
    warned: HashSet<String>,
}

/// The engine's event fabric.
pub struct EventBus {
    state: Mutex<BusState>,
    native: Option<Arc<dyn NativeBridge>>,
    max_listeners: usize,
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl EventBus {
    pub fn new(max_listeners: usize, native: Option<Arc<dyn NativeBridge>>) -> Self {
        EventBus {
            state: Mutex::new(BusState::default()),
            native,
            max_listeners,
        }
    }

    /// Events that keep at most one listener.
    pub fn is_singleton(event: &str) -> bool {
        event == names::SHOW_CONSENT_EXPERIENCE || event == names::SHOW_PREFERENCE_EXPERIENCE
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, event: &str, listener: Listener, once: bool) {
        let mut state = self.lock();
        let registrations = state.listeners.entry(event.to_string()).or_default();

        if Self::is_singleton(event) {
            if !registrations.is_empty() {
                debug!(event, "Replacing singleton listener");
            }
            registrations.clear();
        }
        registrations.push(Registration { listener, once });

        let count = registrations.len();
        if count > self.max_listeners && state.warned.insert(event.to_string()) {
            warn!(
                event,
                count,
                max = self.max_listeners,
                "Possible listener leak: too many listeners"
            );
        }
    }

    /// Adds a listener called on every emission.
    pub fn on(&self, event: &str, listener: Listener) {
        self.add(event, listener, false);
    }

    /// Adds a listener called on the next emission only.
    pub fn once(&self, event: &str, listener: Listener) {
        self.add(event, listener, true);
    }

    /// Removes every registration of `listener` for `event`.
    pub fn off(&self, event: &str, listener: &Listener) -> bool {
        let mut state = self.lock();
        let Some(registrations) = state.listeners.get_mut(event) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| !same_listener(&r.listener, listener));
        registrations.len() != before
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().listeners.get(event).map_or(0, Vec::len)
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        self.listener_count(event) > 0
    }

    /// Delivers `args` to every listener of `event`, mirroring to the native
    /// bridge first. Returns true when at least one listener ran.
    pub fn emit(&self, event: &str, args: &[Value], engine: Option<&ConsentEngine>) -> bool {
        let listeners: Vec<Listener> = {
            let mut state = self.lock();
            match state.listeners.get_mut(event) {
                Some(registrations) => {
                    let listeners = registrations.iter().map(|r| r.listener.clone()).collect();
                    registrations.retain(|r| !r.once);
                    listeners
                }
                None => Vec::new(),
            }
        };

        if let Some(native) = &self.native {
            if native.has_handler(event) {
                native.post(event, encode_native_args(args));
            }
        }

        let delivery = Event {
            name: event,
            args,
            engine,
        };
        for listener in &listeners {
            listener(&delivery);
        }

        !listeners.is_empty()
    }
}
