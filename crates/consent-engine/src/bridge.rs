//! # Native Bridge
//!
//! Mirrors engine events into a native app shell (Android WebView
//! listener object, iOS WKWebView message handlers).
//!
//! ## Argument Encoding
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  emit args                     native payload                           │
//! │  ────────────────────────────  ──────────────────────────────────────── │
//! │  ()                            None                                     │
//! │  ("gdpr")                      Some("gdpr")             raw string      │
//! │  ({"purposes": {...}})         Some("{\"purposes\":{...}}")   JSON      │
//! │  ("test", 123)                 Some("[\"test\",123]")   JSON array      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine reference handed to in-process listeners is never part of
//! the payload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// A native message sink keyed by event name.
pub trait NativeBridge: Send + Sync {
    /// True when the native side registered a handler for `event`.
    fn has_handler(&self, event: &str) -> bool;

    /// Delivers one event to the native side.
    fn post(&self, event: &str, payload: Option<String>);
}

/// Encodes emit arguments into the single native payload.
pub fn encode_native_args(args: &[Value]) -> Option<String> {
    match args {
        [] => None,
        [Value::String(s)] => Some(s.clone()),
        [single] => Some(single.to_string()),
        many => Some(Value::Array(many.to_vec()).to_string()),
    }
}

/// Handler invoked with the encoded payload.
pub type NativeHandler = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// Bridge dispatching to per-event handlers registered by the host.
#[derive(Default)]
pub struct HandlerBridge {
    handlers: Mutex<HashMap<String, NativeHandler>>,
}

impl HandlerBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: impl Into<String>, handler: NativeHandler) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(event.into(), handler);
        }
    }

    fn handler(&self, event: &str) -> Option<NativeHandler> {
        self.handlers.lock().ok()?.get(event).cloned()
    }
}

impl NativeBridge for HandlerBridge {
    fn has_handler(&self, event: &str) -> bool {
        self.handler(event).is_some()
    }

    fn post(&self, event: &str, payload: Option<String>) {
        if let Some(handler) = self.handler(event) {
            handler(payload);
        }
    }
}

/// Bridge that records every delivered message.
#[derive(Default)]
pub struct RecordingBridge {
    events: Vec<String>,
    posted: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingBridge {
    /// Accepts only the listed events.
    pub fn with_handlers(events: &[&str]) -> Self {
        RecordingBridge {
            events: events.iter().map(|e| e.to_string()).collect(),
            posted: Mutex::new(Vec::new()),
        }
    }

    /// Messages delivered so far, oldest first.
    pub fn posted(&self) -> Vec<(String, Option<String>)> {
        self.posted.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl NativeBridge for RecordingBridge {
    fn has_handler(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }

    fn post(&self, event: &str, payload: Option<String>) {
        if let Ok(mut posted) = self.posted.lock() {
            posted.push((event.to_string(), payload));
        }
    }
}
