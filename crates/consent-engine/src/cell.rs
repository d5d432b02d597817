//! # Future Cell
//!
//! A single-slot asynchronous value holder. Every lazily resolved piece of
//! engine state (consent, environment, GeoIP, identities, jurisdiction,
//! region) lives in one.
//!
//! ## Cell Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   EMPTY ───────── set_value(v) ─────────► RESOLVED(v)                   │
//! │     │  get_value() queues a waiter           │  get_value() returns v  │
//! │     │                                        │                          │
//! │     │   on set: 1. drain waiters, FIFO       │  set_value(w)            │
//! │     │           2. notify subscribers,       ▼                          │
//! │     │              newest first           RESOLVED(w)                   │
//! │     │                                        │                          │
//! │     ◄──────────── clear() ───────────────────┘                          │
//! │        (no waiter or subscriber is told)                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A cell has no error state and no timeout. Callers wrap `get_value` in
//! their own timeout when they need one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

/// Callback invoked on every value change.
pub type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct CellState<T> {
    value: Option<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    subscribers: Vec<Subscriber<T>>,
}

/// Single-slot async value with waiters and subscribers.
pub struct FutureCell<T> {
    state: Mutex<CellState<T>>,
}

fn same_subscriber<T>(a: &Subscriber<T>, b: &Subscriber<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl<T: Clone + Send + 'static> FutureCell<T> {
    pub fn new() -> Self {
        FutureCell {
            state: Mutex::new(CellState {
                value: None,
                waiters: VecDeque::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_value(&self) -> bool {
        self.lock().value.is_some()
    }

    /// Current value without waiting.
    pub fn peek(&self) -> Option<T> {
        self.lock().value.clone()
    }

    /// Resolves immediately when a value exists, otherwise waits for the
    /// next `set_value`.
    pub async fn get_value(&self) -> T {
        let rx = {
            let mut state = self.lock();
            if let Some(value) = &state.value {
                return value.clone();
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match rx.await {
            Ok(value) => value,
            // The cell was dropped while empty; nothing will ever resolve.
            Err(_) => std::future::pending().await,
        }
    }

    /// Stores `value`, wakes waiters in registration order, then notifies
    /// subscribers newest first. Returns the stored value.
    pub fn set_value(&self, value: T) -> T {
        let (waiters, subscribers) = {
            let mut state = self.lock();
            state.value = Some(value.clone());
            (
                std::mem::take(&mut state.waiters),
                state.subscribers.clone(),
            )
        };

        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
        for subscriber in subscribers.iter().rev() {
            subscriber(&value);
        }

        value
    }

    /// Empties the cell and returns the previous value. Pending waiters stay
    /// queued and subscribers are not notified.
    pub fn clear(&self) -> Option<T> {
        self.lock().value.take()
    }

    /// Adds a subscriber. Registering the same `Arc` twice is a no-op and
    /// returns false.
    pub fn subscribe(&self, subscriber: Subscriber<T>) -> bool {
        let mut state = self.lock();
        if state
            .subscribers
            .iter()
            .any(|existing| same_subscriber(existing, &subscriber))
        {
            return false;
        }
        state.subscribers.push(subscriber);
        true
    }

    /// Removes a subscriber previously added with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, subscriber: &Subscriber<T>) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state
            .subscribers
            .retain(|existing| !same_subscriber(existing, subscriber));
        state.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }
}

impl<T: Clone + Send + 'static> Default for FutureCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
