//! # Identity Collection
//!
//! Reads visitor identities from the page and feeds them to the engine.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  IdentitySource            IdentityWatcher              ConsentEngine  │
//! │  ──────────────            ───────────────              ─────────────  │
//! │  window snapshot  ──read──► start(): initial  ──mpsc──► set_identities │
//! │  cookies                    observation                 (reactor)      │
//! │  local/session              every interval:                            │
//! │  query string               new or changed   ──mpsc──►                 │
//! │  data layer                 values only                                │
//! │                             until timeout / stop()                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use consent_core::identity::decode_identity;
use consent_core::path::resolve_path;
use consent_core::{IdentityDescriptor, IdentityKind, Identities, PageContext};
use consent_store::StorageArea;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};

// =============================================================================
// Sources
// =============================================================================

/// Reads the raw value a descriptor points at.
pub trait IdentitySource: Send + Sync {
    fn read(&self, descriptor: &IdentityDescriptor) -> Option<String>;
}

/// Identity source over host-provided snapshots of the page.
pub struct SnapshotSource {
    window: RwLock<Value>,
    cookies: Option<Arc<dyn StorageArea>>,
    local: Option<Arc<dyn StorageArea>>,
    session: Option<Arc<dyn StorageArea>>,
    page: RwLock<PageContext>,
}

impl SnapshotSource {
    pub fn new(page: PageContext) -> Self {
        SnapshotSource {
            window: RwLock::new(Value::Null),
            cookies: None,
            local: None,
            session: None,
            page: RwLock::new(page),
        }
    }

    pub fn with_window(self, window: Value) -> Self {
        self.set_window(window);
        self
    }

    pub fn with_cookies(mut self, area: Arc<dyn StorageArea>) -> Self {
        self.cookies = Some(area);
        self
    }

    pub fn with_local_storage(mut self, area: Arc<dyn StorageArea>) -> Self {
        self.local = Some(area);
        self
    }

    pub fn with_session_storage(mut self, area: Arc<dyn StorageArea>) -> Self {
        self.session = Some(area);
        self
    }

    /// Replaces the window snapshot.
    pub fn set_window(&self, window: Value) {
        if let Ok(mut slot) = self.window.write() {
            *slot = window;
        }
    }

    /// Replaces the page context (URL and data layer).
    pub fn set_page(&self, page: PageContext) {
        if let Ok(mut slot) = self.page.write() {
            *slot = page;
        }
    }

    fn read_window(&self, variable: &str) -> Option<String> {
        let window = self.window.read().ok()?;
        match resolve_path(variable, &window)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn read_area(area: Option<&Arc<dyn StorageArea>>, variable: &str) -> Option<String> {
        match area?.get(variable) {
            Ok(value) => value,
            Err(e) => {
                warn!(variable, error = %e, "Failed to read identity from storage");
                None
            }
        }
    }
}

impl IdentitySource for SnapshotSource {
    fn read(&self, descriptor: &IdentityDescriptor) -> Option<String> {
        let variable = descriptor.variable.as_str();
        let raw = match descriptor.kind {
            IdentityKind::Window => self.read_window(variable),
            IdentityKind::Cookie => Self::read_area(self.cookies.as_ref(), variable),
            IdentityKind::LocalStorage => Self::read_area(self.local.as_ref(), variable),
            IdentityKind::SessionStorage => Self::read_area(self.session.as_ref(), variable),
            IdentityKind::QueryString => self.page.read().ok()?.query_param(variable),
            IdentityKind::DataLayer => self.page.read().ok()?.data_layer_value(variable),
        }?;
        decode_identity(&raw, descriptor)
    }
}

/// Reads every descriptor once. Spaces without a value are left out.
pub fn observe(source: &dyn IdentitySource, descriptors: &[(String, IdentityDescriptor)]) -> Identities {
    descriptors
        .iter()
        .filter_map(|(space, descriptor)| {
            source
                .read(descriptor)
                .map(|value| (space.clone(), value))
        })
        .collect()
}

// =============================================================================
// Watchers
// =============================================================================

/// Observes identities and reports them over a channel.
#[async_trait]
pub trait IdentityWatcher: Send + Sync {
    /// Registers an identity space to watch.
    fn add(&self, space: &str, descriptor: IdentityDescriptor);

    /// Sends the initial observation before returning, then keeps reporting
    /// new values in the background.
    async fn start(&self, tx: mpsc::UnboundedSender<Identities>) -> EngineResult<()>;

    /// Stops background observation.
    fn stop(&self);
}

/// Polls an [`IdentitySource`] at a fixed interval until a timeout.
pub struct PollingWatcher {
    source: Arc<dyn IdentitySource>,
    interval: Duration,
    timeout: Duration,
    descriptors: Mutex<Vec<(String, IdentityDescriptor)>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl PollingWatcher {
    pub fn new(source: Arc<dyn IdentitySource>, interval: Duration, timeout: Duration) -> Self {
        PollingWatcher {
            source,
            interval,
            timeout,
            descriptors: Mutex::new(Vec::new()),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Watcher polling at the settings' `watcher_interval` until
    /// `watcher_timeout`.
    pub fn from_settings(source: Arc<dyn IdentitySource>, settings: &EngineSettings) -> Self {
        Self::new(source, settings.watcher_interval(), settings.watcher_timeout())
    }

    fn descriptors(&self) -> MutexGuard<'_, Vec<(String, IdentityDescriptor)>> {
        self.descriptors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shutdown_slot(&self) -> MutexGuard<'_, Option<mpsc::Sender<()>>> {
        self.shutdown_tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl IdentityWatcher for PollingWatcher {
    fn add(&self, space: &str, descriptor: IdentityDescriptor) {
        let mut descriptors = self.descriptors();
        descriptors.retain(|(existing, _)| existing != space);
        descriptors.push((space.to_string(), descriptor));
    }

    async fn start(&self, tx: mpsc::UnboundedSender<Identities>) -> EngineResult<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        {
            let mut slot = self.shutdown_slot();
            if slot.is_some() {
                return Err(EngineError::Internal("identity watcher already started".into()));
            }
            *slot = Some(shutdown_tx);
        }

        let descriptors = self.descriptors().clone();
        let mut seen = observe(self.source.as_ref(), &descriptors);
        if !seen.is_empty() {
            tx.send(seen.clone())
                .map_err(|_| EngineError::ChannelError("identity channel closed".into()))?;
        }

        info!(
            spaces = descriptors.len(),
            initial = seen.len(),
            "Identity watcher started"
        );

        let source = self.source.clone();
        let period = self.interval;
        let timeout = self.timeout;

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let fresh: Identities = observe(source.as_ref(), &descriptors)
                            .into_iter()
                            .filter(|(space, value)| seen.get(space) != Some(value))
                            .collect();

                        if fresh.is_empty() {
                            continue;
                        }

                        debug!(count = fresh.len(), "Observed new identities");
                        seen.extend(fresh.clone());
                        if tx.send(fresh).is_err() {
                            break;
                        }
                    }

                    _ = &mut deadline => {
                        debug!("Identity watcher timed out");
                        break;
                    }

                    _ = shutdown_rx.recv() => {
                        debug!("Identity watcher stopping");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    fn stop(&self) {
        if let Some(tx) = self.shutdown_slot().take() {
            let _ = tx.try_send(());
        }
    }
}

/// Reports a fixed identity map once.
#[derive(Default)]
pub struct StaticWatcher {
    identities: Identities,
}

impl StaticWatcher {
    pub fn new(identities: Identities) -> Self {
        StaticWatcher { identities }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityWatcher for StaticWatcher {
    fn add(&self, space: &str, _descriptor: IdentityDescriptor) {
        debug!(space, "Static watcher ignores descriptors");
    }

    async fn start(&self, tx: mpsc::UnboundedSender<Identities>) -> EngineResult<()> {
        if !self.identities.is_empty() {
            tx.send(self.identities.clone())
                .map_err(|_| EngineError::ChannelError("identity channel closed".into()))?;
        }
        Ok(())
    }

    fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use consent_core::IdentityFormat;
    use consent_store::MemoryStorage;
    use serde_json::json;

    fn descriptor(kind: IdentityKind, variable: &str) -> IdentityDescriptor {
        IdentityDescriptor {
            kind,
            variable: variable.into(),
            format: IdentityFormat::String,
            key: None,
        }
    }

    #[test]
    fn test_snapshot_source_reads_every_kind() {
        let cookies = Arc::new(MemoryStorage::new());
        cookies.set("_uid", "cookie-id").unwrap();

        let mut page = PageContext::for_url("https://example.com/?uid=query-id").unwrap();
        page.data_layer = vec![json!({"visitor": "dl-id"})];

        let source = SnapshotSource::new(page)
            .with_window(json!({"user": {"id": 42, "profile": {"email": "a@b.c"}}}))
            .with_cookies(cookies);

        assert_eq!(
            source.read(&descriptor(IdentityKind::Window, "window.user.id")).as_deref(),
            Some("42")
        );
        assert_eq!(
            source.read(&descriptor(IdentityKind::Cookie, "_uid")).as_deref(),
            Some("cookie-id")
        );
        assert_eq!(
            source.read(&descriptor(IdentityKind::QueryString, "uid")).as_deref(),
            Some("query-id")
        );
        assert_eq!(
            source.read(&descriptor(IdentityKind::DataLayer, "visitor")).as_deref(),
            Some("dl-id")
        );
        assert_eq!(source.read(&descriptor(IdentityKind::LocalStorage, "_uid")), None);

        let json_descriptor = IdentityDescriptor {
            format: IdentityFormat::Json,
            key: Some("email".into()),
            ..descriptor(IdentityKind::Window, "user.profile")
        };
        assert_eq!(source.read(&json_descriptor).as_deref(), Some("a@b.c"));
    }

    #[test]
    fn test_polling_watcher_timing_from_settings() {
        let settings = EngineSettings {
            watcher_interval_ms: 250,
            watcher_timeout_ms: 3_000,
            ..Default::default()
        };
        let watcher = PollingWatcher::from_settings(
            Arc::new(SnapshotSource::new(PageContext::default())),
            &settings,
        );
        assert_eq!(watcher.interval, Duration::from_millis(250));
        assert_eq!(watcher.timeout, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_watcher_reports_only_new_values() {
        let cookies = Arc::new(MemoryStorage::new());
        let source = Arc::new(
            SnapshotSource::new(PageContext::default())
                .with_window(json!({"user": {"id": "abc"}}))
                .with_cookies(cookies.clone()),
        );

        let watcher = PollingWatcher::new(
            source.clone(),
            Duration::from_secs(2),
            Duration::from_secs(10),
        );
        watcher.add("window_id", descriptor(IdentityKind::Window, "user.id"));
        watcher.add("cookie_id", descriptor(IdentityKind::Cookie, "_uid"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.start(tx).await.unwrap();

        let initial = rx.recv().await.unwrap();
        assert_eq!(
            initial,
            Identities::from([("window_id".to_string(), "abc".to_string())])
        );

        cookies.set("_uid", "xyz").unwrap();
        let later = rx.recv().await.unwrap();
        assert_eq!(
            later,
            Identities::from([("cookie_id".to_string(), "xyz".to_string())])
        );

        // Nothing else changes; the loop ends at the timeout.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_polling_watcher_rejects_double_start() {
        let source = Arc::new(SnapshotSource::new(PageContext::default()));
        let watcher = PollingWatcher::new(source, Duration::from_secs(1), Duration::from_secs(5));

        let (tx, _rx) = mpsc::unbounded_channel();
        watcher.start(tx.clone()).await.unwrap();
        assert!(watcher.start(tx).await.is_err());
        watcher.stop();
    }

    #[tokio::test]
    async fn test_static_watcher() {
        let ids = Identities::from([("swb_web".to_string(), "v".to_string())]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        StaticWatcher::new(ids.clone()).start(tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(ids));

        let (tx, mut rx) = mpsc::unbounded_channel();
        StaticWatcher::empty().start(tx).await.unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
