//! # Consent Engine
//!
//! Resolves the visitor's consent from cache, server and provisional input,
//! keeps it in sync with the server, and tells the page when to show an
//! experience.
//!
//! ## get_consent
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  consent cell set? ── yes ──► return it (no network)                   │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │  identities ──► in-flight fetch for these identities? ── yes ──► await │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │  fetch_consent ── cache usable? ── no ──► API get, normalize, cache    │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  provisional override ─► select experience ─► default grants           │
//! │        │                 (pre-fill state)     (non opt-in purposes)     │
//! │        ▼                                                                │
//! │  persist needed? ── yes ──► set_consent (cell + cache + API)           │
//! │        │ no ──────────────► cell only                                   │
//! │        ▼                                                                │
//! │  Consent ► showConsentExperience   Preference ► showPreferenceExperience│
//! │  none    ► hideExperience(willNotShow)                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Reactor
//! ```text
//! set_identities(new) ─► merge ─► experience displayed? ─► stop
//!                                 local consent empty?  ─► stop
//!                                 server consent equal? ─► stop
//!                                 already shown once?   ─► push local consent
//!                                 otherwise             ─► show experience
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use consent_core::consent::{
    apply_default_grants, apply_provisional, build_get_request, build_set_request,
    cache_decision, merge_missing, normalize_response, project_consent, same_purposes,
};
use consent_core::experience;
use consent_core::identity::merge_identities;
use consent_core::protocol::{
    ConsentRecord, GetFullConfigurationRequest, InvokeRightRequest, IpInfo, RightInvocation,
};
use consent_core::resolve::{resolve_environment, resolve_jurisdiction, resolve_region};
use consent_core::{
    Configuration, Consent, ConsentError, ConsentExperienceType, Environment,
    ExperienceClosedReason, ExperienceType, Identities, PageContext,
};
use consent_store::{CacheChain, Cacher, ConsentCache, MemoryStorage};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ConsentApi;
use crate::bridge::NativeBridge;
use crate::cell::FutureCell;
use crate::config::EngineSettings;
use crate::error::EngineResult;
use crate::events::{names, Event, EventBus, Listener};
use crate::identity::{IdentitySource, IdentityWatcher, PollingWatcher, StaticWatcher};
use crate::plugin::{self, Plugin};

// =============================================================================
// Host Bindings
// =============================================================================

/// Everything the engine reads from or pushes to the host page.
#[derive(Clone)]
pub struct HostBindings {
    /// URL, document jurisdiction attribute and data layer.
    pub page: PageContext,

    /// Native app shell, when the page runs inside one.
    pub native: Option<Arc<dyn NativeBridge>>,

    /// Source of visitor identities.
    pub watcher: Arc<dyn IdentityWatcher>,

    /// Page snapshot to poll for identities. When set, the builder replaces
    /// `watcher` with a [`PollingWatcher`] timed by the engine settings.
    pub identity_source: Option<Arc<dyn IdentitySource>>,
}

impl Default for HostBindings {
    fn default() -> Self {
        HostBindings {
            page: PageContext::default(),
            native: None,
            watcher: Arc::new(StaticWatcher::empty()),
            identity_source: None,
        }
    }
}

impl HostBindings {
    pub fn new(page: PageContext) -> Self {
        HostBindings {
            page,
            ..Default::default()
        }
    }

    pub fn with_native(mut self, native: Arc<dyn NativeBridge>) -> Self {
        self.native = Some(native);
        self
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn IdentityWatcher>) -> Self {
        self.watcher = watcher;
        self
    }

    /// Polls `source` for identities using the settings' watcher timing.
    pub fn with_identity_source(mut self, source: Arc<dyn IdentitySource>) -> Self {
        self.identity_source = Some(source);
        self
    }
}

// =============================================================================
// Engine
// =============================================================================

type InFlight = Shared<BoxFuture<'static, EngineResult<Consent>>>;

struct EngineInner {
    config: Configuration,
    settings: EngineSettings,
    api: Arc<dyn ConsentApi>,
    cache: ConsentCache,
    host: HostBindings,
    events: EventBus,

    consent: FutureCell<Consent>,
    environment: FutureCell<Environment>,
    geoip: FutureCell<IpInfo>,
    identities: FutureCell<Identities>,
    jurisdiction: FutureCell<String>,
    region_info: FutureCell<String>,

    provisional: Mutex<Option<Consent>>,
    displayed: AtomicBool,
    has_been_displayed: AtomicBool,
    collection_started: AtomicBool,

    /// Serializes read-merge-store-sync of the consent cell.
    consent_writer: tokio::sync::Mutex<()>,
    in_flight: Mutex<HashMap<Identities, InFlight>>,
    identity_task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineInner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<Identities, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.host.watcher.stop();
        if let Ok(slot) = self.identity_task.get_mut() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// The consent engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConsentEngine {
    inner: Arc<EngineInner>,
}

fn to_arg<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Mirrors every change of `cell` to `event` on the bus.
fn relay<T>(cell: &FutureCell<T>, engine: Weak<EngineInner>, event: &'static str)
where
    T: Serialize + Clone + Send + 'static,
{
    cell.subscribe(Arc::new(move |value: &T| {
        if let Some(inner) = engine.upgrade() {
            let engine = ConsentEngine { inner };
            engine.inner.events.emit(event, &[to_arg(value)], Some(&engine));
        }
    }));
}

impl ConsentEngine {
    fn wire_cells(&self) {
        let inner = &self.inner;
        let weak = Arc::downgrade(inner);
        relay(&inner.consent, weak.clone(), names::CONSENT);
        relay(&inner.environment, weak.clone(), names::ENVIRONMENT);
        relay(&inner.geoip, weak.clone(), names::GEOIP);
        relay(&inner.identities, weak.clone(), names::IDENTITIES);
        relay(&inner.jurisdiction, weak.clone(), names::JURISDICTION);
        relay(&inner.region_info, weak, names::REGION_INFO);
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn page(&self) -> &PageContext {
        &self.inner.host.page
    }

    // =========================================================================
    // Consent Resolution
    // =========================================================================

    /// Returns the visitor's consent, resolving it on first use.
    ///
    /// Concurrent callers for the same identities share a single fetch.
    pub async fn get_consent(&self) -> EngineResult<Consent> {
        if let Some(consent) = self.inner.consent.peek() {
            return Ok(consent);
        }

        let identities = self.get_identities().await;

        let fetch = {
            let mut in_flight = self.inner.in_flight();

            // Another caller may have resolved while identities were pending.
            if let Some(consent) = self.inner.consent.peek() {
                return Ok(consent);
            }

            match in_flight.get(&identities) {
                Some(existing) => {
                    debug!("Joining in-flight consent fetch");
                    existing.clone()
                }
                None => {
                    let engine = self.clone();
                    let key = identities.clone();
                    let fetch = async move {
                        let result = engine.resolve_consent(&key).await;
                        engine.inner.in_flight().remove(&key);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(identities, fetch.clone());
                    fetch
                }
            }
        };

        fetch.await
    }

    async fn resolve_consent(&self, identities: &Identities) -> EngineResult<Consent> {
        let mut consent = self.fetch_consent(identities).await?;
        let mut should_persist = false;

        if let Some(provisional) = self.take_provisional() {
            should_persist |= apply_provisional(&mut consent, &provisional);
        }

        let selected = self.select_experience(&consent);

        if apply_default_grants(self.config(), &mut consent) {
            should_persist = true;
        }

        let consent = if should_persist {
            self.set_consent(consent).await?
        } else {
            self.store_consent(consent).await
        };

        info!(
            purposes = consent.purposes.len(),
            persisted = should_persist,
            experience = ?selected,
            "Consent resolved"
        );

        let renderer = selected.map(|kind| match kind {
            ExperienceType::Consent => names::SHOW_CONSENT_EXPERIENCE,
            ExperienceType::Preference => names::SHOW_PREFERENCE_EXPERIENCE,
        });

        Ok(match selected {
            Some(kind) if renderer.is_some_and(|event| self.inner.events.has_listeners(event)) => {
                match kind {
                    ExperienceType::Consent => self.show_consent_experience(),
                    ExperienceType::Preference => self.show_preference_experience(),
                }
            }
            _ => {
                if selected.is_some() {
                    debug!(experience = ?selected, "No experience renderer registered");
                }
                self.emit(
                    names::HIDE_EXPERIENCE,
                    &[to_arg(&ExperienceClosedReason::WillNotShow)],
                );
                consent
            }
        })
    }

    /// Reads consent for `identities` from cache or server.
    ///
    /// Only configured purposes are returned; purposes without an answer
    /// stay absent.
    pub async fn fetch_consent(&self, identities: &Identities) -> EngineResult<Consent> {
        let request = build_get_request(self.config(), identities)?;

        let cached = self.inner.cache.get_cached_consent(&request).await;
        let decision = cache_decision(
            &cached,
            &request,
            Utc::now().timestamp(),
            self.settings().cache_ttl_secs,
        );

        let record = if decision.is_usable() {
            debug!("Using cached consent");
            cached
        } else {
            debug!(%decision, "Fetching consent from API");
            let response = self.inner.api.get_consent(&request).await?;
            let record = normalize_response(&request, response);
            self.inner.cache.set_cached_consent(record.clone()).await;
            record
        };

        Ok(project_consent(self.config(), &record))
    }

    /// Pushes `consent` for `identities` to the cache and the server.
    ///
    /// ## Errors
    /// - `NoIdentities` when `identities` is empty
    /// - `InvalidConfiguration` when the scope is incomplete
    /// - `EmptyConsent` when `consent` has no purposes
    pub async fn update_consent(&self, identities: &Identities, consent: &Consent) -> EngineResult<()> {
        let request = build_set_request(
            self.config(),
            identities,
            consent,
            self.settings().migration.as_deref(),
        )?;

        let Some(mut request) = request else {
            debug!("No configured purposes to update");
            return Ok(());
        };

        request.collected_at = Some(Utc::now().timestamp());
        self.inner
            .cache
            .set_cached_consent(ConsentRecord::from(request.clone()))
            .await;
        self.inner.api.set_consent(&request).await?;

        info!(purposes = request.purposes.len(), "Consent synchronized");
        Ok(())
    }

    /// Stores `consent` and synchronizes it.
    ///
    /// An empty consent clears the cell. Purposes known before but absent
    /// from `consent` are carried forward.
    pub async fn set_consent(&self, consent: Consent) -> EngineResult<Consent> {
        let _writer = self.inner.consent_writer.lock().await;

        if consent.is_empty() {
            self.inner.consent.clear();
            debug!("Consent cleared");
            return Ok(Consent::new());
        }

        let mut merged = consent;
        if let Some(previous) = self.inner.consent.peek() {
            merge_missing(&mut merged, &previous);
        }

        let merged = self.store_consent(merged).await;
        let identities = self.get_identities().await;
        self.update_consent(&identities, &merged).await?;

        Ok(merged)
    }

    /// Applies a user-driven change, staging it when consent is not
    /// resolved yet.
    pub async fn change_consent(&self, consent: Consent) -> EngineResult<Consent> {
        if self.inner.consent.has_value() {
            self.set_consent(consent).await
        } else {
            debug!("Consent not resolved yet, staging change");
            self.set_provisional_consent(consent.clone());
            Ok(consent)
        }
    }

    /// Stages a consent applied over the next resolved value.
    pub fn set_provisional_consent(&self, consent: Consent) {
        if let Ok(mut slot) = self.inner.provisional.lock() {
            *slot = Some(consent);
        }
    }

    fn take_provisional(&self) -> Option<Consent> {
        self.inner.provisional.lock().ok()?.take()
    }

    /// Current consent, or an empty one. Never touches the network.
    pub fn retrieve_consent(&self) -> Consent {
        self.inner.consent.peek().unwrap_or_default()
    }

    pub fn has_consent(&self) -> bool {
        self.inner.consent.peek().is_some_and(|c| !c.is_empty())
    }

    async fn store_consent(&self, consent: Consent) -> Consent {
        let consent = self.inner.consent.set_value(consent);
        if !self.inner.cache.set_public_consent(&consent).await {
            debug!("Public consent not stored");
        }
        consent
    }

    // =========================================================================
    // Experiences
    // =========================================================================

    /// Experience that must be shown for `consent`, if any.
    pub fn select_experience(&self, consent: &Consent) -> Option<ExperienceType> {
        let show = self.page().query_param(&self.settings().show_parameter);
        let seen = self.inner.displayed.load(Ordering::SeqCst)
            || self.inner.has_been_displayed.load(Ordering::SeqCst);
        experience::select_experience(self.config(), consent, show.as_deref(), seen)
    }

    pub fn select_consent_experience(&self) -> ConsentExperienceType {
        experience::select_consent_experience(self.config())
    }

    /// Marks an experience as displayed.
    pub fn will_show_experience(&self, kind: ExperienceType) {
        self.inner.displayed.store(true, Ordering::SeqCst);
        self.emit(names::WILL_SHOW_EXPERIENCE, &[to_arg(&kind)]);
    }

    /// Marks the displayed experience as closed and returns the consent.
    pub fn experience_closed(&self, reason: ExperienceClosedReason) -> Consent {
        self.inner.displayed.store(false, Ordering::SeqCst);
        self.inner.has_been_displayed.store(true, Ordering::SeqCst);
        debug!(%reason, "Experience closed");
        self.emit(names::HIDE_EXPERIENCE, &[to_arg(&reason)]);
        self.retrieve_consent()
    }

    /// Asks the renderer to show the consent experience.
    pub fn show_consent_experience(&self) -> Consent {
        let consent = self.retrieve_consent();
        if self.inner.events.has_listeners(names::SHOW_CONSENT_EXPERIENCE) {
            self.will_show_experience(ExperienceType::Consent);
            let hint = self.select_consent_experience();
            self.emit(
                names::SHOW_CONSENT_EXPERIENCE,
                &[to_arg(&consent), json!({ "displayHint": hint })],
            );
        } else {
            debug!("No consent experience renderer registered");
        }
        consent
    }

    /// Asks the renderer to show the preference experience.
    pub fn show_preference_experience(&self) -> Consent {
        let consent = self.retrieve_consent();
        if self.inner.events.has_listeners(names::SHOW_PREFERENCE_EXPERIENCE) {
            self.will_show_experience(ExperienceType::Preference);
            self.emit(names::SHOW_PREFERENCE_EXPERIENCE, &[to_arg(&consent)]);
        } else {
            debug!("No preference experience renderer registered");
        }
        consent
    }

    // =========================================================================
    // Events
    // =========================================================================

    fn cell_value(&self, event: &str) -> Option<Value> {
        let inner = &self.inner;
        match event {
            names::CONSENT => inner.consent.peek().map(|v| to_arg(&v)),
            names::ENVIRONMENT => inner.environment.peek().map(|v| to_arg(&v)),
            names::GEOIP => inner.geoip.peek().map(|v| to_arg(&v)),
            names::IDENTITIES => inner.identities.peek().map(|v| to_arg(&v)),
            names::JURISDICTION => inner.jurisdiction.peek().map(|v| to_arg(&v)),
            names::REGION_INFO => inner.region_info.peek().map(|v| to_arg(&v)),
            _ => None,
        }
    }

    /// Adds a listener. Listeners of a resolved value event are called at
    /// once with the current value.
    pub fn on(&self, event: &str, listener: Listener) {
        self.inner.events.on(event, listener.clone());
        if let Some(value) = self.cell_value(event) {
            listener(&Event {
                name: event,
                args: std::slice::from_ref(&value),
                engine: Some(self),
            });
        }
    }

    /// Adds a one-shot listener, called at once when the value is resolved.
    pub fn once(&self, event: &str, listener: Listener) {
        match self.cell_value(event) {
            Some(value) => listener(&Event {
                name: event,
                args: std::slice::from_ref(&value),
                engine: Some(self),
            }),
            None => self.inner.events.once(event, listener),
        }
    }

    pub fn off(&self, event: &str, listener: &Listener) -> bool {
        self.inner.events.off(event, listener)
    }

    /// Emits `event` to listeners and the native bridge.
    pub fn emit(&self, event: &str, args: &[Value]) -> bool {
        self.inner.events.emit(event, args, Some(self))
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.events.listener_count(event)
    }

    // =========================================================================
    // Identities
    // =========================================================================

    /// Merges observed identities and reconciles consent with them.
    pub async fn set_identities(&self, observed: Identities) -> EngineResult<()> {
        let mut identities = self.inner.identities.peek().unwrap_or_default();
        let changed = merge_identities(&mut identities, &observed);
        if !changed && self.inner.identities.has_value() {
            return Ok(());
        }

        debug!(count = identities.len(), "Identities updated");
        self.inner.identities.set_value(identities.clone());

        if self.inner.displayed.load(Ordering::SeqCst) {
            debug!("Experience displayed, deferring consent reconciliation");
            return Ok(());
        }

        let local = self.retrieve_consent();
        if local.is_empty() {
            return Ok(());
        }

        let remote = self.fetch_consent(&identities).await?;
        if same_purposes(&local, &remote) {
            return Ok(());
        }

        if self.inner.has_been_displayed.load(Ordering::SeqCst) {
            info!("Consent differs for new identities, synchronizing");
            self.update_consent(&identities, &local).await
        } else {
            info!("Consent differs for new identities, showing experience");
            self.show_consent_experience();
            Ok(())
        }
    }

    /// Known identities, collecting them first when needed.
    pub async fn get_identities(&self) -> Identities {
        if let Some(identities) = self.inner.identities.peek() {
            return identities;
        }

        if !self.inner.collection_started.load(Ordering::SeqCst) {
            if let Err(e) = self.collect_identities().await {
                warn!(error = %e, "Identity collection failed");
                if !self.inner.identities.has_value() {
                    self.inner.identities.set_value(Identities::new());
                }
            }
        }

        self.inner.identities.get_value().await
    }

    /// Starts the identity watcher and applies its observations.
    ///
    /// The initial observation is applied before returning; an empty map is
    /// stored when nothing was found. Later observations are applied in the
    /// background.
    pub async fn collect_identities(&self) -> EngineResult<Identities> {
        if self.inner.collection_started.swap(true, Ordering::SeqCst) {
            return Ok(self.inner.identities.get_value().await);
        }

        let watcher = self.inner.host.watcher.clone();
        for (space, descriptor) in &self.config().identities {
            watcher.add(space, descriptor.clone());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Identities>();
        watcher.start(tx).await?;

        let mut initial = Identities::new();
        while let Ok(observed) = rx.try_recv() {
            initial.extend(observed);
        }
        self.set_identities(initial).await?;

        let engine = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(observed) = rx.recv().await {
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                let engine = ConsentEngine { inner };
                if let Err(e) = engine.set_identities(observed).await {
                    warn!(error = %e, "Failed to apply observed identities");
                }
            }
        });

        if let Ok(mut slot) = self.inner.identity_task.lock() {
            *slot = Some(task);
        }

        Ok(self.inner.identities.peek().unwrap_or_default())
    }

    // =========================================================================
    // Environment, Location and Jurisdiction
    // =========================================================================

    pub fn set_environment(&self, environment: Environment) -> Environment {
        self.inner.environment.set_value(environment)
    }

    /// Resolved environment, resolving it from the page on first use.
    pub async fn get_environment(&self) -> EngineResult<Environment> {
        if let Some(environment) = self.inner.environment.peek() {
            return Ok(environment);
        }
        let environment = resolve_environment(self.config(), self.page())?;
        debug!(environment = %environment.code, "Environment resolved");
        Ok(self.set_environment(environment))
    }

    pub fn set_geo_ip(&self, location: IpInfo) -> IpInfo {
        self.inner.geoip.set_value(location)
    }

    pub async fn get_geo_ip(&self) -> EngineResult<IpInfo> {
        match self.inner.geoip.peek() {
            Some(location) => Ok(location),
            None => self.load_geo_ip().await,
        }
    }

    /// Looks up the visitor location through the API.
    pub async fn load_geo_ip(&self) -> EngineResult<IpInfo> {
        let response = self.inner.api.get_location().await?;
        let location = response
            .location
            .filter(|l| !l.country_code.is_empty())
            .ok_or(ConsentError::UnrecognizedLocation)?;
        debug!(country = %location.country_code, region = %location.region_code, "Location loaded");
        Ok(self.set_geo_ip(location))
    }

    pub fn set_region_info(&self, region: impl Into<String>) -> String {
        self.inner.region_info.set_value(region.into())
    }

    pub async fn get_region_info(&self) -> EngineResult<String> {
        match self.inner.region_info.peek() {
            Some(region) => Ok(region),
            None => self.load_region_info().await,
        }
    }

    /// Resolves the region from the page override or the visitor location.
    pub async fn load_region_info(&self) -> EngineResult<String> {
        let region = match resolve_region(self.page(), None) {
            Ok(region) => region,
            Err(_) => {
                let location = self.get_geo_ip().await?;
                resolve_region(self.page(), Some(&location))?
            }
        };
        Ok(self.set_region_info(region))
    }

    pub fn set_jurisdiction(&self, code: impl Into<String>) -> String {
        self.inner.jurisdiction.set_value(code.into())
    }

    /// Resolved jurisdiction code, resolving it on first use.
    ///
    /// The region is looked up only when the property maps regions to
    /// jurisdictions.
    pub async fn get_jurisdiction(&self) -> EngineResult<String> {
        if let Some(code) = self.inner.jurisdiction.peek() {
            return Ok(code);
        }

        let has_table = self
            .config()
            .jurisdiction
            .as_ref()
            .is_some_and(|j| !j.jurisdictions.is_empty());

        let region = if has_table {
            match self.get_region_info().await {
                Ok(region) => Some(region),
                Err(e) => {
                    warn!(error = %e, "Region unavailable for jurisdiction lookup");
                    None
                }
            }
        } else {
            None
        };

        let code = resolve_jurisdiction(self.config(), self.page(), region.as_deref())?;
        debug!(jurisdiction = %code, "Jurisdiction resolved");
        Ok(self.set_jurisdiction(code))
    }

    /// Fetches the full property configuration for the resolved scope.
    pub async fn load_full_configuration(&self) -> EngineResult<Configuration> {
        let environment = self.get_environment().await?;
        let jurisdiction = self.get_jurisdiction().await?;

        let request = GetFullConfigurationRequest {
            organization_code: self.config().organization_code().unwrap_or_default().to_string(),
            property_code: self.config().property_code().unwrap_or_default().to_string(),
            environment_code: environment.code,
            jurisdiction_code: jurisdiction,
            hash: environment.hash,
            language_code: None,
        };

        self.inner.api.get_full_configuration(&request).await
    }

    // =========================================================================
    // Rights and Plugins
    // =========================================================================

    /// Submits a data-subject right request.
    ///
    /// A request without a right code or subject email is ignored.
    pub async fn invoke_right(&self, invocation: RightInvocation) -> EngineResult<()> {
        if invocation.right.is_empty() || invocation.subject.email.is_empty() {
            warn!(right = %invocation.right, "Ignoring incomplete right request");
            return Ok(());
        }

        let identities = self.get_identities().await;
        if identities.is_empty() {
            return Err(ConsentError::NoIdentities.into());
        }

        let scope = self.config().scope().ok_or_else(|| {
            ConsentError::InvalidConfiguration(
                "organization, property, environment and jurisdiction are required".into(),
            )
        })?;

        let request = InvokeRightRequest::new(scope, identities, invocation, Utc::now().timestamp());
        self.inner.api.invoke_right(&request).await?;

        info!(right = %request.right_code, "Right invoked");
        self.emit(names::RIGHT_INVOKED, &[to_arg(&request)]);
        Ok(())
    }

    pub fn register_plugin(&self, plugin: Plugin) {
        plugin::install(self, plugin);
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`ConsentEngine`].
pub struct ConsentEngineBuilder {
    config: Configuration,
    settings: Option<EngineSettings>,
    api: Option<Arc<dyn ConsentApi>>,
    cache: Option<Arc<dyn Cacher>>,
    host: HostBindings,
    plugins: Vec<Plugin>,
}

impl ConsentEngineBuilder {
    pub fn new(config: Configuration) -> Self {
        ConsentEngineBuilder {
            config,
            settings: None,
            api: None,
            cache: None,
            host: HostBindings::default(),
            plugins: Vec::new(),
        }
    }

    /// Sets the consent API (required).
    pub fn with_api(mut self, api: Arc<dyn ConsentApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Sets the cache. Defaults to an in-memory cookie/local/session chain.
    pub fn with_cache(mut self, cache: Arc<dyn Cacher>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_host(mut self, host: HostBindings) -> Self {
        self.host = host;
        self
    }

    /// Sets the engine settings. Property options are applied on top.
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Registers a plugin once the engine is built.
    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> EngineResult<ConsentEngine> {
        let organization = self
            .config
            .organization_code()
            .ok_or_else(|| ConsentError::InvalidConfiguration("organization code is required".into()))?
            .to_string();
        let property = self
            .config
            .property_code()
            .ok_or_else(|| ConsentError::InvalidConfiguration("property code is required".into()))?
            .to_string();
        let api = self
            .api
            .ok_or_else(|| ConsentError::InvalidConfiguration("consent API required".into()))?;

        let mut settings = self.settings.unwrap_or_default();
        settings.apply_options(&self.config.options);
        settings.validate()?;

        let cacher = self.cache.unwrap_or_else(|| {
            Arc::new(CacheChain::standard(
                Arc::new(MemoryStorage::new()),
                Arc::new(MemoryStorage::new()),
                Arc::new(MemoryStorage::new()),
            ))
        });
        let cache = ConsentCache::with_keys(
            cacher,
            settings.cache_key.clone(),
            settings.public_cache_key.clone(),
        );
        let mut host = self.host;
        if let Some(source) = host.identity_source.take() {
            host.watcher = Arc::new(PollingWatcher::from_settings(source, &settings));
        }
        let events = EventBus::new(settings.max_listeners, host.native.clone());

        let engine = ConsentEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                settings,
                api,
                cache,
                host,
                events,
                consent: FutureCell::new(),
                environment: FutureCell::new(),
                geoip: FutureCell::new(),
                identities: FutureCell::new(),
                jurisdiction: FutureCell::new(),
                region_info: FutureCell::new(),
                provisional: Mutex::new(None),
                displayed: AtomicBool::new(false),
                has_been_displayed: AtomicBool::new(false),
                collection_started: AtomicBool::new(false),
                consent_writer: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(HashMap::new()),
                identity_task: Mutex::new(None),
            }),
        };
        engine.wire_cells();

        for plugin in self.plugins {
            engine.register_plugin(plugin);
        }

        info!(organization = %organization, property = %property, "Consent engine built");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use consent_core::protocol::{DataSubject, GetConsentResponse, PurposeAllowedLegalBasis, PurposeValue};
    use consent_core::{
        Environment, IdentityDescriptor, IdentityFormat, IdentityKind, JurisdictionInfo,
        Organization, Property, Purpose,
    };

    use crate::api::MemoryConsentApi;
    use crate::bridge::RecordingBridge;
    use crate::error::EngineError;
    use crate::identity::{PollingWatcher, SnapshotSource};

    fn purpose(code: &str, requires_opt_in: bool) -> Purpose {
        Purpose {
            code: code.into(),
            name: None,
            legal_basis_code: "consent_optin".into(),
            requires_opt_in,
        }
    }

    fn config() -> Configuration {
        Configuration {
            organization: Some(Organization { code: "org".into() }),
            property: Some(Property {
                code: "web".into(),
                name: None,
            }),
            environment: Some(Environment {
                code: "production".into(),
                ..Default::default()
            }),
            jurisdiction: Some(JurisdictionInfo {
                code: Some("gdpr".into()),
                ..Default::default()
            }),
            purposes: vec![purpose("analytics", true), purpose("essential", false)],
            ..Default::default()
        }
    }

    fn ids(value: &str) -> Identities {
        BTreeMap::from([("swb_web".to_string(), value.to_string())])
    }

    fn engine_with(config: Configuration, api: Arc<MemoryConsentApi>) -> ConsentEngine {
        ConsentEngineBuilder::new(config).with_api(api).build().unwrap()
    }

    fn counter() -> (Arc<Mutex<Vec<Value>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |event: &Event<'_>| {
            sink.lock().unwrap().push(event.arg(0).cloned().unwrap_or(Value::Null));
        });
        (seen, listener)
    }

    #[test]
    fn test_builder_requires_organization_property_and_api() {
        let api = Arc::new(MemoryConsentApi::new());

        let mut missing_org = config();
        missing_org.organization = None;
        let err = ConsentEngineBuilder::new(missing_org)
            .with_api(api.clone())
            .build()
            .err()
            .unwrap();
        assert!(err.is_config_error());

        let err = ConsentEngineBuilder::new(config()).build().err().unwrap();
        assert!(matches!(
            err,
            EngineError::Consent(ConsentError::InvalidConfiguration(_))
        ));

        let mut with_options = config();
        with_options.options.insert("maxListeners".into(), "5".into());
        let engine = engine_with(with_options, api);
        assert_eq!(engine.settings().max_listeners, 5);
    }

    #[tokio::test]
    async fn test_get_consent_fetches_once() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api.clone());
        engine.set_identities(ids("u1")).await.unwrap();

        let first = engine.get_consent().await.unwrap();
        let second = engine.get_consent().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.get_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_get_consent_shares_one_fetch() {
        let api = Arc::new(MemoryConsentApi::new().with_latency(Duration::from_millis(50)));
        let engine = engine_with(config(), api.clone());
        engine.set_identities(ids("u1")).await.unwrap();

        let (a, b) = tokio::join!(engine.get_consent(), engine.get_consent());

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(api.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_default_grants_fill_after_experience_selection() {
        let mut config = config();
        config.purposes = vec![purpose("a", false)];

        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config, api.clone());
        engine.set_identities(ids("u1")).await.unwrap();

        let (shown, renderer) = counter();
        engine.on(names::SHOW_CONSENT_EXPERIENCE, renderer);
        let (will_show, will_show_listener) = counter();
        engine.on(names::WILL_SHOW_EXPERIENCE, will_show_listener);

        let consent = engine.get_consent().await.unwrap();

        assert_eq!(consent.allowed("a"), Some(true));
        assert_eq!(*shown.lock().unwrap(), vec![json!({"purposes": {"a": true}})]);
        assert_eq!(*will_show.lock().unwrap(), vec![json!("consent")]);
        assert_eq!(api.set_calls(), 1);
        assert_eq!(api.set_requests()[0].purposes["a"].allowed, "true");
    }

    #[tokio::test]
    async fn test_answered_consent_does_not_persist_or_show() {
        let api = Arc::new(MemoryConsentApi::new().with_response(
            ids("u1"),
            GetConsentResponse {
                purposes: BTreeMap::from([
                    ("analytics".to_string(), PurposeValue::Bare("false".into())),
                    (
                        "essential".to_string(),
                        PurposeValue::Detailed(PurposeAllowedLegalBasis::new(true, "")),
                    ),
                ]),
                ..Default::default()
            },
        ));
        let engine = engine_with(config(), api.clone());
        engine.set_identities(ids("u1")).await.unwrap();

        let (hidden, listener) = counter();
        engine.on(names::HIDE_EXPERIENCE, listener);

        let consent = engine.get_consent().await.unwrap();

        assert_eq!(consent.allowed("analytics"), Some(false));
        assert_eq!(consent.allowed("essential"), Some(true));
        assert_eq!(api.set_calls(), 0);
        assert_eq!(*hidden.lock().unwrap(), vec![json!("willNotShow")]);
        assert!(engine.has_consent());
    }

    #[tokio::test]
    async fn test_provisional_consent_overrides_and_persists() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api.clone());
        engine.set_identities(ids("u1")).await.unwrap();

        let staged = engine
            .change_consent(Consent::new().with_purpose("analytics", true))
            .await
            .unwrap();
        assert_eq!(staged.allowed("analytics"), Some(true));
        assert!(!engine.has_consent());

        let consent = engine.get_consent().await.unwrap();
        assert_eq!(consent.allowed("analytics"), Some(true));
        assert_eq!(consent.allowed("essential"), Some(true));
        assert_eq!(api.set_calls(), 1);
    }

    #[tokio::test]
    async fn test_set_consent_merges_previous_purposes() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api.clone());
        engine.set_identities(ids("u1")).await.unwrap();

        engine
            .set_consent(
                Consent::new()
                    .with_purpose("analytics", true)
                    .with_purpose("essential", false),
            )
            .await
            .unwrap();
        let merged = engine
            .set_consent(Consent::new().with_purpose("analytics", false))
            .await
            .unwrap();

        assert_eq!(
            merged,
            Consent::new()
                .with_purpose("analytics", false)
                .with_purpose("essential", false)
        );
        assert_eq!(api.set_requests().last().unwrap().purposes.len(), 2);

        let cleared = engine.set_consent(Consent::new()).await.unwrap();
        assert!(cleared.is_empty());
        assert!(!engine.has_consent());
        assert!(engine.retrieve_consent().is_empty());
    }

    #[tokio::test]
    async fn test_public_consent_mirrors_stored_consent() {
        let chain: Arc<dyn Cacher> = Arc::new(CacheChain::standard(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        ));
        let api = Arc::new(MemoryConsentApi::new());
        let engine = ConsentEngineBuilder::new(config())
            .with_api(api)
            .with_cache(chain.clone())
            .build()
            .unwrap();
        engine.set_identities(ids("u1")).await.unwrap();
        engine
            .set_consent(Consent::new().with_purpose("analytics", false))
            .await
            .unwrap();

        let public = ConsentCache::new(chain).get_public_consent().await.unwrap();
        assert_eq!(public["analytics"], "denied");
    }

    #[tokio::test]
    async fn test_update_consent_rejections() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api.clone());
        let consent = Consent::new().with_purpose("analytics", true);

        let err = engine.update_consent(&Identities::new(), &consent).await.unwrap_err();
        assert_eq!(err.as_consent_error(), Some(&ConsentError::NoIdentities));

        let err = engine.update_consent(&ids("u1"), &Consent::new()).await.unwrap_err();
        assert_eq!(err.as_consent_error(), Some(&ConsentError::EmptyConsent));

        let unknown = Consent::new().with_purpose("unknown", true);
        engine.update_consent(&ids("u1"), &unknown).await.unwrap();
        assert_eq!(api.set_calls(), 0);

        let mut incomplete = config();
        incomplete.jurisdiction = None;
        let engine = engine_with(incomplete, api);
        let err = engine.update_consent(&ids("u1"), &consent).await.unwrap_err();
        assert!(err.is_config_error());
    }

    async fn seeded_cache(identities: Identities, collected_at: i64) -> Arc<dyn Cacher> {
        let chain: Arc<dyn Cacher> = Arc::new(CacheChain::standard(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        ));
        let record = ConsentRecord {
            organization_code: "org".into(),
            property_code: "web".into(),
            environment_code: "production".into(),
            jurisdiction_code: "gdpr".into(),
            identities,
            purposes: BTreeMap::from([(
                "analytics".to_string(),
                PurposeAllowedLegalBasis::new(true, "consent_optin"),
            )]),
            vendors: None,
            collected_at: 0,
        };
        assert!(ConsentCache::new(chain.clone())
            .set_cached_consent_at(record, collected_at)
            .await);
        chain
    }

    #[tokio::test]
    async fn test_fresh_matching_cache_skips_api() {
        let now = Utc::now().timestamp();
        let api = Arc::new(MemoryConsentApi::new());
        let engine = ConsentEngineBuilder::new(config())
            .with_api(api.clone())
            .with_cache(seeded_cache(ids("u1"), now).await)
            .build()
            .unwrap();

        let consent = engine.fetch_consent(&ids("u1")).await.unwrap();
        assert_eq!(consent.allowed("analytics"), Some(true));
        assert_eq!(consent.allowed("essential"), None);
        assert_eq!(api.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_identity_mismatch_refetches() {
        let now = Utc::now().timestamp();
        let api = Arc::new(MemoryConsentApi::new());
        let engine = ConsentEngineBuilder::new(config())
            .with_api(api.clone())
            .with_cache(seeded_cache(ids("someone-else"), now).await)
            .build()
            .unwrap();

        let consent = engine.fetch_consent(&ids("u1")).await.unwrap();
        assert!(consent.is_empty());
        assert_eq!(api.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_refetches() {
        let stale = Utc::now().timestamp() - 301;
        let api = Arc::new(MemoryConsentApi::new());
        let engine = ConsentEngineBuilder::new(config())
            .with_api(api.clone())
            .with_cache(seeded_cache(ids("u1"), stale).await)
            .build()
            .unwrap();

        engine.fetch_consent(&ids("u1")).await.unwrap();
        assert_eq!(api.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_no_identities_fails_before_experience_selection() {
        let mut config = config();
        config.purposes = vec![purpose("analytics", true)];

        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config, api.clone());
        let (will_show, listener) = counter();
        engine.on(names::WILL_SHOW_EXPERIENCE, listener);

        let err = engine.get_consent().await.unwrap_err();

        assert_eq!(err.as_consent_error(), Some(&ConsentError::NoIdentities));
        assert!(will_show.lock().unwrap().is_empty());
        assert_eq!(api.get_calls(), 0);
        assert!(engine.get_identities().await.is_empty());
    }

    #[tokio::test]
    async fn test_show_override_selects_preferences() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = ConsentEngineBuilder::new(config())
            .with_api(api)
            .with_host(HostBindings::new(
                PageContext::for_url("https://example.com/?swb_show=preferences").unwrap(),
            ))
            .build()
            .unwrap();
        engine.set_identities(ids("u1")).await.unwrap();

        let (shown, renderer) = counter();
        engine.on(names::SHOW_PREFERENCE_EXPERIENCE, renderer);

        engine.get_consent().await.unwrap();
        assert_eq!(shown.lock().unwrap().len(), 1);
        assert_eq!(
            engine.select_experience(&engine.retrieve_consent()),
            None,
            "nothing is selected while an experience is displayed"
        );
    }

    async fn engine_with_local_consent(api: Arc<MemoryConsentApi>) -> ConsentEngine {
        let engine = engine_with(config(), api);
        engine.set_identities(ids("u1")).await.unwrap();
        engine
            .set_consent(
                Consent::new()
                    .with_purpose("analytics", true)
                    .with_purpose("essential", true),
            )
            .await
            .unwrap();
        engine
    }

    fn other_identity() -> Identities {
        BTreeMap::from([("email_hash".to_string(), "h1".to_string())])
    }

    #[tokio::test]
    async fn test_reactor_waits_while_experience_displayed() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with_local_consent(api.clone()).await;
        engine.will_show_experience(ExperienceType::Consent);

        let calls = api.get_calls();
        engine.set_identities(other_identity()).await.unwrap();

        assert_eq!(api.get_calls(), calls);
        assert_eq!(engine.get_identities().await.len(), 2);
    }

    #[tokio::test]
    async fn test_reactor_shows_experience_when_consent_differs() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with_local_consent(api.clone()).await;
        let (shown, renderer) = counter();
        engine.on(names::SHOW_CONSENT_EXPERIENCE, renderer);

        engine.set_identities(other_identity()).await.unwrap();

        assert_eq!(shown.lock().unwrap().len(), 1);
        assert_eq!(api.set_calls(), 1);
    }

    #[tokio::test]
    async fn test_reactor_pushes_consent_after_experience_was_shown() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with_local_consent(api.clone()).await;
        engine.experience_closed(ExperienceClosedReason::Close);

        engine.set_identities(other_identity()).await.unwrap();

        assert_eq!(api.set_calls(), 2);
        let last = api.set_requests().pop().unwrap();
        assert_eq!(last.identities.len(), 2);
        assert_eq!(last.purposes.len(), 2);
    }

    #[tokio::test]
    async fn test_reactor_ignores_unchanged_identities() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with_local_consent(api.clone()).await;
        let calls = api.get_calls();

        engine.set_identities(ids("u1")).await.unwrap();
        assert_eq!(api.get_calls(), calls);
    }

    #[tokio::test]
    async fn test_collect_identities_from_page() {
        let mut config = config();
        config.identities.insert(
            "swb_web".into(),
            IdentityDescriptor {
                kind: IdentityKind::Window,
                variable: "window.visitor.id".into(),
                format: IdentityFormat::String,
                key: None,
            },
        );

        let source = Arc::new(
            SnapshotSource::new(PageContext::default())
                .with_window(json!({"visitor": {"id": "abc"}})),
        );
        let watcher = Arc::new(PollingWatcher::new(
            source,
            Duration::from_secs(2),
            Duration::from_secs(10),
        ));

        let engine = ConsentEngineBuilder::new(config)
            .with_api(Arc::new(MemoryConsentApi::new()))
            .with_host(HostBindings::default().with_watcher(watcher))
            .build()
            .unwrap();

        let (seen, listener) = counter();
        engine.on(names::IDENTITIES, listener);

        assert_eq!(engine.get_identities().await, ids("abc"));
        assert_eq!(*seen.lock().unwrap(), vec![json!({"swb_web": "abc"})]);
    }

    #[tokio::test]
    async fn test_jurisdiction_from_location() {
        let mut config = config();
        config.jurisdiction = Some(JurisdictionInfo {
            jurisdictions: BTreeMap::from([("US-CA".to_string(), "ccpa".to_string())]),
            default_jurisdiction_code: Some("default".into()),
            ..Default::default()
        });

        let api = Arc::new(MemoryConsentApi::new().with_location(IpInfo {
            ip: "10.0.0.1".into(),
            country_code: "US".into(),
            region_code: "CA".into(),
            city: None,
        }));
        let engine = engine_with(config.clone(), api.clone());
        let (seen, listener) = counter();
        engine.on(names::JURISDICTION, listener);

        assert_eq!(engine.get_jurisdiction().await.unwrap(), "ccpa");
        assert_eq!(engine.get_region_info().await.unwrap(), "US-CA");
        assert_eq!(*seen.lock().unwrap(), vec![json!("ccpa")]);
        assert_eq!(api.location_calls(), 1);

        let engine = ConsentEngineBuilder::new(config)
            .with_api(api.clone())
            .with_host(HostBindings::new(
                PageContext::for_url("https://example.com/?swb_region=NA").unwrap(),
            ))
            .build()
            .unwrap();
        assert_eq!(engine.get_jurisdiction().await.unwrap(), "default");
        assert_eq!(api.location_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_location_is_unrecognized() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api);
        let err = engine.load_geo_ip().await.unwrap_err();
        assert_eq!(err.as_consent_error(), Some(&ConsentError::UnrecognizedLocation));
    }

    #[tokio::test]
    async fn test_environment_defaults_to_production() {
        let mut config = config();
        config.environment = None;
        config.environments = vec![
            Environment {
                code: "staging".into(),
                ..Default::default()
            },
            Environment {
                code: "production".into(),
                ..Default::default()
            },
        ];
        let engine = engine_with(config, Arc::new(MemoryConsentApi::new()));
        assert_eq!(engine.get_environment().await.unwrap().code, "production");
    }

    #[tokio::test]
    async fn test_invoke_right() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api.clone());
        engine.set_identities(ids("u1")).await.unwrap();
        let (invoked, listener) = counter();
        engine.on(names::RIGHT_INVOKED, listener);

        engine
            .invoke_right(RightInvocation {
                right: "access".into(),
                subject: DataSubject::default(),
            })
            .await
            .unwrap();
        assert!(api.rights().is_empty());

        engine
            .invoke_right(RightInvocation {
                right: "access".into(),
                subject: DataSubject {
                    email: "a@example.com".into(),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let rights = api.rights();
        assert_eq!(rights.len(), 1);
        assert_eq!(rights[0].right_code, "access");
        assert_eq!(rights[0].jurisdiction_code, "gdpr");
        assert_eq!(invoked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cell_events_replay_to_late_listeners() {
        let engine = engine_with(config(), Arc::new(MemoryConsentApi::new()));
        engine.set_jurisdiction("gdpr");

        let (seen, listener) = counter();
        engine.on(names::JURISDICTION, listener.clone());
        assert_eq!(*seen.lock().unwrap(), vec![json!("gdpr")]);

        engine.set_jurisdiction("ccpa");
        assert_eq!(seen.lock().unwrap().len(), 2);

        assert!(engine.off(names::JURISDICTION, &listener));
        engine.set_jurisdiction("lgpd");
        assert_eq!(seen.lock().unwrap().len(), 2);

        let (once_seen, once_listener) = counter();
        engine.once(names::JURISDICTION, once_listener);
        assert_eq!(*once_seen.lock().unwrap(), vec![json!("lgpd")]);
        assert_eq!(engine.listener_count(names::JURISDICTION), 0);
    }

    #[tokio::test]
    async fn test_native_bridge_receives_emissions() {
        let bridge = Arc::new(RecordingBridge::with_handlers(&["unknown", "consent"]));
        let engine = ConsentEngineBuilder::new(config())
            .with_api(Arc::new(MemoryConsentApi::new()))
            .with_host(HostBindings::default().with_native(bridge.clone()))
            .build()
            .unwrap();

        engine.emit("unknown", &[json!("test"), json!(123)]);
        engine.set_identities(ids("u1")).await.unwrap();
        engine
            .set_consent(Consent::new().with_purpose("essential", true))
            .await
            .unwrap();

        assert_eq!(
            bridge.posted(),
            vec![
                ("unknown".to_string(), Some(r#"["test",123]"#.to_string())),
                (
                    "consent".to_string(),
                    Some(r#"{"purposes":{"essential":true}}"#.to_string())
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_change_consent_after_resolution_persists() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api.clone());
        engine.set_identities(ids("u1")).await.unwrap();
        engine.get_consent().await.unwrap();
        assert_eq!(api.set_calls(), 1);

        let changed = engine
            .change_consent(Consent::new().with_purpose("analytics", false))
            .await
            .unwrap();

        assert_eq!(changed.allowed("analytics"), Some(false));
        assert_eq!(changed.allowed("essential"), Some(true));
        assert_eq!(api.set_calls(), 2);
        assert_eq!(engine.retrieve_consent(), changed);
    }

    #[tokio::test]
    async fn test_load_full_configuration() {
        let mut full = config();
        full.rights = vec![consent_core::Right {
            code: "access".into(),
            name: "Access".into(),
            description: None,
        }];

        let api = Arc::new(MemoryConsentApi::new().with_configuration(full.clone()));
        let engine = engine_with(config(), api);
        assert_eq!(engine.load_full_configuration().await.unwrap(), full);
        assert_eq!(engine.get_jurisdiction().await.unwrap(), "gdpr");

        let engine = engine_with(config(), Arc::new(MemoryConsentApi::new()));
        let err = engine.load_full_configuration().await.unwrap_err();
        assert!(err.is_network_error());
    }

    /// Reports its identities only after yielding to the scheduler once.
    struct DeferredWatcher {
        identities: Identities,
    }

    #[async_trait::async_trait]
    impl IdentityWatcher for DeferredWatcher {
        fn add(&self, _space: &str, _descriptor: IdentityDescriptor) {}

        async fn start(&self, tx: mpsc::UnboundedSender<Identities>) -> EngineResult<()> {
            tokio::task::yield_now().await;
            let _ = tx.send(self.identities.clone());
            Ok(())
        }

        fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_caller_waiting_on_identities_reuses_resolved_consent() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = ConsentEngineBuilder::new(config())
            .with_api(api.clone())
            .with_host(HostBindings::default().with_watcher(Arc::new(DeferredWatcher {
                identities: ids("u1"),
            })))
            .build()
            .unwrap();

        let (shown, renderer) = counter();
        engine.on(names::SHOW_CONSENT_EXPERIENCE, renderer);
        let (hidden, hide_listener) = counter();
        engine.on(names::HIDE_EXPERIENCE, hide_listener);
        let (changes, consent_listener) = counter();
        engine.on(names::CONSENT, consent_listener);

        let (a, b) = tokio::join!(engine.get_consent(), engine.get_consent());

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(shown.lock().unwrap().len(), 1);
        assert!(hidden.lock().unwrap().is_empty());
        assert_eq!(changes.lock().unwrap().len(), 1);
        assert_eq!(api.get_calls(), 1);
        assert_eq!(api.set_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_renderer_reports_will_not_show() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api);
        engine.set_identities(ids("u1")).await.unwrap();
        let (hidden, listener) = counter();
        engine.on(names::HIDE_EXPERIENCE, listener);
        let (will_show, will_show_listener) = counter();
        engine.on(names::WILL_SHOW_EXPERIENCE, will_show_listener);

        let consent = engine.get_consent().await.unwrap();

        assert_eq!(consent.allowed("essential"), Some(true));
        assert_eq!(*hidden.lock().unwrap(), vec![json!("willNotShow")]);
        assert!(will_show.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_api_failure_propagates_and_retry_succeeds() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api.clone());
        engine.set_identities(ids("u1")).await.unwrap();

        api.set_failing(true);
        let err = engine.get_consent().await.unwrap_err();
        assert!(err.is_network_error());
        assert!(!engine.has_consent());
        assert!(engine.inner.in_flight().is_empty());

        api.set_failing(false);
        let consent = engine.get_consent().await.unwrap();
        assert_eq!(consent, Consent::new().with_purpose("essential", true));
        assert_eq!(api.get_calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_local_consent() {
        let api = Arc::new(MemoryConsentApi::new());
        let engine = engine_with(config(), api.clone());
        engine.set_identities(ids("u1")).await.unwrap();
        engine.get_consent().await.unwrap();

        api.set_failing(true);
        let err = engine
            .set_consent(Consent::new().with_purpose("analytics", true))
            .await
            .unwrap_err();

        assert!(err.is_network_error());
        assert_eq!(engine.retrieve_consent().allowed("analytics"), Some(true));
        assert_eq!(engine.retrieve_consent().allowed("essential"), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_interval_option_sets_poll_cadence() {
        let mut config = config();
        config.identities.insert(
            "swb_web".into(),
            IdentityDescriptor {
                kind: IdentityKind::Window,
                variable: "window.visitor.id".into(),
                format: IdentityFormat::String,
                key: None,
            },
        );
        config.options.insert("watcherInterval".into(), "500".into());
        config.options.insert("watcherTimeout".into(), "5000".into());

        let source = Arc::new(SnapshotSource::new(PageContext::default()));
        let engine = ConsentEngineBuilder::new(config)
            .with_api(Arc::new(MemoryConsentApi::new()))
            .with_host(HostBindings::default().with_identity_source(source.clone()))
            .build()
            .unwrap();

        assert!(engine.get_identities().await.is_empty());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        source.set_window(json!({"visitor": {"id": "abc"}}));
        tokio::time::advance(Duration::from_millis(400)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(engine.get_identities().await.is_empty());

        tokio::time::advance(Duration::from_millis(200)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.get_identities().await, ids("abc"));
    }
}
