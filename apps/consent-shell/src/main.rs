//! # Consent Shell
//!
//! Bootstraps a consent engine from a property configuration file and prints
//! the visitor's resolved consent.
//!
//! ## Bootstrap
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CONSENT_CONFIG / argv[1] ──► Configuration (JSON)                      │
//! │                                     │                                   │
//! │  CONSENT_PAGE_URL ──► PageContext ──┤                                   │
//! │                                     ▼                                   │
//! │                  resolve environment + jurisdiction                     │
//! │                                     │                                   │
//! │  CONSENT_IDENTITIES ──► StaticWatcher (else poll the page URL)          │
//! │                                     ▼                                   │
//! │                           ConsentEngine::get_consent ──► stdout         │
//! │                                                                         │
//! │  Any failure is logged and the shell exits cleanly (fail open).         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use consent_core::resolve::{resolve_environment, resolve_jurisdiction, resolve_region};
use consent_core::{Configuration, Consent, ConsentExperienceType, Identities, PageContext};
use consent_engine::{
    ConsentEngine, ConsentEngineBuilder, EngineSettings, HostBindings, MemoryConsentApi, Plugin,
    PluginHooks, SnapshotSource, StaticWatcher,
};
use consent_store::{CacheChain, MemoryStorage};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!("Starting consent shell...");

    if let Err(e) = run().await {
        error!(error = %format!("{e:#}"), "Consent bootstrap failed, continuing without consent");
    }
}

async fn run() -> anyhow::Result<()> {
    let path = config_path().ok_or_else(|| anyhow!("set CONSENT_CONFIG or pass a configuration path"))?;
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading configuration {}", path.display()))?;
    let config: Configuration = serde_json::from_str(&raw).context("parsing configuration")?;
    info!(path = %path.display(), purposes = config.purposes.len(), "Configuration loaded");

    let page = match std::env::var("CONSENT_PAGE_URL") {
        Ok(url) => PageContext::for_url(&url).context("parsing CONSENT_PAGE_URL")?,
        Err(_) => PageContext::default(),
    };

    let config = resolve_scope(config, &page)?;
    let identities = identities_from_env()?;

    let engine = build_engine(config, page, identities)?;
    let consent = engine.get_consent().await?;

    println!("{}", serde_json::to_string_pretty(&consent)?);
    Ok(())
}

fn config_path() -> Option<PathBuf> {
    std::env::var("CONSENT_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .map(PathBuf::from)
}

/// Pins environment and jurisdiction into the configuration.
///
/// The engine treats its configuration as immutable, so the scope has to be
/// complete before it is built.
fn resolve_scope(mut config: Configuration, page: &PageContext) -> anyhow::Result<Configuration> {
    let environment = resolve_environment(&config, page)?;
    info!(environment = %environment.code, "Environment resolved");

    let region = resolve_region(page, None).ok();
    let jurisdiction = resolve_jurisdiction(&config, page, region.as_deref())?;
    info!(jurisdiction = %jurisdiction, region = ?region, "Jurisdiction resolved");

    config.environment = Some(environment);
    config.jurisdiction.get_or_insert_with(Default::default).code = Some(jurisdiction);
    Ok(config)
}

fn identities_from_env() -> anyhow::Result<Option<Identities>> {
    match std::env::var("CONSENT_IDENTITIES") {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .context("parsing CONSENT_IDENTITIES"),
        Err(_) => {
            warn!("CONSENT_IDENTITIES not set, polling the page for identities");
            Ok(None)
        }
    }
}

fn build_engine(
    config: Configuration,
    page: PageContext,
    identities: Option<Identities>,
) -> anyhow::Result<ConsentEngine> {
    let settings = EngineSettings::load_or_default(None);

    let cache = CacheChain::standard(
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryStorage::new()),
    );
    let host = match identities {
        Some(identities) => {
            HostBindings::new(page).with_watcher(Arc::new(StaticWatcher::new(identities)))
        }
        None => {
            let source = Arc::new(SnapshotSource::new(page.clone()));
            HostBindings::new(page).with_identity_source(source)
        }
    };

    let engine = ConsentEngineBuilder::new(config)
        .with_api(Arc::new(MemoryConsentApi::new()))
        .with_cache(Arc::new(cache))
        .with_host(host)
        .with_settings(settings)
        .with_plugin(Plugin::Hooks(console_renderer()))
        .build()?;

    Ok(engine)
}

/// Stands in for the experience UI by logging what it would render.
fn console_renderer() -> PluginHooks {
    PluginHooks {
        show_consent_experience: Some(Arc::new(
            |_: &ConsentEngine, consent: &Consent, hint: ConsentExperienceType| {
                info!(hint = ?hint, purposes = consent.purposes.len(), "Consent experience requested");
            },
        )),
        show_preference_experience: Some(Arc::new(|_: &ConsentEngine, consent: &Consent| {
            info!(purposes = consent.purposes.len(), "Preference experience requested");
        })),
        ..Default::default()
    }
}
