//! # Plugins
//!
//! A plugin is either a plain callable, invoked once at registration, or a
//! set of hooks wired onto engine events.
//!
//! ## Hook Wiring
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  hook                          event                                    │
//! │  ────────────────────────────  ──────────────────────────────────────── │
//! │  will_show_experience          willShowExperience                       │
//! │  show_consent_experience       showConsentExperience   (singleton)      │
//! │  show_preference_experience    showPreferenceExperience (singleton)     │
//! │  consent_changed               consent                                  │
//! │  environment_loaded            environment                              │
//! │  experience_hidden             hideExperience                           │
//! │  geo_ip_loaded                 geoip                                    │
//! │  identities_loaded             identities                               │
//! │  jurisdiction_loaded           jurisdiction                             │
//! │  region_info_loaded            regionInfo                               │
//! │  right_invoked                 rightInvoked                             │
//! │  init                          called directly, after all wiring        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use consent_core::protocol::{InvokeRightRequest, IpInfo};
use consent_core::{
    Configuration, Consent, ConsentExperienceType, Environment, ExperienceClosedReason,
    ExperienceType, Identities,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::ConsentEngine;
use crate::events::{names, Event, Listener};

/// Hook receiving the engine and one decoded event argument.
pub type Hook<T> = Arc<dyn Fn(&ConsentEngine, &T) + Send + Sync>;

/// Hook rendering the consent experience with its display hint.
pub type ShowConsentHook =
    Arc<dyn Fn(&ConsentEngine, &Consent, ConsentExperienceType) + Send + Sync>;

/// Plain plugin function.
pub type PluginFn = Arc<dyn Fn(&ConsentEngine, &Configuration) + Send + Sync>;

/// Optional hooks of a structured plugin.
#[derive(Clone, Default)]
pub struct PluginHooks {
    pub init: Option<PluginFn>,
    pub will_show_experience: Option<Hook<ExperienceType>>,
    pub show_consent_experience: Option<ShowConsentHook>,
    pub show_preference_experience: Option<Hook<Consent>>,
    pub consent_changed: Option<Hook<Consent>>,
    pub environment_loaded: Option<Hook<Environment>>,
    pub experience_hidden: Option<Hook<ExperienceClosedReason>>,
    pub geo_ip_loaded: Option<Hook<IpInfo>>,
    pub identities_loaded: Option<Hook<Identities>>,
    pub jurisdiction_loaded: Option<Hook<String>>,
    pub region_info_loaded: Option<Hook<String>>,
    pub right_invoked: Option<Hook<InvokeRightRequest>>,
}

/// A registered plugin.
#[derive(Clone)]
pub enum Plugin {
    Callable(PluginFn),
    Hooks(PluginHooks),
}

impl Plugin {
    pub fn callable(f: impl Fn(&ConsentEngine, &Configuration) + Send + Sync + 'static) -> Self {
        Plugin::Callable(Arc::new(f))
    }
}

/// Adapts a typed hook to an event listener decoding argument 0.
fn listener<T>(event: &'static str, hook: Hook<T>) -> Listener
where
    T: DeserializeOwned + 'static,
{
    Arc::new(move |delivery: &Event<'_>| {
        let Some(engine) = delivery.engine else {
            debug!(event, "Plugin hook skipped: no engine attached");
            return;
        };
        match delivery.decode::<T>(0) {
            Some(value) => hook(engine, &value),
            None => warn!(event, "Plugin hook skipped: unexpected argument"),
        }
    })
}

fn show_consent_listener(hook: ShowConsentHook) -> Listener {
    Arc::new(move |delivery: &Event<'_>| {
        let Some(engine) = delivery.engine else {
            return;
        };
        let Some(consent) = delivery.decode::<Consent>(0) else {
            warn!(event = delivery.name, "Plugin hook skipped: unexpected argument");
            return;
        };
        let hint = delivery
            .arg(1)
            .and_then(|options| options.get("displayHint"))
            .cloned()
            .and_then(|hint: Value| serde_json::from_value(hint).ok())
            .unwrap_or(ConsentExperienceType::Banner);
        hook(engine, &consent, hint);
    })
}

/// Wires `plugin` onto `engine`.
pub(crate) fn install(engine: &ConsentEngine, plugin: Plugin) {
    let hooks = match plugin {
        Plugin::Callable(f) => {
            f(engine, engine.config());
            return;
        }
        Plugin::Hooks(hooks) => hooks,
    };

    let PluginHooks {
        init,
        will_show_experience,
        show_consent_experience,
        show_preference_experience,
        consent_changed,
        environment_loaded,
        experience_hidden,
        geo_ip_loaded,
        identities_loaded,
        jurisdiction_loaded,
        region_info_loaded,
        right_invoked,
    } = hooks;

    if let Some(hook) = will_show_experience {
        engine.on(names::WILL_SHOW_EXPERIENCE, listener(names::WILL_SHOW_EXPERIENCE, hook));
    }
    if let Some(hook) = show_consent_experience {
        engine.on(names::SHOW_CONSENT_EXPERIENCE, show_consent_listener(hook));
    }
    if let Some(hook) = show_preference_experience {
        engine.on(
            names::SHOW_PREFERENCE_EXPERIENCE,
            listener(names::SHOW_PREFERENCE_EXPERIENCE, hook),
        );
    }
    if let Some(hook) = consent_changed {
        engine.on(names::CONSENT, listener(names::CONSENT, hook));
    }
    if let Some(hook) = environment_loaded {
        engine.on(names::ENVIRONMENT, listener(names::ENVIRONMENT, hook));
    }
    if let Some(hook) = experience_hidden {
        engine.on(names::HIDE_EXPERIENCE, listener(names::HIDE_EXPERIENCE, hook));
    }
    if let Some(hook) = geo_ip_loaded {
        engine.on(names::GEOIP, listener(names::GEOIP, hook));
    }
    if let Some(hook) = identities_loaded {
        engine.on(names::IDENTITIES, listener(names::IDENTITIES, hook));
    }
    if let Some(hook) = jurisdiction_loaded {
        engine.on(names::JURISDICTION, listener(names::JURISDICTION, hook));
    }
    if let Some(hook) = region_info_loaded {
        engine.on(names::REGION_INFO, listener(names::REGION_INFO, hook));
    }
    if let Some(hook) = right_invoked {
        engine.on(names::RIGHT_INVOKED, listener(names::RIGHT_INVOKED, hook));
    }

    if let Some(init) = init {
        init(engine, engine.config());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use consent_core::{JurisdictionInfo, Organization, Property};

    use crate::api::MemoryConsentApi;
    use crate::engine::ConsentEngineBuilder;

    fn config() -> Configuration {
        Configuration {
            organization: Some(Organization { code: "org".into() }),
            property: Some(Property {
                code: "web".into(),
                name: None,
            }),
            jurisdiction: Some(JurisdictionInfo {
                code: Some("gdpr".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn engine() -> ConsentEngine {
        ConsentEngineBuilder::new(config())
            .with_api(Arc::new(MemoryConsentApi::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_callable_plugin_runs_once_with_config() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();

        let engine = engine();
        engine.register_plugin(Plugin::callable(move |_, config| {
            sink.lock()
                .unwrap()
                .push(config.property_code().unwrap_or_default().to_string());
        }));

        assert_eq!(*calls.lock().unwrap(), vec!["web"]);
    }

    #[test]
    fn test_hooks_replay_resolved_values_before_init() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine();
        engine.set_jurisdiction("gdpr");

        let jurisdiction_log = log.clone();
        let init_log = log.clone();
        engine.register_plugin(Plugin::Hooks(PluginHooks {
            jurisdiction_loaded: Some(Arc::new(move |_: &ConsentEngine, code: &String| {
                jurisdiction_log.lock().unwrap().push(format!("jurisdiction:{code}"));
            })),
            init: Some(Arc::new(move |_: &ConsentEngine, _: &Configuration| {
                init_log.lock().unwrap().push("init".to_string());
            })),
            ..Default::default()
        }));

        assert_eq!(*log.lock().unwrap(), vec!["jurisdiction:gdpr", "init"]);

        engine.set_jurisdiction("ccpa");
        assert_eq!(log.lock().unwrap().last().unwrap(), "jurisdiction:ccpa");
    }

    #[test]
    fn test_show_consent_hook_receives_display_hint() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();

        let engine = engine();
        engine.register_plugin(Plugin::Hooks(PluginHooks {
            show_consent_experience: Some(Arc::new(
                move |engine: &ConsentEngine, consent: &Consent, hint: ConsentExperienceType| {
                    *sink.lock().unwrap() = Some((consent.clone(), hint, engine.has_consent()));
                },
            )),
            ..Default::default()
        }));

        engine.show_consent_experience();

        assert_eq!(
            *seen.lock().unwrap(),
            Some((Consent::new(), ConsentExperienceType::Banner, false))
        );
    }

    #[test]
    fn test_experience_hidden_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let engine = ConsentEngineBuilder::new(config())
            .with_api(Arc::new(MemoryConsentApi::new()))
            .with_plugin(Plugin::Hooks(PluginHooks {
                experience_hidden: Some(Arc::new(move |_: &ConsentEngine, reason: &ExperienceClosedReason| {
                    sink.lock().unwrap().push(*reason);
                })),
                ..Default::default()
            }))
            .build()
            .unwrap();

        engine.experience_closed(ExperienceClosedReason::SetConsent);
        assert_eq!(*seen.lock().unwrap(), vec![ExperienceClosedReason::SetConsent]);
    }
}
