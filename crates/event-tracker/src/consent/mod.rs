// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consent preferences and the validator gating delivery on them.

pub mod policy;
pub mod preferences;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, ConsentPolicyKind};
use crate::constants::{CALL_TYPE_KEY, QUEUE_REASON_BATCHING, QUEUE_REASON_CONSENT};
use crate::data_layer::DataLayer;
use crate::event::{Dispatch, EventData, TrackEvent};
use crate::pipeline::{EvaluationContext, QueueDecision, Validator};
use crate::storage::{self, PersistentStore, CONSENT_KEY};

pub use policy::{
    CcpaPolicy, ConsentPolicy, GdprPolicy, TrackingStatus, AUDIT_EVENTS,
    CONSENT_CATEGORIES_KEY, CONSENT_LAST_UPDATED_KEY,
};
pub use preferences::{ConsentCategory, ConsentPreferences, ConsentStatus};

pub const CONSENT_VALIDATOR_ID: &str = "consent";

/// Data layer keys written by releases that stored consent there.
const LEGACY_STATUS_KEY: &str = "consent_status";
const LEGACY_LOGGING_KEY: &str = "consent_logging_enabled";

/// Picks the policy for `kind`. `Custom` requires a caller-supplied policy.
pub fn policy_for(
    kind: ConsentPolicyKind,
    custom: Option<Box<dyn ConsentPolicy>>,
) -> Option<Box<dyn ConsentPolicy>> {
    match kind {
        ConsentPolicyKind::Gdpr => Some(Box::new(GdprPolicy)),
        ConsentPolicyKind::Ccpa => Some(Box::new(CcpaPolicy)),
        ConsentPolicyKind::Custom => custom,
    }
}

pub fn is_audit_event(request: &Dispatch) -> bool {
    match request {
        Dispatch::Track(event) => event
            .event_name()
            .is_some_and(|name| AUDIT_EVENTS.contains(&name)),
        Dispatch::Batch(_) => false,
    }
}

pub struct ConsentManager {
    store: Arc<dyn PersistentStore>,
    policy: Box<dyn ConsentPolicy>,
    preferences: ConsentPreferences,
    expiry: Duration,
    logging_enabled: bool,
    categories_key: String,
}

impl ConsentManager {
    /// Loads stored preferences, importing any left in the data layer by older
    /// releases. Returns the cookie-sync events due for already-decided users.
    pub fn new(
        config: &Config,
        policy: Box<dyn ConsentPolicy>,
        store: Arc<dyn PersistentStore>,
        data_layer: &mut DataLayer,
        now: DateTime<Utc>,
    ) -> (Self, Vec<TrackEvent>) {
        let mut manager = ConsentManager {
            store,
            policy,
            preferences: ConsentPreferences::default(),
            expiry: config.consent_expiry,
            logging_enabled: config.consent_logging_enabled,
            categories_key: categories_key(config),
        };

        match storage::retrieve_json::<ConsentPreferences>(manager.store.as_ref(), CONSENT_KEY) {
            Ok(Some(preferences)) => manager.preferences = preferences,
            Ok(None) => {}
            Err(err) => warn!("Failed to load consent preferences: {err}"),
        }
        if let Some(migrated) = migrate_legacy(data_layer, now) {
            debug!("Migrated legacy consent preferences");
            manager.preferences = migrated;
            manager.persist();
        }

        let events = if manager.preferences.status == ConsentStatus::Unknown {
            Vec::new()
        } else {
            manager.audit_events(now)
        };
        (manager, events)
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    pub fn preferences(&mut self, now: DateTime<Utc>) -> ConsentPreferences {
        self.expire_if_needed(now);
        self.preferences.clone()
    }

    pub fn tracking_status(&mut self, now: DateTime<Utc>) -> TrackingStatus {
        self.expire_if_needed(now);
        self.policy.tracking_status(&self.preferences)
    }

    pub fn set_status(&mut self, status: ConsentStatus, now: DateTime<Utc>) -> Vec<TrackEvent> {
        self.preferences.set_status(status, now);
        info!("Consent status set to {}", status.as_str());
        self.persist();
        self.audit_events(now)
    }

    pub fn set_categories(
        &mut self,
        categories: BTreeSet<ConsentCategory>,
        now: DateTime<Utc>,
    ) -> Vec<TrackEvent> {
        self.preferences.set_categories(categories, now);
        info!(
            "Consent categories set to [{}]",
            self.preferences.category_names().join(", ")
        );
        self.persist();
        self.audit_events(now)
    }

    /// Clears status and categories and deletes the stored record.
    pub fn reset(&mut self, now: DateTime<Utc>) -> Vec<TrackEvent> {
        self.preferences.reset();
        if let Err(err) = self.store.delete(CONSENT_KEY) {
            warn!("Failed to delete consent preferences: {err}");
        }
        self.audit_events(now)
    }

    fn expire_if_needed(&mut self, now: DateTime<Utc>) {
        if self.preferences.is_expired(self.expiry, now) {
            info!("Consent preferences expired, resetting");
            self.preferences.reset();
            if let Err(err) = self.store.delete(CONSENT_KEY) {
                warn!("Failed to delete expired consent preferences: {err}");
            }
        }
    }

    fn persist(&self) {
        if let Err(err) = storage::save_json(self.store.as_ref(), CONSENT_KEY, &self.preferences) {
            warn!("Failed to persist consent preferences: {err}");
        }
    }

    fn status_info(&self) -> EventData {
        let mut info = self
            .policy
            .status_info(&self.preferences, &self.categories_key);
        if let Some(last_update) = self.preferences.last_update {
            info.insert(
                CONSENT_LAST_UPDATED_KEY.to_string(),
                Value::String(last_update.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        info
    }

    /// The logging event when enabled, always followed by the cookie-sync event.
    fn audit_events(&self, now: DateTime<Utc>) -> Vec<TrackEvent> {
        let info = self.status_info();
        let mut events = Vec::with_capacity(2);
        if self.logging_enabled && self.policy.should_log_consent() {
            let name = self.policy.logging_event_name(&self.preferences);
            events.push(audit_event(&name, &info, now));
        }
        events.push(audit_event(&self.policy.cookie_event_name(), &info, now));
        events
    }
}

fn audit_event(name: &str, info: &EventData, now: DateTime<Utc>) -> TrackEvent {
    let mut data = info.clone();
    data.insert(CALL_TYPE_KEY.to_string(), Value::String(name.to_string()));
    let mut event = TrackEvent::named(name, data);
    event.timestamp = now;
    event
}

fn categories_key(config: &Config) -> String {
    config
        .override_consent_categories_key
        .clone()
        .unwrap_or_else(|| CONSENT_CATEGORIES_KEY.to_string())
}

fn migrate_legacy(data_layer: &mut DataLayer, now: DateTime<Utc>) -> Option<ConsentPreferences> {
    let values = data_layer.values(now);
    let status = values.get(LEGACY_STATUS_KEY)?.as_i64()?;
    let categories = values.get(CONSENT_CATEGORIES_KEY)?.as_array()?;
    let names: Vec<&str> = categories.iter().filter_map(Value::as_str).collect();
    let preferences = ConsentPreferences {
        status: ConsentStatus::from_legacy(status),
        categories: ConsentCategory::parse_all(&names),
        last_update: Some(now),
    };
    data_layer.delete(&[LEGACY_STATUS_KEY, CONSENT_CATEGORIES_KEY, LEGACY_LOGGING_KEY]);
    Some(preferences)
}

impl Validator for ConsentManager {
    fn id(&self) -> &str {
        CONSENT_VALIDATOR_ID
    }

    fn should_queue(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> QueueDecision {
        if matches!(request, Dispatch::Batch(_)) {
            return QueueDecision::queue(QUEUE_REASON_BATCHING, None);
        }
        if is_audit_event(request) {
            return QueueDecision::pass();
        }
        self.expire_if_needed(ctx.now);
        let info = self.status_info();
        if self.preferences.status == ConsentStatus::Unknown && self.policy.queues_while_unknown() {
            QueueDecision::queue(QUEUE_REASON_CONSENT, Some(info))
        } else {
            QueueDecision::pass_with(info)
        }
    }

    fn should_drop(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> bool {
        if is_audit_event(request) {
            return false;
        }
        self.expire_if_needed(ctx.now);
        // undecided users are queued rather than dropped
        if self.preferences.status == ConsentStatus::Unknown && self.policy.queues_while_unknown() {
            return false;
        }
        self.policy.tracking_status(&self.preferences) == TrackingStatus::Forbidden
    }

    fn should_purge(&mut self, _request: &Dispatch, ctx: &EvaluationContext) -> bool {
        self.expire_if_needed(ctx.now);
        if self.preferences.status == ConsentStatus::Unknown && self.policy.queues_while_unknown() {
            return false;
        }
        self.policy.tracking_status(&self.preferences) == TrackingStatus::Forbidden
    }

    fn update_config(&mut self, config: &Config) {
        self.expiry = config.consent_expiry;
        self.logging_enabled = config.consent_logging_enabled;
        self.categories_key = categories_key(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{EVENT_KEY, QUEUE_REASON_KEY};
    use crate::data_layer::Expiry;
    use crate::event::BatchEvent;
    use crate::storage::MemoryStore;
    use serde_json::json;

    struct Fixture {
        store: Arc<dyn PersistentStore>,
        data_layer: DataLayer,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
            let config = Config::new("acct", "main", "dev");
            let data_layer = DataLayer::new(&config, Arc::clone(&store), Utc::now());
            Self {
                store,
                data_layer,
                config,
            }
        }

        fn manager(&mut self, policy: Box<dyn ConsentPolicy>) -> (ConsentManager, Vec<TrackEvent>) {
            ConsentManager::new(
                &self.config,
                policy,
                Arc::clone(&self.store),
                &mut self.data_layer,
                Utc::now(),
            )
        }
    }

    fn track(name: &str) -> Dispatch {
        Dispatch::Track(TrackEvent::named(name, EventData::new()))
    }

    fn ctx() -> EvaluationContext {
        EvaluationContext::track(Utc::now(), 0)
    }

    #[test]
    fn unknown_status_queues_non_audit_events() {
        let (mut manager, events) = Fixture::new().manager(Box::new(GdprPolicy));
        assert!(events.is_empty());

        let decision = manager.should_queue(&track("view"), &ctx());
        assert!(decision.queue);
        assert_eq!(
            decision.extra.unwrap().get(QUEUE_REASON_KEY),
            Some(&json!(QUEUE_REASON_CONSENT))
        );
        assert!(!manager.should_drop(&track("view"), &ctx()));

        let audit = manager.should_queue(&track(policy::GRANT_FULL_CONSENT_EVENT), &ctx());
        assert!(!audit.queue);
        assert!(audit.extra.is_none());
    }

    #[test]
    fn consented_with_categories_passes_with_consent_data() {
        let (mut manager, _) = Fixture::new().manager(Box::new(GdprPolicy));
        manager.set_categories([ConsentCategory::Analytics].into(), Utc::now());

        assert!(!manager.should_drop(&track("view"), &ctx()));
        assert!(!manager.should_purge(&track("view"), &ctx()));
        let decision = manager.should_queue(&track("view"), &ctx());
        assert!(!decision.queue);
        let extra = decision.extra.unwrap();
        assert_eq!(extra.get(CONSENT_CATEGORIES_KEY), Some(&json!(["analytics"])));
        assert_eq!(extra.get(policy::POLICY_KEY), Some(&json!("gdpr")));
        assert!(extra.contains_key(CONSENT_LAST_UPDATED_KEY));
    }

    #[test]
    fn not_consented_drops_and_purges() {
        let (mut manager, _) = Fixture::new().manager(Box::new(GdprPolicy));
        manager.set_status(ConsentStatus::NotConsented, Utc::now());

        assert!(manager.should_drop(&track("view"), &ctx()));
        assert!(manager.should_purge(&track("view"), &ctx()));
        assert!(!manager.should_drop(&track(policy::DECLINE_CONSENT_EVENT), &ctx()));
        assert!(!manager.should_queue(&track("view"), &ctx()).queue);
    }

    #[test]
    fn batches_always_queue_for_batching() {
        let (mut manager, _) = Fixture::new().manager(Box::new(GdprPolicy));
        manager.set_status(ConsentStatus::Consented, Utc::now());
        let batch = BatchEvent::new(vec![TrackEvent::named("a", EventData::new())]).unwrap();
        let decision = manager.should_queue(&Dispatch::Batch(batch), &ctx());
        assert!(decision.queue);
        assert_eq!(
            decision.extra.unwrap().get(QUEUE_REASON_KEY),
            Some(&json!(QUEUE_REASON_BATCHING))
        );
    }

    #[test]
    fn changes_emit_audit_events() {
        let mut fixture = Fixture::new();
        fixture.config.consent_logging_enabled = true;
        let (mut manager, _) = fixture.manager(Box::new(GdprPolicy));
        let events = manager.set_status(ConsentStatus::Consented, Utc::now());
        let names: Vec<_> = events.iter().filter_map(TrackEvent::event_name).collect();
        assert_eq!(names, vec![policy::GRANT_FULL_CONSENT_EVENT, policy::GDPR_COOKIE_EVENT]);
        assert_eq!(
            events[0].data.get(CALL_TYPE_KEY),
            events[0].data.get(EVENT_KEY)
        );

        let mut fixture = Fixture::new();
        let (mut manager, _) = fixture.manager(Box::new(CcpaPolicy));
        let events = manager.set_status(ConsentStatus::NotConsented, Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name(), Some(policy::CCPA_COOKIE_EVENT));
        assert_eq!(events[0].data.get(policy::DO_NOT_SELL_KEY), Some(&json!(true)));
    }

    #[test]
    fn reset_twice_matches_reset_once() {
        let (mut manager, _) = Fixture::new().manager(Box::new(GdprPolicy));
        manager.set_categories([ConsentCategory::Email].into(), Utc::now());
        manager.reset(Utc::now());
        let once = manager.preferences(Utc::now());
        manager.reset(Utc::now());
        let twice = manager.preferences(Utc::now());
        assert_eq!(once, twice);
        assert_eq!(twice.status, ConsentStatus::Unknown);
        assert!(twice.categories.is_empty());
    }

    #[test]
    fn preferences_survive_restart_and_resync_cookie() {
        let mut fixture = Fixture::new();
        let (mut manager, _) = fixture.manager(Box::new(GdprPolicy));
        manager.set_categories(
            [ConsentCategory::Analytics, ConsentCategory::Search].into(),
            Utc::now(),
        );
        let saved = manager.preferences(Utc::now());

        let (mut reloaded, events) = fixture.manager(Box::new(GdprPolicy));
        assert_eq!(reloaded.preferences(Utc::now()), saved);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name(), Some(policy::GDPR_COOKIE_EVENT));
    }

    #[test]
    fn expired_preferences_reset_lazily() {
        let mut fixture = Fixture::new();
        fixture.config.consent_expiry = Duration::from_secs(60);
        let (mut manager, _) = fixture.manager(Box::new(GdprPolicy));
        let then = Utc::now();
        manager.set_status(ConsentStatus::Consented, then);

        let later = EvaluationContext::track(then + chrono::Duration::seconds(61), 0);
        assert!(manager.should_queue(&track("view"), &later).queue);
        assert_eq!(manager.preferences(later.now).status, ConsentStatus::Unknown);
    }

    #[test]
    fn override_categories_key() {
        let mut fixture = Fixture::new();
        fixture.config.override_consent_categories_key = Some("my_cats".to_string());
        let (mut manager, _) = fixture.manager(Box::new(GdprPolicy));
        manager.set_status(ConsentStatus::Consented, Utc::now());
        let extra = manager.should_queue(&track("view"), &ctx()).extra.unwrap();
        assert!(extra.contains_key("my_cats"));
        assert!(!extra.contains_key(CONSENT_CATEGORIES_KEY));
    }

    #[test]
    fn legacy_preferences_are_migrated_from_data_layer() {
        let mut fixture = Fixture::new();
        let now = Utc::now();
        fixture
            .data_layer
            .add_value(LEGACY_STATUS_KEY, json!(1), Expiry::Forever, now);
        fixture.data_layer.add_value(
            CONSENT_CATEGORIES_KEY,
            json!(["analytics", "email"]),
            Expiry::Forever,
            now,
        );
        let (mut manager, events) = fixture.manager(Box::new(GdprPolicy));
        let prefs = manager.preferences(Utc::now());
        assert_eq!(prefs.status, ConsentStatus::Consented);
        assert_eq!(
            prefs.categories,
            [ConsentCategory::Analytics, ConsentCategory::Email].into()
        );
        assert!(!events.is_empty());
        assert!(!fixture.data_layer.values(now).contains_key(LEGACY_STATUS_KEY));
    }

    #[test]
    fn custom_policy_requires_supplied_policy() {
        assert!(policy_for(ConsentPolicyKind::Custom, None).is_none());
        let custom = policy_for(ConsentPolicyKind::Custom, Some(Box::new(CcpaPolicy))).unwrap();
        assert_eq!(custom.name(), "ccpa");
        assert_eq!(
            policy_for(ConsentPolicyKind::Gdpr, None).unwrap().name(),
            "gdpr"
        );
    }
}
