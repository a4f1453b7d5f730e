// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;

use super::preferences::{ConsentPreferences, ConsentStatus};
use crate::event::EventData;

pub const CONSENT_CATEGORIES_KEY: &str = "consent_categories";
pub const TRACKING_CONSENTED_KEY: &str = "tracking_consented";
pub const DO_NOT_SELL_KEY: &str = "do_not_sell";
pub const POLICY_KEY: &str = "policy";
pub const CONSENT_LAST_UPDATED_KEY: &str = "consent_last_updated";

pub const GRANT_FULL_CONSENT_EVENT: &str = "grant_full_consent";
pub const GRANT_PARTIAL_CONSENT_EVENT: &str = "grant_partial_consent";
pub const DECLINE_CONSENT_EVENT: &str = "decline_consent";
pub const GDPR_COOKIE_EVENT: &str = "update_consent_cookie";
pub const CCPA_COOKIE_EVENT: &str = "set_dns_state";

/// Events produced by the consent engine itself. They are never gated.
pub const AUDIT_EVENTS: [&str; 5] = [
    GRANT_FULL_CONSENT_EVENT,
    GRANT_PARTIAL_CONSENT_EVENT,
    DECLINE_CONSENT_EVENT,
    GDPR_COOKIE_EVENT,
    CCPA_COOKIE_EVENT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    Allowed,
    Forbidden,
}

/// Maps the user's preferences to a delivery decision.
pub trait ConsentPolicy: Send {
    fn name(&self) -> &str;

    fn tracking_status(&self, preferences: &ConsentPreferences) -> TrackingStatus;

    /// Whether events wait in the queue until the user decides.
    fn queues_while_unknown(&self) -> bool {
        false
    }

    /// Whether preference changes are reported with a logging event.
    fn should_log_consent(&self) -> bool {
        false
    }

    fn logging_event_name(&self, preferences: &ConsentPreferences) -> String;

    fn cookie_event_name(&self) -> String;

    /// Attributes merged into every event the policy lets through.
    fn status_info(&self, preferences: &ConsentPreferences, categories_key: &str) -> EventData;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GdprPolicy;

impl ConsentPolicy for GdprPolicy {
    fn name(&self) -> &str {
        "gdpr"
    }

    fn tracking_status(&self, preferences: &ConsentPreferences) -> TrackingStatus {
        match preferences.status {
            ConsentStatus::Consented if !preferences.categories.is_empty() => {
                TrackingStatus::Allowed
            }
            _ => TrackingStatus::Forbidden,
        }
    }

    fn queues_while_unknown(&self) -> bool {
        true
    }

    fn should_log_consent(&self) -> bool {
        true
    }

    fn logging_event_name(&self, preferences: &ConsentPreferences) -> String {
        let name = match preferences.status {
            ConsentStatus::NotConsented => DECLINE_CONSENT_EVENT,
            _ if preferences.has_all_categories() => GRANT_FULL_CONSENT_EVENT,
            _ => GRANT_PARTIAL_CONSENT_EVENT,
        };
        name.to_string()
    }

    fn cookie_event_name(&self) -> String {
        GDPR_COOKIE_EVENT.to_string()
    }

    fn status_info(&self, preferences: &ConsentPreferences, categories_key: &str) -> EventData {
        let mut info = EventData::new();
        info.insert(
            TRACKING_CONSENTED_KEY.to_string(),
            Value::String(preferences.status.as_str().to_string()),
        );
        info.insert(
            categories_key.to_string(),
            Value::from(preferences.category_names()),
        );
        info.insert(POLICY_KEY.to_string(), Value::String(self.name().to_string()));
        info
    }
}

/// Opt-out policy: tracking is always allowed, refusal only sets `do_not_sell`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CcpaPolicy;

impl ConsentPolicy for CcpaPolicy {
    fn name(&self) -> &str {
        "ccpa"
    }

    fn tracking_status(&self, _preferences: &ConsentPreferences) -> TrackingStatus {
        TrackingStatus::Allowed
    }

    fn logging_event_name(&self, preferences: &ConsentPreferences) -> String {
        let name = if preferences.status == ConsentStatus::Consented {
            GRANT_FULL_CONSENT_EVENT
        } else {
            GRANT_PARTIAL_CONSENT_EVENT
        };
        name.to_string()
    }

    fn cookie_event_name(&self) -> String {
        CCPA_COOKIE_EVENT.to_string()
    }

    fn status_info(&self, preferences: &ConsentPreferences, _categories_key: &str) -> EventData {
        let mut info = EventData::new();
        info.insert(
            DO_NOT_SELL_KEY.to_string(),
            Value::Bool(preferences.status == ConsentStatus::NotConsented),
        );
        info.insert(POLICY_KEY.to_string(), Value::String(self.name().to_string()));
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::preferences::ConsentCategory;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn gdpr_requires_categories() {
        let mut prefs = ConsentPreferences::default();
        assert_eq!(GdprPolicy.tracking_status(&prefs), TrackingStatus::Forbidden);
        prefs.set_categories([ConsentCategory::Analytics].into(), Utc::now());
        assert_eq!(GdprPolicy.tracking_status(&prefs), TrackingStatus::Allowed);
        prefs.categories.clear();
        assert_eq!(GdprPolicy.tracking_status(&prefs), TrackingStatus::Forbidden);
    }

    #[test]
    fn gdpr_logging_event_names() {
        let mut prefs = ConsentPreferences::default();
        prefs.set_status(ConsentStatus::Consented, Utc::now());
        assert_eq!(GdprPolicy.logging_event_name(&prefs), GRANT_FULL_CONSENT_EVENT);
        prefs.set_categories([ConsentCategory::Email].into(), Utc::now());
        assert_eq!(GdprPolicy.logging_event_name(&prefs), GRANT_PARTIAL_CONSENT_EVENT);
        prefs.set_status(ConsentStatus::NotConsented, Utc::now());
        assert_eq!(GdprPolicy.logging_event_name(&prefs), DECLINE_CONSENT_EVENT);
    }

    #[test]
    fn gdpr_status_info_uses_categories_key() {
        let mut prefs = ConsentPreferences::default();
        prefs.set_categories([ConsentCategory::Analytics].into(), Utc::now());
        let info = GdprPolicy.status_info(&prefs, "custom_categories");
        assert_eq!(info.get("custom_categories"), Some(&json!(["analytics"])));
        assert_eq!(info.get(TRACKING_CONSENTED_KEY), Some(&json!("consented")));
        assert_eq!(info.get(POLICY_KEY), Some(&json!("gdpr")));
    }

    #[test]
    fn ccpa_allows_and_flags_do_not_sell() {
        let mut prefs = ConsentPreferences::default();
        prefs.set_status(ConsentStatus::NotConsented, Utc::now());
        assert_eq!(CcpaPolicy.tracking_status(&prefs), TrackingStatus::Allowed);
        let info = CcpaPolicy.status_info(&prefs, CONSENT_CATEGORIES_KEY);
        assert_eq!(info.get(DO_NOT_SELL_KEY), Some(&json!(true)));
        assert!(!CcpaPolicy.should_log_consent());
    }
}
