// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsentStatus {
    #[default]
    Unknown,
    Consented,
    NotConsented,
}

impl ConsentStatus {
    /// Decodes the integer form used by older releases.
    pub fn from_legacy(value: i64) -> Self {
        match value {
            1 => ConsentStatus::Consented,
            2 => ConsentStatus::NotConsented,
            _ => ConsentStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Unknown => "unknown",
            ConsentStatus::Consented => "consented",
            ConsentStatus::NotConsented => "notConsented",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentCategory {
    Analytics,
    Affiliates,
    DisplayAds,
    Email,
    Personalization,
    Search,
    Social,
    BigData,
    Mobile,
    Engagement,
    Monitoring,
    Crm,
    Cdp,
    #[serde(rename = "cookiematch")]
    CookieMatch,
    Misc,
}

impl ConsentCategory {
    pub const ALL: [ConsentCategory; 15] = [
        ConsentCategory::Analytics,
        ConsentCategory::Affiliates,
        ConsentCategory::DisplayAds,
        ConsentCategory::Email,
        ConsentCategory::Personalization,
        ConsentCategory::Search,
        ConsentCategory::Social,
        ConsentCategory::BigData,
        ConsentCategory::Mobile,
        ConsentCategory::Engagement,
        ConsentCategory::Monitoring,
        ConsentCategory::Crm,
        ConsentCategory::Cdp,
        ConsentCategory::CookieMatch,
        ConsentCategory::Misc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentCategory::Analytics => "analytics",
            ConsentCategory::Affiliates => "affiliates",
            ConsentCategory::DisplayAds => "display_ads",
            ConsentCategory::Email => "email",
            ConsentCategory::Personalization => "personalization",
            ConsentCategory::Search => "search",
            ConsentCategory::Social => "social",
            ConsentCategory::BigData => "big_data",
            ConsentCategory::Mobile => "mobile",
            ConsentCategory::Engagement => "engagement",
            ConsentCategory::Monitoring => "monitoring",
            ConsentCategory::Crm => "crm",
            ConsentCategory::Cdp => "cdp",
            ConsentCategory::CookieMatch => "cookiematch",
            ConsentCategory::Misc => "misc",
        }
    }

    /// Parses every recognised name, silently skipping the rest.
    pub fn parse_all<S: AsRef<str>>(names: &[S]) -> BTreeSet<ConsentCategory> {
        names
            .iter()
            .filter_map(|name| name.as_ref().parse().ok())
            .collect()
    }
}

impl FromStr for ConsentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        ConsentCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == lowered)
            .ok_or_else(|| format!("unknown consent category {s}"))
    }
}

impl fmt::Display for ConsentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentPreferences {
    pub status: ConsentStatus,
    pub categories: BTreeSet<ConsentCategory>,
    pub last_update: Option<DateTime<Utc>>,
}

impl ConsentPreferences {
    /// Consented grants every category, NotConsented revokes them all.
    pub fn set_status(&mut self, status: ConsentStatus, now: DateTime<Utc>) {
        self.status = status;
        match status {
            ConsentStatus::Consented => self.categories = ConsentCategory::ALL.into(),
            ConsentStatus::NotConsented | ConsentStatus::Unknown => self.categories.clear(),
        }
        self.last_update = Some(now);
    }

    pub fn set_categories(&mut self, categories: BTreeSet<ConsentCategory>, now: DateTime<Utc>) {
        if !categories.is_empty() && self.status != ConsentStatus::NotConsented {
            self.status = ConsentStatus::Consented;
        }
        self.categories = categories;
        self.last_update = Some(now);
    }

    pub fn reset(&mut self) {
        *self = ConsentPreferences::default();
    }

    pub fn has_all_categories(&self) -> bool {
        self.categories.len() == ConsentCategory::ALL.len()
    }

    pub fn category_names(&self) -> Vec<String> {
        self.categories.iter().map(|c| c.as_str().to_string()).collect()
    }

    pub fn is_expired(&self, expiry: Duration, now: DateTime<Utc>) -> bool {
        let Some(last_update) = self.last_update else {
            return false;
        };
        let Ok(expiry) = chrono::Duration::from_std(expiry) else {
            return false;
        };
        now - last_update > expiry
    }
}
