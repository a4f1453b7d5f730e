// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{
    DEFAULT_BATCH_EXPIRATION_DAYS, DEFAULT_COLLECT_BATCH_URL, DEFAULT_COLLECT_URL,
    DEFAULT_HOSTED_BASE_URL, DEFAULT_HOSTED_CACHE_SIZE, DEFAULT_HOSTED_EXPIRY_DAYS,
    DEFAULT_HOSTED_MAX_RETRIES, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MINUTES_BETWEEN_SESSION,
    DEFAULT_SECONDS_BETWEEN_TRACK_EVENTS, DEFAULT_SESSION_BASE_URL, MAX_BATCH_SIZE,
};
use crate::dispatch::collect::RetryStrategy;

const ENV_PREFIX: &str = "TRACKER_";
const DEFAULT_ENVIRONMENT: &str = "prod";
const DEFAULT_CONSENT_EXPIRY: Duration = Duration::from_secs(365 * 24 * 60 * 60);
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEUE_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(String),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Which consent policy governs event delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentPolicyKind {
    Gdpr,
    Ccpa,
    Custom,
}

impl FromStr for ConsentPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gdpr" => Ok(ConsentPolicyKind::Gdpr),
            "ccpa" => Ok(ConsentPolicyKind::Ccpa),
            "custom" => Ok(ConsentPolicyKind::Custom),
            other => Err(format!("unknown consent policy {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub account: String,
    pub profile: String,
    pub environment: String,
    pub data_source: Option<String>,

    /// `None` disables consent gating entirely.
    pub consent_policy: Option<ConsentPolicyKind>,
    pub consent_expiry: Duration,
    pub consent_logging_enabled: bool,
    pub override_consent_categories_key: Option<String>,

    /// Event name to the payload key carrying the hosted data layer id.
    pub hosted_data_layer_keys: HashMap<String, String>,
    pub hosted_data_layer_cache_size: usize,
    pub hosted_data_layer_expiry: Duration,
    pub hosted_data_layer_max_retries: u32,
    pub hosted_data_layer_base_url: String,

    pub batching_enabled: bool,
    /// Capped at 10.
    pub batch_size: usize,
    /// Queue length that triggers a flushing dequeue. Defaults to `batch_size`.
    pub dispatch_after: usize,
    pub batch_window: Option<Duration>,
    pub batching_bypass_keys: HashSet<String>,
    pub dispatch_queue_limit: usize,
    pub dispatch_expiration_days: u32,

    pub minutes_between_session: u64,
    pub seconds_between_track_events: u64,
    pub session_counting_enabled: bool,
    pub session_base_url: String,

    /// Persistence root. `None` keeps all state in memory.
    pub storage_dir: Option<PathBuf>,
    pub collect_url: String,
    pub collect_batch_url: String,
    pub dispatch_timeout: Duration,
    pub retry_strategy: RetryStrategy,
    pub requeue_retry_interval: Duration,
}

impl Config {
    pub fn new(account: &str, profile: &str, environment: &str) -> Self {
        Config {
            account: account.to_string(),
            profile: profile.to_string(),
            environment: environment.to_string(),
            data_source: None,
            consent_policy: None,
            consent_expiry: DEFAULT_CONSENT_EXPIRY,
            consent_logging_enabled: false,
            override_consent_categories_key: None,
            hosted_data_layer_keys: HashMap::new(),
            hosted_data_layer_cache_size: DEFAULT_HOSTED_CACHE_SIZE,
            hosted_data_layer_expiry: days(DEFAULT_HOSTED_EXPIRY_DAYS),
            hosted_data_layer_max_retries: DEFAULT_HOSTED_MAX_RETRIES,
            hosted_data_layer_base_url: DEFAULT_HOSTED_BASE_URL.to_string(),
            batching_enabled: false,
            batch_size: 1,
            dispatch_after: 1,
            batch_window: None,
            batching_bypass_keys: HashSet::new(),
            dispatch_queue_limit: DEFAULT_MAX_QUEUE_SIZE,
            dispatch_expiration_days: DEFAULT_BATCH_EXPIRATION_DAYS,
            minutes_between_session: DEFAULT_MINUTES_BETWEEN_SESSION,
            seconds_between_track_events: DEFAULT_SECONDS_BETWEEN_TRACK_EVENTS,
            session_counting_enabled: false,
            session_base_url: DEFAULT_SESSION_BASE_URL.to_string(),
            storage_dir: None,
            collect_url: DEFAULT_COLLECT_URL.to_string(),
            collect_batch_url: DEFAULT_COLLECT_BATCH_URL.to_string(),
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            retry_strategy: RetryStrategy::LinearBackoff(3, 100),
            requeue_retry_interval: DEFAULT_REQUEUE_RETRY_INTERVAL,
        }
    }

    /// Enables batching with the given size, capped at the collect endpoint's limit.
    #[must_use]
    pub fn with_batching(mut self, batch_size: usize) -> Self {
        self.batching_enabled = true;
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self.dispatch_after = self.batch_size;
        self
    }

    /// Whether events should be grouped before dispatch.
    pub fn batching_active(&self) -> bool {
        self.batching_enabled && self.batch_size > 1
    }

    /// Directory name used for this instance's persisted state.
    pub fn instance_key(&self) -> String {
        format!("{}.{}.{}", self.account, self.profile, self.environment)
    }

    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds a configuration from `TRACKER_*` pairs. Unknown keys are ignored.
    pub fn from_env_iter<I>(vars: I) -> Result<Config, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(ENV_PREFIX)
                    .map(|stripped| (stripped.to_string(), value))
            })
            .collect();
        let lookup = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let account = lookup("ACCOUNT").ok_or_else(|| missing("ACCOUNT"))?;
        let profile = lookup("PROFILE").ok_or_else(|| missing("PROFILE"))?;
        let environment = lookup("ENVIRONMENT").unwrap_or(DEFAULT_ENVIRONMENT);
        let mut config = Config::new(account, profile, environment);

        config.data_source = lookup("DATA_SOURCE").map(str::to_string);
        if let Some(value) = lookup("CONSENT_POLICY") {
            config.consent_policy = Some(parse_with(
                "CONSENT_POLICY",
                value,
                ConsentPolicyKind::from_str,
            )?);
        }
        if let Some(value) = lookup("CONSENT_EXPIRY") {
            config.consent_expiry = parse_with("CONSENT_EXPIRY", value, parse_duration)?;
        }
        if let Some(value) = lookup("CONSENT_LOGGING") {
            config.consent_logging_enabled = parse_bool("CONSENT_LOGGING", value)?;
        }
        config.override_consent_categories_key =
            lookup("OVERRIDE_CONSENT_CATEGORIES_KEY").map(str::to_string);

        if let Some(value) = lookup("HOSTED_DATA_LAYER_KEYS") {
            config.hosted_data_layer_keys =
                parse_with("HOSTED_DATA_LAYER_KEYS", value, parse_key_map)?;
        }
        if let Some(value) = lookup("HOSTED_DATA_LAYER_CACHE_SIZE") {
            config.hosted_data_layer_cache_size = parse_number("HOSTED_DATA_LAYER_CACHE_SIZE", value)?;
        }
        if let Some(value) = lookup("HOSTED_DATA_LAYER_EXPIRY") {
            config.hosted_data_layer_expiry =
                parse_with("HOSTED_DATA_LAYER_EXPIRY", value, parse_duration)?;
        }
        if let Some(value) = lookup("HOSTED_DATA_LAYER_MAX_RETRIES") {
            config.hosted_data_layer_max_retries =
                parse_number("HOSTED_DATA_LAYER_MAX_RETRIES", value)?;
        }
        if let Some(value) = lookup("HOSTED_DATA_LAYER_BASE_URL") {
            config.hosted_data_layer_base_url = value.to_string();
        }

        if let Some(value) = lookup("BATCHING_ENABLED") {
            config.batching_enabled = parse_bool("BATCHING_ENABLED", value)?;
        }
        if let Some(value) = lookup("BATCH_SIZE") {
            let size: usize = parse_number("BATCH_SIZE", value)?;
            config.batch_size = size.clamp(1, MAX_BATCH_SIZE);
        }
        config.dispatch_after = match lookup("DISPATCH_AFTER") {
            Some(value) => parse_number::<usize>("DISPATCH_AFTER", value)?.max(1),
            None => config.batch_size,
        };
        if let Some(value) = lookup("BATCH_WINDOW") {
            config.batch_window = Some(parse_with("BATCH_WINDOW", value, parse_duration)?);
        }
        if let Some(value) = lookup("BATCHING_BYPASS_KEYS") {
            config.batching_bypass_keys = value
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = lookup("DISPATCH_QUEUE_LIMIT") {
            config.dispatch_queue_limit = parse_number("DISPATCH_QUEUE_LIMIT", value)?;
        }
        if let Some(value) = lookup("DISPATCH_EXPIRATION_DAYS") {
            config.dispatch_expiration_days = parse_number("DISPATCH_EXPIRATION_DAYS", value)?;
        }

        if let Some(value) = lookup("MINUTES_BETWEEN_SESSION") {
            config.minutes_between_session = parse_number("MINUTES_BETWEEN_SESSION", value)?;
        }
        if let Some(value) = lookup("SECONDS_BETWEEN_TRACK_EVENTS") {
            config.seconds_between_track_events =
                parse_number("SECONDS_BETWEEN_TRACK_EVENTS", value)?;
        }
        if let Some(value) = lookup("SESSION_COUNTING") {
            config.session_counting_enabled = parse_bool("SESSION_COUNTING", value)?;
        }
        if let Some(value) = lookup("SESSION_BASE_URL") {
            config.session_base_url = value.to_string();
        }

        config.storage_dir = lookup("STORAGE_DIR").map(PathBuf::from);
        if let Some(value) = lookup("COLLECT_URL") {
            config.collect_url = value.to_string();
        }
        if let Some(value) = lookup("COLLECT_BATCH_URL") {
            config.collect_batch_url = value.to_string();
        }
        if let Some(value) = lookup("DISPATCH_TIMEOUT") {
            config.dispatch_timeout = parse_with("DISPATCH_TIMEOUT", value, parse_duration)?;
        }
        if let Some(value) = lookup("RETRY_STRATEGY") {
            config.retry_strategy = parse_with("RETRY_STRATEGY", value, RetryStrategy::from_str)?;
        }
        if let Some(value) = lookup("REQUEUE_RETRY_INTERVAL") {
            config.requeue_retry_interval =
                parse_with("REQUEUE_RETRY_INTERVAL", value, parse_duration)?;
        }

        Ok(config)
    }
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n * 24 * 60 * 60)
}

fn missing(key: &str) -> ConfigError {
    ConfigError::Missing(format!("{ENV_PREFIX}{key}"))
}

fn invalid(key: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_with<T, E: ToString>(
    key: &str,
    value: &str,
    parse: impl Fn(&str) -> Result<T, E>,
) -> Result<T, ConfigError> {
    parse(value).map_err(|e| invalid(key, value, e))
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    parse_with(key, value, str::parse::<T>)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

/// Parses `90d`, `12h`, `30m`, `45s` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let amount: u64 = number
        .parse()
        .map_err(|_| format!("missing amount in duration {value}"))?;
    let seconds = match unit {
        "" | "s" => amount,
        "m" => amount * 60,
        "h" => amount * 60 * 60,
        "d" => amount * 24 * 60 * 60,
        other => return Err(format!("unknown duration unit {other}")),
    };
    Ok(Duration::from_secs(seconds))
}

/// Parses `event:key,event:key` pairs.
fn parse_key_map(value: &str) -> Result<HashMap<String, String>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((event, key)) if !event.is_empty() && !key.is_empty() => {
                Ok((event.trim().to_string(), key.trim().to_string()))
            }
            _ => Err(format!("expected event:key, got {pair}")),
        })
        .collect()
}
