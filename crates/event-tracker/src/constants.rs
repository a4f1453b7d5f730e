// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attribute names and default values shared across the pipeline.

pub const LIBRARY_NAME: &str = "rust";
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ORIGIN_MOBILE: &str = "mobile";

pub const ACCOUNT_KEY: &str = "tealium_account";
pub const PROFILE_KEY: &str = "tealium_profile";
pub const ENVIRONMENT_KEY: &str = "tealium_environment";
pub const DATA_SOURCE_KEY: &str = "tealium_datasource";
pub const LIBRARY_NAME_KEY: &str = "tealium_library_name";
pub const LIBRARY_VERSION_KEY: &str = "tealium_library_version";
pub const ORIGIN_KEY: &str = "origin";
pub const RANDOM_KEY: &str = "tealium_random";
pub const SESSION_ID_KEY: &str = "tealium_session_id";
pub const VISITOR_ID_KEY: &str = "tealium_visitor_id";
pub const APP_UUID_KEY: &str = "app_uuid";

pub const EVENT_KEY: &str = "tealium_event";
pub const CALL_TYPE_KEY: &str = "call_type";
pub const REQUEST_UUID_KEY: &str = "request_uuid";
pub const QUEUE_REASON_KEY: &str = "queue_reason";
pub const WAS_QUEUED_KEY: &str = "was_queued";

pub const TIMESTAMP_EPOCH_KEY: &str = "tealium_timestamp_epoch";
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const TIMESTAMP_LOCAL_KEY: &str = "timestamp_local";
pub const TIMESTAMP_OFFSET_KEY: &str = "timestamp_offset";
pub const TIMESTAMP_UNIX_KEY: &str = "timestamp_unix";
pub const TIMESTAMP_UNIX_MILLISECONDS_KEY: &str = "timestamp_unix_milliseconds";

pub const QUEUE_REASON_BATCHING: &str = "batching";
pub const QUEUE_REASON_CONSENT: &str = "consent";
pub const QUEUE_REASON_PENDING_LOOKUP: &str = "pending lookup";
pub const QUEUE_REASON_DELIVERY_RETRY: &str = "delivery retry";
pub const QUEUE_REASON_NO_DISPATCHERS: &str = "dispatchers not ready";

pub const HOSTED_DATA_LAYER_ERROR_KEY: &str = "hosted_data_layer_error";

/// Keys copied once into the `shared` section of a compressed batch payload.
pub const BATCH_SHARED_KEYS: [&str; 8] = [
    ACCOUNT_KEY,
    PROFILE_KEY,
    ENVIRONMENT_KEY,
    DATA_SOURCE_KEY,
    LIBRARY_NAME_KEY,
    LIBRARY_VERSION_KEY,
    APP_UUID_KEY,
    VISITOR_ID_KEY,
];

pub const MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 40;
pub const DEFAULT_BATCH_EXPIRATION_DAYS: u32 = 7;
pub const DEFAULT_MINUTES_BETWEEN_SESSION: u64 = 30;
pub const DEFAULT_SECONDS_BETWEEN_TRACK_EVENTS: u64 = 30;
pub const DEFAULT_HOSTED_CACHE_SIZE: usize = 50;
pub const DEFAULT_HOSTED_EXPIRY_DAYS: u64 = 7;
pub const DEFAULT_HOSTED_MAX_RETRIES: u32 = 3;

pub const DEFAULT_HOSTED_BASE_URL: &str = "https://tags.tiqcdn.com/dle/";
pub const DEFAULT_SESSION_BASE_URL: &str = "https://tags.tiqcdn.com/utag/tiqapp/utag.v.js?a=";
pub const DEFAULT_COLLECT_URL: &str = "https://collect.tealiumiq.com/event";
pub const DEFAULT_COLLECT_BATCH_URL: &str = "https://collect.tealiumiq.com/bulk-event";
