// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::storage::StoreError;

/// Outcome reported to a track call's completion callback when it did not succeed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackError {
    #[error("tracking forbidden by the current consent preferences")]
    Forbidden,
    #[error("event was purged from the dispatch queue")]
    Purged,
    #[error("event expired from the dispatch queue")]
    Expired,
    #[error("delivery failed: {0}")]
    Delivery(#[from] DispatchError),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("storage unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("tracker service is not running: {0}")]
    ChannelClosed(String),
}
