// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod consent;
pub mod constants;
pub mod data_layer;
pub mod dispatch;
pub mod errors;
pub mod event;
pub mod hosted;
pub mod pipeline;
pub mod service;
pub mod storage;
mod util;

pub use config::{Config, ConsentPolicyKind};
pub use errors::{ServiceError, TrackError};
pub use event::{BatchEvent, Completion, Dispatch, EventData, TrackEvent};
pub use service::{TrackerDependencies, TrackerHandle, TrackerService};
