// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The durable queue, the manager deciding what leaves it and the dispatchers
//! that deliver what does.

pub mod collect;
pub mod manager;
pub mod queue;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::Dispatch;

pub use collect::{CollectDispatcher, RetryStrategy};
pub use manager::{DeliveryOutcome, DispatchManager};
pub use queue::{PersistentQueue, QueueEntry};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The request could not be encoded. Never retried.
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("destination error ({status:?}): {message}")]
    Destination {
        status: Option<u16>,
        message: String,
    },
}

impl DispatchError {
    /// 4xx responses and payload errors are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Payload(_) => false,
            DispatchError::Destination { status, .. } => {
                !status.is_some_and(|code| (400..500).contains(&code))
            }
        }
    }
}

/// A delivery back-end.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn id(&self) -> &str;

    async fn send(&self, request: &Dispatch) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(!DispatchError::Payload("bad".to_string()).is_retryable());
        let status = |code| DispatchError::Destination {
            status: code,
            message: String::new(),
        };
        assert!(!status(Some(400)).is_retryable());
        assert!(!status(Some(499)).is_retryable());
        assert!(status(Some(500)).is_retryable());
        assert!(status(None).is_retryable());
    }
}
