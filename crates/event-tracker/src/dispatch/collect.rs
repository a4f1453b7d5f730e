// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::{debug, error, warn};

use super::{DispatchError, Dispatcher};
use crate::config::Config;
use crate::event::Dispatch;

pub const COLLECT_DISPATCHER_ID: &str = "collect";

/// How many attempts a single send makes before the failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Up to `n` attempts back to back.
    Immediate(u64),
    /// Up to `n` attempts, waiting `delay_ms * attempt` between them.
    LinearBackoff(u64, u64),
}

impl RetryStrategy {
    fn attempts(&self) -> u64 {
        match self {
            RetryStrategy::Immediate(n) | RetryStrategy::LinearBackoff(n, _) => (*n).max(1),
        }
    }

    fn delay(&self, attempt: u64) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate(_) => None,
            RetryStrategy::LinearBackoff(_, delay_ms) => {
                Some(Duration::from_millis(delay_ms.saturating_mul(attempt)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRetryStrategyError(String);

impl fmt::Display for ParseRetryStrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected `immediate:<attempts>` or `linear:<attempts>:<delay_ms>`, got {}",
            self.0
        )
    }
}

impl FromStr for RetryStrategy {
    type Err = ParseRetryStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRetryStrategyError(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();
        let number = |part: &str| part.trim().parse::<u64>().map_err(|_| err());
        match parts.as_slice() {
            [kind, n] if kind.eq_ignore_ascii_case("immediate") => {
                Ok(RetryStrategy::Immediate(number(n)?))
            }
            [kind, n, delay] if kind.eq_ignore_ascii_case("linear") => {
                Ok(RetryStrategy::LinearBackoff(number(n)?, number(delay)?))
            }
            _ => Err(err()),
        }
    }
}

/// Posts JSON payloads to the collect endpoint. Single events go to the event
/// URL, batches to the bulk URL in compressed form.
#[derive(Debug, Clone)]
pub struct CollectDispatcher {
    client: Client,
    event_url: String,
    batch_url: String,
    retry_strategy: RetryStrategy,
}

impl CollectDispatcher {
    pub fn new(config: &Config) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(config.dispatch_timeout)
            .build()
            .map_err(|err| DispatchError::Destination {
                status: None,
                message: format!("unable to build http client: {err}"),
            })?;
        Ok(Self {
            client,
            event_url: config.collect_url.clone(),
            batch_url: config.collect_batch_url.clone(),
            retry_strategy: config.retry_strategy,
        })
    }

    fn url_for(&self, request: &Dispatch) -> &str {
        match request {
            Dispatch::Track(_) => &self.event_url,
            Dispatch::Batch(_) => &self.batch_url,
        }
    }

    async fn post(&self, url: &str, body: &[u8]) -> Result<Response, DispatchError> {
        self.client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|err| DispatchError::Destination {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            })
    }
}

async fn classify(resp: Result<Response, DispatchError>) -> Result<(), DispatchError> {
    let resp = resp?;
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(DispatchError::Destination {
        status: Some(status.as_u16()),
        message: status
            .canonical_reason()
            .map(|reason| format!("{reason}: {body}"))
            .unwrap_or(body),
    })
}

#[async_trait]
impl Dispatcher for CollectDispatcher {
    fn id(&self) -> &str {
        COLLECT_DISPATCHER_ID
    }

    async fn send(&self, request: &Dispatch) -> Result<(), DispatchError> {
        let body = serde_json::to_vec(&request.payload())
            .map_err(|err| DispatchError::Payload(err.to_string()))?;
        let url = self.url_for(request);
        debug!("Sending {} to {url}", request.describe());

        let attempts = self.retry_strategy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match classify(self.post(url, &body).await).await {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() => {
                    error!("{}: rejected by collect endpoint: {err}", request.describe());
                    return Err(err);
                }
                Err(err) if attempt >= attempts => {
                    error!(
                        "{}: giving up after {attempt} attempts: {err}",
                        request.describe()
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!("{}: attempt {attempt} failed: {err}", request.describe());
                    if let Some(delay) = self.retry_strategy.delay(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
