// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::event::EventData;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("empty response body")]
    EmptyResponse,
    #[error("response is not a JSON object: {0}")]
    UnableToDecode(String),
    #[error("lookup returned status {0}")]
    Status(u16),
    #[error("lookup request failed: {0}")]
    Transport(String),
}

impl LookupError {
    /// Terminal errors mark the id as failing instead of being retried.
    pub fn is_terminal(&self) -> bool {
        match self {
            LookupError::EmptyResponse | LookupError::UnableToDecode(_) => true,
            LookupError::Status(code) => (400..500).contains(code),
            LookupError::Transport(_) => false,
        }
    }
}

/// Fetches one hosted data layer record.
#[async_trait]
pub trait LookupClient: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<EventData, LookupError>;
}

pub struct HttpLookupClient {
    client: Client,
}

impl HttpLookupClient {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

pub fn decode(body: &[u8]) -> Result<EventData, LookupError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(LookupError::EmptyResponse);
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(LookupError::UnableToDecode(format!(
            "expected an object, got {}",
            kind(&other)
        ))),
        Err(err) => Err(LookupError::UnableToDecode(err.to_string())),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl LookupClient for HttpLookupClient {
    async fn fetch(&self, url: &str) -> Result<EventData, LookupError> {
        debug!("Fetching hosted data layer record {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LookupError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| LookupError::Transport(e.to_string()))?;
        decode(&body)
    }
}
