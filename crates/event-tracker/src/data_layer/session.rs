// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session start returned status {0}")]
    Status(u16),
    #[error("session start request failed: {0}")]
    Transport(String),
}

/// Issues the remote "session start" call for a freshly generated session.
#[async_trait]
pub trait SessionStarter: Send + Sync {
    async fn request_session(&self, session_id: &str) -> Result<(), SessionError>;
}

pub struct HttpSessionStarter {
    client: Client,
    base_url: String,
    account: String,
    profile: String,
}

impl HttpSessionStarter {
    pub fn new(base_url: &str, account: &str, profile: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.to_string(),
            account: account.to_string(),
            profile: profile.to_string(),
        }
    }

    pub fn url(&self, session_id: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}{}{}{}&cb={}",
            self.base_url,
            self.account,
            self.profile,
            session_id,
            now.timestamp_millis()
        )
    }
}

#[async_trait]
impl SessionStarter for HttpSessionStarter {
    async fn request_session(&self, session_id: &str) -> Result<(), SessionError> {
        let url = self.url(session_id, Utc::now());
        debug!("Starting session {session_id}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SessionError::Status(response.status().as_u16()))
        }
    }
}

/// Bookkeeping for track frequency within the current session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub last_track: Option<DateTime<Utc>>,
    pub track_count: u32,
    /// Set when a new session id was generated and the remote call has not succeeded yet.
    pub session_request_pending: bool,
}

impl SessionState {
    /// Records a track call. Returns true when two calls landed within
    /// `seconds_between_track` and a session start is still pending.
    pub fn record_track(&mut self, now: DateTime<Utc>, seconds_between_track: u64) -> bool {
        let mut start_session = false;
        if let Some(last) = self.last_track {
            let window = chrono::Duration::seconds(
                i64::try_from(seconds_between_track).unwrap_or(i64::MAX),
            );
            if last + window > now {
                start_session = self.session_request_pending;
            } else {
                self.track_count = 0;
            }
        }
        self.last_track = Some(now);
        self.track_count += 1;
        start_session
    }

    pub fn session_started(&mut self) {
        self.session_request_pending = false;
        self.track_count = 0;
        self.last_track = None;
    }
}
