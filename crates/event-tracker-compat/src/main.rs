// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use event_tracker::{
    dispatch::{CollectDispatcher, Dispatcher},
    Config, TrackEvent, TrackerDependencies, TrackerHandle, TrackerService,
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TRACKER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Error creating config on event tracker startup: {e}");
            return;
        }
    };

    let collect = match CollectDispatcher::new(&config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("Error creating collect dispatcher: {e}");
            return;
        }
    };

    let dependencies = TrackerDependencies {
        dispatchers: vec![Arc::new(collect) as Arc<dyn Dispatcher>],
        ..Default::default()
    };
    let (service, handle) = match TrackerService::new(Arc::clone(&config), dependencies) {
        Ok(created) => created,
        Err(e) => {
            error!("Error creating tracker service: {e}");
            return;
        }
    };
    let service_task = tokio::spawn(service.run());
    info!("Event tracker started for {}", config.instance_key());

    tokio::select! {
        () = read_events(handle.clone()) => debug!("Reached end of input"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for shutdown signal: {e}");
            }
        }
    }

    match handle.queue_len().await {
        Ok(0) => {}
        Ok(n) => warn!("{n} events still queued, they are kept for the next run"),
        Err(e) => error!("Unable to read queue length: {e}"),
    }
    if let Err(e) = handle.flush().and_then(|()| handle.shutdown()) {
        error!("Error shutting down tracker service: {e}");
    }
    if let Err(e) = service_task.await {
        error!("Tracker service task failed: {e}");
    }
}

/// Tracks one event per line of stdin. Each line must be a JSON object.
async fn read_events(handle: TrackerHandle) {
    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Error reading input: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let data = match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(serde_json::Value::Object(data)) => data,
            Ok(_) => {
                warn!("Skipping input line: expected a JSON object");
                continue;
            }
            Err(e) => {
                warn!("Skipping malformed input line: {e}");
                continue;
            }
        };
        if let Err(e) = handle.track(TrackEvent::new(data)) {
            error!("Unable to track event: {e}");
            break;
        }
    }
}
