// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The serial context every tracker mutation runs on.
//!
//! `TrackerService::run` owns the data layer, consent engine, hosted data
//! layer and dispatch manager and applies commands one at a time. Network work
//! (lookups, deliveries, session starts) runs on spawned tasks whose results
//! come back as commands on the same channel.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::consent::{
    self, ConsentCategory, ConsentManager, ConsentPolicy, ConsentPreferences, ConsentStatus,
};
use crate::data_layer::session::{HttpSessionStarter, SessionError, SessionStarter};
use crate::data_layer::{DataLayer, Expiry};
use crate::dispatch::{DeliveryOutcome, DispatchError, DispatchManager, Dispatcher};
use crate::errors::{ServiceError, TrackError};
use crate::event::{Completion, Dispatch, EventData, TrackEvent};
use crate::hosted::{
    HostedDataLayer, HttpLookupClient, LookupClient, LookupError, LookupJob, LookupOutcome,
};
use crate::pipeline::batching::BatchingValidator;
use crate::pipeline::listeners::{DataLayerEnrichment, RequestBookkeeping};
use crate::pipeline::{Pipeline, SharedValidator};
use crate::storage::{FileStore, MemoryStore, PersistentStore};
use crate::util::{self, shared, Shared};

const REASON_STARTED: &str = "tracker started";
const REASON_DISPATCHERS_READY: &str = "dispatchers ready";
const REASON_CONSENT_UPDATED: &str = "consent preferences updated";
const REASON_LOOKUP_COMPLETED: &str = "hosted data layer lookup completed";
const REASON_LOOKUP_RETRY: &str = "hosted data layer lookup retry";
const REASON_DELIVERY_RETRY: &str = "delivery retry";
const REASON_BATCH_WINDOW: &str = "batch window elapsed";
const REASON_FLUSH: &str = "flush requested";

/// Collaborators the service cannot build from configuration alone. Anything
/// left empty gets its default implementation.
#[derive(Default)]
pub struct TrackerDependencies {
    /// Overrides the store derived from `Config::storage_dir`.
    pub store: Option<Arc<dyn PersistentStore>>,
    pub dispatchers: Vec<Arc<dyn Dispatcher>>,
    pub lookup_client: Option<Arc<dyn LookupClient>>,
    pub session_starter: Option<Arc<dyn SessionStarter>>,
    /// Required when the configured consent policy is `custom`.
    pub consent_policy: Option<Box<dyn ConsentPolicy>>,
}

pub enum TrackerCommand {
    Track(TrackEvent),
    Dequeue {
        reason: String,
        flush: bool,
    },
    SetConsentStatus(ConsentStatus),
    SetConsentCategories(BTreeSet<ConsentCategory>),
    ResetConsent,
    GetConsentPreferences(oneshot::Sender<Option<ConsentPreferences>>),
    AddData {
        data: EventData,
        expiry: Expiry,
    },
    DeleteData(Vec<String>),
    DeleteAllData,
    GetAllData(oneshot::Sender<EventData>),
    GetSessionId(oneshot::Sender<Option<String>>),
    SetSessionId(String),
    GetQueueLength(oneshot::Sender<usize>),
    UpdateConfig(Arc<Config>),
    AddDispatcher(Arc<dyn Dispatcher>),
    LookupCompleted {
        id: String,
        result: Result<EventData, LookupError>,
    },
    DispatchCompleted {
        request: Dispatch,
        results: Vec<(String, Result<(), DispatchError>)>,
    },
    SessionStarted(Result<(), SessionError>),
    RetryDequeue(&'static str),
    Shutdown,
}

#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::UnboundedSender<TrackerCommand>,
}

impl TrackerHandle {
    fn send(&self, command: TrackerCommand) -> Result<(), ServiceError> {
        self.tx
            .send(command)
            .map_err(|e| ServiceError::ChannelClosed(format!("Failed to send command: {e}")))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> TrackerCommand,
    ) -> Result<T, ServiceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(command(response_tx))?;
        response_rx
            .await
            .map_err(|e| ServiceError::ChannelClosed(format!("Failed to receive response: {e}")))
    }

    pub fn track(&self, event: TrackEvent) -> Result<(), ServiceError> {
        self.send(TrackerCommand::Track(event))
    }

    /// Tracks `event` and waits until it is delivered, dropped or fails.
    /// Any completion already attached to the event still runs first.
    pub async fn track_and_wait(
        &self,
        event: TrackEvent,
    ) -> Result<Result<(), TrackError>, ServiceError> {
        let (response_tx, response_rx) = oneshot::channel();
        let response_tx = Mutex::new(Some(response_tx));
        let inner = event.completion.clone();
        let event = event.with_completion(Completion::new(move |result| {
            if let Some(inner) = &inner {
                inner.complete(result.clone());
            }
            if let Some(tx) = util::lock(&response_tx).take() {
                let _ = tx.send(result);
            }
        }));
        self.track(event)?;
        response_rx
            .await
            .map_err(|e| ServiceError::ChannelClosed(format!("Track completion dropped: {e}")))
    }

    /// Re-evaluates the queue without releasing held batches.
    pub fn dequeue(&self, reason: &str) -> Result<(), ServiceError> {
        self.send(TrackerCommand::Dequeue {
            reason: reason.to_string(),
            flush: false,
        })
    }

    /// Re-evaluates the queue and sends everything that may leave.
    pub fn flush(&self) -> Result<(), ServiceError> {
        self.send(TrackerCommand::Dequeue {
            reason: REASON_FLUSH.to_string(),
            flush: true,
        })
    }

    pub fn set_consent_status(&self, status: ConsentStatus) -> Result<(), ServiceError> {
        self.send(TrackerCommand::SetConsentStatus(status))
    }

    pub fn set_consent_categories(
        &self,
        categories: BTreeSet<ConsentCategory>,
    ) -> Result<(), ServiceError> {
        self.send(TrackerCommand::SetConsentCategories(categories))
    }

    pub fn reset_consent(&self) -> Result<(), ServiceError> {
        self.send(TrackerCommand::ResetConsent)
    }

    /// `None` when no consent policy is configured.
    pub async fn consent_preferences(&self) -> Result<Option<ConsentPreferences>, ServiceError> {
        self.request(TrackerCommand::GetConsentPreferences).await
    }

    pub fn add_data(&self, data: EventData, expiry: Expiry) -> Result<(), ServiceError> {
        self.send(TrackerCommand::AddData { data, expiry })
    }

    pub fn delete_data<S: AsRef<str>>(&self, keys: &[S]) -> Result<(), ServiceError> {
        let keys = keys.iter().map(|k| k.as_ref().to_string()).collect();
        self.send(TrackerCommand::DeleteData(keys))
    }

    pub fn delete_all_data(&self) -> Result<(), ServiceError> {
        self.send(TrackerCommand::DeleteAllData)
    }

    pub async fn all_data(&self) -> Result<EventData, ServiceError> {
        self.request(TrackerCommand::GetAllData).await
    }

    pub async fn session_id(&self) -> Result<Option<String>, ServiceError> {
        self.request(TrackerCommand::GetSessionId).await
    }

    pub fn set_session_id(&self, session_id: &str) -> Result<(), ServiceError> {
        self.send(TrackerCommand::SetSessionId(session_id.to_string()))
    }

    pub async fn queue_len(&self) -> Result<usize, ServiceError> {
        self.request(TrackerCommand::GetQueueLength).await
    }

    pub fn update_config(&self, config: Arc<Config>) -> Result<(), ServiceError> {
        self.send(TrackerCommand::UpdateConfig(config))
    }

    pub fn add_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<(), ServiceError> {
        self.send(TrackerCommand::AddDispatcher(dispatcher))
    }

    pub fn shutdown(&self) -> Result<(), ServiceError> {
        self.send(TrackerCommand::Shutdown)
    }
}

pub struct TrackerService {
    config: Arc<Config>,
    data_layer: Shared<DataLayer>,
    consent: Option<Shared<ConsentManager>>,
    hosted: Shared<HostedDataLayer>,
    manager: DispatchManager,
    dispatchers: Vec<Arc<dyn Dispatcher>>,
    lookup_client: Arc<dyn LookupClient>,
    session_starter: Arc<dyn SessionStarter>,
    lookup_rx: mpsc::UnboundedReceiver<LookupJob>,
    /// Startup events produced before the service ran, such as consent cookie syncs.
    pending: Vec<TrackEvent>,
    /// Dispatch tasks whose results have not come back yet.
    outstanding: usize,
    retry_scheduled: bool,
    cancel: CancellationToken,
    batch_window: Option<CancellationToken>,
    tx: mpsc::WeakUnboundedSender<TrackerCommand>,
    rx: mpsc::UnboundedReceiver<TrackerCommand>,
}

impl TrackerService {
    pub fn new(
        config: Arc<Config>,
        dependencies: TrackerDependencies,
    ) -> Result<(Self, TrackerHandle), ServiceError> {
        let now = Utc::now();
        let store: Arc<dyn PersistentStore> = match (dependencies.store, &config.storage_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileStore::open(dir, &config.instance_key())?),
            (None, None) => Arc::new(MemoryStore::new()),
        };

        let mut data_layer = DataLayer::new(&config, store.clone(), now);
        let mut pending = Vec::new();
        let consent = match config.consent_policy {
            Some(kind) => {
                let policy = consent::policy_for(kind, dependencies.consent_policy)
                    .ok_or_else(|| ConfigError::Invalid {
                        key: "TRACKER_CONSENT_POLICY".to_string(),
                        value: "custom".to_string(),
                        reason: "no custom consent policy supplied".to_string(),
                    })?;
                let (manager, events) =
                    ConsentManager::new(&config, policy, store.clone(), &mut data_layer, now);
                pending.extend(events);
                Some(shared(manager))
            }
            None => None,
        };
        let data_layer = shared(data_layer);

        let (lookup_tx, lookup_rx) = mpsc::unbounded_channel();
        let hosted = shared(HostedDataLayer::new(&config, store.clone(), lookup_tx));

        let mut pipeline = Pipeline::new();
        if let Some(consent) = &consent {
            pipeline.add_validator(Box::new(SharedValidator::new(consent.clone())));
        }
        pipeline.add_validator(Box::new(SharedValidator::new(hosted.clone())));
        pipeline.add_validator(Box::new(BatchingValidator::new(&config)));
        pipeline.add_listener(Box::new(DataLayerEnrichment::new(data_layer.clone())));
        pipeline.add_listener(Box::new(RequestBookkeeping));

        let mut manager = DispatchManager::new(&config, pipeline, store, now);
        manager.set_dispatchers_ready(!dependencies.dispatchers.is_empty());

        let lookup_client = dependencies
            .lookup_client
            .unwrap_or_else(|| Arc::new(HttpLookupClient::new(config.dispatch_timeout)));
        let session_starter = dependencies.session_starter.unwrap_or_else(|| {
            Arc::new(HttpSessionStarter::new(
                &config.session_base_url,
                &config.account,
                &config.profile,
                config.dispatch_timeout,
            ))
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            config,
            data_layer,
            consent,
            hosted,
            manager,
            dispatchers: dependencies.dispatchers,
            lookup_client,
            session_starter,
            lookup_rx,
            pending,
            outstanding: 0,
            retry_scheduled: false,
            cancel: CancellationToken::new(),
            batch_window: None,
            tx: tx.downgrade(),
            rx,
        };
        Ok((service, TrackerHandle { tx }))
    }

    pub async fn run(mut self) {
        debug!(
            "Tracker service started for {} with validators [{}]",
            self.config.instance_key(),
            self.manager.pipeline().validator_ids().join(", ")
        );
        self.start_batch_window();
        self.dequeue(REASON_STARTED, false);
        for event in std::mem::take(&mut self.pending) {
            self.track(event);
        }
        self.spawn_lookups();

        while let Some(command) = self.rx.recv().await {
            match command {
                TrackerCommand::Track(event) => self.track(event),
                TrackerCommand::Dequeue { reason, flush } => self.dequeue(&reason, flush),
                TrackerCommand::SetConsentStatus(status) => {
                    self.update_consent(|consent, now| consent.set_status(status, now));
                }
                TrackerCommand::SetConsentCategories(categories) => {
                    self.update_consent(|consent, now| consent.set_categories(categories, now));
                }
                TrackerCommand::ResetConsent => {
                    self.update_consent(|consent, now| consent.reset(now));
                }
                TrackerCommand::GetConsentPreferences(response_tx) => {
                    let preferences = self
                        .consent
                        .as_ref()
                        .map(|consent| util::lock(consent).preferences(Utc::now()));
                    if response_tx.send(preferences).is_err() {
                        error!("Failed to send consent preferences - receiver dropped");
                    }
                }
                TrackerCommand::AddData { data, expiry } => {
                    util::lock(&self.data_layer).add(data, expiry, Utc::now());
                }
                TrackerCommand::DeleteData(keys) => util::lock(&self.data_layer).delete(&keys),
                TrackerCommand::DeleteAllData => util::lock(&self.data_layer).delete_all(),
                TrackerCommand::GetAllData(response_tx) => {
                    let all = util::lock(&self.data_layer).all(Utc::now());
                    if response_tx.send(all).is_err() {
                        error!("Failed to send data layer contents - receiver dropped");
                    }
                }
                TrackerCommand::GetSessionId(response_tx) => {
                    let session_id = util::lock(&self.data_layer).session_id(Utc::now());
                    if response_tx.send(session_id).is_err() {
                        error!("Failed to send session id - receiver dropped");
                    }
                }
                TrackerCommand::SetSessionId(session_id) => {
                    util::lock(&self.data_layer).set_session_id(&session_id, Utc::now());
                }
                TrackerCommand::GetQueueLength(response_tx) => {
                    if response_tx.send(self.manager.queue_len()).is_err() {
                        error!("Failed to send queue length - receiver dropped");
                    }
                }
                TrackerCommand::UpdateConfig(config) => self.update_config(config),
                TrackerCommand::AddDispatcher(dispatcher) => {
                    info!("Dispatcher {} added", dispatcher.id());
                    self.dispatchers.push(dispatcher);
                    self.manager.set_dispatchers_ready(true);
                    self.dequeue(REASON_DISPATCHERS_READY, false);
                }
                TrackerCommand::LookupCompleted { id, result } => {
                    self.lookup_completed(&id, result);
                }
                TrackerCommand::DispatchCompleted { request, results } => {
                    if self.dispatch_completed(request, results) == DeliveryOutcome::Requeued {
                        self.schedule_dequeue(REASON_DELIVERY_RETRY);
                    }
                }
                TrackerCommand::SessionStarted(result) => match result {
                    Ok(()) => {
                        debug!("Session start acknowledged");
                        util::lock(&self.data_layer).session_started();
                    }
                    Err(err) => warn!("Session start failed: {err}"),
                },
                TrackerCommand::RetryDequeue(reason) => {
                    self.retry_scheduled = false;
                    self.dequeue(reason, true);
                }
                TrackerCommand::Shutdown => {
                    debug!("Tracker service shutting down");
                    break;
                }
            }
            self.spawn_lookups();
        }

        self.cancel.cancel();
        self.await_outstanding().await;
        debug!("Tracker service stopped");
    }

    fn dispatch_completed(
        &mut self,
        request: Dispatch,
        results: Vec<(String, Result<(), DispatchError>)>,
    ) -> DeliveryOutcome {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.manager.handle_dispatch_result(request, results, Utc::now())
    }

    /// Gives running deliveries up to the dispatch timeout to report back.
    /// Whatever is still in flight afterwards stays in the stored queue.
    async fn await_outstanding(&mut self) {
        if self.outstanding == 0 {
            return;
        }
        debug!("Waiting for {} deliveries before stopping", self.outstanding);
        let deadline = tokio::time::sleep(self.config.dispatch_timeout);
        tokio::pin!(deadline);
        while self.outstanding > 0 {
            tokio::select! {
                () = &mut deadline => {
                    warn!(
                        "Stopping with {} deliveries in flight, they stay queued",
                        self.outstanding
                    );
                    break;
                }
                command = self.rx.recv() => match command {
                    Some(TrackerCommand::DispatchCompleted { request, results }) => {
                        self.dispatch_completed(request, results);
                    }
                    Some(_) => debug!("Ignoring command received while stopping"),
                    None => break,
                },
            }
        }
    }

    fn track(&mut self, event: TrackEvent) {
        let now = Utc::now();
        let session_start = util::lock(&self.data_layer).refresh_session(now);
        if let Some(session_id) = session_start {
            self.start_session(session_id);
        }
        let dispatches = self.manager.process_track(event, now);
        self.send(dispatches);
    }

    fn dequeue(&mut self, reason: &str, flush: bool) {
        let dispatches = self.manager.handle_dequeue_request(reason, flush, Utc::now());
        self.send(dispatches);
    }

    fn update_consent<F>(&mut self, change: F)
    where
        F: FnOnce(&mut ConsentManager, chrono::DateTime<Utc>) -> Vec<TrackEvent>,
    {
        let Some(consent) = &self.consent else {
            warn!("Ignoring consent update: no consent policy configured");
            return;
        };
        let events = {
            let mut consent = util::lock(consent);
            change(&mut consent, Utc::now())
        };
        self.dequeue(REASON_CONSENT_UPDATED, true);
        for event in events {
            self.track(event);
        }
    }

    fn update_config(&mut self, config: Arc<Config>) {
        info!("Applying configuration update");
        util::lock(&self.data_layer).update_config(&config);
        self.manager.update_config(&config, Utc::now());
        self.config = config;
        self.start_batch_window();
    }

    fn lookup_completed(&mut self, id: &str, result: Result<EventData, LookupError>) {
        let outcome = util::lock(&self.hosted).complete_lookup(id, result, Utc::now());
        match outcome {
            LookupOutcome::Cached | LookupOutcome::Failed => {
                self.dequeue(REASON_LOOKUP_COMPLETED, true);
            }
            LookupOutcome::RetryLater => self.schedule_dequeue(REASON_LOOKUP_RETRY),
            LookupOutcome::Ignored => {}
        }
    }

    /// Hands each request to every dispatcher on its own task.
    fn send(&mut self, dispatches: Vec<Dispatch>) {
        if dispatches.is_empty() {
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.outstanding += dispatches.len();
        for request in dispatches {
            let dispatchers = self.dispatchers.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut results = Vec::with_capacity(dispatchers.len());
                for dispatcher in &dispatchers {
                    let result = dispatcher.send(&request).await;
                    results.push((dispatcher.id().to_string(), result));
                }
                let command = TrackerCommand::DispatchCompleted { request, results };
                post_back(&tx, command, "delivery result");
            });
        }
    }

    fn spawn_lookups(&mut self) {
        while let Ok(job) = self.lookup_rx.try_recv() {
            let Some(tx) = self.tx.upgrade() else {
                return;
            };
            let client = self.lookup_client.clone();
            tokio::spawn(async move {
                let result = client.fetch(&job.url).await;
                let command = TrackerCommand::LookupCompleted { id: job.id, result };
                post_back(&tx, command, "lookup result");
            });
        }
    }

    fn start_session(&self, session_id: String) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let starter = self.session_starter.clone();
        tokio::spawn(async move {
            let result = starter.request_session(&session_id).await;
            post_back(&tx, TrackerCommand::SessionStarted(result), "session start result");
        });
    }

    /// At most one delayed retry dequeue is pending at a time.
    fn schedule_dequeue(&mut self, reason: &'static str) {
        if self.retry_scheduled {
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.retry_scheduled = true;
        let delay = self.config.requeue_retry_interval;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    post_back(&tx, TrackerCommand::RetryDequeue(reason), "retry dequeue");
                }
            }
        });
    }

    fn start_batch_window(&mut self) {
        if let Some(previous) = self.batch_window.take() {
            previous.cancel();
        }
        let Some(period) = self.config.batch_window.filter(|p| !p.is_zero()) else {
            return;
        };
        let token = self.cancel.child_token();
        self.batch_window = Some(token.clone());
        let tx = self.tx.clone();
        tokio::spawn(batch_window_ticker(period, token, tx));
    }
}

/// Hands a worker result back to the service loop.
fn post_back(tx: &mpsc::UnboundedSender<TrackerCommand>, command: TrackerCommand, what: &str) {
    if tx.send(command).is_err() {
        debug!("Tracker service gone before {what} arrived");
    }
}

async fn batch_window_ticker(
    period: Duration,
    cancel: CancellationToken,
    tx: mpsc::WeakUnboundedSender<TrackerCommand>,
) {
    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(tx) = tx.upgrade() else { break };
                let command = TrackerCommand::Dequeue {
                    reason: REASON_BATCH_WINDOW.to_string(),
                    flush: true,
                };
                if tx.send(command).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsentPolicyKind;
    use crate::constants::{ACCOUNT_KEY, REQUEST_UUID_KEY, VISITOR_ID_KEY};
    use async_trait::async_trait;
    use serde_json::json;
    use tracing_test::traced_test;

    /// Dispatcher recording what it was asked to send.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Dispatch>>,
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        fn id(&self) -> &str {
            "recorder"
        }

        async fn send(&self, request: &Dispatch) -> Result<(), DispatchError> {
            util::lock(&self.sent).push(request.clone());
            Ok(())
        }
    }

    struct NoLookups;

    #[async_trait]
    impl LookupClient for NoLookups {
        async fn fetch(&self, _url: &str) -> Result<EventData, LookupError> {
            Err(LookupError::Status(404))
        }
    }

    struct NoSessions;

    #[async_trait]
    impl SessionStarter for NoSessions {
        async fn request_session(&self, _session_id: &str) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn start(config: Config, recorder: Option<Arc<Recorder>>) -> TrackerHandle {
        let dependencies = TrackerDependencies {
            dispatchers: recorder
                .map(|r| vec![r as Arc<dyn Dispatcher>])
                .unwrap_or_default(),
            lookup_client: Some(Arc::new(NoLookups)),
            session_starter: Some(Arc::new(NoSessions)),
            ..Default::default()
        };
        let (service, handle) =
            TrackerService::new(Arc::new(config), dependencies).expect("service");
        tokio::spawn(service.run());
        handle
    }

    #[tokio::test]
    async fn delivers_enriched_events() {
        let recorder = Arc::new(Recorder::default());
        let handle = start(Config::new("acct", "main", "prod"), Some(recorder.clone()));

        let result = handle
            .track_and_wait(TrackEvent::named("view", EventData::new()))
            .await
            .expect("service running");
        assert_eq!(result, Ok(()));

        let sent = util::lock(&recorder.sent).clone();
        assert_eq!(sent.len(), 1);
        let data = &sent[0].events()[0].data;
        assert_eq!(data.get(ACCOUNT_KEY), Some(&json!("acct")));
        assert!(data.contains_key(VISITOR_ID_KEY));
        assert!(data.contains_key(REQUEST_UUID_KEY));
        handle.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn queues_until_dispatcher_added() {
        let handle = start(Config::new("acct", "main", "prod"), None);
        handle
            .track(TrackEvent::named("view", EventData::new()))
            .expect("track");
        assert_eq!(handle.queue_len().await.expect("queue length"), 1);

        let recorder = Arc::new(Recorder::default());
        handle.add_dispatcher(recorder.clone()).expect("add dispatcher");
        assert_eq!(handle.queue_len().await.expect("queue length"), 0);
        handle.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn consent_reset_is_idempotent() {
        let mut config = Config::new("acct", "main", "prod");
        config.consent_policy = Some(ConsentPolicyKind::Gdpr);
        let handle = start(config, Some(Arc::new(Recorder::default())));

        handle
            .set_consent_status(ConsentStatus::Consented)
            .expect("set status");
        handle.reset_consent().expect("reset");
        let once = handle.consent_preferences().await.expect("preferences");
        handle.reset_consent().expect("reset");
        let twice = handle.consent_preferences().await.expect("preferences");

        let once = once.expect("gdpr configured");
        assert_eq!(once.status, ConsentStatus::Unknown);
        assert!(once.categories.is_empty());
        assert_eq!(Some(once), twice);
        handle.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn data_layer_commands() {
        let handle = start(Config::new("acct", "main", "prod"), None);
        let data = json!({"plan": "pro", "tier": 2}).as_object().cloned().unwrap();
        handle.add_data(data, Expiry::Forever).expect("add");
        handle.delete_data(&["tier"]).expect("delete");
        handle.set_session_id("12345").expect("session id");

        let all = handle.all_data().await.expect("all");
        assert_eq!(all.get("plan"), Some(&json!("pro")));
        assert!(all.get("tier").is_none());
        assert_eq!(
            handle.session_id().await.expect("session id").as_deref(),
            Some("12345")
        );

        handle.delete_all_data().expect("delete all");
        let all = handle.all_data().await.expect("all");
        assert!(all.get("plan").is_none());
        handle.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn custom_policy_requires_implementation() {
        let mut config = Config::new("acct", "main", "prod");
        config.consent_policy = Some(ConsentPolicyKind::Custom);
        let result = TrackerService::new(Arc::new(config), TrackerDependencies::default());
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[test]
    #[traced_test]
    fn late_worker_results_are_logged() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        post_back(&tx, TrackerCommand::SessionStarted(Ok(())), "session start result");
        post_back(&tx, TrackerCommand::RetryDequeue("test"), "retry dequeue");
        assert!(logs_contain(
            "Tracker service gone before session start result arrived"
        ));
        assert!(logs_contain("Tracker service gone before retry dequeue arrived"));
    }

    #[tokio::test]
    async fn handle_reports_stopped_service() {
        let handle = start(Config::new("acct", "main", "prod"), None);
        handle.shutdown().expect("shutdown");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            handle.queue_len().await,
            Err(ServiceError::ChannelClosed(_))
        ));
    }
}
