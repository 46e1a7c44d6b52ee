// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable flow worker.
//!
//! [`FlowWorker`] owns the store, the pipeline, the flow mapper and the task
//! manager, and moves events between them:
//!
//! ```text
//!   submit / loopback ─▶ lane[hash(key) % N] ─▶ read ─▶ pipeline ─▶ CAS write ─▶ records
//!                                                  ▲                    │
//!                                                  └──── conflict ──────┘
//! ```
//!
//! Flow events are partitioned by flow key and mapper events by session id, so
//! one key is always handled by one lane, strictly in order. Records for the
//! flow-event and mapper topics loop back into the lanes; everything else goes
//! to the [`RecordSink`]. Delayed records wait on the task manager's scheduled
//! lane.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ledgerflow_core::bus::InMemoryRecordSink;
//! use ledgerflow_core::fiber::FlowRegistry;
//! use ledgerflow_core::persistence::InMemoryCheckpointStore;
//! use ledgerflow_core::worker::FlowWorker;
//!
//! let worker = FlowWorker::builder()
//!     .store(Arc::new(InMemoryCheckpointStore::new()))
//!     .sink(Arc::new(InMemoryRecordSink::new()))
//!     .flows(Arc::new(FlowRegistry::new().with_serde::<Payment>("payment")))
//!     .local_identity(alice)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! worker.start_flow(flow_key, "payment", args)?;
//!
//! worker.shutdown().await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{OffsetClock, Record, RecordPayload, RecordSink};
use crate::config::{Config, EngineConfig};
use crate::error::CoreError;
use crate::external::{ExternalEventFactoryRegistry, ExternalEventResponse};
use crate::fiber::FlowRegistry;
use crate::model::{
    EventEnvelope, FlowEvent, FlowEventKind, FlowKey, HoldingIdentity, Payload, StartFlow,
};
use crate::persistence::{CheckpointStore, PutOutcome};
use crate::pipeline::{CheckpointAction, FlowEventProcessor};
use crate::session::{FlowMapper, MapperEvent, MapperStatus, SessionPayload};
use crate::task_manager::TaskManager;

/// Default number of lanes.
pub const DEFAULT_PARTITIONS: usize = 8;

/// Default time [`FlowWorker::shutdown`] waits for in-flight work.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound of the delay between publish attempts.
const MAX_PUBLISH_BACKOFF: Duration = Duration::from_secs(30);

/// Builder for creating a [`FlowWorker`].
pub struct FlowWorkerBuilder {
    store: Option<Arc<dyn CheckpointStore>>,
    sink: Option<Arc<dyn RecordSink>>,
    flows: Arc<FlowRegistry>,
    factories: Arc<ExternalEventFactoryRegistry>,
    local_identities: Vec<HoldingIdentity>,
    partitions: usize,
    engine: EngineConfig,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for FlowWorkerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWorkerBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("sink", &self.sink.as_ref().map(|_| "..."))
            .field("flows", &self.flows)
            .field("factories", &self.factories)
            .field("local_identities", &self.local_identities)
            .field("partitions", &self.partitions)
            .field("engine", &self.engine)
            .finish()
    }
}

impl Default for FlowWorkerBuilder {
    fn default() -> Self {
        Self {
            store: None,
            sink: None,
            flows: Arc::new(FlowRegistry::new()),
            factories: Arc::new(ExternalEventFactoryRegistry::new()),
            local_identities: Vec::new(),
            partitions: DEFAULT_PARTITIONS,
            engine: EngineConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl FlowWorkerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take partitions and engine settings from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.partitions = config.partitions;
        self.engine = config.engine.clone();
        self
    }

    /// Set the checkpoint store (required).
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the sink for records leaving the engine (required).
    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the flow registry.
    pub fn flows(mut self, flows: Arc<FlowRegistry>) -> Self {
        self.flows = flows;
        self
    }

    /// Set the external event factory registry.
    pub fn external_factories(mut self, factories: Arc<ExternalEventFactoryRegistry>) -> Self {
        self.factories = factories;
        self
    }

    /// Add an identity hosted by this worker.
    ///
    /// Session messages between local identities never leave the worker.
    pub fn local_identity(mut self, identity: HoldingIdentity) -> Self {
        self.local_identities.push(identity);
        self
    }

    /// Set the number of lanes.
    ///
    /// Default: [`DEFAULT_PARTITIONS`]
    pub fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set the engine settings.
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Set how long shutdown waits for in-flight work.
    ///
    /// Default: [`DEFAULT_SHUTDOWN_TIMEOUT`]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the worker configuration.
    ///
    /// Returns an error if required fields are missing or the pipeline cannot
    /// be wired.
    pub fn build(self) -> Result<FlowWorkerConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("checkpoint store is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("record sink is required"))?;
        if self.partitions == 0 {
            anyhow::bail!("partitions must be at least 1");
        }

        let tasks = TaskManager::new(&self.engine);
        let processor =
            FlowEventProcessor::new(&self.engine, self.flows, self.factories, tasks.clone())?;
        let mapper = FlowMapper::new(
            store.clone(),
            self.local_identities,
            self.engine.mapper_cleanup_delay,
        );

        Ok(FlowWorkerConfig {
            store,
            sink,
            processor,
            mapper,
            tasks,
            partitions: self.partitions,
            retry_delay: self.engine.hospital_backoff,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Configuration for a [`FlowWorker`].
pub struct FlowWorkerConfig {
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RecordSink>,
    processor: FlowEventProcessor,
    mapper: FlowMapper,
    tasks: TaskManager,
    partitions: usize,
    retry_delay: Duration,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for FlowWorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWorkerConfig")
            .field("store", &"...")
            .field("sink", &"...")
            .field("processor", &self.processor)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl FlowWorkerConfig {
    /// Start the lanes and recover stored flows.
    pub async fn start(self) -> Result<FlowWorker> {
        let mut senders = Vec::with_capacity(self.partitions);
        let mut receivers = Vec::with_capacity(self.partitions);
        for _ in 0..self.partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let stop = CancellationToken::new();
        let inner = Arc::new(WorkerInner {
            store: self.store,
            sink: self.sink,
            processor: self.processor,
            mapper: self.mapper,
            tasks: self.tasks,
            clock: OffsetClock::new(),
            lanes: senders,
            flow_tokens: Mutex::new(HashMap::new()),
            retry_delay: self.retry_delay,
            stop: stop.clone(),
        });

        let lanes = receivers
            .into_iter()
            .enumerate()
            .map(|(index, rx)| tokio::spawn(run_lane(inner.clone(), index, rx, stop.clone())))
            .collect();

        let recovered = inner.recover().await?;
        info!(
            partitions = self.partitions,
            recovered, "FlowWorker started"
        );

        Ok(FlowWorker {
            inner,
            lanes,
            stop,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// A running flow worker.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FlowWorker {
    inner: Arc<WorkerInner>,
    lanes: Vec<JoinHandle<()>>,
    stop: CancellationToken,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for FlowWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWorker")
            .field("partitions", &self.lanes.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl FlowWorker {
    /// Create a new builder for configuring the worker.
    pub fn builder() -> FlowWorkerBuilder {
        FlowWorkerBuilder::new()
    }

    /// Start a new flow.
    pub fn start_flow(
        &self,
        flow_key: FlowKey,
        flow_name: impl Into<String>,
        args: Payload,
    ) -> Result<(), CoreError> {
        self.submit(FlowEvent::new(
            flow_key,
            FlowEventKind::Start(StartFlow {
                flow_name: flow_name.into(),
                args,
            }),
        ))
    }

    /// Deliver an external subsystem's response.
    pub fn deliver_external_response(
        &self,
        flow_key: FlowKey,
        response: ExternalEventResponse,
    ) -> Result<(), CoreError> {
        self.submit(FlowEvent::new(
            flow_key,
            FlowEventKind::ExternalEventResponse(response),
        ))
    }

    /// Enqueue a flow event.
    pub fn submit(&self, event: FlowEvent) -> Result<(), CoreError> {
        self.inner.enqueue(LaneMessage::Flow(event))
    }

    /// Enqueue a mapper event, such as a session message from another node.
    pub fn submit_mapper(&self, event: MapperEvent) -> Result<(), CoreError> {
        self.inner.enqueue(LaneMessage::Mapper(event))
    }

    /// Kill a flow.
    ///
    /// An in-flight fiber step of the flow is abandoned, then a kill event is
    /// enqueued behind it.
    pub fn kill_flow(&self, flow_key: FlowKey, reason: impl Into<String>) -> Result<(), CoreError> {
        if let Some(token) = self.inner.tokens().remove(&flow_key) {
            token.cancel();
        }
        self.submit(FlowEvent::new(
            flow_key,
            FlowEventKind::Kill {
                reason: reason.into(),
            },
        ))
    }

    /// The checkpoint store.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.store
    }

    /// The task manager.
    pub fn task_manager(&self) -> &TaskManager {
        &self.inner.tasks
    }

    /// Check if every lane is still running.
    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled() && self.lanes.iter().all(|lane| !lane.is_finished())
    }

    /// Gracefully shut down the worker.
    ///
    /// Lanes finish the event they are processing and stop; queued events are
    /// dropped. Pending timers are cancelled and in-flight tasks drained.
    pub async fn shutdown(self) -> Result<()> {
        info!("FlowWorker shutting down...");
        self.stop.cancel();

        let mut panicked = 0;
        for lane in self.lanes {
            if let Err(e) = lane.await {
                error!("FlowWorker lane panicked: {}", e);
                panicked += 1;
            }
        }

        if !self.inner.tasks.shutdown(self.shutdown_timeout).await {
            warn!("FlowWorker shutdown timed out waiting for tasks");
        }

        if panicked > 0 {
            return Err(anyhow::anyhow!("{} lane(s) panicked", panicked));
        }
        info!("FlowWorker shutdown complete");
        Ok(())
    }
}

#[derive(Debug)]
enum LaneMessage {
    Flow(FlowEvent),
    Mapper(MapperEvent),
}

impl LaneMessage {
    fn partition_hash(&self) -> u64 {
        match self {
            Self::Flow(event) => event.flow_key.partition_hash(),
            Self::Mapper(event) => event.session_id().partition_hash(),
        }
    }
}

struct WorkerInner {
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RecordSink>,
    processor: FlowEventProcessor,
    mapper: FlowMapper,
    tasks: TaskManager,
    clock: OffsetClock,
    lanes: Vec<mpsc::UnboundedSender<LaneMessage>>,
    flow_tokens: Mutex<HashMap<FlowKey, CancellationToken>>,
    retry_delay: Duration,
    stop: CancellationToken,
}

async fn run_lane(
    inner: Arc<WorkerInner>,
    index: usize,
    mut rx: mpsc::UnboundedReceiver<LaneMessage>,
    stop: CancellationToken,
) {
    debug!(lane = index, "Lane started");
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            LaneMessage::Flow(event) => inner.handle_flow_event(event).await,
            LaneMessage::Mapper(event) => inner.handle_mapper_event(event).await,
        }
    }
    debug!(lane = index, "Lane stopped");
}

impl WorkerInner {
    fn enqueue(&self, message: LaneMessage) -> Result<(), CoreError> {
        let lanes = self.lanes.len() as u64;
        let index = usize::try_from(message.partition_hash() % lanes).unwrap_or(0);
        self.lanes[index]
            .send(message)
            .map_err(|_| CoreError::WorkerStopped)
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<FlowKey, CancellationToken>> {
        self.flow_tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flow_token(&self, key: &FlowKey) -> CancellationToken {
        self.tokens().entry(key.clone()).or_default().clone()
    }

    #[instrument(
        skip(self, event),
        fields(flow_id = %event.flow_key.flow_id, event = event.kind.name())
    )]
    async fn handle_flow_event(self: &Arc<Self>, event: FlowEvent) {
        // The lane assigns the offset, so offsets per flow follow processing order.
        let offset = self.clock.next();
        match self.process_flow_event(offset, &event).await {
            Ok(records) => self.dispatch(records).await,
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Flow event failed, redelivering");
                self.redeliver(LaneMessage::Flow(event));
            }
        }
    }

    async fn process_flow_event(
        &self,
        offset: u64,
        event: &FlowEvent,
    ) -> Result<Vec<Record>, CoreError> {
        let key = &event.flow_key;
        let cancel = self.flow_token(key);

        loop {
            // 1. Read the checkpoint and its version
            let stored = self.store.get(key).await?;
            let version = stored.as_ref().map(|s| s.version);
            if stored.is_none() && self.is_finished_responder(event).await? {
                warn!("Session init for a finished responder dropped");
                return Ok(Vec::new());
            }

            // 2. Run the pipeline
            let envelope = EventEnvelope {
                offset,
                event: event.clone(),
            };
            let output = self
                .processor
                .process(envelope, stored.map(|s| s.checkpoint), &cancel)
                .await;

            // 3. Compare-and-set the result
            let written = match &output.checkpoint {
                CheckpointAction::Unchanged => PutOutcome::Written(version.unwrap_or(0)),
                CheckpointAction::Put(checkpoint) => {
                    self.store.put(key, checkpoint, version).await?
                }
                CheckpointAction::Delete => self.store.delete(key, version).await?,
            };
            if written.is_conflict() {
                warn!(?version, "Checkpoint changed concurrently, replaying event");
                continue;
            }

            // 4. Persist dead letters before anything is published
            if let Some(letter) = output
                .hospital
                .as_ref()
                .and_then(|report| report.dead_letter.as_ref())
            {
                self.store.put_dead_letter(letter).await?;
            }
            if output.checkpoint == CheckpointAction::Delete {
                self.tokens().remove(key);
            }

            return Ok(output.records);
        }
    }

    /// Whether `event` is a session init for a responder whose session end
    /// the mapper already closed.
    ///
    /// The responder's checkpoint is gone once it finishes, so without this a
    /// redelivered init would start it again.
    async fn is_finished_responder(&self, event: &FlowEvent) -> Result<bool, CoreError> {
        let FlowEventKind::Session(session) = &event.kind else {
            return Ok(false);
        };
        if !matches!(session.payload, SessionPayload::Init { .. }) {
            return Ok(false);
        }
        Ok(self
            .store
            .get_mapper_state(&session.session_id)
            .await?
            .is_some_and(|state| state.status != MapperStatus::Open))
    }

    #[instrument(skip(self, event), fields(session_id = %event.session_id()))]
    async fn handle_mapper_event(self: &Arc<Self>, event: MapperEvent) {
        match self.mapper.process(event.clone(), Utc::now()).await {
            Ok(records) => self.dispatch(records).await,
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Mapper event failed, redelivering");
                self.redeliver(LaneMessage::Mapper(event));
            }
        }
    }

    /// Route records: delayed ones to the scheduler, local ones back into the
    /// lanes, the rest to the sink in one batch.
    async fn dispatch(self: &Arc<Self>, records: Vec<Record>) {
        let now = Utc::now();
        let mut outbound = Vec::new();
        for record in records {
            match record.deliver_at {
                Some(at) if at > now => self.deliver_later(at, record),
                _ if record.topic.is_local() => self.loop_back(record),
                _ => outbound.push(record),
            }
        }
        self.publish(outbound).await;
    }

    fn deliver_later(self: &Arc<Self>, at: DateTime<Utc>, record: Record) {
        let inner = self.clone();
        self.tasks.schedule(at, async move {
            if record.topic.is_local() {
                inner.loop_back(record);
            } else {
                inner.publish(vec![record]).await;
            }
        });
    }

    fn loop_back(&self, record: Record) {
        let message = match record.payload {
            RecordPayload::FlowEvent(event) => LaneMessage::Flow(event),
            RecordPayload::MapperEvent(event) => LaneMessage::Mapper(event),
            other => {
                warn!(topic = %record.topic, payload = ?other, "Unexpected payload on local topic dropped");
                return;
            }
        };
        if self.enqueue(message).is_err() {
            debug!(topic = %record.topic, "Worker stopped, local record dropped");
        }
    }

    /// Publish records, retrying with backoff until the sink accepts them.
    ///
    /// The checkpoint that produced the records is already committed, so they
    /// cannot be regenerated. Retrying in place holds the lane and keeps the
    /// partition's output in order. Gives up only when the worker stops.
    async fn publish(&self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        let count = records.len();
        let mut delay = self.retry_delay;
        let mut attempt = 1u32;
        loop {
            match self.sink.publish(records.clone()).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(count, attempt, "Records published after retry");
                    }
                    return;
                }
                Err(e) => warn!(
                    error = %e,
                    code = e.error_code(),
                    count,
                    attempt,
                    "Failed to publish records, retrying"
                ),
            }
            tokio::select! {
                _ = self.stop.cancelled() => {
                    error!(count, attempt, "Worker stopped, unpublished records dropped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_PUBLISH_BACKOFF);
            attempt += 1;
        }
    }

    fn redeliver(self: &Arc<Self>, message: LaneMessage) {
        let inner = self.clone();
        let at = Utc::now()
            + chrono::Duration::from_std(self.retry_delay).unwrap_or(chrono::Duration::seconds(1));
        self.tasks.schedule(at, async move {
            if inner.enqueue(message).is_err() {
                debug!("Worker stopped, redelivery dropped");
            }
        });
    }

    /// Wake every stored flow and re-arm its timers.
    ///
    /// Self-wakeups and scheduled wakeups live only in memory, so a flow that
    /// was waiting on one when the process stopped needs a fresh one.
    async fn recover(self: &Arc<Self>) -> Result<usize, CoreError> {
        let keys = self.store.list_flow_keys().await?;
        let mut recovered = 0;
        for key in keys {
            let Some(stored) = self.store.get(&key).await? else {
                continue;
            };
            let checkpoint = stored.checkpoint;
            if checkpoint.is_dead_lettered() {
                continue;
            }

            self.enqueue(LaneMessage::Flow(FlowEvent::wakeup(key.clone())))?;
            let timers = [
                checkpoint.timer_at,
                checkpoint.retry.as_ref().map(|retry| retry.due_at),
            ];
            for at in timers.into_iter().flatten() {
                self.deliver_later(at, Record::flow_event(FlowEvent::wakeup(key.clone())));
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "Recovered stored flows");
        }
        Ok(recovered)
    }
}
