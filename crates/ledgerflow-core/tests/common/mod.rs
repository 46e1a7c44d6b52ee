// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ledgerflow-core E2E tests.
//!
//! Provides test flows, external event factories and [`TestContext`], which
//! runs a [`FlowWorker`] hosting two local identities against an in-memory
//! record sink.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use ledgerflow_core::bus::{InMemoryRecordSink, Record, RecordPayload, RecordSink, Topic};
use ledgerflow_core::config::EngineConfig;
use ledgerflow_core::error::{CoreError, PipelineError};
use ledgerflow_core::external::{ExternalEventFactory, ExternalEventFactoryRegistry};
use ledgerflow_core::fiber::{FlowContext, FlowRegistry, SerdeFlow};
use ledgerflow_core::model::{
    FlowException, FlowIORequest, FlowKey, FlowStatus, HoldingIdentity, Payload, Resume,
    SessionId, SessionInit,
};
use ledgerflow_core::persistence::{CheckpointStore, InMemoryCheckpointStore};
use ledgerflow_core::worker::FlowWorker;

/// Default wait for an expected record.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn alice() -> HoldingIdentity {
    HoldingIdentity::new("O=Alice, L=London, C=GB", "group-1")
}

pub fn bob() -> HoldingIdentity {
    HoldingIdentity::new("O=Bob, L=Warsaw, C=PL", "group-1")
}

pub fn flow_key(flow_id: &str) -> FlowKey {
    FlowKey::new(flow_id, alice())
}

/// Engine settings with timings short enough for tests.
pub fn fast_engine() -> EngineConfig {
    EngineConfig {
        fiber_pool_size: 4,
        long_running_pool_size: 2,
        external_event_timeout: Duration::from_millis(200),
        external_event_max_retries: 1,
        session_timeout: Duration::from_secs(10),
        session_resend_interval: Duration::from_secs(5),
        hospital_max_retries: 2,
        hospital_backoff: Duration::from_millis(20),
        mapper_cleanup_delay: Duration::from_millis(50),
    }
}

pub fn flows() -> Arc<FlowRegistry> {
    Arc::new(
        FlowRegistry::new()
            .with_serde::<PingFlow>("ping")
            .with_serde::<PongFlow>("pong")
            .with_serde::<OpenerFlow>("opener")
            .with_serde::<SleepFlow>("sleep")
            .with_serde::<LedgerCallFlow>("ledger-call")
            .with_serde::<BusyFlow>("busy"),
    )
}

pub fn factories() -> Arc<ExternalEventFactoryRegistry> {
    Arc::new(
        ExternalEventFactoryRegistry::new()
            .with("ledger", Arc::new(LedgerFactory))
            .with("flaky", Arc::new(FlakyFactory)),
    )
}

// ============================================================================
// Flows
// ============================================================================

/// Opens a session to bob, sends its args, waits for the reply and closes.
///
/// Finishes with the reply as result.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PingFlow {
    message: Vec<u8>,
    session: Option<SessionId>,
    reply: Option<Payload>,
    finished: bool,
}

impl SerdeFlow for PingFlow {
    fn start(args: &Payload) -> Result<Self, FlowException> {
        Ok(Self {
            message: args.as_bytes().to_vec(),
            ..Self::default()
        })
    }

    fn step(
        &mut self,
        ctx: &mut FlowContext,
        input: Result<Resume, FlowException>,
    ) -> Result<FlowIORequest, FlowException> {
        let input = input?;

        let Some(session) = self.session.clone() else {
            let session_id = ctx.new_session_id();
            self.session = Some(session_id.clone());
            return Ok(FlowIORequest::InitiateSessions {
                sessions: vec![SessionInit {
                    session_id,
                    counterparty: bob(),
                    protocol: "pong".to_string(),
                    require_close: true,
                    context: BTreeMap::from([("purpose".to_string(), "test".to_string())]),
                }],
            });
        };

        if let Resume::SessionData(mut messages) = input {
            self.reply = messages.remove(&session);
            return Ok(FlowIORequest::CloseSessions {
                session_ids: vec![session],
            });
        }

        match (&self.reply, self.finished) {
            (None, _) => Ok(FlowIORequest::SendAndReceive {
                messages: BTreeMap::from([(session, Payload::from(self.message.clone()))]),
            }),
            (Some(reply), false) => {
                self.finished = true;
                Ok(FlowIORequest::Finished {
                    result: reply.clone(),
                })
            }
            (Some(_), true) => Err(FlowException::user("resumed after finishing")),
        }
    }
}

/// Responder for [`PingFlow`]: echoes the message back prefixed with `pong:`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PongFlow {
    session: Option<SessionId>,
    replied: bool,
    closing: bool,
}

impl SerdeFlow for PongFlow {
    fn start(_args: &Payload) -> Result<Self, FlowException> {
        Ok(Self::default())
    }

    fn step(
        &mut self,
        _ctx: &mut FlowContext,
        input: Result<Resume, FlowException>,
    ) -> Result<FlowIORequest, FlowException> {
        match input? {
            Resume::Start { initiated_by, .. } => {
                let initiated_by = initiated_by
                    .ok_or_else(|| FlowException::user("pong must be started by a session"))?;
                let session = initiated_by.session_id;
                self.session = Some(session.clone());
                Ok(FlowIORequest::Receive {
                    session_ids: vec![session],
                })
            }
            Resume::SessionData(messages) => {
                let session = self
                    .session
                    .clone()
                    .ok_or_else(|| FlowException::user("no session"))?;
                let received = messages
                    .get(&session)
                    .map(|p| p.as_bytes().to_vec())
                    .unwrap_or_default();
                let mut reply = b"pong:".to_vec();
                reply.extend(received);
                self.replied = true;
                Ok(FlowIORequest::Send {
                    messages: BTreeMap::from([(session, Payload::from(reply))]),
                })
            }
            _ if self.replied && !self.closing => {
                self.closing = true;
                let session = self
                    .session
                    .clone()
                    .ok_or_else(|| FlowException::user("no session"))?;
                Ok(FlowIORequest::CloseSessions {
                    session_ids: vec![session],
                })
            }
            _ => Ok(FlowIORequest::Finished {
                result: Payload::from("closed"),
            }),
        }
    }
}

/// Opens one session and finishes as soon as it is confirmed.
///
/// Args are `protocol` or `protocol@x500`; the counterparty defaults to bob.
#[derive(Debug, Serialize, Deserialize)]
pub struct OpenerFlow {
    protocol: String,
    counterparty: HoldingIdentity,
    initiated: bool,
}

impl SerdeFlow for OpenerFlow {
    fn start(args: &Payload) -> Result<Self, FlowException> {
        let args = std::str::from_utf8(args.as_bytes())
            .map_err(|_| FlowException::user("opener args must be utf-8"))?;
        let (protocol, counterparty) = match args.split_once('@') {
            Some((protocol, x500)) => (protocol, HoldingIdentity::new(x500, "group-1")),
            None => (args, bob()),
        };
        Ok(Self {
            protocol: protocol.to_string(),
            counterparty,
            initiated: false,
        })
    }

    fn step(
        &mut self,
        ctx: &mut FlowContext,
        input: Result<Resume, FlowException>,
    ) -> Result<FlowIORequest, FlowException> {
        input?;
        if self.initiated {
            return Ok(FlowIORequest::Finished {
                result: Payload::from("confirmed"),
            });
        }
        self.initiated = true;
        Ok(FlowIORequest::InitiateSessions {
            sessions: vec![SessionInit {
                session_id: ctx.new_session_id(),
                counterparty: self.counterparty.clone(),
                protocol: self.protocol.clone(),
                require_close: false,
                context: BTreeMap::new(),
            }],
        })
    }
}

/// Sleeps for the number of milliseconds given as args, then finishes.
#[derive(Debug, Serialize, Deserialize)]
pub struct SleepFlow {
    duration_ms: u64,
    slept: bool,
}

impl SerdeFlow for SleepFlow {
    fn start(args: &Payload) -> Result<Self, FlowException> {
        let duration_ms = std::str::from_utf8(args.as_bytes())
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| FlowException::user("sleep duration must be a number"))?;
        Ok(Self {
            duration_ms,
            slept: false,
        })
    }

    fn step(
        &mut self,
        _ctx: &mut FlowContext,
        input: Result<Resume, FlowException>,
    ) -> Result<FlowIORequest, FlowException> {
        input?;
        if self.slept {
            return Ok(FlowIORequest::Finished {
                result: Payload::from("rested"),
            });
        }
        self.slept = true;
        Ok(FlowIORequest::Sleep {
            duration_ms: self.duration_ms,
        })
    }
}

/// Calls the external factory named in its args and finishes with the response.
#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerCallFlow {
    factory: String,
    requested: bool,
}

impl SerdeFlow for LedgerCallFlow {
    fn start(args: &Payload) -> Result<Self, FlowException> {
        let factory = String::from_utf8(args.as_bytes().to_vec())
            .map_err(|_| FlowException::user("factory name must be utf-8"))?;
        Ok(Self {
            factory,
            requested: false,
        })
    }

    fn step(
        &mut self,
        ctx: &mut FlowContext,
        input: Result<Resume, FlowException>,
    ) -> Result<FlowIORequest, FlowException> {
        match input? {
            Resume::ExternalResponse(value) => Ok(FlowIORequest::Finished {
                result: Payload::from(value.to_string().into_bytes()),
            }),
            _ if !self.requested => {
                self.requested = true;
                Ok(FlowIORequest::ExternalEvent {
                    request_id: ctx.new_request_id(),
                    factory: self.factory.clone(),
                    parameters: json!({ "account": "acc-1", "amount": 100 }),
                })
            }
            other => Err(FlowException::user(format!("unexpected resume: {:?}", other))),
        }
    }
}

/// Tracks how many steps of any busy flow run at the same time.
pub static BUSY_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
/// Highest value [`BUSY_IN_FLIGHT`] reached.
pub static BUSY_MAX_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Force-checkpoints the number of times given as args, holding each step
/// for a few milliseconds.
#[derive(Debug, Serialize, Deserialize)]
pub struct BusyFlow {
    remaining: u32,
}

impl SerdeFlow for BusyFlow {
    fn start(args: &Payload) -> Result<Self, FlowException> {
        let remaining = std::str::from_utf8(args.as_bytes())
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);
        Ok(Self { remaining })
    }

    fn step(
        &mut self,
        _ctx: &mut FlowContext,
        input: Result<Resume, FlowException>,
    ) -> Result<FlowIORequest, FlowException> {
        input?;
        let now = BUSY_IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
        BUSY_MAX_IN_FLIGHT.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(15));
        BUSY_IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);

        if self.remaining == 0 {
            return Ok(FlowIORequest::Finished {
                result: Payload::from("busy done"),
            });
        }
        self.remaining -= 1;
        Ok(FlowIORequest::ForceCheckpoint)
    }
}

// ============================================================================
// External event factories
// ============================================================================

/// Ledger subsystem: the request body is the parameters tagged with the request id.
pub struct LedgerFactory;

impl ExternalEventFactory for LedgerFactory {
    fn topic(&self) -> &str {
        "ledger"
    }

    fn create_request(
        &self,
        flow_key: &FlowKey,
        request_id: &str,
        parameters: &Value,
    ) -> Result<Value, PipelineError> {
        Ok(json!({
            "request_id": request_id,
            "flow": flow_key.flow_id,
            "parameters": parameters,
        }))
    }
}

/// Subsystem whose requests can never be built.
pub struct FlakyFactory;

impl ExternalEventFactory for FlakyFactory {
    fn topic(&self) -> &str {
        "flaky"
    }

    fn create_request(
        &self,
        _flow_key: &FlowKey,
        _request_id: &str,
        _parameters: &Value,
    ) -> Result<Value, PipelineError> {
        Err(PipelineError::transient("flaky subsystem unavailable"))
    }
}

/// Sink that fails a number of publishes before forwarding to an in-memory sink.
pub struct FailingSink {
    inner: Arc<InMemoryRecordSink>,
    remaining_failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn new(inner: Arc<InMemoryRecordSink>, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Publish calls seen so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for FailingSink {
    async fn publish(&self, records: Vec<Record>) -> Result<(), CoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoreError::PublishFailed {
                details: "broker unavailable".to_string(),
            });
        }
        self.inner.publish(records).await
    }
}

// ============================================================================
// Worker harness
// ============================================================================

/// A running worker with its store and sink.
pub struct TestContext {
    pub worker: FlowWorker,
    pub store: Arc<dyn CheckpointStore>,
    pub sink: Arc<InMemoryRecordSink>,
}

impl TestContext {
    /// Worker over a fresh in-memory store.
    pub async fn new() -> Self {
        Self::with_store(Arc::new(InMemoryCheckpointStore::new())).await
    }

    /// Worker over the given store.
    pub async fn with_store(store: Arc<dyn CheckpointStore>) -> Self {
        Self::with_engine(store, fast_engine()).await
    }

    /// Worker over the given store with custom engine settings.
    pub async fn with_engine(store: Arc<dyn CheckpointStore>, engine: EngineConfig) -> Self {
        let sink = Arc::new(InMemoryRecordSink::new());
        Self::start(store, engine, sink.clone(), sink).await
    }

    /// Worker whose sink rejects the first `failures` publishes.
    pub async fn with_failing_sink(failures: usize) -> (Self, Arc<FailingSink>) {
        let sink = Arc::new(InMemoryRecordSink::new());
        let failing = Arc::new(FailingSink::new(sink.clone(), failures));
        let ctx = Self::start(
            Arc::new(InMemoryCheckpointStore::new()),
            fast_engine(),
            failing.clone(),
            sink,
        )
        .await;
        (ctx, failing)
    }

    /// This sets up:
    /// 1. A worker hosting alice and bob with every test flow and factory
    /// 2. `publish_to` as its record sink, with accepted records landing in `sink`
    async fn start(
        store: Arc<dyn CheckpointStore>,
        engine: EngineConfig,
        publish_to: Arc<dyn RecordSink>,
        sink: Arc<InMemoryRecordSink>,
    ) -> Self {
        let worker = FlowWorker::builder()
            .store(store.clone())
            .sink(publish_to)
            .flows(flows())
            .external_factories(factories())
            .local_identity(alice())
            .local_identity(bob())
            .partitions(4)
            .engine(engine)
            .shutdown_timeout(Duration::from_secs(2))
            .build()
            .expect("worker config")
            .start()
            .await
            .expect("worker start");

        Self {
            worker,
            store,
            sink,
        }
    }

    /// Wait for a status record of `key` matching `predicate`.
    pub async fn wait_status<F>(&self, key: &FlowKey, predicate: F) -> Option<FlowStatus>
    where
        F: Fn(&FlowStatus) -> bool,
    {
        wait_status(&self.sink, key, predicate).await
    }

    /// Status records published for `key`, in order.
    pub fn statuses(&self, key: &FlowKey) -> Vec<FlowStatus> {
        statuses(&self.sink, key)
    }

    /// Shut the worker down.
    pub async fn shutdown(self) {
        self.worker.shutdown().await.expect("worker shutdown");
    }
}

/// Wait on `sink` for a status record of `key` matching `predicate`.
pub async fn wait_status<F>(sink: &InMemoryRecordSink, key: &FlowKey, predicate: F) -> Option<FlowStatus>
where
    F: Fn(&FlowStatus) -> bool,
{
    let record = sink
        .wait_for(WAIT, |record| {
            status_of(record).is_some_and(|(k, status)| k == key && predicate(status))
        })
        .await?;
    status_of(&record).map(|(_, status)| status.clone())
}

/// Status records published on `sink` for `key`, in order.
pub fn statuses(sink: &InMemoryRecordSink, key: &FlowKey) -> Vec<FlowStatus> {
    sink.on_topic(&Topic::FlowStatus)
        .iter()
        .filter_map(status_of)
        .filter(|(k, _)| *k == key)
        .map(|(_, status)| status.clone())
        .collect()
}

fn status_of(record: &Record) -> Option<(&FlowKey, &FlowStatus)> {
    match &record.payload {
        RecordPayload::FlowStatus(status) => Some((&status.flow_key, &status.status)),
        _ => None,
    }
}

pub fn is_completed(status: &FlowStatus) -> bool {
    matches!(status, FlowStatus::Completed { .. })
}

pub fn is_failed(status: &FlowStatus) -> bool {
    matches!(status, FlowStatus::Failed { .. })
}
