// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Output records and the transport boundary.
//!
//! The engine never talks to a broker directly. Pipeline and mapper outputs are
//! [`Record`]s addressed to a [`Topic`]; the worker loops local topics back into
//! its own lanes and hands everything else to a [`RecordSink`].

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::CoreError;
use crate::external::ExternalEventRequest;
use crate::hospital::DeadLetter;
use crate::model::{FlowEvent, FlowStatusRecord};
use crate::session::{MapperEvent, SessionEvent};

/// Destination of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "topic", content = "name", rename_all = "snake_case")]
pub enum Topic {
    /// Events consumed by the flow pipeline, keyed by flow key.
    FlowEvent,
    /// Events consumed by the flow mapper, keyed by session id.
    FlowMapperEvent,
    /// Session messages leaving this node.
    P2pOut,
    /// Requests for the named external subsystem.
    ExternalEvent(String),
    /// Dead-lettered flows and events.
    DeadLetter,
    /// Flow lifecycle status changes.
    FlowStatus,
}

impl Topic {
    /// Whether records on this topic are consumed by the engine itself.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::FlowEvent | Self::FlowMapperEvent)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlowEvent => f.write_str("flow.event"),
            Self::FlowMapperEvent => f.write_str("flow.mapper.event"),
            Self::P2pOut => f.write_str("p2p.out"),
            Self::ExternalEvent(name) => write!(f, "external.{}", name),
            Self::DeadLetter => f.write_str("flow.dlq"),
            Self::FlowStatus => f.write_str("flow.status"),
        }
    }
}

/// Body of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum RecordPayload {
    /// Input for the flow pipeline.
    FlowEvent(FlowEvent),
    /// Input for the flow mapper.
    MapperEvent(MapperEvent),
    /// Session message for a remote node.
    SessionEvent(SessionEvent),
    /// Request (or cancellation) for an external subsystem.
    ExternalEventRequest(ExternalEventRequest),
    /// Dead-lettered flow or event.
    DeadLetter(Box<DeadLetter>),
    /// Flow status change.
    FlowStatus(FlowStatusRecord),
}

/// One output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Destination.
    pub topic: Topic,
    /// Partition key.
    pub key: String,
    /// Body.
    pub payload: RecordPayload,
    /// Earliest delivery time; `None` delivers immediately.
    pub deliver_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Create a record for immediate delivery.
    pub fn new(topic: Topic, key: impl Into<String>, payload: RecordPayload) -> Self {
        Self {
            topic,
            key: key.into(),
            payload,
            deliver_at: None,
        }
    }

    /// Record carrying a flow event, keyed by its flow key.
    pub fn flow_event(event: FlowEvent) -> Self {
        Self::new(
            Topic::FlowEvent,
            event.flow_key.storage_key(),
            RecordPayload::FlowEvent(event),
        )
    }

    /// Delay delivery until `at`.
    pub fn deliver_at(mut self, at: DateTime<Utc>) -> Self {
        self.deliver_at = Some(at);
        self
    }
}

/// Consumer of records addressed to topics outside the engine.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Publish records in order.
    async fn publish(&self, records: Vec<Record>) -> Result<(), CoreError>;
}

/// Sink that keeps every record in memory.
///
/// Used for single-node deployments without a broker and by tests, which can
/// wait for a record to appear with [`InMemoryRecordSink::wait_for`].
#[derive(Debug, Default)]
pub struct InMemoryRecordSink {
    records: Mutex<Vec<Record>>,
    notify: Notify,
}

impl InMemoryRecordSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record published so far.
    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Records published to one topic.
    pub fn on_topic(&self, topic: &Topic) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|record| &record.topic == topic)
            .collect()
    }

    /// Wait until a record matching `predicate` has been published.
    ///
    /// Returns `None` when `timeout` elapses first.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Option<Record>
    where
        F: Fn(&Record) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(found) = self.records().into_iter().find(|r| predicate(r)) {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait]
impl RecordSink for InMemoryRecordSink {
    async fn publish(&self, records: Vec<Record>) -> Result<(), CoreError> {
        {
            let mut stored = self.records.lock().map_err(|_| CoreError::PublishFailed {
                details: "record buffer poisoned".to_string(),
            })?;
            stored.extend(records);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Assigns transport offsets to flow events.
///
/// Offsets are strictly increasing and never below the current time in
/// microseconds, so offsets assigned after a restart stay above every offset a
/// stored checkpoint has already applied.
#[derive(Debug, Default)]
pub struct OffsetClock {
    last: AtomicU64,
}

impl OffsetClock {
    /// Create a clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next offset.
    pub fn next(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self
                .last
                .compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}
