// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The durable state of one flow instance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    FlowEvent, FlowException, FlowIORequest, FlowKey, InitiatedBy, Payload, SessionId, WaitingFor,
};
use crate::error::CoreError;
use crate::external::ExternalEventState;
use crate::session::SessionState;

/// Lifecycle of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowState {
    /// The flow is live.
    Running,
    /// Tombstone: the flow hit a fatal error and every further event is dead-lettered.
    DeadLettered {
        /// Fatal error message.
        reason: String,
    },
}

/// How the flow was started; replayed into the fiber as [`Resume::Start`](super::Resume::Start).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartContext {
    /// Start arguments.
    pub args: Payload,
    /// The session that created a responder flow.
    pub initiated_by: Option<InitiatedBy>,
}

/// Event parked by the hospital for a later retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// The event that failed transiently.
    pub event: FlowEvent,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Message of the last failure.
    pub last_error: String,
    /// When the retry wakeup is due.
    pub due_at: DateTime<Utc>,
    /// Events that arrived while the retry was pending, in arrival order.
    #[serde(default)]
    pub deferred: Vec<FlowEvent>,
    /// The flow had no checkpoint before the failed event; this one only parks it.
    #[serde(default)]
    pub placeholder: bool,
}

/// Durable state of one flow.
///
/// Created by the pipeline on the first event of a flow and rewritten after every
/// processed event. Business logic only ever sees its own `fiber_state` blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Flow identity.
    pub flow_key: FlowKey,
    /// Registered flow name used to restore the fiber.
    pub flow_name: String,
    /// Live or tombstoned.
    pub state: FlowState,
    /// Offset of the last applied event.
    pub sequence: u64,
    /// Serialized business state; `None` until the fiber first suspends.
    pub fiber_state: Option<Payload>,
    /// Current suspension reason.
    pub waiting_for: WaitingFor,
    /// Last request the fiber suspended on.
    pub suspended_on: Option<FlowIORequest>,
    /// Session states keyed by this flow's session id.
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, SessionState>,
    /// Outstanding external event requests keyed by request id.
    #[serde(default)]
    pub external_events: BTreeMap<String, ExternalEventState>,
    /// Parked event awaiting a hospital retry.
    pub retry: Option<RetryState>,
    /// Error to raise in the fiber on its next resume.
    pub pending_error: Option<FlowException>,
    /// Counter behind deterministic session and request ids.
    pub id_counter: u64,
    /// Start context.
    pub start: StartContext,
    /// Earliest scheduled timer wakeup still outstanding.
    pub timer_at: Option<DateTime<Utc>>,
    /// When the flow was created.
    pub created_at: DateTime<Utc>,
    /// When the checkpoint was last rewritten.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh checkpoint for a flow whose fiber has not run yet.
    pub fn new(
        flow_key: FlowKey,
        flow_name: impl Into<String>,
        start: StartContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            flow_key,
            flow_name: flow_name.into(),
            state: FlowState::Running,
            sequence: 0,
            fiber_state: None,
            waiting_for: WaitingFor::Start,
            suspended_on: None,
            sessions: BTreeMap::new(),
            external_events: BTreeMap::new(),
            retry: None,
            pending_error: None,
            id_counter: 0,
            start,
            timer_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this checkpoint is a dead-letter tombstone.
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self.state, FlowState::DeadLettered { .. })
    }

    /// Encode for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(|e| CoreError::CorruptState {
            what: format!("checkpoint {}", self.flow_key),
            details: e.to_string(),
        })
    }

    /// Decode from storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::CorruptState {
            what: "checkpoint".to_string(),
            details: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HoldingIdentity;

    fn key() -> FlowKey {
        FlowKey::new("flow-1", HoldingIdentity::new("O=Alice", "group"))
    }

    #[test]
    fn test_new_checkpoint_waits_for_start() {
        let cp = Checkpoint::new(key(), "payment", StartContext::default(), Utc::now());
        assert_eq!(cp.waiting_for, WaitingFor::Start);
        assert_eq!(cp.sequence, 0);
        assert!(cp.fiber_state.is_none());
        assert!(!cp.is_dead_lettered());
    }

    #[test]
    fn test_checkpoint_bytes_round_trip() {
        let mut cp = Checkpoint::new(
            key(),
            "payment",
            StartContext {
                args: Payload::from("100 GBP"),
                initiated_by: None,
            },
            Utc::now(),
        );
        cp.sequence = 42;
        cp.fiber_state = Some(Payload::from(r#"{"step":2}"#));
        cp.waiting_for = WaitingFor::ExternalEventResponse {
            request_id: "flow-1-r1".to_string(),
        };

        let bytes = cp.to_bytes().unwrap();
        let back = Checkpoint::from_bytes(&bytes).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn test_corrupt_bytes_are_reported() {
        let err = Checkpoint::from_bytes(b"{not json").unwrap_err();
        assert_eq!(err.error_code(), "CORRUPT_STATE");
    }
}
