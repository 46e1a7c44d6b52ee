// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events consumed by the flow pipeline and status records it produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FlowException, FlowKey, Payload};
use crate::external::ExternalEventResponse;
use crate::session::{SessionEvent, SessionPayload};

/// Request to start a new flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFlow {
    /// Registered flow name.
    pub flow_name: String,
    /// Start arguments.
    pub args: Payload,
}

/// Kind of an inbound flow event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEventKind {
    /// Start a flow (RPC start).
    Start(StartFlow),
    /// Session message from a counterparty, delivered by the mapper.
    Session(SessionEvent),
    /// Completion of an external event request.
    ExternalEventResponse(ExternalEventResponse),
    /// Timer or self-addressed wakeup.
    Wakeup,
    /// Kill the flow.
    Kill {
        /// Operator supplied reason.
        reason: String,
    },
}

impl FlowEventKind {
    /// Short name used in logs and hospital reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Session(_) => "session",
            Self::ExternalEventResponse(_) => "external_event_response",
            Self::Wakeup => "wakeup",
            Self::Kill { .. } => "kill",
        }
    }
}

/// Event addressed to one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Target flow.
    pub flow_key: FlowKey,
    /// What happened.
    pub kind: FlowEventKind,
}

impl FlowEvent {
    /// Create an event.
    pub fn new(flow_key: FlowKey, kind: FlowEventKind) -> Self {
        Self { flow_key, kind }
    }

    /// Wakeup for the given flow.
    pub fn wakeup(flow_key: FlowKey) -> Self {
        Self::new(flow_key, FlowEventKind::Wakeup)
    }

    /// Whether this event may create a checkpoint for a flow that has none.
    pub fn creates_flow(&self) -> bool {
        match &self.kind {
            FlowEventKind::Start(_) => true,
            FlowEventKind::Session(event) => matches!(event.payload, SessionPayload::Init { .. }),
            _ => false,
        }
    }
}

/// A flow event with the transport offset it was delivered at.
///
/// The offset is the idempotency sequence: a checkpoint that has applied
/// offset `n` ignores every envelope with an offset `<= n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Transport offset, strictly increasing per partition.
    pub offset: u64,
    /// The event.
    pub event: FlowEvent,
}

/// Lifecycle status of a flow as published to the status topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlowStatus {
    /// The fiber started.
    Running,
    /// The flow finished successfully.
    Completed {
        /// Flow result.
        result: Payload,
    },
    /// The flow failed.
    Failed {
        /// Failure reason.
        error: FlowException,
    },
    /// The flow was killed.
    Killed {
        /// Kill reason.
        reason: String,
    },
    /// The flow was moved to the dead-letter destination.
    DeadLettered {
        /// Fatal error message.
        reason: String,
    },
}

impl FlowStatus {
    /// Whether no further status will follow.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Status change of one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatusRecord {
    /// The flow.
    pub flow_key: FlowKey,
    /// New status.
    pub status: FlowStatus,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
}
