// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session protocol between flows.
//!
//! A session is a sequenced, bidirectional channel between two flows. Each end
//! keeps a [`SessionState`] in its checkpoint; the [`SessionManager`] applies
//! inbound messages to it and produces outbound ones. Messages leave a flow as
//! [`MapperEvent::Outbound`] records and are routed by the [`FlowMapper`],
//! which decides whether the counterparty is local or remote.
//!
//! ```text
//!  flow A ──Outbound──▶ mapper(s) ──Inbound(s-INITIATED)──▶ mapper(s-INITIATED) ──▶ flow B
//!                          │
//!                          └── remote counterparty ──▶ P2P out topic
//! ```
//!
//! # Sequencing
//!
//! `Init`, `Data` and `Close` carry a per-sender sequence starting at 1. `Ack`
//! and `Error` carry sequence 0. Every message piggybacks `received_sequence`,
//! the highest contiguous sequence its sender has received, which trims the
//! receiver's unacknowledged buffer.
//!
//! # Close semantics
//!
//! With `require_close` set, a session is closed only once both ends sent
//! `Close`. Without it, the first `Close` from either end closes both ends and
//! no reply is expected.

mod manager;
mod mapper;
mod state;

pub use manager::SessionManager;
pub(crate) use manager::chrono_duration;
pub use mapper::{FlowMapper, initiated_flow_id};
pub use state::{SessionState, SessionStatus, UnackedMessage};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::{Record, RecordPayload, Topic};
use crate::model::{FlowException, FlowKey, HoldingIdentity, Payload, SessionId};

/// Body of a session message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionPayload {
    /// Open the session; starts the responder flow registered under `protocol`.
    Init {
        /// Responder flow name.
        protocol: String,
        /// Mutual close required.
        require_close: bool,
        /// Context properties.
        #[serde(default)]
        context: BTreeMap<String, String>,
    },
    /// Application data.
    Data {
        /// Message bytes.
        payload: Payload,
    },
    /// Acknowledges everything up to `received_sequence`.
    Ack,
    /// The sender closed its end.
    Close,
    /// The sender's end failed.
    Error {
        /// Failure reason.
        error: FlowException,
    },
}

impl SessionPayload {
    /// Whether the payload consumes a sequence number.
    pub fn is_sequenced(&self) -> bool {
        matches!(self, Self::Init { .. } | Self::Data { .. } | Self::Close)
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Data { .. } => "data",
            Self::Ack => "ack",
            Self::Close => "close",
            Self::Error { .. } => "error",
        }
    }
}

/// One session message.
///
/// Outbound messages carry the sender's session id; the mapper rewrites it to
/// the receiver's id ([`SessionId::counterpart`]) on delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Session id as seen by the end currently holding the message.
    pub session_id: SessionId,
    /// Sender sequence; 0 for unsequenced payloads.
    pub sequence: u64,
    /// Highest contiguous sequence the sender has received.
    pub received_sequence: u64,
    /// The party that opened the session.
    pub initiating_identity: HoldingIdentity,
    /// The party the session was opened to.
    pub initiated_identity: HoldingIdentity,
    /// Message body.
    pub payload: SessionPayload,
    /// Send time.
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    /// Identity of the end that owns `session_id`.
    pub fn owner(&self) -> &HoldingIdentity {
        if self.session_id.is_initiated() {
            &self.initiated_identity
        } else {
            &self.initiating_identity
        }
    }

    /// Identity of the other end.
    pub fn peer(&self) -> &HoldingIdentity {
        if self.session_id.is_initiated() {
            &self.initiating_identity
        } else {
            &self.initiated_identity
        }
    }

    /// The same message addressed to the other end.
    pub fn flipped(&self) -> SessionEvent {
        SessionEvent {
            session_id: self.session_id.counterpart(),
            ..self.clone()
        }
    }
}

/// Mapper lifecycle of one session end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapperStatus {
    /// Messages are routed.
    Open,
    /// The owning flow finished; state is removed after `expiry`.
    Closing,
    /// The session errored.
    Error,
}

/// Routing state for one session end, keyed by its session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMapperState {
    /// Flow that owns this session end.
    pub flow_key: FlowKey,
    /// Mapper lifecycle.
    pub status: MapperStatus,
    /// Removal time once closing.
    pub expiry: Option<DateTime<Utc>>,
}

/// Events consumed by the [`FlowMapper`], keyed by session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapperEvent {
    /// A flow sent a session message.
    Outbound {
        /// Sending flow.
        flow_key: FlowKey,
        /// Message carrying the sender's session id.
        event: SessionEvent,
    },
    /// A message arrived for a local session end.
    Inbound {
        /// Message carrying the receiver's session id.
        event: SessionEvent,
    },
    /// The owning flow terminated; expire the routing state.
    ScheduleCleanup {
        /// Session end to expire.
        session_id: SessionId,
    },
    /// Remove expired routing state.
    ExecuteCleanup {
        /// Session end to remove.
        session_id: SessionId,
    },
}

impl MapperEvent {
    /// Partition key of the event.
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Outbound { event, .. } | Self::Inbound { event } => &event.session_id,
            Self::ScheduleCleanup { session_id } | Self::ExecuteCleanup { session_id } => {
                session_id
            }
        }
    }

    /// Wrap into a mapper-topic record.
    pub fn into_record(self) -> Record {
        Record::new(
            Topic::FlowMapperEvent,
            self.session_id().to_string(),
            RecordPayload::MapperEvent(self),
        )
    }
}

/// Record carrying a flow's outbound session message to the mapper.
pub(crate) fn outbound_record(flow_key: &FlowKey, event: SessionEvent) -> Record {
    MapperEvent::Outbound {
        flow_key: flow_key.clone(),
        event,
    }
    .into_record()
}
