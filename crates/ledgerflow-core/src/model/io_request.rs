// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Suspension requests yielded by a fiber.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{FlowException, HoldingIdentity, Payload, SessionId};

/// Parameters of a session the flow wants to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInit {
    /// Session id, normally from [`FlowContext::new_session_id`](crate::fiber::FlowContext::new_session_id).
    pub session_id: SessionId,
    /// The party to talk to.
    pub counterparty: HoldingIdentity,
    /// Name of the responder flow the counterparty should start.
    pub protocol: String,
    /// Mutual close: the session closes only after both sides sent CLOSE.
    pub require_close: bool,
    /// Context properties handed to the responder.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

/// What a fiber asks the engine to do before it can continue.
///
/// The fiber never performs IO itself; each variant is translated by
/// post-processing into checkpoint updates and output records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowIORequest {
    /// Open sessions and wait until every counterparty confirmed.
    InitiateSessions {
        /// Sessions to open.
        sessions: Vec<SessionInit>,
    },
    /// Send one message per session and continue immediately.
    Send {
        /// Message per session.
        messages: BTreeMap<SessionId, Payload>,
    },
    /// Wait for one message from every listed session.
    Receive {
        /// Sessions to receive from.
        session_ids: Vec<SessionId>,
    },
    /// Send, then wait for one reply from every addressed session.
    SendAndReceive {
        /// Message per session.
        messages: BTreeMap<SessionId, Payload>,
    },
    /// Close sessions and wait until they reached their closed state.
    CloseSessions {
        /// Sessions to close.
        session_ids: Vec<SessionId>,
    },
    /// Call an external subsystem through a registered factory.
    ExternalEvent {
        /// Correlation id, normally from [`FlowContext::new_request_id`](crate::fiber::FlowContext::new_request_id).
        request_id: String,
        /// Registered factory name.
        factory: String,
        /// Factory-specific parameters.
        parameters: serde_json::Value,
    },
    /// Durable sleep.
    Sleep {
        /// Sleep duration in milliseconds.
        duration_ms: u64,
    },
    /// Persist a checkpoint and continue immediately.
    ForceCheckpoint,
    /// Terminal: the flow completed.
    Finished {
        /// Flow result.
        result: Payload,
    },
    /// Terminal: the flow failed.
    Failed {
        /// Failure reason.
        error: FlowException,
    },
}

impl FlowIORequest {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitiateSessions { .. } => "initiate_sessions",
            Self::Send { .. } => "send",
            Self::Receive { .. } => "receive",
            Self::SendAndReceive { .. } => "send_and_receive",
            Self::CloseSessions { .. } => "close_sessions",
            Self::ExternalEvent { .. } => "external_event",
            Self::Sleep { .. } => "sleep",
            Self::ForceCheckpoint => "force_checkpoint",
            Self::Finished { .. } => "finished",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether the flow ends with this request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}
