// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-session state kept in the flow checkpoint.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SessionEvent, SessionPayload};
use crate::model::{FlowException, HoldingIdentity, Payload, SessionId};

/// Lifecycle of one session end.
///
/// ```text
///  (none) ──init──▶ PENDING ──ack/data──▶ CONFIRMED ──close──▶ CLOSING ──close──▶ CLOSED
///                      │                      │                   │
///                      └──────── error / timeout ─────────────────┴──▶ ERRORED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Init sent, no message from the counterparty yet.
    Pending,
    /// Data may flow both ways.
    Confirmed,
    /// One end sent CLOSE, mutual close outstanding.
    Closing,
    /// Terminal.
    Closed,
    /// Terminal; the session failed.
    Errored,
}

impl SessionStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }
}

/// A sequenced message not yet acknowledged by the counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnackedMessage {
    /// The message as last sent.
    pub event: SessionEvent,
    /// Last send time.
    pub sent_at: DateTime<Utc>,
}

/// State of this flow's end of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// This end's session id.
    pub session_id: SessionId,
    /// The party that opened the session.
    pub initiating_identity: HoldingIdentity,
    /// The party the session was opened to.
    pub initiated_identity: HoldingIdentity,
    /// Responder flow name.
    pub protocol: String,
    /// Mutual close required.
    pub require_close: bool,
    /// Context properties exchanged at init.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Lifecycle.
    pub status: SessionStatus,
    /// Last sequence assigned to an outbound message.
    pub send_sequence: u64,
    /// Highest sequence received without gaps.
    pub last_contiguous: u64,
    /// Messages received ahead of a gap.
    #[serde(default)]
    pub out_of_order: BTreeMap<u64, SessionEvent>,
    /// In-order data not yet handed to the flow.
    #[serde(default)]
    pub inbox: VecDeque<Payload>,
    /// Outbound messages awaiting acknowledgement.
    #[serde(default)]
    pub unacked: Vec<UnackedMessage>,
    /// This end sent CLOSE.
    pub close_sent: bool,
    /// The counterparty sent CLOSE.
    pub close_received: bool,
    /// Last inbound activity; drives the inactivity timeout.
    pub last_received_at: DateTime<Utc>,
    /// Failure reason once errored.
    pub error: Option<FlowException>,
}

impl SessionState {
    /// Whether the session can still exchange messages.
    pub fn is_active(&self) -> bool {
        !matches!(self.status, SessionStatus::Closed | SessionStatus::Errored)
    }

    /// The other end's identity.
    pub fn counterparty(&self) -> &HoldingIdentity {
        if self.session_id.is_initiated() {
            &self.initiating_identity
        } else {
            &self.initiated_identity
        }
    }

    /// Build an outbound message, assigning a sequence when the payload needs one.
    pub fn outbound(&mut self, payload: SessionPayload, now: DateTime<Utc>) -> SessionEvent {
        let sequence = if payload.is_sequenced() {
            self.send_sequence += 1;
            self.send_sequence
        } else {
            0
        };

        let event = SessionEvent {
            session_id: self.session_id.clone(),
            sequence,
            received_sequence: self.last_contiguous,
            initiating_identity: self.initiating_identity.clone(),
            initiated_identity: self.initiated_identity.clone(),
            payload,
            timestamp: now,
        };

        if sequence > 0 {
            self.unacked.push(UnackedMessage {
                event: event.clone(),
                sent_at: now,
            });
        }
        event
    }

    /// Drop unacked messages the counterparty confirmed.
    pub fn trim_unacked(&mut self, received_sequence: u64) {
        self.unacked
            .retain(|message| message.event.sequence > received_sequence);
    }

    /// Move to the closing or closed state after a CLOSE was sent or received.
    pub fn refresh_close_status(&mut self) {
        if !self.is_active() {
            return;
        }
        let closed = if self.require_close {
            self.close_sent && self.close_received
        } else {
            self.close_sent || self.close_received
        };
        if closed {
            self.status = SessionStatus::Closed;
        } else if self.close_sent || self.close_received {
            self.status = SessionStatus::Closing;
        }
    }

    /// Move to the errored state. Returns false when already terminal.
    pub fn mark_errored(&mut self, error: FlowException) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = SessionStatus::Errored;
        self.error = Some(error);
        self.unacked.clear();
        true
    }

    /// Exception raised in the flow for a session that can no longer deliver data.
    pub fn failure(&self) -> Option<FlowException> {
        match self.status {
            SessionStatus::Errored => Some(FlowException::session(format!(
                "session {} errored: {}",
                self.session_id,
                self.error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown error")
            ))),
            _ if self.inbox.is_empty() && self.close_received => Some(FlowException::session(
                format!("session {} was closed by the counterparty", self.session_id),
            )),
            _ => None,
        }
    }
}
