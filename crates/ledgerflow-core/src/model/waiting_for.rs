// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Suspension reasons stored in a checkpoint.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionId;

/// What a suspended flow needs before its fiber may run again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitingFor {
    /// The flow has been created but its fiber has not run yet.
    Start,
    /// Resume on the next event of any kind.
    Wakeup,
    /// Every listed session must be confirmed (initiate) or closed (close).
    SessionConfirmation {
        /// Sessions the flow is waiting on.
        session_ids: Vec<SessionId>,
        /// Which confirmation is awaited.
        kind: ConfirmationKind,
    },
    /// One in-order data message from every listed session.
    SessionData {
        /// Sessions the flow is waiting on.
        session_ids: Vec<SessionId>,
    },
    /// Response to an outstanding external event request.
    ExternalEventResponse {
        /// Correlation id of the request.
        request_id: String,
    },
    /// Durable sleep.
    Sleep {
        /// Instant after which the flow resumes.
        wake_at: DateTime<Utc>,
    },
}

/// Kind of session confirmation a flow can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationKind {
    /// Counterparty acknowledged session initiation.
    Initiate,
    /// Session reached its closed state.
    Close,
}

/// Tag of a [`WaitingFor`] variant, used to index the dispatcher registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WaitingForKind {
    /// [`WaitingFor::Start`]
    Start,
    /// [`WaitingFor::Wakeup`]
    Wakeup,
    /// [`WaitingFor::SessionConfirmation`]
    SessionConfirmation,
    /// [`WaitingFor::SessionData`]
    SessionData,
    /// [`WaitingFor::ExternalEventResponse`]
    ExternalEventResponse,
    /// [`WaitingFor::Sleep`]
    Sleep,
}

impl WaitingForKind {
    /// Every tag; the dispatcher must have a handler for each.
    pub const ALL: [WaitingForKind; 6] = [
        WaitingForKind::Start,
        WaitingForKind::Wakeup,
        WaitingForKind::SessionConfirmation,
        WaitingForKind::SessionData,
        WaitingForKind::ExternalEventResponse,
        WaitingForKind::Sleep,
    ];

    /// Returns the string representation of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Wakeup => "wakeup",
            Self::SessionConfirmation => "session_confirmation",
            Self::SessionData => "session_data",
            Self::ExternalEventResponse => "external_event_response",
            Self::Sleep => "sleep",
        }
    }
}

impl fmt::Display for WaitingForKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WaitingFor {
    /// The registry tag of this suspension reason.
    pub fn kind(&self) -> WaitingForKind {
        match self {
            Self::Start => WaitingForKind::Start,
            Self::Wakeup => WaitingForKind::Wakeup,
            Self::SessionConfirmation { .. } => WaitingForKind::SessionConfirmation,
            Self::SessionData { .. } => WaitingForKind::SessionData,
            Self::ExternalEventResponse { .. } => WaitingForKind::ExternalEventResponse,
            Self::Sleep { .. } => WaitingForKind::Sleep,
        }
    }

    /// Sessions this suspension depends on; these are subject to inactivity timeouts.
    pub fn session_ids(&self) -> &[SessionId] {
        match self {
            Self::SessionConfirmation { session_ids, .. } | Self::SessionData { session_ids } => {
                session_ids
            }
            _ => &[],
        }
    }
}
