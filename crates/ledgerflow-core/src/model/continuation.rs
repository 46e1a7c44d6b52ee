// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Continuations: what the dispatcher tells the pipeline to do with the fiber.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{HoldingIdentity, Payload, SessionId};

/// Value injected at the fiber's last suspension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Resume {
    /// First invocation of the flow.
    Start {
        /// Start arguments supplied by the caller.
        args: Payload,
        /// Present when the flow was created by an inbound session.
        initiated_by: Option<InitiatedBy>,
    },
    /// The suspension completed without a value.
    Unit,
    /// One message per session the flow was receiving from.
    SessionData(BTreeMap<SessionId, Payload>),
    /// Result of an external event, as produced by its factory.
    ExternalResponse(serde_json::Value),
}

/// The session that caused an initiated (responder) flow to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatedBy {
    /// Session id as seen by the responder.
    pub session_id: SessionId,
    /// The initiating party.
    pub counterparty: HoldingIdentity,
    /// Context properties sent with the session init.
    pub context: BTreeMap<String, String>,
}

/// Business-level error categories injected into a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowExceptionKind {
    /// A session errored, timed out or was closed unexpectedly.
    Session,
    /// An awaited party never answered.
    Timeout,
    /// An external subsystem reported a failure.
    ExternalEvent,
    /// The flow or its counterparty was killed.
    Killed,
    /// Raised by business logic.
    User,
}

impl FlowExceptionKind {
    /// Returns the string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Timeout => "timeout",
            Self::ExternalEvent => "external_event",
            Self::Killed => "killed",
            Self::User => "user",
        }
    }
}

impl fmt::Display for FlowExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exception raised at a fiber's suspension point, or returned by business logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct FlowException {
    /// Error category.
    pub kind: FlowExceptionKind,
    /// Human readable details.
    pub message: String,
}

impl FlowException {
    /// Create an exception of the given kind.
    pub fn new(kind: FlowExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::new(FlowExceptionKind::Session, message)
    }

    /// Timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FlowExceptionKind::Timeout, message)
    }

    /// External subsystem error.
    pub fn external(message: impl Into<String>) -> Self {
        Self::new(FlowExceptionKind::ExternalEvent, message)
    }

    /// Business logic error.
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(FlowExceptionKind::User, message)
    }
}

/// Outcome of evaluating a checkpoint's [`WaitingFor`](super::WaitingFor) against an event.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowContinuation {
    /// Leave the fiber suspended.
    Continue,
    /// Start or resume the fiber with a value.
    Run(Resume),
    /// Resume the fiber by raising an exception at its suspension point.
    Error(FlowException),
}

impl FlowContinuation {
    /// Whether the fiber must be invoked.
    pub fn invokes_fiber(&self) -> bool {
        !matches!(self, Self::Continue)
    }

    /// Convert into the input handed to business logic.
    ///
    /// Returns `None` for [`FlowContinuation::Continue`].
    pub fn into_input(self) -> Option<Result<Resume, FlowException>> {
        match self {
            Self::Continue => None,
            Self::Run(resume) => Some(Ok(resume)),
            Self::Error(exception) => Some(Err(exception)),
        }
    }
}
