// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External events: asynchronous calls from a flow to subsystems outside the engine.
//!
//! A flow suspends on [`FlowIORequest::ExternalEvent`](crate::model::FlowIORequest::ExternalEvent)
//! naming a registered [`ExternalEventFactory`]. The factory turns the flow's
//! parameters into a request published on the subsystem's topic, and turns the
//! subsystem's response back into the value the fiber resumes with. The
//! [`ExternalEventCorrelator`] tracks outstanding requests in the checkpoint by
//! request id.

mod correlator;

pub use correlator::ExternalEventCorrelator;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::model::{FlowException, FlowKey};

/// Request (or cancellation) published to an external subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEventRequest {
    /// Correlation id.
    pub request_id: String,
    /// Requesting flow; responses are addressed to it.
    pub flow_key: FlowKey,
    /// Factory-built request body; `None` cancels the request.
    pub payload: Option<Value>,
    /// Send attempt, starting at 1.
    pub attempt: u32,
    /// Send time.
    pub timestamp: DateTime<Utc>,
}

/// Failure category reported by an external subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalEventErrorKind {
    /// Temporary; the request is sent again within the retry budget.
    Transient,
    /// The request was processed and rejected; raised in the flow.
    Platform,
    /// Unrecoverable; the flow is dead-lettered.
    Fatal,
}

/// Error returned by an external subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEventError {
    /// Category.
    pub kind: ExternalEventErrorKind,
    /// Details.
    pub message: String,
}

/// Response from an external subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEventResponse {
    /// Correlation id of the request.
    pub request_id: String,
    /// Response body on success.
    pub payload: Option<Value>,
    /// Failure, if any.
    pub error: Option<ExternalEventError>,
    /// Response time.
    pub timestamp: DateTime<Utc>,
}

impl ExternalEventResponse {
    /// Successful response.
    pub fn success(request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            payload: Some(payload),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Failed response.
    pub fn failure(
        request_id: impl Into<String>,
        kind: ExternalEventErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            payload: None,
            error: Some(ExternalEventError {
                kind,
                message: message.into(),
            }),
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle of an outstanding request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExternalEventStatus {
    /// Sent, no final answer yet.
    Pending,
    /// Answered successfully.
    Responded {
        /// Response body.
        response: Value,
    },
    /// Rejected by the subsystem or out of transient retries.
    Failed {
        /// Exception to raise in the flow.
        error: FlowException,
    },
    /// No response within the retry budget.
    TimedOut,
}

/// Outstanding external request, stored in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEventState {
    /// Correlation id.
    pub request_id: String,
    /// Factory that built the request.
    pub factory: String,
    /// Request body, kept for resends.
    pub request: Value,
    /// Lifecycle.
    pub status: ExternalEventStatus,
    /// Sends so far.
    pub attempts: u32,
    /// Last send time.
    pub sent_at: DateTime<Utc>,
    /// Deadline of the current attempt.
    pub deadline: DateTime<Utc>,
}

/// Bridge between a flow and one external subsystem.
pub trait ExternalEventFactory: Send + Sync {
    /// Topic requests are published on.
    fn topic(&self) -> &str;

    /// Build the request body from the flow's parameters.
    fn create_request(
        &self,
        flow_key: &FlowKey,
        request_id: &str,
        parameters: &Value,
    ) -> Result<Value, PipelineError>;

    /// Turn a successful response into the value the flow resumes with.
    fn resume_with(&self, response: Value) -> Result<Value, PipelineError> {
        Ok(response)
    }
}

/// Factories by name, built once at startup.
#[derive(Default)]
pub struct ExternalEventFactoryRegistry {
    factories: HashMap<String, Arc<dyn ExternalEventFactory>>,
}

impl std::fmt::Debug for ExternalEventFactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ExternalEventFactoryRegistry")
            .field("factories", &names)
            .finish()
    }
}

impl ExternalEventFactoryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ExternalEventFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, factory: Arc<dyn ExternalEventFactory>) -> Self {
        self.register(name, factory);
        self
    }

    /// Look up a factory. A missing factory is a deployment error.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ExternalEventFactory>, PipelineError> {
        self.factories.get(name).cloned().ok_or_else(|| {
            PipelineError::fatal(format!("no external event factory registered as '{}'", name))
        })
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no factory is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
