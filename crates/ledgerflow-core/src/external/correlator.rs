// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matching of external responses to the requests a flow is waiting on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    ExternalEventErrorKind, ExternalEventFactoryRegistry, ExternalEventRequest,
    ExternalEventResponse, ExternalEventState, ExternalEventStatus,
};
use crate::bus::{Record, RecordPayload, Topic};
use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::model::{Checkpoint, FlowContinuation, FlowException, Resume};
use crate::session::chrono_duration;

/// Tracks outstanding external requests per flow.
///
/// Every state has exactly one terminal transition: a response, a platform
/// failure, or a timeout. The waiting-for handler consumes the terminal state
/// and removes it, so the flow is resumed once per request.
#[derive(Debug, Clone)]
pub struct ExternalEventCorrelator {
    factories: Arc<ExternalEventFactoryRegistry>,
    timeout: Duration,
    max_retries: u32,
}

impl ExternalEventCorrelator {
    /// Create a correlator.
    pub fn new(factories: Arc<ExternalEventFactoryRegistry>, config: &EngineConfig) -> Self {
        Self {
            factories,
            timeout: config.external_event_timeout,
            max_retries: config.external_event_max_retries,
        }
    }

    /// Registered factories.
    pub fn factories(&self) -> &ExternalEventFactoryRegistry {
        &self.factories
    }

    /// Register a new outstanding request and build its first send.
    pub fn send(
        &self,
        checkpoint: &mut Checkpoint,
        request_id: &str,
        factory_name: &str,
        parameters: &Value,
        now: DateTime<Utc>,
    ) -> Result<Record, PipelineError> {
        let factory = self.factories.get(factory_name)?;
        if checkpoint.external_events.contains_key(request_id) {
            return Err(PipelineError::fatal(format!(
                "external event request {} is already outstanding",
                request_id
            )));
        }
        let request = factory.create_request(&checkpoint.flow_key, request_id, parameters)?;

        let state = ExternalEventState {
            request_id: request_id.to_string(),
            factory: factory_name.to_string(),
            request: request.clone(),
            status: ExternalEventStatus::Pending,
            attempts: 1,
            sent_at: now,
            deadline: now + chrono_duration(self.timeout),
        };
        checkpoint
            .external_events
            .insert(request_id.to_string(), state);

        Ok(request_record(
            factory.topic(),
            checkpoint,
            request_id,
            Some(request),
            1,
            now,
        ))
    }

    /// Apply a response. Unmatched or late responses are dropped.
    pub fn ingest(
        &self,
        checkpoint: &mut Checkpoint,
        response: &ExternalEventResponse,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, PipelineError> {
        let Some(state) = checkpoint.external_events.get_mut(&response.request_id) else {
            warn!(
                request_id = %response.request_id,
                "External event response without outstanding request dropped"
            );
            return Ok(Vec::new());
        };
        if state.status != ExternalEventStatus::Pending {
            debug!(request_id = %response.request_id, "Duplicate external event response dropped");
            return Ok(Vec::new());
        }

        match (&response.error, &response.payload) {
            (Some(error), _) => match error.kind {
                ExternalEventErrorKind::Fatal => Err(PipelineError::fatal(format!(
                    "external event {} failed fatally: {}",
                    response.request_id, error.message
                ))),
                ExternalEventErrorKind::Platform => {
                    state.status = ExternalEventStatus::Failed {
                        error: FlowException::external(error.message.clone()),
                    };
                    Ok(Vec::new())
                }
                ExternalEventErrorKind::Transient => {
                    warn!(
                        request_id = %response.request_id,
                        attempts = state.attempts,
                        error = %error.message,
                        "Transient external event failure"
                    );
                    if state.attempts > self.max_retries {
                        state.status = ExternalEventStatus::Failed {
                            error: FlowException::external(format!(
                                "gave up after {} attempts: {}",
                                state.attempts, error.message
                            )),
                        };
                        return Ok(Vec::new());
                    }
                    let request_id = response.request_id.clone();
                    Ok(vec![self.resend(checkpoint, &request_id, now)?])
                }
            },
            (None, Some(payload)) => {
                state.status = ExternalEventStatus::Responded {
                    response: payload.clone(),
                };
                Ok(Vec::new())
            }
            (None, None) => {
                state.status = ExternalEventStatus::Responded {
                    response: Value::Null,
                };
                Ok(Vec::new())
            }
        }
    }

    /// Resend or time out every pending request whose deadline passed.
    pub fn check_timeouts(
        &self,
        checkpoint: &mut Checkpoint,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, PipelineError> {
        let expired: Vec<String> = checkpoint
            .external_events
            .values()
            .filter(|s| s.status == ExternalEventStatus::Pending && s.deadline <= now)
            .map(|s| s.request_id.clone())
            .collect();

        let mut records = Vec::new();
        for request_id in expired {
            let Some(state) = checkpoint.external_events.get_mut(&request_id) else {
                continue;
            };
            if state.attempts > self.max_retries {
                warn!(request_id = %request_id, attempts = state.attempts, "External event timed out");
                state.status = ExternalEventStatus::TimedOut;
            } else {
                debug!(request_id = %request_id, attempts = state.attempts, "Resending external event");
                records.push(self.resend(checkpoint, &request_id, now)?);
            }
        }
        Ok(records)
    }

    /// Consume the terminal state of a request into a continuation.
    pub fn take_result(
        &self,
        checkpoint: &mut Checkpoint,
        request_id: &str,
    ) -> Result<FlowContinuation, PipelineError> {
        let status = match checkpoint.external_events.get(request_id) {
            Some(state) => state.status.clone(),
            None => {
                return Err(PipelineError::fatal(format!(
                    "flow waits for unknown external event request {}",
                    request_id
                )));
            }
        };

        let continuation = match status {
            ExternalEventStatus::Pending => return Ok(FlowContinuation::Continue),
            ExternalEventStatus::Responded { response } => {
                let factory_name = checkpoint
                    .external_events
                    .get(request_id)
                    .map(|s| s.factory.clone())
                    .unwrap_or_default();
                let value = self.factories.get(&factory_name)?.resume_with(response)?;
                FlowContinuation::Run(Resume::ExternalResponse(value))
            }
            ExternalEventStatus::Failed { error } => FlowContinuation::Error(error),
            ExternalEventStatus::TimedOut => FlowContinuation::Error(FlowException::timeout(
                format!("no response to external event {}", request_id),
            )),
        };
        checkpoint.external_events.remove(request_id);
        Ok(continuation)
    }

    /// Cancel every outstanding request, returning the cancellation records.
    pub fn cancel_all(&self, checkpoint: &mut Checkpoint, now: DateTime<Utc>) -> Vec<Record> {
        let states: Vec<ExternalEventState> = std::mem::take(&mut checkpoint.external_events)
            .into_values()
            .collect();
        states
            .into_iter()
            .filter(|state| state.status == ExternalEventStatus::Pending)
            .filter_map(|state| {
                let factory = self.factories.get(&state.factory).ok()?;
                Some(request_record(
                    factory.topic(),
                    checkpoint,
                    &state.request_id,
                    None,
                    state.attempts,
                    now,
                ))
            })
            .collect()
    }

    /// Earliest deadline among pending requests.
    pub fn next_deadline(&self, checkpoint: &Checkpoint) -> Option<DateTime<Utc>> {
        checkpoint
            .external_events
            .values()
            .filter(|s| s.status == ExternalEventStatus::Pending)
            .map(|s| s.deadline)
            .min()
    }

    fn resend(
        &self,
        checkpoint: &mut Checkpoint,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Record, PipelineError> {
        let (factory_name, request, attempt) = {
            let state = checkpoint
                .external_events
                .get_mut(request_id)
                .ok_or_else(|| PipelineError::fatal(format!("unknown request {}", request_id)))?;
            state.attempts += 1;
            state.sent_at = now;
            state.deadline = now + chrono_duration(self.timeout);
            (state.factory.clone(), state.request.clone(), state.attempts)
        };
        let factory = self.factories.get(&factory_name)?;
        Ok(request_record(
            factory.topic(),
            checkpoint,
            request_id,
            Some(request),
            attempt,
            now,
        ))
    }
}

fn request_record(
    topic: &str,
    checkpoint: &Checkpoint,
    request_id: &str,
    payload: Option<Value>,
    attempt: u32,
    now: DateTime<Utc>,
) -> Record {
    Record::new(
        Topic::ExternalEvent(topic.to_string()),
        checkpoint.flow_key.flow_id.clone(),
        RecordPayload::ExternalEventRequest(ExternalEventRequest {
            request_id: request_id.to_string(),
            flow_key: checkpoint.flow_key.clone(),
            payload,
            attempt,
            timestamp: now,
        }),
    )
}
