// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The flow hospital: what happens to an event whose processing failed.
//!
//! | Category | Checkpoint | Records |
//! |----------|------------|---------|
//! | Fatal | tombstoned | dead letter + `DeadLettered` status |
//! | Abort | working copy up to the failure | everything computed so far |
//! | Transient | stored copy + parked event | delayed retry wakeup |
//!
//! A transient event is replayed by the retry wakeup with exponential backoff.
//! Once the retry budget is spent it is escalated to fatal. Events arriving
//! while a retry is pending are parked behind it and replayed in order.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::bus::{Record, RecordPayload, Topic};
use crate::config::EngineConfig;
use crate::error::{ErrorCategory, PipelineError};
use crate::model::{Checkpoint, FlowEvent, FlowKey, FlowState, FlowStatus, RetryState};
use crate::pipeline::context::status_record;
use crate::pipeline::{CheckpointAction, FlowEventContext, FlowEventOutput};
use crate::session::chrono_duration;

/// A flow or event that can make no further progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Affected flow.
    pub flow_key: FlowKey,
    /// Event that failed or arrived for a dead flow.
    pub event: FlowEvent,
    /// Failure message.
    pub reason: String,
    /// Category of the original failure.
    pub category: ErrorCategory,
    /// Checkpoint as it was before the failed event.
    pub checkpoint: Option<Checkpoint>,
    /// Checkpoint sequence at the time of failure.
    pub sequence: u64,
    /// When the letter was written.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Wrap into a dead-letter topic record.
    pub fn into_record(self) -> Record {
        Record::new(
            Topic::DeadLetter,
            self.flow_key.storage_key(),
            RecordPayload::DeadLetter(Box::new(self)),
        )
    }
}

/// Triage summary attached to every output that went through the hospital.
#[derive(Debug, Clone, PartialEq)]
pub struct HospitalReport {
    /// Affected flow.
    pub flow_key: FlowKey,
    /// Name of the failed event kind.
    pub event: &'static str,
    /// Checkpoint sequence before the failed event.
    pub sequence: u64,
    /// How the failure was treated.
    pub category: ErrorCategory,
    /// Failure message.
    pub message: String,
    /// Failed attempts including this one.
    pub attempts: u32,
    /// Letter to persist for operators, when the flow or event was dead-lettered.
    pub dead_letter: Option<DeadLetter>,
}

/// A failed event and the state it failed against.
#[derive(Debug)]
pub struct Admission {
    /// Offset of the event being processed.
    pub offset: u64,
    /// The event that failed.
    pub event: FlowEvent,
    /// Checkpoint before the failed event, without retry bookkeeping.
    pub base: Option<Checkpoint>,
    /// Whether `base` was created only to park the event.
    pub placeholder: bool,
    /// Failed attempts before this one.
    pub attempts: u32,
    /// Events parked behind the failed one.
    pub deferred: Vec<FlowEvent>,
}

/// Classifies pipeline failures and decides their outcome.
#[derive(Debug, Clone)]
pub struct FlowHospital {
    max_retries: u32,
    backoff: Duration,
}

impl FlowHospital {
    /// Create a hospital from engine settings.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.hospital_max_retries,
            backoff: config.hospital_backoff,
        }
    }

    /// Delay before retry number `attempt` (1-based): `backoff * 2^(attempt - 1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(multiplier)
    }

    /// Turn a failure into the cycle's output.
    pub fn treat(
        &self,
        failure: PipelineError,
        admission: Admission,
        partial: FlowEventContext,
    ) -> FlowEventOutput {
        let now = partial.now;
        match failure {
            PipelineError::Abort(message) => {
                warn!(
                    flow_id = %admission.event.flow_key.flow_id,
                    event = admission.event.kind.name(),
                    stage = %partial.stage,
                    error = %message,
                    "Event aborted"
                );
                let mut output = partial.into_output();
                output.hospital = Some(report(&admission, ErrorCategory::Abort, message, None));
                output
            }
            PipelineError::Transient(message) => {
                let attempts = admission.attempts + 1;
                if attempts > self.max_retries {
                    let reason = format!(
                        "retry budget exhausted after {} attempts: {}",
                        attempts, message
                    );
                    return self.dead_letter(admission, ErrorCategory::Transient, reason, now);
                }
                self.park(admission, message, now)
            }
            PipelineError::Fatal(message) => {
                self.dead_letter(admission, ErrorCategory::Fatal, message, now)
            }
        }
    }

    /// Output for an event that reached a dead-lettered flow.
    pub fn reject(
        &self,
        tombstone: Checkpoint,
        offset: u64,
        event: FlowEvent,
        now: DateTime<Utc>,
    ) -> FlowEventOutput {
        let reason = match &tombstone.state {
            FlowState::DeadLettered { reason } => format!("flow is dead-lettered: {}", reason),
            FlowState::Running => "flow is dead-lettered".to_string(),
        };
        warn!(
            flow_id = %event.flow_key.flow_id,
            event = event.kind.name(),
            "Event for dead-lettered flow sent to the dead letter queue"
        );
        let letter = DeadLetter {
            flow_key: event.flow_key.clone(),
            event: event.clone(),
            reason: reason.clone(),
            category: ErrorCategory::Fatal,
            checkpoint: None,
            sequence: tombstone.sequence,
            dead_lettered_at: now,
        };
        let report = HospitalReport {
            flow_key: event.flow_key.clone(),
            event: event.kind.name(),
            sequence: tombstone.sequence,
            category: ErrorCategory::Fatal,
            message: reason,
            attempts: 0,
            dead_letter: Some(letter.clone()),
        };

        let mut checkpoint = tombstone;
        checkpoint.sequence = offset;
        checkpoint.updated_at = now;
        FlowEventOutput {
            checkpoint: CheckpointAction::Put(checkpoint),
            records: vec![letter.into_record()],
            hospital: Some(report),
        }
    }

    fn park(&self, admission: Admission, message: String, now: DateTime<Utc>) -> FlowEventOutput {
        let attempts = admission.attempts + 1;
        let Some(mut checkpoint) = admission.base.clone() else {
            warn!(
                flow_id = %admission.event.flow_key.flow_id,
                error = %message,
                "Transient failure for a flow without checkpoint, event dropped"
            );
            let mut output = FlowEventOutput::unchanged();
            output.hospital = Some(report(&admission, ErrorCategory::Transient, message, None));
            return output;
        };

        let due_at = now + chrono_duration(self.backoff_for(attempts));
        warn!(
            flow_id = %admission.event.flow_key.flow_id,
            event = admission.event.kind.name(),
            attempts,
            due_at = %due_at,
            error = %message,
            "Transient failure, event parked for retry"
        );

        checkpoint.retry = Some(RetryState {
            event: admission.event.clone(),
            attempts,
            last_error: message.clone(),
            due_at,
            deferred: admission.deferred.clone(),
            placeholder: admission.placeholder,
        });
        checkpoint.sequence = admission.offset;
        checkpoint.updated_at = now;

        let wakeup =
            Record::flow_event(FlowEvent::wakeup(checkpoint.flow_key.clone())).deliver_at(due_at);
        let mut report = report(&admission, ErrorCategory::Transient, message, None);
        report.attempts = attempts;
        FlowEventOutput {
            checkpoint: CheckpointAction::Put(checkpoint),
            records: vec![wakeup],
            hospital: Some(report),
        }
    }

    fn dead_letter(
        &self,
        admission: Admission,
        category: ErrorCategory,
        reason: String,
        now: DateTime<Utc>,
    ) -> FlowEventOutput {
        error!(
            flow_id = %admission.event.flow_key.flow_id,
            holding_identity = %admission.event.flow_key.identity,
            event = admission.event.kind.name(),
            category = %category,
            error = %reason,
            "Flow dead-lettered"
        );

        let sequence = admission.base.as_ref().map(|cp| cp.sequence).unwrap_or(0);
        let letter = DeadLetter {
            flow_key: admission.event.flow_key.clone(),
            event: admission.event.clone(),
            reason: reason.clone(),
            category,
            checkpoint: admission.base.clone().filter(|_| !admission.placeholder),
            sequence,
            dead_lettered_at: now,
        };

        let mut records = vec![letter.clone().into_record()];
        records.extend(admission.deferred.iter().map(|event| {
            DeadLetter {
                flow_key: event.flow_key.clone(),
                event: event.clone(),
                reason: format!("parked behind dead-lettered event: {}", reason),
                category,
                checkpoint: None,
                sequence,
                dead_lettered_at: now,
            }
            .into_record()
        }));

        let checkpoint = match admission.base.clone() {
            Some(mut tombstone) => {
                tombstone.state = FlowState::DeadLettered {
                    reason: reason.clone(),
                };
                tombstone.retry = None;
                tombstone.sequence = admission.offset;
                tombstone.updated_at = now;
                records.push(status_record(
                    &tombstone.flow_key,
                    FlowStatus::DeadLettered {
                        reason: reason.clone(),
                    },
                    now,
                ));
                CheckpointAction::Put(tombstone)
            }
            None => CheckpointAction::Unchanged,
        };

        let mut report = report(&admission, ErrorCategory::Fatal, reason, Some(letter));
        report.attempts = admission.attempts + 1;
        FlowEventOutput {
            checkpoint,
            records,
            hospital: Some(report),
        }
    }
}

fn report(
    admission: &Admission,
    category: ErrorCategory,
    message: String,
    dead_letter: Option<DeadLetter>,
) -> HospitalReport {
    HospitalReport {
        flow_key: admission.event.flow_key.clone(),
        event: admission.event.kind.name(),
        sequence: admission.base.as_ref().map(|cp| cp.sequence).unwrap_or(0),
        category,
        message,
        attempts: admission.attempts + 1,
        dead_letter,
    }
}
