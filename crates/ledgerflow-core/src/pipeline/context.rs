// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Working state of one pipeline cycle.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bus::{Record, RecordPayload, Topic};
use crate::error::PipelineError;
use crate::hospital::HospitalReport;
use crate::model::{Checkpoint, FlowEvent, FlowStatus, FlowStatusRecord};
use crate::session::{MapperEvent, SessionEvent, outbound_record};

/// Stage of a pipeline cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStage {
    /// Event accepted, nothing applied yet.
    Received,
    /// Event validated and applied to checkpoint bookkeeping.
    PreProcessed,
    /// The waiting-for handler produced a continuation.
    WaitingForEvaluated,
    /// The fiber ran and returned its next request.
    FiberInvoked,
    /// The request was turned into checkpoint changes and records.
    PostProcessed,
    /// Output assembled.
    OutputReady,
}

impl PipelineStage {
    /// Returns the string representation of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::PreProcessed => "pre_processed",
            Self::WaitingForEvaluated => "waiting_for_evaluated",
            Self::FiberInvoked => "fiber_invoked",
            Self::PostProcessed => "post_processed",
            Self::OutputReady => "output_ready",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one cycle reads and writes.
#[derive(Debug)]
pub struct FlowEventContext {
    /// Transport offset of the event.
    pub offset: u64,
    /// The event being processed.
    pub event: FlowEvent,
    /// Working copy of the checkpoint; `None` until created.
    pub checkpoint: Option<Checkpoint>,
    /// Records produced so far.
    pub records: Vec<Record>,
    /// Processing time; the only clock the cycle reads.
    pub now: DateTime<Utc>,
    /// Current stage.
    pub stage: PipelineStage,
    pub(crate) delete: bool,
    pub(crate) discarded: bool,
}

impl FlowEventContext {
    /// Context for `event` against the stored checkpoint, if any.
    pub fn new(
        offset: u64,
        event: FlowEvent,
        checkpoint: Option<Checkpoint>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            offset,
            event,
            checkpoint,
            records: Vec::new(),
            now,
            stage: PipelineStage::Received,
            delete: false,
            discarded: false,
        }
    }

    /// Move to the next stage.
    pub fn advance(&mut self, stage: PipelineStage) {
        debug!(
            flow_id = %self.event.flow_key.flow_id,
            event = self.event.kind.name(),
            from = %self.stage,
            to = %stage,
            "Pipeline stage"
        );
        self.stage = stage;
    }

    /// The working checkpoint; its absence past pre-processing is a defect.
    pub fn checkpoint_mut(&mut self) -> Result<&mut Checkpoint, PipelineError> {
        let flow_key = &self.event.flow_key;
        self.checkpoint.as_mut().ok_or_else(|| {
            PipelineError::fatal(format!("no checkpoint for {} at stage {}", flow_key, self.stage))
        })
    }

    /// Drop the event without touching the checkpoint.
    pub fn discard(&mut self, reason: &str) {
        debug!(
            flow_id = %self.event.flow_key.flow_id,
            event = self.event.kind.name(),
            reason,
            "Event discarded"
        );
        self.discarded = true;
    }

    /// Whether the event was discarded.
    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Delete the checkpoint when the cycle completes.
    pub fn mark_for_deletion(&mut self) {
        self.delete = true;
    }

    /// Whether the checkpoint will be deleted.
    pub fn is_deleting(&self) -> bool {
        self.delete
    }

    /// Queue outbound session messages from this flow.
    pub fn push_session_events(&mut self, events: impl IntoIterator<Item = SessionEvent>) {
        let flow_key = self.event.flow_key.clone();
        self.records
            .extend(events.into_iter().map(|event| outbound_record(&flow_key, event)));
    }

    /// Queue a mapper cleanup for every session end of the flow.
    pub fn push_session_cleanups(&mut self) {
        let Some(checkpoint) = &self.checkpoint else {
            return;
        };
        let cleanups: Vec<Record> = checkpoint
            .sessions
            .keys()
            .map(|session_id| {
                MapperEvent::ScheduleCleanup {
                    session_id: session_id.clone(),
                }
                .into_record()
            })
            .collect();
        self.records.extend(cleanups);
    }

    /// Queue a lifecycle status record.
    pub fn push_status(&mut self, status: FlowStatus) {
        self.records.push(status_record(&self.event.flow_key, status, self.now));
    }

    /// Queue an immediate wakeup for this flow.
    pub fn push_self_wakeup(&mut self) {
        self.records
            .push(Record::flow_event(FlowEvent::wakeup(self.event.flow_key.clone())));
    }

    /// Assemble the cycle's output.
    pub fn into_output(mut self) -> FlowEventOutput {
        self.advance(PipelineStage::OutputReady);
        let checkpoint = match (self.discarded, self.delete, self.checkpoint) {
            (true, _, _) | (false, false, None) => CheckpointAction::Unchanged,
            (false, true, _) => CheckpointAction::Delete,
            (false, false, Some(mut checkpoint)) => {
                checkpoint.sequence = self.offset;
                checkpoint.updated_at = self.now;
                CheckpointAction::Put(checkpoint)
            }
        };
        FlowEventOutput {
            checkpoint,
            records: self.records,
            hospital: None,
        }
    }
}

/// What to do with the stored checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointAction {
    /// Leave it as it is.
    Unchanged,
    /// Write this checkpoint.
    Put(Checkpoint),
    /// Remove it.
    Delete,
}

/// Output of one pipeline cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEventOutput {
    /// Checkpoint change.
    pub checkpoint: CheckpointAction,
    /// Records to publish once the checkpoint change is durable.
    pub records: Vec<Record>,
    /// Set when the event went through the hospital.
    pub hospital: Option<HospitalReport>,
}

impl FlowEventOutput {
    /// Output of an event that changes nothing.
    pub fn unchanged() -> Self {
        Self {
            checkpoint: CheckpointAction::Unchanged,
            records: Vec::new(),
            hospital: None,
        }
    }

    /// Whether the output has any effect.
    pub fn is_noop(&self) -> bool {
        self.checkpoint == CheckpointAction::Unchanged && self.records.is_empty()
    }
}

pub(crate) fn status_record(
    flow_key: &crate::model::FlowKey,
    status: FlowStatus,
    now: DateTime<Utc>,
) -> Record {
    Record::new(
        Topic::FlowStatus,
        flow_key.storage_key(),
        RecordPayload::FlowStatus(FlowStatusRecord {
            flow_key: flow_key.clone(),
            status,
            timestamp: now,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlowKey, HoldingIdentity, StartContext};

    fn key() -> FlowKey {
        FlowKey::new("f1", HoldingIdentity::new("O=Alice", "g"))
    }

    fn ctx(checkpoint: Option<Checkpoint>) -> FlowEventContext {
        FlowEventContext::new(42, FlowEvent::wakeup(key()), checkpoint, Utc::now())
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(key(), "demo", StartContext::default(), Utc::now())
    }

    #[test]
    fn test_output_put_advances_sequence() {
        let output = ctx(Some(checkpoint())).into_output();
        let CheckpointAction::Put(cp) = output.checkpoint else {
            panic!("expected put");
        };
        assert_eq!(cp.sequence, 42);
    }

    #[test]
    fn test_output_discarded_is_unchanged() {
        let mut c = ctx(Some(checkpoint()));
        c.discard("test");
        assert!(c.into_output().is_noop());
    }

    #[test]
    fn test_output_delete() {
        let mut c = ctx(Some(checkpoint()));
        c.mark_for_deletion();
        c.push_status(FlowStatus::Running);
        let output = c.into_output();
        assert_eq!(output.checkpoint, CheckpointAction::Delete);
        assert_eq!(output.records[0].topic, Topic::FlowStatus);
    }

    #[test]
    fn test_missing_checkpoint_is_fatal() {
        let mut c = ctx(None);
        assert!(matches!(c.checkpoint_mut(), Err(PipelineError::Fatal(_))));
    }
}
