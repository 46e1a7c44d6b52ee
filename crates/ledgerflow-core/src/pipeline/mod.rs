// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The flow event pipeline.
//!
//! One cycle per inbound event, run to completion against one checkpoint:
//!
//! ```text
//! Received ─▶ PreProcessed ─▶ WaitingForEvaluated ─┬─▶ FiberInvoked ─┬─▶ PostProcessed ─▶ OutputReady
//!                                                  └─────(Continue)──┘
//! ```
//!
//! 1. **Pre-process** drops events already applied (the checkpoint's sequence is
//!    the last applied offset), creates the checkpoint for start events and
//!    session inits, and applies the event to session, external-event and timer
//!    bookkeeping.
//! 2. **Evaluate** the checkpoint's waiting-for through the
//!    [`WaitingForDispatcher`].
//! 3. **Invoke** the fiber for `Run` and `Error` continuations.
//! 4. **Post-process** the fiber's request into checkpoint changes and records.
//!
//! Any [`PipelineError`](crate::error::PipelineError) raised on the way goes to
//! the [`FlowHospital`], which alone decides the output of a failed cycle.

pub(crate) mod context;
mod post_process;
mod pre_process;

pub use context::{CheckpointAction, FlowEventContext, FlowEventOutput, PipelineStage};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::bus::Record;
use crate::config::EngineConfig;
use crate::dispatcher::WaitingForDispatcher;
use crate::error::PipelineError;
use crate::external::{ExternalEventCorrelator, ExternalEventFactoryRegistry};
use crate::fiber::{FiberOutcome, FlowFiber, FlowRegistry};
use crate::hospital::{Admission, FlowHospital};
use crate::model::{
    Checkpoint, EventEnvelope, FlowContinuation, FlowEvent, FlowEventKind, FlowStatus,
    HousekeepingState, Resume,
};
use crate::session::SessionManager;
use crate::task_manager::TaskManager;

/// Processes flow events into checkpoint changes and records.
///
/// Stateless between events; every cycle gets the stored checkpoint from the
/// caller and returns what to write back.
#[derive(Debug, Clone)]
pub struct FlowEventProcessor {
    dispatcher: WaitingForDispatcher,
    fiber: FlowFiber,
    sessions: SessionManager,
    correlator: ExternalEventCorrelator,
    hospital: FlowHospital,
}

impl FlowEventProcessor {
    /// Wire up a processor with the built-in waiting-for handlers.
    pub fn new(
        config: &EngineConfig,
        flows: Arc<FlowRegistry>,
        factories: Arc<ExternalEventFactoryRegistry>,
        tasks: TaskManager,
    ) -> Result<Self, PipelineError> {
        let sessions = SessionManager::new(config);
        let correlator = ExternalEventCorrelator::new(factories, config);
        let dispatcher =
            WaitingForDispatcher::with_default_handlers(sessions.clone(), correlator.clone());
        Self::with_dispatcher(config, dispatcher, flows, correlator, tasks)
    }

    /// Wire up a processor with a custom dispatcher, validated for completeness.
    pub fn with_dispatcher(
        config: &EngineConfig,
        dispatcher: WaitingForDispatcher,
        flows: Arc<FlowRegistry>,
        correlator: ExternalEventCorrelator,
        tasks: TaskManager,
    ) -> Result<Self, PipelineError> {
        dispatcher.validate()?;
        Ok(Self {
            dispatcher,
            fiber: FlowFiber::new(flows, tasks),
            sessions: SessionManager::new(config),
            correlator,
            hospital: FlowHospital::new(config),
        })
    }

    /// Registered flows.
    pub fn flows(&self) -> &FlowRegistry {
        self.fiber.registry()
    }

    /// Process one event at the current time.
    pub async fn process(
        &self,
        envelope: EventEnvelope,
        stored: Option<Checkpoint>,
        cancel: &CancellationToken,
    ) -> FlowEventOutput {
        self.process_at(envelope, stored, cancel, Utc::now()).await
    }

    /// Process one event as if at `now`.
    #[instrument(
        skip(self, envelope, stored, cancel),
        fields(
            flow_id = %envelope.event.flow_key.flow_id,
            event = envelope.event.kind.name(),
            offset = envelope.offset
        )
    )]
    pub async fn process_at(
        &self,
        envelope: EventEnvelope,
        stored: Option<Checkpoint>,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> FlowEventOutput {
        let EventEnvelope { offset, event } = envelope;

        // 1. Idempotent replay: the checkpoint already reflects this offset
        if let Some(checkpoint) = &stored
            && offset <= checkpoint.sequence
        {
            debug!(sequence = checkpoint.sequence, "Event already applied, skipping");
            return FlowEventOutput::unchanged();
        }

        // 2. Tombstoned flows only accept a kill
        let stored = match stored {
            Some(tombstone)
                if tombstone.is_dead_lettered()
                    && !matches!(event.kind, FlowEventKind::Kill { .. }) =>
            {
                return self.hospital.reject(tombstone, offset, event, now);
            }
            other => other,
        };

        // 3. Retry gate: replay a parked event or park this one behind it
        let (mut admission, working) = match self.admit(offset, event, stored, now) {
            Gate::Run {
                admission,
                working,
            } => (admission, working),
            Gate::Hold(output) => return output,
        };
        if admission.base.is_none() {
            admission.base = pre_process::fresh_checkpoint(&admission.event, now);
            admission.placeholder = admission.base.is_some();
        }

        // 4. Run the cycle; failures go to the hospital
        let mut ctx = FlowEventContext::new(offset, admission.event.clone(), working, now);
        match self.run(&mut ctx, cancel).await {
            Ok(()) => {
                ctx.records
                    .extend(admission.deferred.iter().cloned().map(Record::flow_event));
                ctx.into_output()
            }
            Err(failure) => self.hospital.treat(failure, admission, ctx),
        }
    }

    fn admit(
        &self,
        offset: u64,
        event: FlowEvent,
        stored: Option<Checkpoint>,
        now: DateTime<Utc>,
    ) -> Gate {
        let Some(mut checkpoint) = stored else {
            return Gate::run(offset, event, None);
        };
        let Some(mut retry) = checkpoint.retry.take() else {
            return Gate::run(offset, event, Some(checkpoint));
        };

        match event.kind {
            FlowEventKind::Kill { .. } => Gate::run(offset, event, Some(checkpoint)),
            FlowEventKind::Wakeup if retry.due_at <= now => {
                info!(attempt = retry.attempts + 1, "Replaying parked event");
                let working = (!retry.placeholder).then_some(checkpoint);
                Gate::Run {
                    admission: Admission {
                        offset,
                        event: retry.event,
                        base: working.clone(),
                        placeholder: retry.placeholder,
                        attempts: retry.attempts,
                        deferred: retry.deferred,
                    },
                    working,
                }
            }
            _ => {
                if !matches!(event.kind, FlowEventKind::Wakeup) {
                    debug!(deferred = retry.deferred.len() + 1, "Event parked behind pending retry");
                    retry.deferred.push(event);
                }
                checkpoint.retry = Some(retry);
                checkpoint.sequence = offset;
                checkpoint.updated_at = now;
                Gate::Hold(FlowEventOutput {
                    checkpoint: CheckpointAction::Put(checkpoint),
                    records: Vec::new(),
                    hospital: None,
                })
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut FlowEventContext,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        pre_process::apply(self, ctx)?;
        if ctx.is_discarded() || ctx.is_deleting() {
            return Ok(());
        }
        ctx.advance(PipelineStage::PreProcessed);

        let continuation = self.dispatcher.run_or_continue(ctx)?;
        ctx.advance(PipelineStage::WaitingForEvaluated);

        if continuation.invokes_fiber() {
            if matches!(continuation, FlowContinuation::Run(Resume::Start { .. })) {
                info!("Flow started");
                ctx.push_status(FlowStatus::Running);
            }
            let outcome = self.invoke_fiber(ctx, continuation, cancel).await?;
            ctx.advance(PipelineStage::FiberInvoked);
            post_process::apply_request(self, ctx, outcome)?;
        }

        post_process::schedule_timer(self, ctx);
        ctx.advance(PipelineStage::PostProcessed);
        Ok(())
    }

    async fn invoke_fiber(
        &self,
        ctx: &mut FlowEventContext,
        continuation: FlowContinuation,
        cancel: &CancellationToken,
    ) -> Result<FiberOutcome, PipelineError> {
        let checkpoint = ctx
            .checkpoint
            .take()
            .ok_or_else(|| PipelineError::fatal("fiber invoked without a checkpoint"))?;

        let mut state = self
            .fiber
            .resume(HousekeepingState::new(checkpoint, continuation));
        let outcome = state.next_request(cancel).await;
        ctx.checkpoint = Some(state.checkpoint);
        outcome
    }
}

enum Gate {
    Run {
        admission: Admission,
        working: Option<Checkpoint>,
    },
    Hold(FlowEventOutput),
}

impl Gate {
    fn run(offset: u64, event: FlowEvent, stored: Option<Checkpoint>) -> Self {
        Gate::Run {
            admission: Admission {
                offset,
                event,
                base: stored.clone(),
                placeholder: false,
                attempts: 0,
                deferred: Vec::new(),
            },
            working: stored,
        }
    }
}
