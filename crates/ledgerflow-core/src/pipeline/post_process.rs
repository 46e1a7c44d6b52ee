// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Turning the fiber's request into checkpoint changes and records.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::{FlowEventContext, FlowEventProcessor};
use crate::bus::Record;
use crate::error::PipelineError;
use crate::fiber::FiberOutcome;
use crate::model::{
    ConfirmationKind, FlowEvent, FlowException, FlowIORequest, FlowStatus, Payload, SessionId,
    SessionInit, WaitingFor,
};
use crate::session::SessionEvent;

pub(super) fn apply_request(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    outcome: FiberOutcome,
) -> Result<(), PipelineError> {
    let FiberOutcome {
        request,
        fiber_state,
        id_counter,
    } = outcome;
    {
        let checkpoint = ctx.checkpoint_mut()?;
        checkpoint.fiber_state = fiber_state;
        checkpoint.id_counter = id_counter;
        checkpoint.suspended_on = Some(request.clone());
    }

    match request {
        FlowIORequest::InitiateSessions { sessions } => {
            let session_ids = sessions.iter().map(|s| s.session_id.clone()).collect();
            let failure = initiate(processor, ctx, &sessions)?;
            suspend(
                ctx,
                WaitingFor::SessionConfirmation {
                    session_ids,
                    kind: ConfirmationKind::Initiate,
                },
                failure,
            )
        }
        FlowIORequest::Send { messages } => {
            let failure = send(processor, ctx, messages)?;
            suspend(ctx, WaitingFor::Wakeup, failure)
        }
        FlowIORequest::Receive { session_ids } => {
            suspend(ctx, WaitingFor::SessionData { session_ids }, None)
        }
        FlowIORequest::SendAndReceive { messages } => {
            let session_ids = messages.keys().cloned().collect();
            let failure = send(processor, ctx, messages)?;
            suspend(ctx, WaitingFor::SessionData { session_ids }, failure)
        }
        FlowIORequest::CloseSessions { session_ids } => {
            let failure = close(processor, ctx, &session_ids)?;
            suspend(
                ctx,
                WaitingFor::SessionConfirmation {
                    session_ids,
                    kind: ConfirmationKind::Close,
                },
                failure,
            )
        }
        FlowIORequest::ExternalEvent {
            request_id,
            factory,
            parameters,
        } => {
            let now = ctx.now;
            let checkpoint = ctx.checkpoint_mut()?;
            let record =
                processor
                    .correlator
                    .send(checkpoint, &request_id, &factory, &parameters, now)?;
            checkpoint.waiting_for = WaitingFor::ExternalEventResponse { request_id };
            ctx.records.push(record);
            Ok(())
        }
        FlowIORequest::Sleep { duration_ms } => match wake_time(ctx.now, duration_ms) {
            Some(wake_at) => {
                ctx.checkpoint_mut()?.waiting_for = WaitingFor::Sleep { wake_at };
                Ok(())
            }
            None => {
                let error = FlowException::user(format!(
                    "sleep of {} ms is out of range",
                    duration_ms
                ));
                suspend(ctx, WaitingFor::Wakeup, Some(error))
            }
        },
        FlowIORequest::ForceCheckpoint => suspend(ctx, WaitingFor::Wakeup, None),
        FlowIORequest::Finished { result } => finish(processor, ctx, result),
        FlowIORequest::Failed { error } => fail(processor, ctx, error),
    }
}

/// When a sleep of `duration_ms` started at `now` ends, if representable.
fn wake_time(now: DateTime<Utc>, duration_ms: u64) -> Option<DateTime<Utc>> {
    let millis = i64::try_from(duration_ms).ok()?;
    now.checked_add_signed(Duration::try_milliseconds(millis)?)
}

/// Schedule a wakeup for the earliest pending deadline.
///
/// A new timer is only published when no earlier one is outstanding.
pub(super) fn schedule_timer(processor: &FlowEventProcessor, ctx: &mut FlowEventContext) {
    if ctx.is_deleting() || ctx.is_discarded() {
        return;
    }
    let now = ctx.now;
    let flow_key = ctx.event.flow_key.clone();
    let Some(checkpoint) = ctx.checkpoint.as_mut() else {
        return;
    };

    let sleep = match checkpoint.waiting_for {
        WaitingFor::Sleep { wake_at } => Some(wake_at),
        _ => None,
    };
    let Some(next) = [
        sleep,
        processor.correlator.next_deadline(checkpoint),
        processor.sessions.next_deadline(checkpoint),
    ]
    .into_iter()
    .flatten()
    .min() else {
        return;
    };

    let outstanding = checkpoint
        .timer_at
        .is_some_and(|at| at > now && at <= next);
    if !outstanding {
        checkpoint.timer_at = Some(next);
        ctx.records
            .push(Record::flow_event(FlowEvent::wakeup(flow_key)).deliver_at(next));
    }
}

fn suspend(
    ctx: &mut FlowEventContext,
    waiting_for: WaitingFor,
    failure: Option<FlowException>,
) -> Result<(), PipelineError> {
    let checkpoint = ctx.checkpoint_mut()?;
    match failure {
        Some(error) => {
            warn!(error = %error, "Flow request failed, raising in the flow");
            checkpoint.pending_error = Some(error);
            checkpoint.waiting_for = WaitingFor::Wakeup;
        }
        None => checkpoint.waiting_for = waiting_for,
    }
    // What the flow waits for may already be satisfied; re-evaluate right away.
    ctx.push_self_wakeup();
    Ok(())
}

fn initiate(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    sessions: &[SessionInit],
) -> Result<Option<FlowException>, PipelineError> {
    let now = ctx.now;
    let checkpoint = ctx.checkpoint_mut()?;
    let mut events = Vec::new();
    let mut failure = None;
    for init in sessions {
        match processor.sessions.initiate(checkpoint, init, now) {
            Ok(event) => events.push(event),
            Err(error) => {
                failure = Some(error);
                break;
            }
        }
    }
    ctx.push_session_events(events);
    Ok(failure)
}

fn send(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    messages: BTreeMap<SessionId, Payload>,
) -> Result<Option<FlowException>, PipelineError> {
    let now = ctx.now;
    let checkpoint = ctx.checkpoint_mut()?;
    let mut events = Vec::new();
    let mut failure = None;
    for (session_id, payload) in messages {
        match processor.sessions.send(checkpoint, &session_id, payload, now) {
            Ok(event) => events.push(event),
            Err(error) => {
                failure = Some(error);
                break;
            }
        }
    }
    ctx.push_session_events(events);
    Ok(failure)
}

fn close(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    session_ids: &[SessionId],
) -> Result<Option<FlowException>, PipelineError> {
    let now = ctx.now;
    let checkpoint = ctx.checkpoint_mut()?;
    let mut events: Vec<SessionEvent> = Vec::new();
    let mut failure = None;
    for session_id in session_ids {
        match processor.sessions.close(checkpoint, session_id, now) {
            Ok(event) => events.extend(event),
            Err(error) => {
                failure = Some(error);
                break;
            }
        }
    }
    ctx.push_session_events(events);
    Ok(failure)
}

fn finish(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    result: Payload,
) -> Result<(), PipelineError> {
    let now = ctx.now;
    let checkpoint = ctx.checkpoint_mut()?;
    let closes = processor.sessions.close_all(checkpoint, now);
    let cancellations = processor.correlator.cancel_all(checkpoint, now);

    info!("Flow completed");
    ctx.push_session_events(closes);
    ctx.records.extend(cancellations);
    ctx.push_session_cleanups();
    ctx.push_status(FlowStatus::Completed { result });
    ctx.mark_for_deletion();
    Ok(())
}

fn fail(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    error: FlowException,
) -> Result<(), PipelineError> {
    let now = ctx.now;
    let checkpoint = ctx.checkpoint_mut()?;
    let errors = processor.sessions.error_all(checkpoint, &error, now);
    let cancellations = processor.correlator.cancel_all(checkpoint, now);

    warn!(error = %error, "Flow failed");
    ctx.push_session_events(errors);
    ctx.records.extend(cancellations);
    ctx.push_session_cleanups();
    ctx.push_status(FlowStatus::Failed { error });
    ctx.mark_for_deletion();
    Ok(())
}
