// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Applying the inbound event to checkpoint bookkeeping.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{FlowEventContext, FlowEventProcessor};
use crate::error::PipelineError;
use crate::external::ExternalEventResponse;
use crate::model::{
    Checkpoint, FlowEvent, FlowEventKind, FlowException, FlowExceptionKind, FlowStatus,
    StartContext, StartFlow,
};
use crate::session::{SessionEvent, SessionPayload};

/// Checkpoint an event would create for a flow that has none.
pub(super) fn fresh_checkpoint(event: &FlowEvent, now: DateTime<Utc>) -> Option<Checkpoint> {
    let flow_name = match &event.kind {
        FlowEventKind::Start(start) => start.flow_name.clone(),
        FlowEventKind::Session(SessionEvent {
            payload: SessionPayload::Init { protocol, .. },
            ..
        }) => protocol.clone(),
        _ => return None,
    };
    Some(Checkpoint::new(
        event.flow_key.clone(),
        flow_name,
        StartContext::default(),
        now,
    ))
}

pub(super) fn apply(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
) -> Result<(), PipelineError> {
    match ctx.event.kind.clone() {
        FlowEventKind::Start(start) => start_flow(processor, ctx, start),
        FlowEventKind::Session(event) => session_event(processor, ctx, event),
        FlowEventKind::ExternalEventResponse(response) => {
            external_response(processor, ctx, response)
        }
        FlowEventKind::Wakeup => wakeup(processor, ctx),
        FlowEventKind::Kill { reason } => kill(processor, ctx, reason),
    }
}

fn start_flow(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    start: StartFlow,
) -> Result<(), PipelineError> {
    if ctx.checkpoint.is_some() {
        warn!(flow = %start.flow_name, "Duplicate start for existing flow ignored");
        ctx.discard("flow already exists");
        return Ok(());
    }
    if !processor.flows().contains(&start.flow_name) {
        return Err(PipelineError::fatal(format!(
            "no flow registered as '{}'",
            start.flow_name
        )));
    }

    info!(flow = %start.flow_name, "Flow created");
    ctx.checkpoint = Some(Checkpoint::new(
        ctx.event.flow_key.clone(),
        start.flow_name,
        StartContext {
            args: start.args,
            initiated_by: None,
        },
        ctx.now,
    ));
    Ok(())
}

fn session_event(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    event: SessionEvent,
) -> Result<(), PipelineError> {
    let now = ctx.now;

    if ctx.checkpoint.is_none() {
        let SessionPayload::Init { protocol, .. } = &event.payload else {
            ctx.discard("session message for a flow without checkpoint");
            return Ok(());
        };
        if !processor.flows().contains(protocol) {
            warn!(
                session_id = %event.session_id,
                protocol = %protocol,
                "Session init for unknown protocol rejected"
            );
            let rejection = SessionEvent {
                sequence: 0,
                received_sequence: event.sequence,
                payload: SessionPayload::Error {
                    error: FlowException::session(format!(
                        "no responder flow registered for protocol '{}'",
                        protocol
                    )),
                },
                timestamp: now,
                ..event.clone()
            };
            ctx.push_session_events([rejection]);
            ctx.discard("unknown protocol");
            return Ok(());
        }

        let mut checkpoint = Checkpoint::new(
            ctx.event.flow_key.clone(),
            protocol.clone(),
            StartContext::default(),
            now,
        );
        let (initiated_by, ack) = processor.sessions.accept(&mut checkpoint, &event, now)?;
        info!(
            session_id = %event.session_id,
            protocol = %protocol,
            "Responder flow created"
        );
        checkpoint.start.initiated_by = Some(initiated_by);
        ctx.checkpoint = Some(checkpoint);
        ctx.push_session_events([ack]);
        return Ok(());
    }

    let mut replies = Vec::new();
    let result = processor
        .sessions
        .receive(ctx.checkpoint_mut()?, &event, now, &mut replies);
    ctx.push_session_events(replies);
    result
}

fn external_response(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    response: ExternalEventResponse,
) -> Result<(), PipelineError> {
    let now = ctx.now;
    let Some(checkpoint) = ctx.checkpoint.as_mut() else {
        ctx.discard("external response for a flow without checkpoint");
        return Ok(());
    };
    let resends = processor.correlator.ingest(checkpoint, &response, now)?;
    ctx.records.extend(resends);
    Ok(())
}

fn wakeup(processor: &FlowEventProcessor, ctx: &mut FlowEventContext) -> Result<(), PipelineError> {
    let now = ctx.now;
    let Some(checkpoint) = ctx.checkpoint.as_mut() else {
        ctx.discard("wakeup for a flow without checkpoint");
        return Ok(());
    };

    if checkpoint.timer_at.is_some_and(|at| at <= now) {
        checkpoint.timer_at = None;
    }
    let external = processor.correlator.check_timeouts(checkpoint, now)?;
    let mut session_events = processor.sessions.check_timeouts(checkpoint, now);
    session_events.extend(processor.sessions.due_resends(checkpoint, now));

    if !external.is_empty() || !session_events.is_empty() {
        debug!(
            external = external.len(),
            session = session_events.len(),
            "Deadlines processed"
        );
    }
    ctx.records.extend(external);
    ctx.push_session_events(session_events);
    Ok(())
}

fn kill(
    processor: &FlowEventProcessor,
    ctx: &mut FlowEventContext,
    reason: String,
) -> Result<(), PipelineError> {
    let now = ctx.now;
    let Some(checkpoint) = ctx.checkpoint.as_mut() else {
        ctx.discard("kill for a flow without checkpoint");
        return Ok(());
    };

    if !checkpoint.is_dead_lettered() {
        let error = FlowException::new(FlowExceptionKind::Killed, reason.clone());
        let session_events = processor.sessions.error_all(checkpoint, &error, now);
        let cancellations = processor.correlator.cancel_all(checkpoint, now);
        ctx.push_session_events(session_events);
        ctx.records.extend(cancellations);
        ctx.push_session_cleanups();
    }

    info!(reason = %reason, "Flow killed");
    ctx.push_status(FlowStatus::Killed { reason });
    ctx.mark_for_deletion();
    Ok(())
}
