// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in waiting-for handlers, one per [`WaitingForKind`].

use super::WaitingForHandler;
use crate::error::PipelineError;
use crate::external::ExternalEventCorrelator;
use crate::model::{FlowContinuation, Resume, WaitingFor, WaitingForKind};
use crate::pipeline::FlowEventContext;
use crate::session::SessionManager;

/// Runs a flow that has never been started.
#[derive(Debug, Default)]
pub struct StartHandler;

impl WaitingForHandler for StartHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::Start
    }

    fn run_or_continue(
        &self,
        ctx: &mut FlowEventContext,
        _waiting_for: &WaitingFor,
    ) -> Result<FlowContinuation, PipelineError> {
        let checkpoint = ctx.checkpoint_mut()?;
        Ok(FlowContinuation::Run(Resume::Start {
            args: checkpoint.start.args.clone(),
            initiated_by: checkpoint.start.initiated_by.clone(),
        }))
    }
}

/// Resumes on any event, raising a pending error if one was recorded.
#[derive(Debug, Default)]
pub struct WakeupHandler;

impl WaitingForHandler for WakeupHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::Wakeup
    }

    fn run_or_continue(
        &self,
        ctx: &mut FlowEventContext,
        _waiting_for: &WaitingFor,
    ) -> Result<FlowContinuation, PipelineError> {
        let checkpoint = ctx.checkpoint_mut()?;
        Ok(match checkpoint.pending_error.take() {
            Some(error) => FlowContinuation::Error(error),
            None => FlowContinuation::Run(Resume::Unit),
        })
    }
}

/// Waits until sessions are confirmed or closed.
#[derive(Debug, Clone)]
pub struct SessionConfirmationHandler {
    sessions: SessionManager,
}

impl SessionConfirmationHandler {
    /// Create the handler.
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }
}

impl WaitingForHandler for SessionConfirmationHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::SessionConfirmation
    }

    fn run_or_continue(
        &self,
        ctx: &mut FlowEventContext,
        waiting_for: &WaitingFor,
    ) -> Result<FlowContinuation, PipelineError> {
        let checkpoint = ctx.checkpoint_mut()?;
        Ok(match self.sessions.confirmed(checkpoint, waiting_for) {
            Ok(true) => FlowContinuation::Run(Resume::Unit),
            Ok(false) => FlowContinuation::Continue,
            Err(error) => FlowContinuation::Error(error),
        })
    }
}

/// Waits for one message from every listed session.
#[derive(Debug, Clone)]
pub struct SessionDataHandler {
    sessions: SessionManager,
}

impl SessionDataHandler {
    /// Create the handler.
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }
}

impl WaitingForHandler for SessionDataHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::SessionData
    }

    fn run_or_continue(
        &self,
        ctx: &mut FlowEventContext,
        waiting_for: &WaitingFor,
    ) -> Result<FlowContinuation, PipelineError> {
        let checkpoint = ctx.checkpoint_mut()?;
        Ok(
            match self.sessions.take_data(checkpoint, waiting_for.session_ids()) {
                Ok(Some(messages)) => FlowContinuation::Run(Resume::SessionData(messages)),
                Ok(None) => FlowContinuation::Continue,
                Err(error) => FlowContinuation::Error(error),
            },
        )
    }
}

/// Waits for an external event request to reach a terminal state.
#[derive(Debug, Clone)]
pub struct ExternalEventResponseHandler {
    correlator: ExternalEventCorrelator,
}

impl ExternalEventResponseHandler {
    /// Create the handler.
    pub fn new(correlator: ExternalEventCorrelator) -> Self {
        Self { correlator }
    }
}

impl WaitingForHandler for ExternalEventResponseHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::ExternalEventResponse
    }

    fn run_or_continue(
        &self,
        ctx: &mut FlowEventContext,
        waiting_for: &WaitingFor,
    ) -> Result<FlowContinuation, PipelineError> {
        let WaitingFor::ExternalEventResponse { request_id } = waiting_for else {
            return Err(PipelineError::fatal(format!(
                "external event handler called for {}",
                waiting_for.kind()
            )));
        };
        let checkpoint = ctx.checkpoint_mut()?;
        self.correlator.take_result(checkpoint, request_id)
    }
}

/// Resumes once the sleep deadline has passed.
#[derive(Debug, Default)]
pub struct SleepHandler;

impl WaitingForHandler for SleepHandler {
    fn kind(&self) -> WaitingForKind {
        WaitingForKind::Sleep
    }

    fn run_or_continue(
        &self,
        ctx: &mut FlowEventContext,
        waiting_for: &WaitingFor,
    ) -> Result<FlowContinuation, PipelineError> {
        Ok(match waiting_for {
            WaitingFor::Sleep { wake_at } if *wake_at <= ctx.now => {
                FlowContinuation::Run(Resume::Unit)
            }
            _ => FlowContinuation::Continue,
        })
    }
}
