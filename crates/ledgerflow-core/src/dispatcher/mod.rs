// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waiting-for dispatch.
//!
//! A checkpoint's [`WaitingFor`] says what the suspended flow needs. For every
//! event the pipeline asks the handler registered for that variant whether the
//! need is met, getting back a [`FlowContinuation`]. Handlers only look at the
//! event and checkpoint bookkeeping (sessions, external requests, timers) and
//! never touch the fiber's own state. They must be safe to run again for the
//! same event after a crash.

mod handlers;

pub use handlers::{
    ExternalEventResponseHandler, SessionConfirmationHandler, SessionDataHandler, SleepHandler,
    StartHandler, WakeupHandler,
};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::PipelineError;
use crate::external::ExternalEventCorrelator;
use crate::model::{FlowContinuation, WaitingFor, WaitingForKind};
use crate::pipeline::FlowEventContext;
use crate::session::SessionManager;

/// Decides whether a suspended flow can run.
pub trait WaitingForHandler: Send + Sync {
    /// The variant this handler serves.
    fn kind(&self) -> WaitingForKind;

    /// Evaluate `waiting_for` against the current event.
    fn run_or_continue(
        &self,
        ctx: &mut FlowEventContext,
        waiting_for: &WaitingFor,
    ) -> Result<FlowContinuation, PipelineError>;
}

/// Handlers by waiting-for kind, built once at startup.
#[derive(Default, Clone)]
pub struct WaitingForDispatcher {
    handlers: HashMap<WaitingForKind, Arc<dyn WaitingForHandler>>,
}

impl std::fmt::Debug for WaitingForDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&WaitingForKind> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("WaitingForDispatcher")
            .field("handlers", &kinds)
            .finish()
    }
}

impl WaitingForDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with every built-in handler registered.
    pub fn with_default_handlers(
        sessions: SessionManager,
        correlator: ExternalEventCorrelator,
    ) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Arc::new(StartHandler));
        dispatcher.register(Arc::new(WakeupHandler));
        dispatcher.register(Arc::new(SessionConfirmationHandler::new(sessions.clone())));
        dispatcher.register(Arc::new(SessionDataHandler::new(sessions)));
        dispatcher.register(Arc::new(ExternalEventResponseHandler::new(correlator)));
        dispatcher.register(Arc::new(SleepHandler));
        dispatcher
    }

    /// Register a handler for its kind, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn WaitingForHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Check that every waiting-for kind has a handler.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let missing: Vec<&str> = WaitingForKind::ALL
            .iter()
            .filter(|kind| !self.handlers.contains_key(*kind))
            .map(|kind| kind.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::fatal(format!(
                "no waiting-for handler registered for: {}",
                missing.join(", ")
            )))
        }
    }

    /// Evaluate the context's checkpoint against its event.
    pub fn run_or_continue(
        &self,
        ctx: &mut FlowEventContext,
    ) -> Result<FlowContinuation, PipelineError> {
        let waiting_for = ctx.checkpoint_mut()?.waiting_for.clone();
        let handler = self.handlers.get(&waiting_for.kind()).ok_or_else(|| {
            PipelineError::fatal(format!(
                "no waiting-for handler registered for {}",
                waiting_for.kind()
            ))
        })?;

        let continuation = handler.run_or_continue(ctx, &waiting_for)?;
        debug!(
            flow_id = %ctx.event.flow_key.flow_id,
            waiting_for = %waiting_for.kind(),
            invokes_fiber = continuation.invokes_fiber(),
            "Waiting-for evaluated"
        );
        Ok(continuation)
    }
}
