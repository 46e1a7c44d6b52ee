// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow fibers: running one business-logic step between two suspensions.
//!
//! Flows are explicit state machines. A step receives the value (or exception)
//! for its last suspension and returns the next [`FlowIORequest`]; the engine
//! snapshots the logic and stores it in the checkpoint until the next event
//! resumes it.
//!
//! ```text
//! HousekeepingState ──resume──▶ fiber lane ──step──▶ FlowIORequest + snapshot
//!        ▲                                                   │
//!        └──────────────── next_request() ◀──────────────────┘
//! ```

mod logic;
mod registry;

pub use logic::{FlowContext, FlowFactory, FlowLogic, SerdeFlow};
pub use registry::FlowRegistry;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::model::{
    FlowException, FlowIORequest, FlowKey, HousekeepingState, Payload, Resume, StartContext,
};
use crate::task_manager::TaskManager;

/// Result of one fiber step.
#[derive(Debug, Clone, PartialEq)]
pub struct FiberOutcome {
    /// The fiber's next suspension request.
    pub request: FlowIORequest,
    /// Snapshot taken after the step; `None` when the flow ended.
    pub fiber_state: Option<Payload>,
    /// Id counter after the step.
    pub id_counter: u64,
}

/// Runs flow steps on the task manager's fiber lane.
#[derive(Debug, Clone)]
pub struct FlowFiber {
    registry: Arc<FlowRegistry>,
    tasks: TaskManager,
}

impl FlowFiber {
    /// Create a fiber runner.
    pub fn new(registry: Arc<FlowRegistry>, tasks: TaskManager) -> Self {
        Self { registry, tasks }
    }

    /// Registered flows.
    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Start the step described by `state` and attach its pending outcome.
    ///
    /// Does nothing for a `Continue` continuation. The outcome is collected
    /// with [`HousekeepingState::next_request`].
    pub fn resume(&self, mut state: HousekeepingState) -> HousekeepingState {
        let Some(input) = state.continuation.clone().into_input() else {
            return state;
        };

        let step = FiberStep {
            registry: self.registry.clone(),
            flow_key: state.checkpoint.flow_key.clone(),
            flow_name: state.checkpoint.flow_name.clone(),
            fiber_state: state.checkpoint.fiber_state.clone(),
            start: state.checkpoint.start.clone(),
            id_counter: state.checkpoint.id_counter,
            input,
        };
        debug!(
            flow_id = %step.flow_key.flow_id,
            flow = %step.flow_name,
            "Resuming fiber"
        );
        let rx = self
            .tasks
            .execute_fiber(&step.flow_key.to_string(), move || step.run());
        state.attach(rx);
        state
    }
}

struct FiberStep {
    registry: Arc<FlowRegistry>,
    flow_key: FlowKey,
    flow_name: String,
    fiber_state: Option<Payload>,
    start: StartContext,
    id_counter: u64,
    input: Result<Resume, FlowException>,
}

impl FiberStep {
    fn run(self) -> Result<FiberOutcome, PipelineError> {
        let factory = self.registry.get(&self.flow_name)?;
        let mut ctx = FlowContext::new(self.flow_key.clone(), self.id_counter);

        // 1. Obtain the logic: fresh for a start, restored otherwise
        let logic = match &self.fiber_state {
            Some(snapshot) => Ok(factory.restore(snapshot)?),
            None if matches!(self.input, Ok(Resume::Start { .. })) => {
                catch_panic(|| factory.start(&self.start.args))
            }
            None => {
                return Err(PipelineError::fatal(format!(
                    "flow {} has no state to resume",
                    self.flow_key
                )));
            }
        };

        // 2. Run the step; exceptions and panics end the flow
        let (request, logic) = match logic {
            Ok(mut logic) => {
                let result = catch_panic(|| logic.step(&mut ctx, self.input));
                (result, Some(logic))
            }
            Err(error) => (Err(error), None),
        };
        let request = request.unwrap_or_else(|error| {
            warn!(flow_id = %self.flow_key.flow_id, error = %error, "Flow raised an exception");
            FlowIORequest::Failed { error }
        });

        // 3. Snapshot unless the flow is over
        let fiber_state = match (&logic, request.is_terminal()) {
            (Some(logic), false) => Some(logic.snapshot()?),
            _ => None,
        };

        Ok(FiberOutcome {
            request,
            fiber_state,
            id_counter: ctx.id_counter(),
        })
    }
}

fn catch_panic<T>(f: impl FnOnce() -> Result<T, FlowException>) -> Result<T, FlowException> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic_info| {
        let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Err(FlowException::user(format!("flow panicked: {}", message)))
    })
}
