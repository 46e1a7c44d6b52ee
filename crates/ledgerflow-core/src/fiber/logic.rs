// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Business-logic contracts.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PipelineError;
use crate::model::{FlowException, FlowIORequest, FlowKey, Payload, Resume, SessionId};

/// Environment handed to a flow step.
///
/// The only engine facilities a step may touch. Ids are derived from a counter
/// stored in the checkpoint, so a replayed step produces the same ids.
#[derive(Debug, Clone)]
pub struct FlowContext {
    flow_key: FlowKey,
    id_counter: u64,
}

impl FlowContext {
    /// Context for one step of `flow_key`, continuing from `id_counter`.
    pub fn new(flow_key: FlowKey, id_counter: u64) -> Self {
        Self {
            flow_key,
            id_counter,
        }
    }

    /// The flow being run.
    pub fn flow_key(&self) -> &FlowKey {
        &self.flow_key
    }

    /// Fresh session id, unique within the flow.
    pub fn new_session_id(&mut self) -> SessionId {
        let n = self.next();
        SessionId::new(format!("{}-s{}", self.flow_key.flow_id, n))
    }

    /// Fresh external request id, unique within the flow.
    pub fn new_request_id(&mut self) -> String {
        let n = self.next();
        format!("{}-r{}", self.flow_key.flow_id, n)
    }

    /// Counter value to store back into the checkpoint.
    pub fn id_counter(&self) -> u64 {
        self.id_counter
    }

    fn next(&mut self) -> u64 {
        self.id_counter += 1;
        self.id_counter
    }
}

/// A flow's business state machine.
///
/// Each call to [`step`](Self::step) receives the result of the previous
/// suspension and returns the next one. The engine snapshots the logic after
/// every step that does not end the flow.
pub trait FlowLogic: Send {
    /// Advance the flow.
    ///
    /// Returning `Err` fails the flow with that exception.
    fn step(
        &mut self,
        ctx: &mut FlowContext,
        input: Result<Resume, FlowException>,
    ) -> Result<FlowIORequest, FlowException>;

    /// Serialize the logic's state.
    fn snapshot(&self) -> Result<Payload, PipelineError>;
}

/// Creates and restores one kind of flow.
pub trait FlowFactory: Send + Sync {
    /// New instance for a flow about to start.
    fn start(&self, args: &Payload) -> Result<Box<dyn FlowLogic>, FlowException>;

    /// Instance restored from a snapshot.
    fn restore(&self, state: &Payload) -> Result<Box<dyn FlowLogic>, PipelineError>;
}

/// A flow whose whole state is serde-serializable.
///
/// Register with [`FlowRegistry::register_serde`](super::FlowRegistry::register_serde);
/// snapshots are the JSON encoding of the value.
pub trait SerdeFlow: Serialize + DeserializeOwned + Send + 'static {
    /// Build the initial state from the start arguments.
    fn start(args: &Payload) -> Result<Self, FlowException>;

    /// Advance the flow. Same contract as [`FlowLogic::step`].
    fn step(
        &mut self,
        ctx: &mut FlowContext,
        input: Result<Resume, FlowException>,
    ) -> Result<FlowIORequest, FlowException>;
}

struct SerdeLogic<T>(T);

impl<T: SerdeFlow> FlowLogic for SerdeLogic<T> {
    fn step(
        &mut self,
        ctx: &mut FlowContext,
        input: Result<Resume, FlowException>,
    ) -> Result<FlowIORequest, FlowException> {
        self.0.step(ctx, input)
    }

    fn snapshot(&self) -> Result<Payload, PipelineError> {
        serde_json::to_vec(&self.0)
            .map(Payload::from)
            .map_err(|e| PipelineError::fatal(format!("flow state is not serializable: {}", e)))
    }
}

/// Factory for a [`SerdeFlow`].
pub(crate) struct SerdeFlowFactory<T>(PhantomData<fn() -> T>);

impl<T> SerdeFlowFactory<T> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: SerdeFlow> FlowFactory for SerdeFlowFactory<T> {
    fn start(&self, args: &Payload) -> Result<Box<dyn FlowLogic>, FlowException> {
        Ok(Box::new(SerdeLogic(T::start(args)?)))
    }

    fn restore(&self, state: &Payload) -> Result<Box<dyn FlowLogic>, PipelineError> {
        let value: T = serde_json::from_slice(state.as_bytes())
            .map_err(|e| PipelineError::fatal(format!("corrupt flow state: {}", e)))?;
        Ok(Box::new(SerdeLogic(value)))
    }
}
