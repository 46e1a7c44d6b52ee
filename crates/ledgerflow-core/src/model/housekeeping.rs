// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation fiber bookkeeping.

use serde::{Serialize, Serializer};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{Checkpoint, FlowContinuation, FlowIORequest};
use crate::error::PipelineError;
use crate::fiber::FiberOutcome;

/// State of exactly one fiber invocation.
///
/// Pairs the checkpoint with the continuation to apply, the request the fiber
/// last suspended on, and the channel its next request arrives on. It lives in
/// memory only; serializing it always fails.
pub struct HousekeepingState {
    /// Checkpoint the fiber is resumed from.
    pub checkpoint: Checkpoint,
    /// Continuation to apply.
    pub continuation: FlowContinuation,
    /// The fiber's last suspension request.
    pub suspended_on: Option<FlowIORequest>,
    next_request: Option<oneshot::Receiver<Result<FiberOutcome, PipelineError>>>,
}

impl HousekeepingState {
    /// Prepare an invocation.
    pub fn new(checkpoint: Checkpoint, continuation: FlowContinuation) -> Self {
        let suspended_on = checkpoint.suspended_on.clone();
        Self {
            checkpoint,
            continuation,
            suspended_on,
            next_request: None,
        }
    }

    pub(crate) fn attach(&mut self, rx: oneshot::Receiver<Result<FiberOutcome, PipelineError>>) {
        self.next_request = Some(rx);
    }

    /// Whether a fiber invocation is in flight.
    pub fn is_attached(&self) -> bool {
        self.next_request.is_some()
    }

    /// Wait for the fiber's next suspension request.
    ///
    /// Returns an abort error when `cancel` fires first; the fiber's result is
    /// then dropped unobserved.
    pub async fn next_request(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<FiberOutcome, PipelineError> {
        let rx = self
            .next_request
            .take()
            .ok_or_else(|| PipelineError::fatal("fiber was not resumed before awaiting its outcome"))?;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(PipelineError::abort(format!(
                "flow {} killed during fiber invocation",
                self.checkpoint.flow_key
            ))),

            outcome = rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(PipelineError::transient("fiber lane dropped the invocation")),
            },
        }
    }
}

impl std::fmt::Debug for HousekeepingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HousekeepingState")
            .field("flow_key", &self.checkpoint.flow_key)
            .field("continuation", &self.continuation)
            .field("suspended_on", &self.suspended_on)
            .field("in_flight", &self.next_request.is_some())
            .finish()
    }
}

impl Serialize for HousekeepingState {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom(
            "HousekeepingState is transient and must never be serialized",
        ))
    }
}
