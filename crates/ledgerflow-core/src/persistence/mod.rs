// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable storage for checkpoints, mapper state and dead letters.
//!
//! Every write of a checkpoint is a compare-and-set on its version. A writer
//! reads a [`StoredCheckpoint`], runs the pipeline, and writes back with the
//! version it read; if another writer got there first the write reports
//! [`PutOutcome::Conflict`] and the caller re-reads and replays the event.
//!
//! Backends:
//!
//! | Backend | Feature | Use |
//! |---------|---------|-----|
//! | [`InMemoryCheckpointStore`] | always | tests and single-process deployments |
//! | [`SqliteCheckpointStore`] | `sqlite` (default) | embedded deployments |
//! | [`PostgresCheckpointStore`] | `postgres` | clustered deployments |

mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use self::memory::InMemoryCheckpointStore;
#[cfg(feature = "postgres")]
pub use self::postgres::PostgresCheckpointStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteCheckpointStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::hospital::DeadLetter;
use crate::model::{Checkpoint, FlowKey, SessionId};
use crate::session::FlowMapperState;

/// A checkpoint together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCheckpoint {
    /// Row version, bumped on every write.
    pub version: u64,
    /// The checkpoint.
    pub checkpoint: Checkpoint,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Written; carries the new version.
    Written(u64),
    /// The stored version did not match the expected one.
    Conflict,
}

impl PutOutcome {
    /// Whether the write lost the race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

/// Persistence interface used by the worker and the flow mapper.
///
/// `expected` is the version the caller read; `None` means the caller saw no
/// row and the write must create one.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read a flow's checkpoint.
    async fn get(&self, key: &FlowKey) -> Result<Option<StoredCheckpoint>, CoreError>;

    /// Conditionally write a flow's checkpoint.
    async fn put(
        &self,
        key: &FlowKey,
        checkpoint: &Checkpoint,
        expected: Option<u64>,
    ) -> Result<PutOutcome, CoreError>;

    /// Conditionally delete a flow's checkpoint.
    ///
    /// Deleting a row that does not exist with `expected = None` succeeds.
    async fn delete(&self, key: &FlowKey, expected: Option<u64>) -> Result<PutOutcome, CoreError>;

    /// Keys of every stored checkpoint, used for recovery on startup.
    async fn list_flow_keys(&self) -> Result<Vec<FlowKey>, CoreError>;

    /// Read the routing state of one session end.
    async fn get_mapper_state(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<FlowMapperState>, CoreError>;

    /// Insert or replace the routing state of one session end.
    async fn put_mapper_state(
        &self,
        session_id: &SessionId,
        state: &FlowMapperState,
    ) -> Result<(), CoreError>;

    /// Remove the routing state of one session end.
    async fn delete_mapper_state(&self, session_id: &SessionId) -> Result<(), CoreError>;

    /// Append a dead letter.
    async fn put_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), CoreError>;

    /// Dead letters for one flow, oldest first.
    async fn list_dead_letters(&self, key: &FlowKey) -> Result<Vec<DeadLetter>, CoreError>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<bool, CoreError>;
}

/// Open the store named by a database URL.
///
/// `None` selects the in-memory store. `sqlite:` URLs need the `sqlite`
/// feature and `postgres://` URLs the `postgres` feature.
pub async fn connect(database_url: Option<&str>) -> Result<Arc<dyn CheckpointStore>, CoreError> {
    let Some(url) = database_url else {
        return Ok(Arc::new(InMemoryCheckpointStore::new()));
    };

    #[cfg(feature = "sqlite")]
    if url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteCheckpointStore::connect(url).await?));
    }

    #[cfg(feature = "postgres")]
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return Ok(Arc::new(PostgresCheckpointStore::connect(url).await?));
    }

    Err(CoreError::ValidationError {
        field: "database_url".to_string(),
        message: format!("unsupported database URL scheme in '{}'", url),
    })
}
