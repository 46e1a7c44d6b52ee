// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed checkpoint store.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{CheckpointStore, PutOutcome, StoredCheckpoint};
use crate::error::CoreError;
use crate::hospital::DeadLetter;
use crate::migrations::SQLITE as MIGRATOR;
use crate::model::{Checkpoint, FlowKey, HoldingIdentity, SessionId};
use crate::session::FlowMapperState;

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    version: i64,
    state: Vec<u8>,
}

#[derive(sqlx::FromRow)]
struct FlowKeyRow {
    flow_id: String,
    x500_name: String,
    group_id: String,
}

/// SQLite-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// the embedded migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteCheckpointStore::from_path(".data/flows.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a SQLite URL and run the embedded migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        // Every connection to an in-memory database opens a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or(0)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, key: &FlowKey) -> Result<Option<StoredCheckpoint>, CoreError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT version, state
            FROM flow_checkpoints
            WHERE flow_key = ?
            "#,
        )
        .bind(key.storage_key())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Checkpoint::from_bytes(&row.state).map(|checkpoint| StoredCheckpoint {
                version: from_version(row.version),
                checkpoint,
            })
        })
        .transpose()
    }

    async fn put(
        &self,
        key: &FlowKey,
        checkpoint: &Checkpoint,
        expected: Option<u64>,
    ) -> Result<PutOutcome, CoreError> {
        let state = checkpoint.to_bytes()?;
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO flow_checkpoints (flow_key, flow_id, x500_name, group_id, version, state, updated_at)
                    VALUES (?, ?, ?, ?, 1, ?, CURRENT_TIMESTAMP)
                    ON CONFLICT (flow_key) DO NOTHING
                    "#,
                )
                .bind(key.storage_key())
                .bind(&key.flow_id)
                .bind(&key.identity.x500_name)
                .bind(&key.identity.group_id)
                .bind(&state)
                .execute(&self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query(
                    r#"
                    UPDATE flow_checkpoints
                    SET version = version + 1, state = ?, updated_at = CURRENT_TIMESTAMP
                    WHERE flow_key = ? AND version = ?
                    "#,
                )
                .bind(&state)
                .bind(key.storage_key())
                .bind(to_version(version))
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Ok(PutOutcome::Conflict);
        }
        Ok(PutOutcome::Written(expected.map_or(1, |v| v + 1)))
    }

    async fn delete(&self, key: &FlowKey, expected: Option<u64>) -> Result<PutOutcome, CoreError> {
        let Some(version) = expected else {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM flow_checkpoints WHERE flow_key = ?")
                    .bind(key.storage_key())
                    .fetch_optional(&self.pool)
                    .await?;
            return Ok(if exists.is_some() {
                PutOutcome::Conflict
            } else {
                PutOutcome::Written(0)
            });
        };

        let result = sqlx::query("DELETE FROM flow_checkpoints WHERE flow_key = ? AND version = ?")
            .bind(key.storage_key())
            .bind(to_version(version))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(PutOutcome::Conflict);
        }
        Ok(PutOutcome::Written(version))
    }

    async fn list_flow_keys(&self) -> Result<Vec<FlowKey>, CoreError> {
        let rows = sqlx::query_as::<_, FlowKeyRow>(
            r#"
            SELECT flow_id, x500_name, group_id
            FROM flow_checkpoints
            ORDER BY flow_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FlowKey::new(row.flow_id, HoldingIdentity::new(row.x500_name, row.group_id)))
            .collect())
    }

    async fn get_mapper_state(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<FlowMapperState>, CoreError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT state FROM flow_mapper_states WHERE session_id = ?")
                .bind(session_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(state,)| serde_json::from_slice(&state).map_err(CoreError::from))
            .transpose()
    }

    async fn put_mapper_state(
        &self,
        session_id: &SessionId,
        state: &FlowMapperState,
    ) -> Result<(), CoreError> {
        let encoded = serde_json::to_vec(state)?;
        sqlx::query(
            r#"
            INSERT INTO flow_mapper_states (session_id, state, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (session_id) DO UPDATE
            SET state = excluded.state, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(session_id.as_str())
        .bind(encoded)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_mapper_state(&self, session_id: &SessionId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM flow_mapper_states WHERE session_id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), CoreError> {
        let letter = serde_json::to_vec(dead_letter)?;
        sqlx::query(
            r#"
            INSERT INTO dead_letters (flow_key, category, letter, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(dead_letter.flow_key.storage_key())
        .bind(dead_letter.category.as_str())
        .bind(letter)
        .bind(dead_letter.dead_lettered_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_dead_letters(&self, key: &FlowKey) -> Result<Vec<DeadLetter>, CoreError> {
        let rows: Vec<(Vec<u8>,)> =
            sqlx::query_as("SELECT letter FROM dead_letters WHERE flow_key = ? ORDER BY id")
                .bind(key.storage_key())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(letter,)| serde_json::from_slice(&letter).map_err(CoreError::from))
            .collect()
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
