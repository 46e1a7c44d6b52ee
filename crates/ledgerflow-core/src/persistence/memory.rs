// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process checkpoint store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CheckpointStore, PutOutcome, StoredCheckpoint};
use crate::error::CoreError;
use crate::hospital::DeadLetter;
use crate::model::{Checkpoint, FlowKey, SessionId};
use crate::session::FlowMapperState;

#[derive(Debug, Default)]
struct Tables {
    checkpoints: HashMap<FlowKey, StoredCheckpoint>,
    mapper_states: HashMap<SessionId, FlowMapperState>,
    dead_letters: Vec<DeadLetter>,
}

/// Checkpoint store kept in memory; nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    tables: RwLock<Tables>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub async fn checkpoint_count(&self) -> usize {
        self.tables.read().await.checkpoints.len()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, key: &FlowKey) -> Result<Option<StoredCheckpoint>, CoreError> {
        Ok(self.tables.read().await.checkpoints.get(key).cloned())
    }

    async fn put(
        &self,
        key: &FlowKey,
        checkpoint: &Checkpoint,
        expected: Option<u64>,
    ) -> Result<PutOutcome, CoreError> {
        let mut tables = self.tables.write().await;
        let current = tables.checkpoints.get(key).map(|stored| stored.version);
        if current != expected {
            return Ok(PutOutcome::Conflict);
        }
        let version = current.map_or(1, |v| v + 1);
        tables.checkpoints.insert(
            key.clone(),
            StoredCheckpoint {
                version,
                checkpoint: checkpoint.clone(),
            },
        );
        Ok(PutOutcome::Written(version))
    }

    async fn delete(&self, key: &FlowKey, expected: Option<u64>) -> Result<PutOutcome, CoreError> {
        let mut tables = self.tables.write().await;
        let current = tables.checkpoints.get(key).map(|stored| stored.version);
        if current != expected {
            return Ok(PutOutcome::Conflict);
        }
        tables.checkpoints.remove(key);
        Ok(PutOutcome::Written(current.unwrap_or(0)))
    }

    async fn list_flow_keys(&self) -> Result<Vec<FlowKey>, CoreError> {
        let mut keys: Vec<FlowKey> = self.tables.read().await.checkpoints.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_mapper_state(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<FlowMapperState>, CoreError> {
        Ok(self.tables.read().await.mapper_states.get(session_id).cloned())
    }

    async fn put_mapper_state(
        &self,
        session_id: &SessionId,
        state: &FlowMapperState,
    ) -> Result<(), CoreError> {
        self.tables
            .write()
            .await
            .mapper_states
            .insert(session_id.clone(), state.clone());
        Ok(())
    }

    async fn delete_mapper_state(&self, session_id: &SessionId) -> Result<(), CoreError> {
        self.tables.write().await.mapper_states.remove(session_id);
        Ok(())
    }

    async fn put_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), CoreError> {
        self.tables.write().await.dead_letters.push(dead_letter.clone());
        Ok(())
    }

    async fn list_dead_letters(&self, key: &FlowKey) -> Result<Vec<DeadLetter>, CoreError> {
        Ok(self
            .tables
            .read()
            .await
            .dead_letters
            .iter()
            .filter(|letter| &letter.flow_key == key)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HoldingIdentity, StartContext};
    use chrono::Utc;

    fn key() -> FlowKey {
        FlowKey::new("f1", HoldingIdentity::new("O=Alice", "g"))
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(key(), "demo", StartContext::default(), Utc::now())
    }

    #[tokio::test]
    async fn test_put_requires_matching_version() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint();

        assert_eq!(store.put(&key(), &cp, None).await.unwrap(), PutOutcome::Written(1));
        assert!(store.put(&key(), &cp, None).await.unwrap().is_conflict());
        assert_eq!(store.put(&key(), &cp, Some(1)).await.unwrap(), PutOutcome::Written(2));
        assert!(store.put(&key(), &cp, Some(1)).await.unwrap().is_conflict());

        let stored = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_delete_is_conditional() {
        let store = InMemoryCheckpointStore::new();
        store.put(&key(), &checkpoint(), None).await.unwrap();

        assert!(store.delete(&key(), Some(7)).await.unwrap().is_conflict());
        assert!(!store.delete(&key(), Some(1)).await.unwrap().is_conflict());
        assert!(store.get(&key()).await.unwrap().is_none());
        // Already gone.
        assert!(!store.delete(&key(), None).await.unwrap().is_conflict());
    }
}
