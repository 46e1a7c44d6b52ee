// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routing of session messages between flows and across the network boundary.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::manager::chrono_duration;
use super::{FlowMapperState, MapperEvent, MapperStatus, SessionEvent, SessionPayload};
use crate::bus::{Record, RecordPayload, Topic};
use crate::error::CoreError;
use crate::model::{FlowEvent, FlowEventKind, FlowKey, HoldingIdentity, SessionId};
use crate::persistence::CheckpointStore;

/// Deterministic flow id of the responder flow created by a session.
///
/// Derived from the initiated session id so a redelivered INIT maps to the same flow.
pub fn initiated_flow_id(session_id: &SessionId) -> String {
    let digest = Sha256::digest(session_id.as_str().as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// Per-session router.
///
/// Keeps one [`FlowMapperState`] per session end so inbound messages can be
/// addressed to the owning flow. Events for one session id are processed
/// sequentially by the worker lane that owns the id.
pub struct FlowMapper {
    store: Arc<dyn CheckpointStore>,
    local_identities: HashSet<HoldingIdentity>,
    cleanup_delay: Duration,
}

impl std::fmt::Debug for FlowMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowMapper")
            .field("store", &"...")
            .field("local_identities", &self.local_identities)
            .field("cleanup_delay", &self.cleanup_delay)
            .finish()
    }
}

impl FlowMapper {
    /// Create a mapper.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        local_identities: impl IntoIterator<Item = HoldingIdentity>,
        cleanup_delay: Duration,
    ) -> Self {
        Self {
            store,
            local_identities: local_identities.into_iter().collect(),
            cleanup_delay,
        }
    }

    /// Whether the identity is hosted by this node.
    pub fn is_local(&self, identity: &HoldingIdentity) -> bool {
        self.local_identities.contains(identity)
    }

    /// Process one mapper event into output records.
    #[instrument(skip(self, event), fields(session_id = %event.session_id()))]
    pub async fn process(
        &self,
        event: MapperEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, CoreError> {
        match event {
            MapperEvent::Outbound { flow_key, event } => self.outbound(flow_key, event).await,
            MapperEvent::Inbound { event } => self.inbound(event).await,
            MapperEvent::ScheduleCleanup { session_id } => {
                self.schedule_cleanup(session_id, now).await
            }
            MapperEvent::ExecuteCleanup { session_id } => {
                self.execute_cleanup(session_id, now).await
            }
        }
    }

    async fn outbound(&self, flow_key: FlowKey, event: SessionEvent) -> Result<Vec<Record>, CoreError> {
        // 1. Track the sending end
        match &event.payload {
            SessionPayload::Init { .. } => {
                if self.store.get_mapper_state(&event.session_id).await?.is_none() {
                    self.store
                        .put_mapper_state(
                            &event.session_id,
                            &FlowMapperState {
                                flow_key,
                                status: MapperStatus::Open,
                                expiry: None,
                            },
                        )
                        .await?;
                }
            }
            SessionPayload::Error { .. } => {
                self.set_status(&event.session_id, MapperStatus::Error).await?;
            }
            _ => {}
        }

        // 2. Route to the counterparty
        let delivered = event.flipped();
        let record = if self.is_local(event.peer()) {
            MapperEvent::Inbound { event: delivered }.into_record()
        } else {
            debug!(peer = %event.peer(), "Routing session message to P2P out");
            Record::new(
                Topic::P2pOut,
                delivered.session_id.to_string(),
                RecordPayload::SessionEvent(delivered),
            )
        };
        Ok(vec![record])
    }

    async fn inbound(&self, event: SessionEvent) -> Result<Vec<Record>, CoreError> {
        let flow_key = match self.store.get_mapper_state(&event.session_id).await? {
            Some(state) => {
                if matches!(event.payload, SessionPayload::Init { .. })
                    && state.status != MapperStatus::Open
                {
                    warn!(
                        flow_id = %state.flow_key.flow_id,
                        status = ?state.status,
                        "Session init for a finished responder dropped"
                    );
                    return Ok(Vec::new());
                }
                if matches!(event.payload, SessionPayload::Error { .. }) {
                    self.set_status(&event.session_id, MapperStatus::Error).await?;
                }
                state.flow_key
            }
            None => {
                if !matches!(event.payload, SessionPayload::Init { .. }) {
                    warn!(
                        payload = event.payload.name(),
                        "Session message without mapper state dropped"
                    );
                    return Ok(Vec::new());
                }
                let flow_key = FlowKey::new(
                    initiated_flow_id(&event.session_id),
                    event.owner().clone(),
                );
                self.store
                    .put_mapper_state(
                        &event.session_id,
                        &FlowMapperState {
                            flow_key: flow_key.clone(),
                            status: MapperStatus::Open,
                            expiry: None,
                        },
                    )
                    .await?;
                info!(flow_id = %flow_key.flow_id, "Session init creates responder flow");
                flow_key
            }
        };

        let flow_event = FlowEvent::new(flow_key, FlowEventKind::Session(event));
        Ok(vec![Record::flow_event(flow_event)])
    }

    async fn schedule_cleanup(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, CoreError> {
        let Some(mut state) = self.store.get_mapper_state(&session_id).await? else {
            return Ok(Vec::new());
        };
        let expiry = now + chrono_duration(self.cleanup_delay);
        state.status = MapperStatus::Closing;
        state.expiry = Some(expiry);
        self.store.put_mapper_state(&session_id, &state).await?;

        Ok(vec![
            MapperEvent::ExecuteCleanup { session_id }
                .into_record()
                .deliver_at(expiry),
        ])
    }

    async fn execute_cleanup(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, CoreError> {
        if let Some(state) = self.store.get_mapper_state(&session_id).await?
            && state.status == MapperStatus::Closing
            && state.expiry.is_some_and(|expiry| expiry <= now)
        {
            self.store.delete_mapper_state(&session_id).await?;
            debug!("Mapper state removed");
        }
        Ok(Vec::new())
    }

    async fn set_status(&self, session_id: &SessionId, status: MapperStatus) -> Result<(), CoreError> {
        if let Some(mut state) = self.store.get_mapper_state(session_id).await?
            && state.status != status
            && state.status != MapperStatus::Closing
        {
            state.status = status;
            self.store.put_mapper_state(session_id, &state).await?;
        }
        Ok(())
    }
}
