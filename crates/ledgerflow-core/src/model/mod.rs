// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by every engine component.
//!
//! Identities, the durable [`Checkpoint`], the [`WaitingFor`] suspension reason,
//! [`FlowContinuation`] and the fiber's [`FlowIORequest`].

pub mod checkpoint;
pub mod continuation;
pub mod events;
pub mod housekeeping;
pub mod io_request;
pub mod waiting_for;

pub use checkpoint::{Checkpoint, FlowState, RetryState, StartContext};
pub use continuation::{FlowContinuation, FlowException, FlowExceptionKind, InitiatedBy, Resume};
pub use events::{
    EventEnvelope, FlowEvent, FlowEventKind, FlowStatus, FlowStatusRecord, StartFlow,
};
pub use housekeeping::HousekeepingState;
pub use io_request::{FlowIORequest, SessionInit};
pub use waiting_for::{ConfirmationKind, WaitingFor, WaitingForKind};

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Suffix marking the initiated end of a session.
pub const INITIATED_SUFFIX: &str = "-INITIATED";

/// Identity of a virtual node: an X.500 name within a membership group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HoldingIdentity {
    /// X.500 distinguished name of the party.
    pub x500_name: String,
    /// Membership group the party belongs to.
    pub group_id: String,
}

impl HoldingIdentity {
    /// Create a holding identity.
    pub fn new(x500_name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            x500_name: x500_name.into(),
            group_id: group_id.into(),
        }
    }
}

impl fmt::Display for HoldingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.x500_name, self.group_id)
    }
}

/// Unique, immutable identity of one flow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    /// Flow instance id.
    pub flow_id: String,
    /// Party the flow runs for.
    pub identity: HoldingIdentity,
}

impl FlowKey {
    /// Create a flow key.
    pub fn new(flow_id: impl Into<String>, identity: HoldingIdentity) -> Self {
        Self {
            flow_id: flow_id.into(),
            identity,
        }
    }

    /// Stable storage key (`flow_id@x500/group`).
    pub fn storage_key(&self) -> String {
        self.to_string()
    }

    /// Stable 64-bit hash used to pick the owning partition.
    pub fn partition_hash(&self) -> u64 {
        stable_hash(self.storage_key().as_bytes())
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.flow_id, self.identity)
    }
}

/// Session identifier as seen by one end of the session.
///
/// The initiating end uses the bare id, the initiated end the id with
/// [`INITIATED_SUFFIX`] appended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a session id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id names the initiated end.
    pub fn is_initiated(&self) -> bool {
        self.0.ends_with(INITIATED_SUFFIX)
    }

    /// The id the other end uses for the same session.
    pub fn counterpart(&self) -> SessionId {
        match self.0.strip_suffix(INITIATED_SUFFIX) {
            Some(base) => SessionId(base.to_string()),
            None => SessionId(format!("{}{}", self.0, INITIATED_SUFFIX)),
        }
    }

    /// Stable 64-bit hash used to pick the owning mapper partition.
    pub fn partition_hash(&self) -> u64 {
        stable_hash(self.0.as_bytes())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId::new(value)
    }
}

/// Opaque byte blob, base64-encoded when serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    /// Borrow the bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload(value.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload(value.as_bytes().to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Payload)
            .map_err(serde::de::Error::custom)
    }
}

/// First eight bytes of the SHA-256 digest, big-endian.
pub(crate) fn stable_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
