// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow factories by name.

use std::collections::HashMap;
use std::sync::Arc;

use super::logic::{FlowFactory, SerdeFlow, SerdeFlowFactory};
use crate::error::PipelineError;

/// Flow factories keyed by flow name, built once at startup.
///
/// Responder flows are registered under the protocol name initiators put in
/// their session `Init`.
#[derive(Default)]
pub struct FlowRegistry {
    factories: HashMap<String, Arc<dyn FlowFactory>>,
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flows", &self.names())
            .finish()
    }
}

impl FlowRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn FlowFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Register a serde-backed flow under `name`.
    pub fn register_serde<F: SerdeFlow>(&mut self, name: impl Into<String>) {
        self.register(name, Arc::new(SerdeFlowFactory::<F>::new()));
    }

    /// Builder-style [`register_serde`](Self::register_serde).
    pub fn with_serde<F: SerdeFlow>(mut self, name: impl Into<String>) -> Self {
        self.register_serde::<F>(name);
        self
    }

    /// Look up a factory. A missing flow is a deployment error.
    pub fn get(&self, name: &str) -> Result<Arc<dyn FlowFactory>, PipelineError> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::fatal(format!("no flow registered as '{}'", name)))
    }

    /// Whether a flow is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
