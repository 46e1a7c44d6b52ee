// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ledgerflow Core - Durable Flow Execution Engine
//!
//! This crate runs long-lived business flows that talk to counterparties over
//! sessions and to external subsystems over request/response topics, and that
//! survive crashes by checkpointing after every event.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                 Service layer (RPC, P2P transport, broker)                │
//! └──────────────────────────────────────────────────────────────────────────┘
//!        │ start / kill / responses            ▲ status, p2p.out, external.*
//!        ▼                                     │
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              FlowWorker                                   │
//! │   lanes partitioned by flow key / session id, CAS checkpoint writes       │
//! │                                                                           │
//! │  ┌─────────────────────────────┐        ┌───────────────────────────┐    │
//! │  │     FlowEventProcessor      │◄──────►│        FlowMapper          │    │
//! │  │ pre ▸ waiting-for ▸ fiber ▸ │ session│  session id ▸ flow key     │    │
//! │  │ post        ▸ hospital      │ events │                            │    │
//! │  └─────────────────────────────┘        └───────────────────────────┘    │
//! │           │ fiber lane                                                    │
//! │           ▼                                                               │
//! │  ┌─────────────────────────────┐                                          │
//! │  │ TaskManager (fiber, long-   │                                          │
//! │  │ running, scheduled lanes)   │                                          │
//! │  └─────────────────────────────┘                                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//! ┌───────────────────────┐
//! │    CheckpointStore    │
//! │ memory/SQLite/Postgres│
//! └───────────────────────┘
//! ```
//!
//! # Processing model
//!
//! Every inbound [`FlowEvent`](model::FlowEvent) is processed to completion
//! against one [`Checkpoint`](model::Checkpoint):
//!
//! | Stage | Component | Effect |
//! |-------|-----------|--------|
//! | Pre-process | [`pipeline`] | dedup by offset, create flow, apply session/external/timer bookkeeping |
//! | Evaluate | [`dispatcher`] | decide `Continue`, `Run(resume)` or `Error(exception)` |
//! | Invoke | [`fiber`] | run one business-logic step until its next suspension |
//! | Post-process | [`pipeline`] | turn the suspension request into records and waiting-for |
//! | Triage | [`hospital`] | fatal → dead letter, abort → publish partial, transient → retry |
//!
//! Output records are published only after the checkpoint write succeeded, so
//! a crash between the two replays the event, which the stored sequence
//! turns into a no-op.
//!
//! # Writing flows
//!
//! Business logic implements [`SerdeFlow`](fiber::SerdeFlow) (or the lower
//! level [`FlowLogic`](fiber::FlowLogic) / [`FlowFactory`](fiber::FlowFactory)
//! pair). A step receives how it was resumed and returns the next
//! [`FlowIORequest`](model::FlowIORequest):
//!
//! | Request | Resumed with |
//! |---------|--------------|
//! | `InitiateSessions` | `Unit` once every session is confirmed |
//! | `Send` | `Unit` |
//! | `Receive` / `SendAndReceive` | `SessionData` with one payload per session |
//! | `CloseSessions` | `Unit` once every session is closed |
//! | `ExternalEvent` | `ExternalResponse`, or an error after retries time out |
//! | `Sleep` | `Unit` after the duration |
//! | `ForceCheckpoint` | `Unit` |
//! | `Finished` / `Failed` | never; the flow is removed |
//!
//! # Storage
//!
//! | Backend | Feature |
//! |---------|---------|
//! | [`persistence::InMemoryCheckpointStore`] | always |
//! | `persistence::SqliteCheckpointStore` | `sqlite` (default) |
//! | `persistence::PostgresCheckpointStore` | `postgres` |
//!
//! # Configuration
//!
//! [`config::Config::from_env`] reads `LEDGERFLOW_*` variables; see
//! [`config`] for the full list.

#![deny(missing_docs)]

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod external;
pub mod fiber;
pub mod hospital;
pub mod migrations;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod session;
pub mod task_manager;
pub mod telemetry;
pub mod worker;

pub use bus::{InMemoryRecordSink, Record, RecordSink, Topic};
pub use config::{Config, EngineConfig};
pub use error::{CoreError, ErrorCategory, PipelineError};
pub use fiber::{FlowContext, FlowRegistry, SerdeFlow};
pub use model::{FlowEvent, FlowIORequest, FlowKey, HoldingIdentity, Payload, SessionId};
pub use persistence::{CheckpointStore, InMemoryCheckpointStore};
pub use worker::{FlowWorker, FlowWorkerBuilder};
