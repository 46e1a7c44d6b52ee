// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipeline tests driven through the public processor API, with the
//! checkpoint round-tripped through its stored encoding between events.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use common::*;
use ledgerflow_core::bus::{RecordPayload, Topic};
use ledgerflow_core::model::{
    Checkpoint, EventEnvelope, FlowEvent, FlowEventKind, FlowStatus, Payload, StartFlow,
    WaitingFor,
};
use ledgerflow_core::pipeline::{CheckpointAction, FlowEventProcessor};
use ledgerflow_core::task_manager::TaskManager;

fn processor() -> FlowEventProcessor {
    let engine = fast_engine();
    FlowEventProcessor::new(&engine, flows(), factories(), TaskManager::new(&engine))
        .expect("processor")
}

fn start_event(flow_id: &str, ms: &str) -> FlowEvent {
    FlowEvent::new(
        flow_key(flow_id),
        FlowEventKind::Start(StartFlow {
            flow_name: "sleep".to_string(),
            args: Payload::from(ms),
        }),
    )
}

/// Store and reload the way a persistent store does.
fn reload(checkpoint: &Checkpoint) -> Checkpoint {
    Checkpoint::from_bytes(&checkpoint.to_bytes().unwrap()).unwrap()
}

#[tokio::test]
async fn test_replayed_event_is_a_no_op() {
    let processor = processor();
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let envelope = EventEnvelope {
        offset: 10,
        event: start_event("replay-1", "1000"),
    };

    // 1. First delivery creates the flow
    let first = processor
        .process_at(envelope.clone(), None, &cancel, now)
        .await;
    let CheckpointAction::Put(checkpoint) = first.checkpoint else {
        panic!("expected put, got {:?}", first.checkpoint);
    };
    assert_eq!(checkpoint.sequence, 10);
    assert!(!first.records.is_empty());

    // 2. Redelivery after a crash between write and commit changes nothing
    let again = processor
        .process_at(envelope, Some(reload(&checkpoint)), &cancel, now)
        .await;
    assert_eq!(again.checkpoint, CheckpointAction::Unchanged);
    assert!(again.records.is_empty());
    assert!(again.hospital.is_none());
}

#[tokio::test]
async fn test_suspend_and_resume_across_reload() {
    let processor = processor();
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let key = flow_key("replay-2");

    // 1. Start: the flow suspends on a one second sleep with a timer
    let started = processor
        .process_at(
            EventEnvelope {
                offset: 1,
                event: start_event("replay-2", "1000"),
            },
            None,
            &cancel,
            now,
        )
        .await;
    let CheckpointAction::Put(checkpoint) = started.checkpoint else {
        panic!("expected put");
    };
    let wake_at = now + ChronoDuration::milliseconds(1000);
    assert_eq!(checkpoint.waiting_for, WaitingFor::Sleep { wake_at });
    let timer = started
        .records
        .iter()
        .find(|r| r.topic == Topic::FlowEvent)
        .expect("timer record");
    assert_eq!(timer.deliver_at, Some(wake_at));

    // 2. An early wakeup leaves the flow asleep and does not re-arm the timer
    let early = processor
        .process_at(
            EventEnvelope {
                offset: 2,
                event: FlowEvent::wakeup(key.clone()),
            },
            Some(reload(&checkpoint)),
            &cancel,
            now + ChronoDuration::milliseconds(10),
        )
        .await;
    let CheckpointAction::Put(checkpoint) = early.checkpoint else {
        panic!("expected put");
    };
    assert_eq!(checkpoint.sequence, 2);
    assert!(early.records.is_empty(), "{:?}", early.records);

    // 3. The due wakeup resumes the restored fiber, which finishes
    let done = processor
        .process_at(
            EventEnvelope {
                offset: 3,
                event: FlowEvent::wakeup(key.clone()),
            },
            Some(reload(&checkpoint)),
            &cancel,
            wake_at,
        )
        .await;
    assert_eq!(done.checkpoint, CheckpointAction::Delete);
    let completed = done.records.iter().any(|r| {
        matches!(
            &r.payload,
            RecordPayload::FlowStatus(status)
                if status.status == FlowStatus::Completed { result: Payload::from("rested") }
        )
    });
    assert!(completed, "{:?}", done.records);
}

#[tokio::test]
async fn test_out_of_order_offset_is_ignored() {
    let processor = processor();
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let key = flow_key("replay-3");

    let started = processor
        .process_at(
            EventEnvelope {
                offset: 50,
                event: start_event("replay-3", "1000"),
            },
            None,
            &cancel,
            now,
        )
        .await;
    let CheckpointAction::Put(checkpoint) = started.checkpoint else {
        panic!("expected put");
    };

    // An older offset is already covered by the stored sequence
    let stale = processor
        .process_at(
            EventEnvelope {
                offset: 49,
                event: FlowEvent::wakeup(key),
            },
            Some(checkpoint),
            &cancel,
            now + ChronoDuration::seconds(5),
        )
        .await;
    assert_eq!(stale.checkpoint, CheckpointAction::Unchanged);
    assert!(stale.records.is_empty());
}
