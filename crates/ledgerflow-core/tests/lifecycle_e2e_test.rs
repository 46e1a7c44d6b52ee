// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the flow lifecycle: start, durable sleep, kill.

mod common;

use std::time::{Duration, Instant};

use common::*;
use ledgerflow_core::model::{FlowExceptionKind, FlowStatus, Payload, WaitingFor};

#[tokio::test]
async fn test_sleeping_flow_wakes_and_completes() {
    let ctx = TestContext::new().await;
    let key = flow_key("nap-1");
    let started = Instant::now();

    ctx.worker
        .start_flow(key.clone(), "sleep", Payload::from("150"))
        .unwrap();

    let status = ctx.wait_status(&key, is_completed).await;
    assert_eq!(
        status,
        Some(FlowStatus::Completed {
            result: Payload::from("rested")
        })
    );
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(ctx.store.get(&key).await.unwrap().is_none());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_sleeping_flow_is_checkpointed_with_timer() {
    let ctx = TestContext::new().await;
    let key = flow_key("nap-2");

    ctx.worker
        .start_flow(key.clone(), "sleep", Payload::from("60000"))
        .unwrap();
    ctx.wait_status(&key, |s| *s == FlowStatus::Running)
        .await
        .unwrap();

    let stored = ctx.store.get(&key).await.unwrap().unwrap();
    let WaitingFor::Sleep { wake_at } = &stored.checkpoint.waiting_for else {
        panic!("expected sleep, got {:?}", stored.checkpoint.waiting_for);
    };
    assert_eq!(stored.checkpoint.timer_at, Some(*wake_at));
    assert_eq!(stored.checkpoint.flow_name, "sleep");
    assert!(stored.checkpoint.fiber_state.is_some());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_kill_sleeping_flow() {
    let ctx = TestContext::new().await;
    let key = flow_key("nap-3");

    ctx.worker
        .start_flow(key.clone(), "sleep", Payload::from("60000"))
        .unwrap();
    ctx.wait_status(&key, |s| *s == FlowStatus::Running)
        .await
        .unwrap();

    ctx.worker.kill_flow(key.clone(), "no longer needed").unwrap();

    let status = ctx
        .wait_status(&key, |s| matches!(s, FlowStatus::Killed { .. }))
        .await;
    assert_eq!(
        status,
        Some(FlowStatus::Killed {
            reason: "no longer needed".to_string()
        })
    );
    assert!(ctx.store.get(&key).await.unwrap().is_none());
    assert!(!ctx.statuses(&key).iter().any(is_completed));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_start_is_ignored() {
    let ctx = TestContext::new().await;
    let key = flow_key("nap-4");

    ctx.worker
        .start_flow(key.clone(), "sleep", Payload::from("60000"))
        .unwrap();
    ctx.wait_status(&key, |s| *s == FlowStatus::Running)
        .await
        .unwrap();
    let before = ctx.store.get(&key).await.unwrap().unwrap();

    ctx.worker
        .start_flow(key.clone(), "sleep", Payload::from("1"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = ctx.store.get(&key).await.unwrap().unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.checkpoint.waiting_for, before.checkpoint.waiting_for);
    let running = ctx
        .statuses(&key)
        .into_iter()
        .filter(|s| *s == FlowStatus::Running)
        .count();
    assert_eq!(running, 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_start_args_fail_flow() {
    let ctx = TestContext::new().await;
    let key = flow_key("nap-5");

    ctx.worker
        .start_flow(key.clone(), "sleep", Payload::from("soon"))
        .unwrap();

    let status = ctx.wait_status(&key, is_failed).await;
    let Some(FlowStatus::Failed { error }) = status else {
        panic!("expected failure, got {:?}", status);
    };
    assert!(error.message.contains("must be a number"));
    assert!(ctx.store.get(&key).await.unwrap().is_none());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_unrepresentable_sleep_fails_flow_and_worker_keeps_running() {
    let ctx = TestContext::new().await;
    let key = flow_key("nap-6");

    ctx.worker
        .start_flow(key.clone(), "sleep", Payload::from(u64::MAX.to_string().as_str()))
        .unwrap();

    let status = ctx.wait_status(&key, is_failed).await;
    let Some(FlowStatus::Failed { error }) = status else {
        panic!("expected failure, got {:?}", status);
    };
    assert_eq!(error.kind, FlowExceptionKind::User);
    assert!(error.message.contains("out of range"), "{}", error.message);
    assert!(ctx.store.get(&key).await.unwrap().is_none());
    assert!(ctx.worker.is_running());

    // Other flows still make progress
    let other = flow_key("nap-7");
    ctx.worker
        .start_flow(other.clone(), "sleep", Payload::from("10"))
        .unwrap();
    assert!(ctx.wait_status(&other, is_completed).await.is_some());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_records_published_once_sink_recovers() {
    let (ctx, failing) = TestContext::with_failing_sink(3).await;
    let key = flow_key("nap-8");

    ctx.worker
        .start_flow(key.clone(), "sleep", Payload::from("10"))
        .unwrap();

    let status = ctx.wait_status(&key, is_completed).await;
    assert!(status.is_some());

    // Every status survives the rejected attempts, in order
    let statuses = ctx.statuses(&key);
    assert_eq!(statuses.len(), 2, "{:?}", statuses);
    assert_eq!(statuses[0], FlowStatus::Running);
    assert!(is_completed(&statuses[1]));
    assert!(failing.attempts() > 3);
    assert!(ctx.worker.is_running());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_interrupts_publish_retries() {
    let (ctx, failing) = TestContext::with_failing_sink(usize::MAX).await;
    let key = flow_key("nap-9");

    ctx.worker
        .start_flow(key.clone(), "sleep", Payload::from("10"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(failing.attempts() > 1);
    assert!(ctx.statuses(&key).is_empty());

    tokio::time::timeout(WAIT, ctx.shutdown())
        .await
        .expect("shutdown blocked by publish retries");
}
