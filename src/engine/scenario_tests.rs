// End-to-end scenarios driving FlowEngine over in-memory storage

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use super::flow_engine::FlowEngine;
use super::jobs::{spawn_job_worker, ChannelJobDispatcher, QueuedJobDispatcher};
use super::lock::{CacheLock, LockKey, LockLease, LockRetryPolicy, ProcessLock, RowLock};
use super::permissions::RolePermissions;
use super::storage::InMemoryStorage;
use super::Caller;
use crate::engine::events::FlowEvent;
use crate::flow::{Flow, NodeSpec};
use crate::models::{ProcessId, ProcessStatus, Task, TaskStatus};
use crate::FlowError;

fn linear_flow() -> Arc<Flow> {
    Flow::builder("demo", "linear.Flow")
        .node("start", NodeSpec::start().next("work"))
        .node("work", NodeSpec::handle().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap()
}

fn parallel_flow() -> Arc<Flow> {
    Flow::builder("demo", "parallel.Flow")
        .node("start", NodeSpec::start().next("split"))
        .node("split", NodeSpec::split().next("a").next("b"))
        .node("a", NodeSpec::handle().next("join"))
        .node("b", NodeSpec::handle().next("join"))
        .node("join", NodeSpec::join().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap()
}

fn engine_for(flow: &Arc<Flow>) -> FlowEngine {
    FlowEngine::builder().flow(flow.clone()).build()
}

async fn start(engine: &FlowEngine, flow: &Arc<Flow>) -> ProcessId {
    engine
        .start_process(&flow.reference(), "start", json!({}), &Caller::system())
        .await
        .unwrap()
        .id
}

async fn only(engine: &FlowEngine, process: ProcessId, node: &str) -> Task {
    let mut tasks = engine.storage().find_tasks(process, node, &[]).await.unwrap();
    assert_eq!(tasks.len(), 1, "expected exactly one `{}` task", node);
    tasks.remove(0)
}

async fn status_of(engine: &FlowEngine, process: ProcessId) -> ProcessStatus {
    engine.process(process).await.unwrap().status
}

#[tokio::test]
async fn linear_flow_finishes_with_three_tasks() {
    let flow = linear_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;

    let work = only(&engine, process, "work").await;
    assert_eq!(work.status, TaskStatus::New);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::New);

    engine.run_handle(work.id, &Caller::system()).await.unwrap();

    let tasks = engine.tasks(process).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Done));
    assert!(tasks.iter().all(|t| t.finished.is_some()));
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);

    let end = only(&engine, process, "end").await;
    assert_eq!(end.previous, vec![work.id]);
}

#[tokio::test]
async fn handle_cannot_run_twice() {
    let flow = linear_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let work = only(&engine, process, "work").await;

    engine.run_handle(work.id, &Caller::system()).await.unwrap();
    let err = assert_err!(engine.run_handle(work.id, &Caller::system()).await);
    assert!(matches!(err, FlowError::TransitionNotAllowed { .. }));
}

#[tokio::test]
async fn split_and_join_produce_six_tasks() {
    let flow = parallel_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;

    let split = only(&engine, process, "split").await;
    let a = only(&engine, process, "a").await;
    let b = only(&engine, process, "b").await;
    assert_eq!(a.token.as_str(), format!("start/{}_1", split.id));
    assert_eq!(b.token.as_str(), format!("start/{}_2", split.id));

    engine.run_handle(a.id, &Caller::system()).await.unwrap();
    let join = only(&engine, process, "join").await;
    assert_eq!(join.status, TaskStatus::Started);
    assert_eq!(join.token.as_str(), "start");
    assert_eq!(status_of(&engine, process).await, ProcessStatus::New);

    engine.run_handle(b.id, &Caller::system()).await.unwrap();
    let join = only(&engine, process, "join").await;
    assert_eq!(join.status, TaskStatus::Done);
    assert_eq!(join.previous, vec![a.id, b.id]);

    assert_eq!(engine.tasks(process).await.unwrap().len(), 6);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);
}

#[tokio::test]
async fn canceled_branch_does_not_block_join() {
    let flow = parallel_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let a = only(&engine, process, "a").await;
    let b = only(&engine, process, "b").await;

    let canceled = engine.cancel(a.id, &Caller::system()).await.unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);

    engine.run_handle(b.id, &Caller::system()).await.unwrap();
    let join = only(&engine, process, "join").await;
    assert_eq!(join.status, TaskStatus::Done);
    assert_eq!(join.previous, vec![b.id]);
    assert_eq!(engine.tasks(process).await.unwrap().len(), 6);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);
}

#[tokio::test]
async fn cancel_releases_a_waiting_join() {
    let flow = parallel_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let a = only(&engine, process, "a").await;
    let b = only(&engine, process, "b").await;

    engine.run_handle(a.id, &Caller::system()).await.unwrap();
    assert_eq!(only(&engine, process, "join").await.status, TaskStatus::Started);

    engine.cancel(b.id, &Caller::system()).await.unwrap();
    assert_eq!(only(&engine, process, "join").await.status, TaskStatus::Done);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);
}

#[tokio::test]
async fn guarded_split_skips_false_branches() {
    let flow = Flow::builder("demo", "guarded.Flow")
        .node("start", NodeSpec::start().next("split"))
        .node(
            "split",
            NodeSpec::split()
                .branch_if("rush", |p, _| Ok(p.data["rush"] == json!(true)))
                .next("normal"),
        )
        .node("rush", NodeSpec::handle().next("join"))
        .node("normal", NodeSpec::handle().next("join"))
        .node("join", NodeSpec::join().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    let engine = engine_for(&flow);
    let process = engine
        .start_process(&flow.reference(), "start", json!({"rush": false}), &Caller::system())
        .await
        .unwrap()
        .id;

    assert!(engine.storage().find_tasks(process, "rush", &[]).await.unwrap().is_empty());
    let normal = only(&engine, process, "normal").await;
    engine.run_handle(normal.id, &Caller::system()).await.unwrap();
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);
}

#[tokio::test]
async fn wait_any_join_passes_on_first_arrival() {
    let flow = Flow::builder("demo", "race.Flow")
        .node("start", NodeSpec::start().next("split"))
        .node("split", NodeSpec::split().next("a").next("b"))
        .node("a", NodeSpec::handle().next("join"))
        .node("b", NodeSpec::handle().next("join"))
        .node("join", NodeSpec::join().wait_any().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let a = only(&engine, process, "a").await;
    let b = only(&engine, process, "b").await;

    engine.run_handle(a.id, &Caller::system()).await.unwrap();
    assert_eq!(only(&engine, process, "join").await.status, TaskStatus::Done);
    assert_eq!(only(&engine, process, "end").await.status, TaskStatus::Done);
    // b is still active, so the end could not finish the process
    assert_eq!(status_of(&engine, process).await, ProcessStatus::New);

    engine.run_handle(b.id, &Caller::system()).await.unwrap();
    let join = only(&engine, process, "join").await;
    assert_eq!(join.previous, vec![a.id, b.id]);
    assert_eq!(engine.storage().find_tasks(process, "end", &[]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn switch_without_matching_case_fails_without_successors() {
    let flow = Flow::builder("demo", "switch.Flow")
        .node("start", NodeSpec::start().next("route"))
        .node("route", NodeSpec::switch().case("express", |p, _| Ok(p.data["kind"] == json!("express"))))
        .node("express", NodeSpec::handle().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    let engine = engine_for(&flow);

    let err = engine
        .start_process(&flow.reference(), "start", json!({"kind": "economy"}), &Caller::system().capturing())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NoActiveBranch { .. }));
    assert!(err.is_graph_inconsistency());

    // The whole start is rolled back, process record included
    let process = ProcessId(1);
    assert!(matches!(engine.process(process).await, Err(FlowError::NotFound(_))));
    assert!(engine.tasks(process).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_operation_rolls_back_its_writes() {
    let flow = Flow::builder("demo", "late_switch.Flow")
        .node("start", NodeSpec::start().next("work"))
        .node("work", NodeSpec::handle().next("route"))
        .node("route", NodeSpec::switch().case("express", |p, _| Ok(p.data["kind"] == json!("express"))))
        .node("express", NodeSpec::handle().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    let engine = engine_for(&flow);
    let process = engine
        .start_process(&flow.reference(), "start", json!({"kind": "economy"}), &Caller::system())
        .await
        .unwrap()
        .id;
    let work = only(&engine, process, "work").await;
    let mut events = engine.subscribe();

    let err = assert_err!(engine.run_handle(work.id, &Caller::system()).await);
    assert!(matches!(err, FlowError::NoActiveBranch { .. }));

    assert_eq!(only(&engine, process, "work").await.status, TaskStatus::New);
    assert!(engine.storage().find_tasks(process, "route", &[]).await.unwrap().is_empty());
    assert_eq!(engine.tasks(process).await.unwrap().len(), 2);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::New);
    // Nothing is published for writes that were undone
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn if_gate_follows_condition() {
    let flow = Flow::builder("demo", "if.Flow")
        .node("start", NodeSpec::start().next("check"))
        .node(
            "check",
            NodeSpec::if_(|p, _| Ok(p.data["amount"].as_i64().unwrap_or(0) > 100))
                .then("approve")
                .otherwise("end"),
        )
        .node("approve", NodeSpec::handle().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    let engine = engine_for(&flow);

    let small = engine
        .start_process(&flow.reference(), "start", json!({"amount": 10}), &Caller::system())
        .await
        .unwrap();
    assert_eq!(small.status, ProcessStatus::Done);

    let large = engine
        .start_process(&flow.reference(), "start", json!({"amount": 500}), &Caller::system())
        .await
        .unwrap();
    assert_eq!(large.status, ProcessStatus::New);
    assert_eq!(only(&engine, large.id, "approve").await.status, TaskStatus::New);
}

#[tokio::test]
async fn end_undo_and_revive_round_trip() {
    let flow = linear_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let work = only(&engine, process, "work").await;
    engine.run_handle(work.id, &Caller::system()).await.unwrap();
    let end = only(&engine, process, "end").await;

    let undone = engine.undo(end.id, &Caller::system()).await.unwrap();
    assert_eq!(undone.status, TaskStatus::Canceled);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::New);

    let revived = engine.revive(end.id, &Caller::system()).await.unwrap();
    assert_ne!(revived.id, end.id);
    assert_eq!(revived.status, TaskStatus::Done);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);

    let ends = engine.storage().find_tasks(process, "end", &[]).await.unwrap();
    assert_eq!(ends.len(), 2);
    assert_eq!(ends[0].status, TaskStatus::Canceled);
    assert_eq!(ends[0].previous, vec![work.id]);
    assert_eq!(ends[1].status, TaskStatus::Done);
    assert_eq!(ends[1].previous, ends[0].previous);
}

#[tokio::test]
async fn undo_requires_successors_to_be_canceled() {
    let flow = linear_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let start_task = only(&engine, process, "start").await;
    let work = only(&engine, process, "work").await;

    let err = assert_err!(engine.undo(start_task.id, &Caller::system()).await);
    assert!(matches!(err, FlowError::TransitionNotAllowed { .. }));

    assert_ok!(engine.cancel(work.id, &Caller::system()).await);
    let undone = assert_ok!(engine.undo(start_task.id, &Caller::system()).await);
    assert_eq!(undone.status, TaskStatus::Canceled);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Canceled);
}

#[tokio::test]
async fn terminating_end_cancels_other_branches() {
    let flow = Flow::builder("demo", "escalate.Flow")
        .node("start", NodeSpec::start().next("split"))
        .node("split", NodeSpec::split().next("escalate").next("regular"))
        .node("escalate", NodeSpec::handle().next("abort"))
        .node("regular", NodeSpec::handle().next("end"))
        .node("abort", NodeSpec::end().terminate())
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let escalate = only(&engine, process, "escalate").await;

    engine.run_handle(escalate.id, &Caller::system()).await.unwrap();

    assert_eq!(only(&engine, process, "regular").await.status, TaskStatus::Canceled);
    assert_eq!(only(&engine, process, "abort").await.status, TaskStatus::Done);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);
}

#[tokio::test]
async fn cancel_process_cancels_active_tasks() {
    let flow = parallel_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;

    let canceled = engine.cancel_process(process, &Caller::system()).await.unwrap();
    assert_eq!(canceled.status, ProcessStatus::Canceled);
    assert!(canceled.finished.is_some());
    assert_eq!(only(&engine, process, "a").await.status, TaskStatus::Canceled);
    assert_eq!(only(&engine, process, "b").await.status, TaskStatus::Canceled);
    assert_eq!(only(&engine, process, "start").await.status, TaskStatus::Done);

    let err = assert_err!(engine.cancel_process(process, &Caller::system()).await);
    assert!(matches!(err, FlowError::ProcessFinished { status: ProcessStatus::Canceled, .. }));
}

#[tokio::test]
async fn finished_process_cannot_be_canceled() {
    let flow = linear_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let work = only(&engine, process, "work").await;
    engine.run_handle(work.id, &Caller::system()).await.unwrap();
    let done = engine.process(process).await.unwrap();

    let err = assert_err!(engine.cancel_process(process, &Caller::system()).await);
    assert!(matches!(err, FlowError::ProcessFinished { status: ProcessStatus::Done, .. }));

    let after = engine.process(process).await.unwrap();
    assert_eq!(after.status, ProcessStatus::Done);
    assert_eq!(after.finished, done.finished);
}

// ============================================================================
// Nested splits
// ============================================================================

fn nested_flow() -> Arc<Flow> {
    Flow::builder("demo", "nested.Flow")
        .node("start", NodeSpec::start().next("outer"))
        .node("outer", NodeSpec::split().next("a").next("inner"))
        .node("a", NodeSpec::handle().next("outer_join"))
        .node("inner", NodeSpec::split().next("b").next("c"))
        .node("b", NodeSpec::handle().next("inner_join"))
        .node("c", NodeSpec::handle().next("inner_join"))
        .node("inner_join", NodeSpec::join().next("outer_join"))
        .node("outer_join", NodeSpec::join().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap()
}

#[derive(Clone, Copy)]
enum Step {
    Run(&'static str),
    Cancel(&'static str),
}

async fn drive_nested(steps: &[Step]) {
    let flow = nested_flow();
    let engine = engine_for(&flow);
    let mut events = engine.subscribe();
    let process = start(&engine, &flow).await;

    for step in steps {
        match *step {
            Step::Run(node) => {
                let task = only(&engine, process, node).await;
                engine.run_handle(task.id, &Caller::system()).await.unwrap();
            }
            Step::Cancel(node) => {
                let task = only(&engine, process, node).await;
                engine.cancel(task.id, &Caller::system()).await.unwrap();
            }
        }
    }

    let outer_join = only(&engine, process, "outer_join").await;
    assert_eq!(outer_join.status, TaskStatus::Done);
    assert_eq!(outer_join.token.as_str(), "start");
    assert!(engine.storage().find_tasks(process, "inner_join", &[]).await.unwrap().len() <= 1);
    assert_eq!(only(&engine, process, "end").await.status, TaskStatus::Done);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);

    let finished = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, FlowEvent::FlowFinished { .. }))
        .count();
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn nested_join_released_by_cancel_advances_once() {
    drive_nested(&[Step::Run("b"), Step::Run("a"), Step::Cancel("c")]).await;
}

#[tokio::test]
async fn nested_joins_in_completion_order() {
    drive_nested(&[Step::Run("a"), Step::Run("b"), Step::Cancel("c")]).await;
    drive_nested(&[Step::Run("c"), Step::Run("b"), Step::Run("a")]).await;
    drive_nested(&[Step::Run("a"), Step::Run("c"), Step::Run("b")]).await;
}

#[tokio::test]
async fn nested_joins_with_canceled_branches() {
    drive_nested(&[Step::Cancel("c"), Step::Run("b"), Step::Run("a")]).await;
    drive_nested(&[Step::Cancel("a"), Step::Run("b"), Step::Run("c")]).await;
    drive_nested(&[Step::Run("a"), Step::Cancel("b"), Step::Cancel("c")]).await;
}

#[tokio::test]
async fn inner_join_token_is_its_split_branch() {
    let flow = nested_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let outer = only(&engine, process, "outer").await;
    let inner = only(&engine, process, "inner").await;
    let b = only(&engine, process, "b").await;
    assert_eq!(inner.token.as_str(), format!("start/{}_2", outer.id));
    assert_eq!(b.token.as_str(), format!("start/{}_2/{}_1", outer.id, inner.id));

    engine.run_handle(b.id, &Caller::system()).await.unwrap();
    let inner_join = only(&engine, process, "inner_join").await;
    assert_eq!(inner_join.token, inner.token);
    assert_eq!(inner_join.status, TaskStatus::Started);
}

#[tokio::test]
async fn simultaneous_arrivals_enter_one_join() {
    let flow = Flow::builder("demo", "auto.Flow")
        .node("start", NodeSpec::start().next("split"))
        .node("split", NodeSpec::split().next("a").next("b"))
        .node("a", NodeSpec::function(|_| Ok(())).next("join"))
        .node("b", NodeSpec::function(|_| Ok(())).next("join"))
        .node("join", NodeSpec::join().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;

    let a = only(&engine, process, "a").await;
    let b = only(&engine, process, "b").await;
    let join = only(&engine, process, "join").await;
    assert_eq!(join.status, TaskStatus::Done);
    assert_eq!(join.previous, vec![a.id, b.id]);
    assert_eq!(only(&engine, process, "end").await.status, TaskStatus::Done);
    assert_eq!(engine.tasks(process).await.unwrap().len(), 6);
}

// ============================================================================
// Error policy, retry and revive
// ============================================================================

fn flaky_flow(failures: Arc<AtomicUsize>) -> Arc<Flow> {
    Flow::builder("demo", "flaky.Flow")
        .node("start", NodeSpec::start().next("calc"))
        .node(
            "calc",
            NodeSpec::function(move |ctx| {
                if failures.load(Ordering::SeqCst) > 0 {
                    failures.fetch_sub(1, Ordering::SeqCst);
                    anyhow::bail!("upstream unavailable");
                }
                ctx.task.merge_data(json!({"total": 42}));
                Ok(())
            })
            .next("end"),
        )
        .node("end", NodeSpec::end())
        .build()
        .unwrap()
}

#[tokio::test]
async fn propagating_caller_sees_callback_error() {
    let flow = flaky_flow(Arc::new(AtomicUsize::new(1)));
    let engine = engine_for(&flow);

    let err = engine
        .start_process(&flow.reference(), "start", json!({}), &Caller::system())
        .await
        .unwrap_err();
    assert!(err.is_capturable());
    assert!(err.to_string().contains("calc"));
    assert!(engine.tasks(ProcessId(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn capturing_caller_records_error_and_retry_recovers() {
    let flow = flaky_flow(Arc::new(AtomicUsize::new(1)));
    let engine = engine_for(&flow);
    let mut events = engine.subscribe();

    let process = engine
        .start_process(&flow.reference(), "start", json!({}), &Caller::system().capturing())
        .await
        .unwrap();
    assert_eq!(process.status, ProcessStatus::New);

    let calc = only(&engine, process.id, "calc").await;
    assert_eq!(calc.status, TaskStatus::Error);
    assert!(calc.error.as_deref().unwrap_or_default().contains("upstream unavailable"));

    let failed = std::iter::from_fn(|| events.try_recv().ok()).any(|e| matches!(e, FlowEvent::TaskFailed { .. }));
    assert!(failed);

    let retried = engine.retry(calc.id, &Caller::system()).await.unwrap();
    assert_eq!(retried.id, calc.id);
    assert_eq!(retried.status, TaskStatus::Done);
    assert_eq!(retried.error, None);
    assert_eq!(retried.data["total"], 42);
    assert_eq!(status_of(&engine, process.id).await, ProcessStatus::Done);
}

#[tokio::test]
async fn reviving_an_error_task_supersedes_it() {
    let flow = flaky_flow(Arc::new(AtomicUsize::new(1)));
    let engine = engine_for(&flow);
    let process = engine
        .start_process(&flow.reference(), "start", json!({}), &Caller::worker())
        .await
        .unwrap();
    let calc = only(&engine, process.id, "calc").await;

    let copy = engine.revive(calc.id, &Caller::system()).await.unwrap();
    assert_eq!(copy.status, TaskStatus::Done);
    assert_eq!(copy.token, calc.token);

    let rows = engine.storage().find_tasks(process.id, "calc", &[]).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].status, TaskStatus::Revived);
    assert_eq!(status_of(&engine, process.id).await, ProcessStatus::Done);
}

#[tokio::test]
async fn retry_only_applies_to_failed_tasks() {
    let flow = linear_flow();
    let engine = engine_for(&flow);
    let process = start(&engine, &flow).await;
    let work = only(&engine, process, "work").await;

    let err = engine.retry(work.id, &Caller::system()).await.unwrap_err();
    assert!(matches!(err, FlowError::TransitionNotAllowed { .. }));
}

// ============================================================================
// Human tasks and permissions
// ============================================================================

fn approval_flow() -> Arc<Flow> {
    Flow::builder("demo", "approval.Flow")
        .node("start", NodeSpec::start().next("approve"))
        .node(
            "approve",
            NodeSpec::view()
                .permission("orders.approve")
                .on_execute(|ctx| {
                    anyhow::ensure!(ctx.task.data["approved"] == json!(true), "order rejected");
                    ctx.process.data["approved_by"] = json!(ctx.user);
                    Ok(())
                })
                .next("end"),
        )
        .node("end", NodeSpec::end())
        .build()
        .unwrap()
}

fn approval_engine(flow: &Arc<Flow>) -> FlowEngine {
    let policy = RolePermissions::new().grant("alice", "orders.approve").manager("boss");
    FlowEngine::builder()
        .flow(flow.clone())
        .with_permissions(Arc::new(policy))
        .build()
}

#[tokio::test]
async fn view_assign_and_execute_respect_permissions() {
    let flow = approval_flow();
    let engine = approval_engine(&flow);
    let process = start(&engine, &flow).await;
    let approve = only(&engine, process, "approve").await;
    assert_eq!(approve.owner_permission.as_deref(), Some("orders.approve"));

    let err = engine.assign(approve.id, "bob", &Caller::user("bob")).await.unwrap_err();
    assert!(matches!(err, FlowError::PermissionDenied { action: "assign", .. }));

    let assigned = engine.assign(approve.id, "alice", &Caller::user("alice")).await.unwrap();
    assert_eq!(assigned.status, TaskStatus::Assigned);
    assert_eq!(assigned.owner.as_deref(), Some("alice"));

    let err = engine
        .execute(approve.id, json!({"approved": true}), &Caller::user("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::PermissionDenied { action: "execute", .. }));

    let done = engine
        .execute(approve.id, json!({"approved": true}), &Caller::user("alice"))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.data["approved"], true);

    let process = engine.process(process).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Done);
    assert_eq!(process.data["approved_by"], "alice");
}

#[tokio::test]
async fn only_owner_or_manager_may_unassign() {
    let flow = approval_flow();
    let engine = approval_engine(&flow);
    let process = start(&engine, &flow).await;
    let approve = only(&engine, process, "approve").await;
    engine.assign(approve.id, "alice", &Caller::user("alice")).await.unwrap();

    let err = engine.unassign(approve.id, &Caller::user("bob")).await.unwrap_err();
    assert!(matches!(err, FlowError::PermissionDenied { .. }));

    let reassigned = engine.reassign(approve.id, "boss", &Caller::user("boss")).await.unwrap();
    assert_eq!(reassigned.owner.as_deref(), Some("boss"));

    let unassigned = engine.unassign(approve.id, &Caller::user("boss")).await.unwrap();
    assert_eq!(unassigned.status, TaskStatus::New);
    assert_eq!(unassigned.owner, None);
}

#[tokio::test]
async fn view_undo_returns_task_to_owner() {
    let flow = approval_flow();
    let engine = approval_engine(&flow);
    let process = start(&engine, &flow).await;
    let approve = only(&engine, process, "approve").await;
    engine.assign(approve.id, "alice", &Caller::user("alice")).await.unwrap();
    engine
        .execute(approve.id, json!({"approved": true}), &Caller::user("alice"))
        .await
        .unwrap();
    let end = only(&engine, process, "end").await;

    let err = engine.undo(end.id, &Caller::user("alice")).await.unwrap_err();
    assert!(matches!(err, FlowError::PermissionDenied { action: "undo", .. }));

    engine.undo(end.id, &Caller::user("boss")).await.unwrap();
    let approve = engine.undo(approve.id, &Caller::user("boss")).await.unwrap();
    assert_eq!(approve.status, TaskStatus::Assigned);
    assert_eq!(approve.owner.as_deref(), Some("alice"));
    assert_eq!(status_of(&engine, process).await, ProcessStatus::New);
}

#[tokio::test]
async fn view_handler_error_keeps_task_assigned() {
    let flow = approval_flow();
    let engine = approval_engine(&flow);
    let process = start(&engine, &flow).await;
    let approve = only(&engine, process, "approve").await;
    engine.assign(approve.id, "alice", &Caller::user("alice")).await.unwrap();

    let err = engine
        .execute(approve.id, json!({"approved": false}), &Caller::user("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Callback { .. }));
    assert_eq!(only(&engine, process, "approve").await.status, TaskStatus::Assigned);
}

#[tokio::test]
async fn start_permission_is_checked() {
    let flow = Flow::builder("demo", "guarded_start.Flow")
        .node("start", NodeSpec::start().permission("orders.create").next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    let policy = RolePermissions::new().grant("alice", "orders.create");
    let engine = FlowEngine::builder()
        .flow(flow.clone())
        .with_permissions(Arc::new(policy))
        .build();

    let err = engine
        .start_process(&flow.reference(), "start", json!({}), &Caller::user("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::StartDenied { .. }));

    let process = engine
        .start_process(&flow.reference(), "start", json!({}), &Caller::user("alice"))
        .await
        .unwrap();
    assert_eq!(process.status, ProcessStatus::Done);
}

// ============================================================================
// Jobs
// ============================================================================

fn job_flow() -> Arc<Flow> {
    Flow::builder("demo", "jobs.Flow")
        .node("start", NodeSpec::start().next("fetch"))
        .node(
            "fetch",
            NodeSpec::job(|ctx| async move {
                anyhow::ensure!(ctx.process_data["url"].is_string(), "no url to fetch");
                Ok::<_, anyhow::Error>(json!({"fetched_for": ctx.task_id.0}))
            })
            .next("end"),
        )
        .node("end", NodeSpec::end())
        .build()
        .unwrap()
}

#[tokio::test]
async fn job_runs_outside_activation() {
    let flow = job_flow();
    let queue = Arc::new(QueuedJobDispatcher::new());
    let engine = FlowEngine::builder().flow(flow.clone()).with_jobs(queue.clone()).build();

    let process = engine
        .start_process(&flow.reference(), "start", json!({"url": "https://example.test"}), &Caller::system())
        .await
        .unwrap();
    let fetch = only(&engine, process.id, "fetch").await;
    assert_eq!(fetch.status, TaskStatus::Scheduled);

    let requests = queue.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].task, fetch.id);
    assert_eq!(requests[0].job, "demo/jobs.Flow.fetch");

    let done = engine.run_job(&requests[0], &Caller::worker()).await.unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.data["fetched_for"], fetch.id.0);
    assert_eq!(status_of(&engine, process.id).await, ProcessStatus::Done);
}

#[tokio::test]
async fn failed_job_is_rescheduled_by_retry() {
    let flow = job_flow();
    let queue = Arc::new(QueuedJobDispatcher::new());
    let engine = FlowEngine::builder().flow(flow.clone()).with_jobs(queue.clone()).build();

    let process = start(&engine, &flow).await;
    let request = queue.drain().remove(0);

    let failed = engine.run_job(&request, &Caller::worker()).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(failed.error.as_deref().unwrap_or_default().contains("no url"));

    let retried = engine.retry(failed.id, &Caller::system()).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Scheduled);
    assert_eq!(queue.len(), 1);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::New);
}

#[tokio::test]
async fn propagating_job_caller_gets_error_and_task_is_failed() {
    let flow = job_flow();
    let queue = Arc::new(QueuedJobDispatcher::new());
    let engine = FlowEngine::builder().flow(flow.clone()).with_jobs(queue.clone()).build();
    let process = start(&engine, &flow).await;
    let request = queue.drain().remove(0);

    let err = engine.run_job(&request, &Caller::system()).await.unwrap_err();
    assert!(matches!(err, FlowError::Callback { .. }));
    assert_eq!(only(&engine, process, "fetch").await.status, TaskStatus::Error);
}

#[tokio::test]
async fn canceled_job_is_skipped() {
    let flow = job_flow();
    let queue = Arc::new(QueuedJobDispatcher::new());
    let engine = FlowEngine::builder().flow(flow.clone()).with_jobs(queue.clone()).build();
    let process = start(&engine, &flow).await;
    let request = queue.drain().remove(0);

    engine.cancel(request.task, &Caller::system()).await.unwrap();
    let task = engine.run_job(&request, &Caller::worker()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    assert!(engine.storage().find_tasks(process, "end", &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn channel_worker_drives_jobs_to_completion() {
    let flow = job_flow();
    let (dispatcher, receiver) = ChannelJobDispatcher::new();
    let engine = FlowEngine::builder()
        .flow(flow.clone())
        .with_jobs(Arc::new(dispatcher))
        .build();
    let mut events = engine.subscribe();
    let worker = spawn_job_worker(engine.clone(), receiver);

    let process = engine
        .start_process(&flow.reference(), "start", json!({"url": "https://example.test"}), &Caller::system())
        .await
        .unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(FlowEvent::FlowFinished { process: id, .. }) = events.recv().await {
                return id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(finished, process.id);
    assert_eq!(status_of(&engine, process.id).await, ProcessStatus::Done);

    drop(engine);
    worker.abort();
}

// ============================================================================
// Subprocesses
// ============================================================================

fn parent_and_child() -> (Arc<Flow>, Arc<Flow>) {
    let child = Flow::builder("demo", "child.Flow")
        .node("start", NodeSpec::start().next("review"))
        .node("review", NodeSpec::handle().next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    let parent = Flow::builder("demo", "parent.Flow")
        .node("start", NodeSpec::start().next("nested"))
        .node("nested", NodeSpec::subprocess("demo/child.Flow", "start").next("end"))
        .node("end", NodeSpec::end())
        .build()
        .unwrap();
    (parent, child)
}

#[tokio::test]
async fn subprocess_completes_parent_task() {
    let (parent, child) = parent_and_child();
    let engine = FlowEngine::builder().flow(parent.clone()).flow(child).build();

    let process = engine
        .start_process(&parent.reference(), "start", json!({"order": 7}), &Caller::system())
        .await
        .unwrap();
    let nested = only(&engine, process.id, "nested").await;
    assert_eq!(nested.status, TaskStatus::Started);

    let children = engine.storage().processes_by_parent(nested.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].data, json!({"order": 7}));

    let review = only(&engine, children[0].id, "review").await;
    engine.run_handle(review.id, &Caller::system()).await.unwrap();

    assert_eq!(status_of(&engine, children[0].id).await, ProcessStatus::Done);
    assert_eq!(only(&engine, process.id, "nested").await.status, TaskStatus::Done);
    assert_eq!(status_of(&engine, process.id).await, ProcessStatus::Done);
}

#[tokio::test]
async fn canceling_subprocess_task_cancels_child() {
    let (parent, child) = parent_and_child();
    let engine = FlowEngine::builder().flow(parent.clone()).flow(child).build();
    let process = start(&engine, &parent).await;
    let nested = only(&engine, process, "nested").await;

    engine.cancel(nested.id, &Caller::system()).await.unwrap();

    let children = engine.storage().processes_by_parent(nested.id).await.unwrap();
    assert_eq!(children[0].status, ProcessStatus::Canceled);
    assert_eq!(only(&engine, children[0].id, "review").await.status, TaskStatus::Canceled);
}

// ============================================================================
// Locking
// ============================================================================

fn quick_policy(attempts: u32) -> LockRetryPolicy {
    LockRetryPolicy::bounded(attempts).with_delays(Duration::from_millis(1), Duration::from_millis(5))
}

#[tokio::test]
async fn held_lock_fails_bounded_operation() {
    let flow = linear_flow();
    let lock = CacheLock::new(Duration::from_secs(30), quick_policy(3));
    let engine = FlowEngine::builder()
        .flow(flow.clone())
        .with_lock(Arc::new(lock.clone()))
        .build();
    let process = start(&engine, &flow).await;
    let work = only(&engine, process, "work").await;

    let mut lease = assert_ok!(lock.acquire(&LockKey::new(flow.reference(), process)).await);
    let err = assert_err!(engine.run_handle(work.id, &Caller::system()).await);
    assert!(matches!(err, FlowError::LockAcquisitionFailed { attempts: 3, .. }));
    assert_eq!(only(&engine, process, "work").await.status, TaskStatus::New);

    assert_ok!(lease.release().await);
    assert_ok!(engine.run_handle(work.id, &Caller::system()).await);
    assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);
}

#[tokio::test]
async fn blocking_lock_waits_for_holder() {
    let flow = linear_flow();
    let policy = LockRetryPolicy::blocking().with_delays(Duration::from_millis(1), Duration::from_millis(5));
    let lock = CacheLock::new(Duration::from_secs(30), policy);
    let engine = FlowEngine::builder()
        .flow(flow.clone())
        .with_lock(Arc::new(lock.clone()))
        .build();
    let process = start(&engine, &flow).await;
    let work = only(&engine, process, "work").await;

    let mut lease = lock.acquire(&LockKey::new(flow.reference(), process)).await.unwrap();
    let waiting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_handle(work.id, &Caller::system()).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiting.is_finished());
    assert_eq!(only(&engine, process, "work").await.status, TaskStatus::New);

    lease.release().await.unwrap();
    let done = waiting.await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_branches_advance_join_once() {
    let flow = parallel_flow();
    let storage = Arc::new(InMemoryStorage::new());
    let engine = FlowEngine::builder()
        .flow(flow.clone())
        .with_storage(storage.clone())
        .with_lock(Arc::new(RowLock::new(storage, LockRetryPolicy::blocking())))
        .build();

    for _ in 0..10 {
        let process = start(&engine, &flow).await;
        let a = only(&engine, process, "a").await;
        let b = only(&engine, process, "b").await;

        let left = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_handle(a.id, &Caller::system()).await })
        };
        let right = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_handle(b.id, &Caller::system()).await })
        };
        left.await.unwrap().unwrap();
        right.await.unwrap().unwrap();

        assert_eq!(only(&engine, process, "join").await.status, TaskStatus::Done);
        assert_eq!(only(&engine, process, "end").await.status, TaskStatus::Done);
        assert_eq!(status_of(&engine, process).await, ProcessStatus::Done);
    }
}
