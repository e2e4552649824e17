//! エンジン全体を通したシナリオテスト

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use rstest::rstest;
use serde_json::{Value, json};

use super::{Configuration, EngineBuilder, OperationState, WorkContinuation, WorkEngine};
use crate::domain::{
    Data, EngineError, ExistingPeriodicWorkPolicy, ExistingWorkPolicy, MAX_DATA_BYTES, WorkId,
    WorkRecord, WorkRequest, WorkResult, WorkState,
};
use crate::handler::{HandlerError, WorkContext, WorkHandler};
use crate::impls::{InMemoryConstraintTracker, MemorySnapshotStore};
use crate::ports::{Clock, FixedClock, Scheduler, WorkLauncher};
use crate::testing::{TestDriver, wait_for_state};

const WAIT: Duration = Duration::from_secs(5);

struct FnHandler<F>(F);

#[async_trait]
impl<F> WorkHandler for FnHandler<F>
where
    F: Fn(&WorkContext) -> WorkResult + Send + Sync,
{
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkResult, HandlerError> {
        Ok((self.0)(&ctx))
    }
}

fn handler<F>(f: F) -> impl Fn() -> Box<dyn WorkHandler> + Send + Sync + 'static
where
    F: Fn(&WorkContext) -> WorkResult + Clone + Send + Sync + 'static,
{
    move || Box::new(FnHandler(f.clone()))
}

/// Waits for the stop signal, then claims success.
struct UntilStopped;

#[async_trait]
impl WorkHandler for UntilStopped {
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkResult, HandlerError> {
        ctx.stopped().await;
        Ok(WorkResult::success())
    }
}

fn config() -> Configuration {
    Configuration {
        min_periodic_interval_ms: 1_000,
        stop_grace_period_ms: 200,
        ..Configuration::default()
    }
}

fn inputs_recorder() -> (
    Arc<Mutex<Vec<Data>>>,
    impl Fn(&WorkContext) -> WorkResult + Clone + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = {
        let seen = Arc::clone(&seen);
        move |ctx: &WorkContext| {
            seen.lock().unwrap().push(ctx.input().clone());
            WorkResult::success()
        }
    };
    (seen, record)
}

async fn manual_engine(builder: EngineBuilder) -> (WorkEngine, TestDriver) {
    let engine = builder
        .configuration(config())
        .without_default_schedulers()
        .build()
        .unwrap();
    engine.recovery().await.unwrap();
    let driver = TestDriver::new(&engine);
    (engine, driver)
}

fn state_of(engine: &WorkEngine, id: WorkId) -> Option<WorkState> {
    engine.status_by_id(id).map(|status| status.state)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_time_work_succeeds_with_output() {
    let engine = EngineBuilder::new()
        .configuration(config())
        .register_handler(
            "produce",
            handler(|_| WorkResult::success_with(Data::empty().with("value", 42))),
        )
        .unwrap()
        .build()
        .unwrap();
    let request = WorkRequest::one_time("produce").build();
    let id = request.id();

    engine.enqueue(vec![request]).unwrap().await.unwrap();

    let status = wait_for_state(&engine, id, WorkState::Succeeded, WAIT)
        .await
        .unwrap();
    assert_eq!(status.output.get_i64("value"), Some(42));
    assert_eq!(status.run_attempt_count, 1);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failure_cascades_and_dependents_never_run() {
    let (seen, record) = inputs_recorder();
    let engine = EngineBuilder::new()
        .configuration(config())
        .register_handler(
            "fail",
            handler(|_| WorkResult::failure_with(Data::empty().with("reason", "boom"))),
        )
        .unwrap()
        .register_handler("consume", handler(record))
        .unwrap()
        .build()
        .unwrap();
    let first = WorkRequest::one_time("fail").build();
    let second = WorkRequest::one_time("consume").build();
    let (a, b) = (first.id(), second.id());

    engine
        .begin_with(vec![first])
        .unwrap()
        .then(vec![second])
        .unwrap()
        .enqueue()
        .await
        .unwrap();

    let failed = wait_for_state(&engine, a, WorkState::Failed, WAIT).await.unwrap();
    assert_eq!(failed.output.get_str("reason"), Some("boom"));
    let dependent = wait_for_state(&engine, b, WorkState::Failed, WAIT).await.unwrap();
    assert!(dependent.output.is_empty());
    assert!(seen.lock().unwrap().is_empty());
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependents_receive_merged_input() {
    let (seen, record) = inputs_recorder();
    let engine = EngineBuilder::new()
        .configuration(config())
        .register_handler(
            "produce",
            handler(|ctx| {
                let value = ctx.input().get_i64("value").unwrap_or_default();
                WorkResult::success_with(Data::empty().with("value", value))
            }),
        )
        .unwrap()
        .register_handler("consume", handler(record))
        .unwrap()
        .build()
        .unwrap();

    let producer = WorkRequest::one_time("produce")
        .input(Data::empty().with("value", 42))
        .build();
    let consumer = WorkRequest::one_time("consume")
        .input(Data::empty().with("own", "yes").with("value", 0))
        .build();
    let consumer_id = consumer.id();
    engine
        .begin_with(vec![producer])
        .unwrap()
        .then(vec![consumer])
        .unwrap()
        .enqueue()
        .await
        .unwrap();
    wait_for_state(&engine, consumer_id, WorkState::Succeeded, WAIT)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get_str("own"), Some("yes"));
    assert_eq!(seen[0].get_i64("value"), Some(42));
    drop(seen);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn combine_collects_outputs_into_arrays() {
    let (seen, record) = inputs_recorder();
    let engine = EngineBuilder::new()
        .configuration(config())
        .register_handler(
            "produce",
            handler(|ctx| WorkResult::success_with(ctx.input().clone())),
        )
        .unwrap()
        .register_handler("consume", handler(record))
        .unwrap()
        .build()
        .unwrap();

    let left = engine
        .begin_with(vec![
            WorkRequest::one_time("produce")
                .input(Data::empty().with("value", 1))
                .build(),
        ])
        .unwrap();
    let right = engine
        .begin_with(vec![
            WorkRequest::one_time("produce")
                .input(Data::empty().with("value", 2))
                .build(),
        ])
        .unwrap();
    let join = WorkRequest::one_time("consume")
        .input_merger("array_creating")
        .build();
    let join_id = join.id();
    let combined = WorkContinuation::combine(&[left, right], vec![join]).unwrap();
    assert_eq!(combined.ids().len(), 3);
    combined.enqueue().await.unwrap();

    wait_for_state(&engine, join_id, WorkState::Succeeded, WAIT)
        .await
        .unwrap();
    let seen = seen.lock().unwrap();
    let mut values: Vec<i64> = match seen[0].get("value") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
        other => panic!("expected an array, got {other:?}"),
    };
    values.sort();
    assert_eq!(values, vec![1, 2]);
    drop(seen);
    engine.shutdown().await;
}

#[tokio::test]
async fn keep_leaves_pending_unique_work_alone() {
    let (engine, _driver) = manual_engine(EngineBuilder::new()).await;
    let first = WorkRequest::one_time("sync").build();
    let first_id = first.id();
    engine
        .enqueue_unique_work("sync", ExistingWorkPolicy::Keep, vec![first])
        .unwrap()
        .await
        .unwrap();

    let second = WorkRequest::one_time("sync").build();
    let follow_up = WorkRequest::one_time("report").build();
    let (second_id, follow_up_id) = (second.id(), follow_up.id());
    let kept = engine
        .begin_unique_work("sync", ExistingWorkPolicy::Keep, vec![second])
        .unwrap()
        .then(vec![follow_up])
        .unwrap();
    kept.enqueue().await.unwrap();

    let statuses = engine.statuses_for_unique_work("sync");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].id, first_id);
    assert!(engine.status_by_id(second_id).is_none());
    assert!(engine.status_by_id(follow_up_id).is_none());
    assert!(kept.is_enqueued());
    engine.shutdown().await;
}

#[tokio::test]
async fn keep_replaces_finished_unique_work() {
    let (engine, driver) = manual_engine(
        EngineBuilder::new()
            .register_handler("sync", handler(|_| WorkResult::success()))
            .unwrap(),
    )
    .await;
    let first = WorkRequest::one_time("sync").build();
    let first_id = first.id();
    engine
        .enqueue_unique_work("sync", ExistingWorkPolicy::Keep, vec![first])
        .unwrap()
        .await
        .unwrap();
    driver.run_now(first_id).await;
    assert_eq!(state_of(&engine, first_id), Some(WorkState::Succeeded));

    let second = WorkRequest::one_time("sync").build();
    let second_id = second.id();
    engine
        .enqueue_unique_work("sync", ExistingWorkPolicy::Keep, vec![second])
        .unwrap()
        .await
        .unwrap();

    assert!(engine.status_by_id(first_id).is_none());
    assert_eq!(state_of(&engine, second_id), Some(WorkState::Enqueued));
    engine.shutdown().await;
}

#[tokio::test]
async fn replace_removes_the_existing_chain() {
    let (engine, _driver) = manual_engine(EngineBuilder::new()).await;
    let head = WorkRequest::one_time("sync").build();
    let tail = WorkRequest::one_time("report").build();
    let (head_id, tail_id) = (head.id(), tail.id());
    engine
        .begin_unique_work("sync", ExistingWorkPolicy::Replace, vec![head])
        .unwrap()
        .then(vec![tail])
        .unwrap()
        .enqueue()
        .await
        .unwrap();
    assert_eq!(engine.statuses_for_unique_work("sync").len(), 2);

    let replacement = WorkRequest::one_time("sync").build();
    let replacement_id = replacement.id();
    engine
        .enqueue_unique_work("sync", ExistingWorkPolicy::Replace, vec![replacement])
        .unwrap()
        .await
        .unwrap();

    assert!(engine.status_by_id(head_id).is_none());
    assert!(engine.status_by_id(tail_id).is_none());
    let statuses = engine.statuses_for_unique_work("sync");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].id, replacement_id);
    assert_eq!(statuses[0].state, WorkState::Enqueued);
    engine.shutdown().await;
}

#[tokio::test]
async fn append_waits_for_the_existing_leaves() {
    let (engine, driver) = manual_engine(
        EngineBuilder::new()
            .register_handler("sync", handler(|_| WorkResult::success()))
            .unwrap(),
    )
    .await;
    let first = WorkRequest::one_time("sync").build();
    let first_id = first.id();
    engine
        .enqueue_unique_work("sync", ExistingWorkPolicy::Append, vec![first])
        .unwrap()
        .await
        .unwrap();

    let appended = WorkRequest::one_time("sync").build();
    let appended_id = appended.id();
    engine
        .enqueue_unique_work("sync", ExistingWorkPolicy::Append, vec![appended])
        .unwrap()
        .await
        .unwrap();

    assert_eq!(state_of(&engine, appended_id), Some(WorkState::Blocked));
    let prerequisites = engine.core().db.read(|tx| tx.prerequisites(appended_id));
    assert_eq!(prerequisites, vec![first_id]);

    driver.run_now(first_id).await;
    assert_eq!(state_of(&engine, appended_id), Some(WorkState::Enqueued));
    driver.run_now(appended_id).await;
    assert_eq!(state_of(&engine, appended_id), Some(WorkState::Succeeded));
    engine.shutdown().await;
}

#[tokio::test]
async fn retry_backs_off_until_success() {
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let (engine, driver) = manual_engine(
        EngineBuilder::new()
            .clock(clock.clone())
            .register_handler(
                "flaky",
                handler(|ctx| {
                    if ctx.run_attempt_count() < 3 {
                        WorkResult::retry()
                    } else {
                        WorkResult::success()
                    }
                }),
            )
            .unwrap(),
    )
    .await;
    let request = WorkRequest::one_time("flaky").build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();

    for attempt in 1..=3 {
        assert!(driver.run_now(id).await, "attempt {attempt} should retry");
        let status = engine.status_by_id(id).unwrap();
        assert_eq!(status.state, WorkState::Enqueued);
        assert_eq!(status.run_attempt_count, attempt);
        let due = engine.core().db.read(|tx| tx.get(id).map(|record| record.next_run_time()));
        assert!(due.unwrap() > clock.now());
        clock.advance(Duration::from_secs(60 * 60));
    }
    assert!(!driver.run_now(id).await);
    let status = engine.status_by_id(id).unwrap();
    assert_eq!(status.state, WorkState::Succeeded);
    assert_eq!(status.run_attempt_count, 4);
    engine.shutdown().await;
}

#[tokio::test]
async fn processor_skips_work_that_is_not_due() {
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (engine, _driver) = manual_engine(
        EngineBuilder::new()
            .clock(clock.clone())
            .register_handler(
                "later",
                handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    WorkResult::success()
                }),
            )
            .unwrap(),
    )
    .await;
    let request = WorkRequest::one_time("later")
        .initial_delay(Duration::from_secs(60))
        .build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();

    assert!(engine.processor().start_work(id));
    tokio::time::timeout(WAIT, async {
        while engine.processor().is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(state_of(&engine, id), Some(WorkState::Enqueued));
    engine.shutdown().await;
}

#[tokio::test]
async fn periodic_work_advances_one_interval_per_run() {
    let start = Utc::now();
    let clock = Arc::new(FixedClock::new(start));
    let (engine, driver) = manual_engine(
        EngineBuilder::new()
            .clock(clock.clone())
            .register_handler("tick", handler(|_| WorkResult::success()))
            .unwrap(),
    )
    .await;
    let interval = Duration::from_secs(60 * 60);
    let request = WorkRequest::periodic("tick", interval).build();
    let id = request.id();
    engine
        .enqueue_unique_periodic_work("ticker", ExistingPeriodicWorkPolicy::Keep, request)
        .unwrap()
        .await
        .unwrap();

    for _ in 0..3 {
        assert!(!driver.run_now(id).await);
    }
    let status = engine.status_by_id(id).unwrap();
    assert_eq!(status.state, WorkState::Enqueued);
    assert_eq!(status.period_count, 3);
    assert_eq!(status.run_attempt_count, 0);
    let period_start = engine
        .core()
        .db
        .read(|tx| tx.get(id).map(|record| record.period_start_time))
        .unwrap();
    assert_eq!(period_start, start + TimeDelta::hours(3));
    engine.shutdown().await;
}

#[tokio::test]
async fn short_periodic_intervals_are_clamped() {
    let (engine, _driver) = manual_engine(EngineBuilder::new()).await;
    let request = WorkRequest::periodic("tick", Duration::from_millis(10)).build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();

    let interval = engine
        .core()
        .db
        .read(|tx| tx.get(id).and_then(|record| record.interval));
    assert_eq!(interval, Some(Duration::from_secs(1)));
    engine.shutdown().await;
}

#[tokio::test]
async fn periodic_work_is_rejected_in_chains() {
    let (engine, _driver) = manual_engine(EngineBuilder::new()).await;
    let periodic = WorkRequest::periodic("tick", Duration::from_secs(3600)).build();
    assert!(matches!(
        engine.begin_with(vec![periodic.clone()]),
        Err(EngineError::InvalidRequest(_))
    ));
    assert!(matches!(
        engine.enqueue_unique_periodic_work(
            "once",
            ExistingPeriodicWorkPolicy::Keep,
            WorkRequest::one_time("once").build()
        ),
        Err(EngineError::InvalidRequest(_))
    ));
    assert!(matches!(engine.enqueue(Vec::new()), Err(EngineError::EmptyWork(_))));
    engine.shutdown().await;
}

#[tokio::test]
async fn prune_keeps_records_with_unfinished_dependents() {
    let (engine, driver) = manual_engine(
        EngineBuilder::new()
            .register_handler("done", handler(|_| WorkResult::success()))
            .unwrap(),
    )
    .await;
    let lone = WorkRequest::one_time("done").build();
    let pending = WorkRequest::one_time("later").build();
    let head = WorkRequest::one_time("done").build();
    let tail = WorkRequest::one_time("later").build();
    let (lone_id, pending_id, head_id, tail_id) = (lone.id(), pending.id(), head.id(), tail.id());
    engine.enqueue(vec![lone, pending]).unwrap().await.unwrap();
    engine
        .begin_with(vec![head])
        .unwrap()
        .then(vec![tail])
        .unwrap()
        .enqueue()
        .await
        .unwrap();
    driver.run_now(lone_id).await;
    driver.run_now(head_id).await;

    engine.prune_work().await.unwrap();

    assert!(engine.status_by_id(lone_id).is_none());
    assert_eq!(state_of(&engine, pending_id), Some(WorkState::Enqueued));
    assert_eq!(state_of(&engine, head_id), Some(WorkState::Succeeded));
    assert_eq!(state_of(&engine, tail_id), Some(WorkState::Enqueued));
    engine.shutdown().await;
}

#[tokio::test]
async fn cancel_is_idempotent_and_reaches_dependents() {
    let (engine, _driver) = manual_engine(EngineBuilder::new()).await;
    let head = WorkRequest::one_time("a").tag("batch").build();
    let tail = WorkRequest::one_time("b").build();
    let (head_id, tail_id) = (head.id(), tail.id());
    engine
        .begin_with(vec![head])
        .unwrap()
        .then(vec![tail])
        .unwrap()
        .enqueue()
        .await
        .unwrap();

    engine.cancel_work_by_id(head_id).await.unwrap();
    engine.cancel_work_by_id(head_id).await.unwrap();
    engine.cancel_all_work_by_tag("batch").await.unwrap();
    engine
        .cancel_work_by_id(WorkId::generate())
        .await
        .unwrap();

    assert_eq!(state_of(&engine, head_id), Some(WorkState::Cancelled));
    assert_eq!(state_of(&engine, tail_id), Some(WorkState::Cancelled));
    engine.shutdown().await;
}

#[tokio::test]
async fn cancel_all_stamps_the_time() {
    let (engine, _driver) = manual_engine(EngineBuilder::new()).await;
    let mut stamped = engine.observe_last_cancel_all_time();
    assert!(engine.last_cancel_all_time().is_none());
    let request = WorkRequest::one_time("a").build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();

    engine.cancel_all_work().await.unwrap();

    assert!(engine.last_cancel_all_time().is_some());
    assert_eq!(state_of(&engine, id), Some(WorkState::Cancelled));
    tokio::time::timeout(WAIT, stamped.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_running_work_stops_it() {
    let engine = EngineBuilder::new()
        .configuration(config())
        .register_handler("wait", || Box::new(UntilStopped))
        .unwrap()
        .build()
        .unwrap();
    let request = WorkRequest::one_time("wait").build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();
    wait_for_state(&engine, id, WorkState::Running, WAIT)
        .await
        .unwrap();

    engine.cancel_work_by_id(id).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while engine.processor().is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(state_of(&engine, id), Some(WorkState::Cancelled));
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_handler_fails_with_a_diagnostic() {
    let engine = EngineBuilder::new().configuration(config()).build().unwrap();
    let missing = WorkRequest::one_time("missing").build();
    let dependent = WorkRequest::one_time("missing").build();
    let (missing_id, dependent_id) = (missing.id(), dependent.id());
    engine
        .begin_with(vec![missing])
        .unwrap()
        .then(vec![dependent])
        .unwrap()
        .enqueue()
        .await
        .unwrap();

    let status = wait_for_state(&engine, missing_id, WorkState::Failed, WAIT)
        .await
        .unwrap();
    assert!(status.output.get_str("error").is_some());
    assert_eq!(status.run_attempt_count, 0);
    wait_for_state(&engine, dependent_id, WorkState::Failed, WAIT)
        .await
        .unwrap();
    engine.shutdown().await;
}

struct Erroring;

#[async_trait]
impl WorkHandler for Erroring {
    async fn do_work(&self, _ctx: WorkContext) -> Result<WorkResult, HandlerError> {
        Err("disk full".into())
    }
}

fn erroring() -> Box<dyn WorkHandler> {
    Box::new(Erroring)
}

fn panicking() -> Box<dyn WorkHandler> {
    Box::new(FnHandler(|_: &WorkContext| -> WorkResult {
        panic!("handler blew up")
    }))
}

fn oversized() -> Box<dyn WorkHandler> {
    Box::new(FnHandler(|_: &WorkContext| {
        WorkResult::success_with(Data::empty().with("blob", "x".repeat(MAX_DATA_BYTES + 1)))
    }))
}

async fn chain(engine: &WorkEngine, name: &str) -> (WorkId, WorkId) {
    let head = WorkRequest::one_time(name).build();
    let tail = WorkRequest::one_time(name).build();
    let ids = (head.id(), tail.id());
    engine
        .begin_with(vec![head])
        .unwrap()
        .then(vec![tail])
        .unwrap()
        .enqueue()
        .await
        .unwrap();
    ids
}

#[rstest]
#[case::returns_an_error(erroring, false)]
#[case::panics(panicking, false)]
#[case::output_over_the_limit(oversized, true)]
#[tokio::test]
async fn broken_attempts_fail_the_work_and_its_dependents(
    #[case] factory: fn() -> Box<dyn WorkHandler>,
    #[case] with_diagnostic: bool,
) {
    let (engine, driver) =
        manual_engine(EngineBuilder::new().register_handler("job", factory).unwrap()).await;
    let (head_id, tail_id) = chain(&engine, "job").await;

    assert!(!driver.run_now(head_id).await);

    let status = engine.status_by_id(head_id).unwrap();
    assert_eq!(status.state, WorkState::Failed);
    assert_eq!(status.run_attempt_count, 1);
    if with_diagnostic {
        let error = status.output.get_str("error").unwrap();
        assert!(error.contains(&MAX_DATA_BYTES.to_string()), "{error}");
    } else {
        assert_eq!(status.output, Data::empty());
    }
    assert_eq!(state_of(&engine, tail_id), Some(WorkState::Failed));
    engine.shutdown().await;
}

#[tokio::test]
async fn unregistered_input_merger_fails_before_running() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (engine, driver) = manual_engine(
        EngineBuilder::new()
            .register_handler(
                "job",
                handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    WorkResult::success()
                }),
            )
            .unwrap(),
    )
    .await;
    let head = WorkRequest::one_time("job").input_merger("nope").build();
    let tail = WorkRequest::one_time("job").build();
    let (head_id, tail_id) = (head.id(), tail.id());
    engine
        .begin_with(vec![head])
        .unwrap()
        .then(vec![tail])
        .unwrap()
        .enqueue()
        .await
        .unwrap();

    driver.run_now(head_id).await;

    let status = engine.status_by_id(head_id).unwrap();
    assert_eq!(status.state, WorkState::Failed);
    assert_eq!(status.run_attempt_count, 0);
    assert_eq!(
        status.output.get_str("error"),
        Some("input merger 'nope' is not registered")
    );
    assert_eq!(state_of(&engine, tail_id), Some(WorkState::Failed));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn duplicate_enqueue_fails_the_operation() {
    let (engine, _driver) = manual_engine(EngineBuilder::new()).await;
    let request = WorkRequest::one_time("a").build();
    engine.enqueue(vec![request.clone()]).unwrap().await.unwrap();

    let operation = engine.enqueue(vec![request]).unwrap();
    assert!(operation.clone().await.is_err());
    assert!(matches!(operation.state(), OperationState::Failure(_)));
    engine.shutdown().await;
}

#[tokio::test]
async fn continuation_enqueues_once() {
    let (engine, _driver) = manual_engine(EngineBuilder::new()).await;
    let continuation = engine
        .begin_with(vec![WorkRequest::one_time("a").build()])
        .unwrap()
        .then(vec![WorkRequest::one_time("b").build()])
        .unwrap();
    assert!(!continuation.is_enqueued());

    continuation.enqueue().await.unwrap();
    continuation.enqueue().await.unwrap();

    let statuses = continuation.statuses();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].state, WorkState::Enqueued);
    assert_eq!(statuses[1].state, WorkState::Blocked);
    engine.shutdown().await;
}

#[tokio::test]
async fn processor_runs_each_id_once_at_a_time() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (engine, _driver) = manual_engine(
        EngineBuilder::new()
            .register_handler(
                "count",
                handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    WorkResult::success()
                }),
            )
            .unwrap(),
    )
    .await;
    let request = WorkRequest::one_time("count").build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();

    let processor = engine.processor();
    assert!(processor.start_work(id));
    assert!(!processor.start_work(id));
    wait_for_state(&engine, id, WorkState::Succeeded, WAIT)
        .await
        .unwrap();
    tokio::time::timeout(WAIT, async {
        while processor.is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observers_see_every_state_change() {
    let engine = EngineBuilder::new()
        .configuration(config())
        .register_handler("tagged", handler(|_| WorkResult::success()))
        .unwrap()
        .build()
        .unwrap();
    let request = WorkRequest::one_time("tagged").tag("nightly").build();
    let id = request.id();
    let mut by_id = engine.observe_status_by_id(id);
    let mut by_tag = engine.observe_statuses_by_tag("nightly");
    assert!(by_id.borrow_and_update().is_none());
    assert!(by_tag.borrow_and_update().is_empty());

    engine.enqueue(vec![request]).unwrap().await.unwrap();

    tokio::time::timeout(
        WAIT,
        by_tag.wait_for(|statuses| {
            statuses.len() == 1 && statuses[0].state == WorkState::Succeeded
        }),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::timeout(
        WAIT,
        by_id.wait_for(|status| {
            status
                .as_ref()
                .is_some_and(|status| status.state == WorkState::Succeeded)
        }),
    )
    .await
    .unwrap()
    .unwrap();
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_is_visible_while_running() {
    let engine = EngineBuilder::new()
        .configuration(config())
        .register_handler(
            "report",
            handler(|ctx| {
                ctx.set_progress(Data::empty().with("percent", 50));
                WorkResult::success()
            }),
        )
        .unwrap()
        .without_default_schedulers()
        .build()
        .unwrap();
    let driver = TestDriver::new(&engine);
    let request = WorkRequest::one_time("report").build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();
    let mut progress = engine.observe_progress(id);

    driver.run_now(id).await;

    assert_eq!(
        progress.borrow_and_update().get("percent"),
        Some(&json!(50))
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn progress_of_unknown_or_finished_work_is_closed_and_untracked() {
    let (engine, driver) = manual_engine(
        EngineBuilder::new()
            .register_handler("done", handler(|_| WorkResult::success()))
            .unwrap(),
    )
    .await;
    let progress = &engine.core().progress;

    for _ in 0..100 {
        let unknown = WorkId::generate();
        let rx = engine.observe_progress(unknown);
        assert!(rx.has_changed().is_err());
        assert!(!progress.is_tracking(unknown));
    }

    let request = WorkRequest::one_time("done").build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();
    driver.run_now(id).await;
    assert_eq!(state_of(&engine, id), Some(WorkState::Succeeded));

    let rx = engine.observe_progress(id);
    assert!(rx.has_changed().is_err());
    assert!(!progress.is_tracking(id));
    assert_eq!(progress.tracked_count(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn early_progress_channels_close_when_work_finishes_without_running() {
    let (engine, _driver) = manual_engine(EngineBuilder::new()).await;
    let head = WorkRequest::one_time("a").build();
    let tail = WorkRequest::one_time("b").build();
    let (head_id, tail_id) = (head.id(), tail.id());
    engine
        .begin_with(vec![head])
        .unwrap()
        .then(vec![tail])
        .unwrap()
        .enqueue()
        .await
        .unwrap();
    let mut head_rx = engine.observe_progress(head_id);
    let _tail_rx = engine.observe_progress(tail_id);
    let progress = &engine.core().progress;
    assert!(progress.is_tracking(head_id));
    assert!(progress.is_tracking(tail_id));
    assert!(head_rx.has_changed().is_ok());

    engine.cancel_work_by_id(head_id).await.unwrap();

    assert!(!progress.is_tracking(head_id));
    assert!(!progress.is_tracking(tail_id));
    assert!(head_rx.has_changed().is_err());
    engine.shutdown().await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Schedule(WorkId),
    Cancel(WorkId),
}

/// Backend that only remembers what it was told.
#[derive(Default)]
struct RecordingBackend {
    triggers: Mutex<Vec<Trigger>>,
}

impl RecordingBackend {
    fn triggers(&self) -> Vec<Trigger> {
        self.triggers.lock().unwrap().clone()
    }
}

impl Scheduler for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn schedule(&self, records: &[WorkRecord]) {
        let mut triggers = self.triggers.lock().unwrap();
        triggers.extend(records.iter().map(|record| Trigger::Schedule(record.id)));
    }

    fn cancel(&self, id: WorkId) {
        self.triggers.lock().unwrap().push(Trigger::Cancel(id));
    }
}

#[rstest]
#[case::retry(WorkRequest::one_time("retry").build())]
#[case::periodic(WorkRequest::periodic("tick", Duration::from_secs(60)).build())]
#[tokio::test]
async fn backends_drop_old_triggers_before_unfinished_work_is_rescheduled(
    #[case] request: WorkRequest,
) {
    let backend = Arc::new(RecordingBackend::default());
    let installed = Arc::clone(&backend);
    let (engine, driver) = manual_engine(
        EngineBuilder::new()
            .register_handler("retry", handler(|_| WorkResult::retry()))
            .unwrap()
            .register_handler("tick", handler(|_| WorkResult::success()))
            .unwrap()
            .with_scheduler(move |_, _| installed as Arc<dyn Scheduler>),
    )
    .await;
    let id = request.id();
    let periodic = request.is_periodic();
    engine.enqueue(vec![request]).unwrap().await.unwrap();
    assert_eq!(backend.triggers(), vec![Trigger::Schedule(id)]);

    driver.run_now(id).await;

    assert_eq!(
        backend.triggers(),
        vec![Trigger::Schedule(id), Trigger::Cancel(id), Trigger::Schedule(id)]
    );
    let status = engine.status_by_id(id).unwrap();
    assert_eq!(status.state, WorkState::Enqueued);
    if periodic {
        assert_eq!(status.period_count, 1);
    } else {
        assert_eq!(status.run_attempt_count, 1);
    }
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn constrained_work_waits_until_its_conditions_hold() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let tracker = Arc::new(InMemoryConstraintTracker::new());
    let engine = EngineBuilder::new()
        .configuration(config())
        .constraint_tracker(tracker.clone())
        .register_handler(
            "upload",
            handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                WorkResult::success()
            }),
        )
        .unwrap()
        .build()
        .unwrap();
    let request = WorkRequest::one_time("upload").require("network").build();
    let id = request.id();

    engine.enqueue(vec![request]).unwrap().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state_of(&engine, id), Some(WorkState::Enqueued));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tracker.set("network", true);

    wait_for_state(&engine, id, WorkState::Succeeded, WAIT)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_a_constraint_mid_run_counts_as_a_retry() {
    let tracker = Arc::new(InMemoryConstraintTracker::new());
    tracker.set("charging", true);
    let engine = EngineBuilder::new()
        .configuration(config())
        .constraint_tracker(tracker.clone())
        .register_handler("backup", || Box::new(UntilStopped))
        .unwrap()
        .build()
        .unwrap();
    let request = WorkRequest::one_time("backup").require("charging").build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();
    wait_for_state(&engine, id, WorkState::Running, WAIT)
        .await
        .unwrap();

    tracker.set("charging", false);

    let status = wait_for_state(&engine, id, WorkState::Enqueued, WAIT)
        .await
        .unwrap();
    assert_eq!(status.run_attempt_count, 1);
    assert!(status.output.is_empty());
    tokio::time::timeout(WAIT, async {
        while engine.processor().is_running(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let record = engine.core().db.read(|tx| tx.get(id).cloned()).unwrap();
    assert!(record.is_backed_off());
    assert!(record.next_run_time() > Utc::now());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_driver_still_honours_constraints() {
    let tracker = Arc::new(InMemoryConstraintTracker::new());
    let (engine, driver) = manual_engine(
        EngineBuilder::new()
            .constraint_tracker(tracker.clone())
            .register_handler("upload", handler(|_| WorkResult::success()))
            .unwrap(),
    )
    .await;
    let request = WorkRequest::one_time("upload").require("network").build();
    let id = request.id();
    engine.enqueue(vec![request]).unwrap().await.unwrap();

    assert!(!driver.run_now(id).await);
    let status = engine.status_by_id(id).unwrap();
    assert_eq!(status.state, WorkState::Enqueued);
    assert_eq!(status.run_attempt_count, 0);

    tracker.set("network", true);
    driver.run_now(id).await;
    assert_eq!(state_of(&engine, id), Some(WorkState::Succeeded));
    engine.shutdown().await;
}

#[tokio::test]
async fn unclean_restart_requeues_running_work() {
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let first = EngineBuilder::new()
        .configuration(config())
        .snapshot_store(snapshots.clone())
        .without_default_schedulers()
        .build()
        .unwrap();
    first.recovery().await.unwrap();
    let request = WorkRequest::one_time("a").build();
    let id = request.id();
    first.enqueue(vec![request]).unwrap().await.unwrap();
    first
        .core()
        .db
        .transaction(|tx| {
            tx.update(id, |record| record.start_attempt());
            Ok::<_, crate::domain::StoreError>(())
        })
        .unwrap();
    // The process "dies" without shutting down.
    first.core().executor.close();

    let second = EngineBuilder::new()
        .configuration(config())
        .snapshot_store(snapshots)
        .without_default_schedulers()
        .build()
        .unwrap();
    second.recovery().await.unwrap();

    let report = second.recovery_report().unwrap();
    assert!(report.unclean_shutdown);
    assert_eq!(report.reset, vec![id]);
    assert_eq!(state_of(&second, id), Some(WorkState::Enqueued));
    second.shutdown().await;
}

#[tokio::test]
async fn clean_restart_keeps_records_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = Configuration {
        snapshot_path: Some(dir.path().join("work.json")),
        ..config()
    };
    let first = EngineBuilder::new()
        .configuration(config.clone())
        .without_default_schedulers()
        .build()
        .unwrap();
    let request = WorkRequest::one_time("a").tag("kept").build();
    let id = request.id();
    first.enqueue(vec![request]).unwrap().await.unwrap();
    first.shutdown().await;
    assert!(first.enqueue(vec![WorkRequest::one_time("a").build()]).unwrap().await.is_err());

    let second = EngineBuilder::new()
        .configuration(config)
        .without_default_schedulers()
        .build()
        .unwrap();
    second.recovery().await.unwrap();

    assert!(!second.recovery_report().unwrap().unclean_shutdown);
    let statuses = second.statuses_by_tag("kept");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].id, id);
    second.shutdown().await;
}
