//! Job queue behavior against the SQLite store: retries, cancellation,
//! synchronous execution with deadlines, pool limits and recovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use tokio::sync::Notify;

use hubsync::clock::{Clock, ManualClock};
use hubsync::error::{Error, Result};
use hubsync::jobs::{
    HandlerRegistry, HandlerSpec, JobContext, JobHandler, JobQueue, JobStore, JobsConfig, QueueConfig, RetryPolicy,
};
use hubsync::journal::JournalKind;
use hubsync::model::job::{Job, JobId, JobState, JobUpdate};
use hubsync::storage::Storage;

// ---------------------------------------------------------------------------
// Test handlers
// ---------------------------------------------------------------------------

/// Fails transiently `failures` times, then returns its call count.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
    failed_with: std::sync::Mutex<Option<String>>,
}

impl Flaky {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            failed_with: std::sync::Mutex::new(None),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for Flaky {
    async fn run(&self, ctx: &JobContext, _args: &[Value]) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(ctx.attempt, n);
        if n <= self.failures {
            return Err(Error::TransientUpstream(format!("attempt {n}: 503")));
        }
        Ok(json!({ "calls": n }))
    }

    async fn on_failure(&self, _ctx: &JobContext, _args: &[Value], error: &Error) {
        *self.failed_with.lock().unwrap() = Some(error.to_string());
    }
}

/// Sleeps before succeeding.
struct Slow(Duration);

#[async_trait]
impl JobHandler for Slow {
    async fn run(&self, _ctx: &JobContext, _args: &[Value]) -> Result<Value> {
        tokio::time::sleep(self.0).await;
        Ok(json!("done"))
    }
}

/// Blocks until released.
struct Held(Arc<Notify>);

#[async_trait]
impl JobHandler for Held {
    async fn run(&self, _ctx: &JobContext, _args: &[Value]) -> Result<Value> {
        self.0.notified().await;
        Ok(Value::Null)
    }
}

/// Records how many of its attempts overlap.
#[derive(Default)]
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for Gauge {
    async fn run(&self, _ctx: &JobContext, _args: &[Value]) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

/// Echoes its first argument; rejects credentials when asked to.
struct Echo;

#[async_trait]
impl JobHandler for Echo {
    async fn run(&self, _ctx: &JobContext, args: &[Value]) -> Result<Value> {
        match args.first() {
            Some(Value::String(s)) if s == "revoked" => Err(Error::AuthInvalid {
                service: "trello".into(),
                message: "revoked".into(),
            }),
            Some(v) => Ok(v.clone()),
            None => Ok(Value::Null),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    queue: JobQueue,
    store: Arc<Storage>,
    clock: Arc<ManualClock>,
}

fn harness(register: impl FnOnce(&mut HandlerRegistry)) -> Harness {
    harness_with(JobsConfig::default(), register)
}

fn harness_with(config: JobsConfig, register: impl FnOnce(&mut HandlerRegistry)) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()));
    let store = Arc::new(Storage::in_memory().unwrap().with_clock(clock.clone()));
    let mut registry = HandlerRegistry::with_overrides(config);
    registry.register("echo", Arc::new(Echo), HandlerSpec::default());
    register(&mut registry);
    let queue = JobQueue::new(
        store.clone(),
        Arc::new(registry),
        clock.clone(),
        QueueConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 16,
        },
    );
    Harness { queue, store, clock }
}

fn fixed(attempts: u32, delay_secs: u64) -> HandlerSpec {
    HandlerSpec::default().policy(RetryPolicy::Fixed {
        attempts,
        delay: Duration::from_secs(delay_secs),
    })
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_exhaust_attempts_then_fail() {
    let flaky = Flaky::new(u32::MAX);
    let h = harness(|r| {
        r.register("flaky", flaky.clone(), fixed(3, 10));
    });
    let id = h.queue.enqueue("flaky", vec![]).await.unwrap();

    assert_eq!(h.queue.run_until_idle().await.unwrap(), 1);
    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.as_deref().unwrap().contains("attempt 1"));

    // Not due until the retry delay passes.
    assert_eq!(h.queue.run_until_idle().await.unwrap(), 0);
    for _ in 0..2 {
        h.clock.advance(Duration::from_secs(10));
        assert_eq!(h.queue.run_until_idle().await.unwrap(), 1);
    }

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.finished_at.is_some());
    assert_eq!(flaky.calls(), 3);
    assert!(flaky.failed_with.lock().unwrap().as_deref().unwrap().contains("attempt 3"));
    assert_eq!(h.queue.failed(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn fibonacci_backoff_spaces_retries() {
    let flaky = Flaky::new(3);
    let h = harness(|r| {
        r.register(
            "flaky",
            flaky.clone(),
            HandlerSpec::default().policy(RetryPolicy::Fibonacci {
                attempts: 5,
                base: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
            }),
        );
    });
    let id = h.queue.enqueue("flaky", vec![]).await.unwrap();

    let mut waits = Vec::new();
    loop {
        h.queue.run_until_idle().await.unwrap();
        let job = h.queue.get(id).await.unwrap();
        if job.state != JobState::Queued {
            break;
        }
        let wait = (job.run_at - h.clock.now()).num_seconds();
        waits.push(wait);
        h.clock.advance(Duration::from_secs(wait as u64));
    }

    assert_eq!(waits, vec![2, 2, 4]);
    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.result, Some(json!({ "calls": 4 })));
}

#[tokio::test]
async fn terminal_error_fails_without_retry() {
    let h = harness(|_| {});
    let id = h.queue.enqueue("echo", vec![json!("revoked")]).await.unwrap();
    h.queue.run_until_idle().await.unwrap();

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_only_applies_to_queued_jobs() {
    let h = harness(|_| {});
    let later = h
        .queue
        .schedule("echo", Duration::from_secs(60), vec![json!(1)])
        .await
        .unwrap();
    let cancelled = h.queue.cancel(later).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(matches!(h.queue.cancel(later).await, Err(Error::InvalidTransition { .. })));

    h.clock.advance(Duration::from_secs(120));
    assert_eq!(h.queue.run_until_idle().await.unwrap(), 0);

    let running = h.queue.enqueue("echo", vec![json!(2)]).await.unwrap();
    h.store
        .transition(running, JobState::Queued, JobState::Executing, JobUpdate::begin_attempt())
        .await
        .unwrap();
    assert!(matches!(h.queue.cancel(running).await, Err(Error::InvalidTransition { .. })));
    assert_eq!(h.queue.get(running).await.unwrap().state, JobState::Executing);
}

#[tokio::test]
async fn unknown_handler_and_job_are_reported() {
    let h = harness(|_| {});
    assert!(matches!(
        h.queue.enqueue("nope", vec![]).await,
        Err(Error::UnknownHandler(name)) if name == "nope"
    ));
    let missing = hubsync::model::job::JobId::new();
    assert!(matches!(h.queue.get(missing).await, Err(Error::NotFound(_))));
}

// ---------------------------------------------------------------------------
// Synchronous execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn do_sync_returns_the_handler_result() {
    let h = harness(|_| {});
    let value = h
        .queue
        .do_sync("echo", vec![json!({ "id": 9 })], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(value, json!({ "id": 9 }));

    let jobs = h.queue.list(Some(JobState::Finished), 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].inline);
}

#[tokio::test]
async fn do_sync_retries_inline_before_returning() {
    let flaky = Flaky::new(2);
    let h = harness(|r| {
        r.register(
            "flaky",
            flaky.clone(),
            HandlerSpec::default().policy(RetryPolicy::Fixed {
                attempts: 3,
                delay: Duration::from_millis(5),
            }),
        );
    });
    let value = h.queue.do_sync("flaky", vec![], Duration::from_secs(5)).await.unwrap();
    assert_eq!(value, json!({ "calls": 3 }));
}

#[tokio::test]
async fn do_sync_surfaces_terminal_errors() {
    let h = harness(|_| {});
    let err = h
        .queue
        .do_sync("echo", vec![json!("revoked")], Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthInvalid { .. }));
}

#[tokio::test]
async fn do_sync_deadline_hands_the_job_to_the_dispatcher() {
    let h = harness(|r| {
        r.register("slow", Arc::new(Slow(Duration::from_millis(200))), HandlerSpec::default());
    });

    let err = h
        .queue
        .do_sync("slow", vec![], Duration::from_millis(20))
        .await
        .unwrap_err();
    let Error::DeadlineExceeded(timeout, id) = err else {
        panic!("expected deadline, got {err:?}");
    };
    assert_eq!(timeout, Duration::from_millis(20));

    let id = id.parse().unwrap();
    let job = h.queue.get(id).await.unwrap();
    assert!(!job.inline);
    assert_eq!(job.state, JobState::Queued);

    assert_eq!(h.queue.run_until_idle().await.unwrap(), 1);
    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.result, Some(json!("done")));

    let journal = h.queue.journal_since(0).await.unwrap();
    assert!(journal.iter().any(|e| e.kind == JournalKind::JobDetached { id }));
}

#[tokio::test]
async fn inline_jobs_are_invisible_to_the_dispatcher() {
    let release = Arc::new(Notify::new());
    let h = harness(|r| {
        r.register("held", Arc::new(Held(release.clone())), HandlerSpec::default());
    });

    let queue = h.queue.clone();
    let waiter = tokio::spawn(async move { queue.do_sync("held", vec![], Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.queue.dispatch_due().await.unwrap(), 0);
    release.notify_one();
    assert_eq!(waiter.await.unwrap().unwrap(), Value::Null);
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pool_size_caps_concurrent_attempts() {
    let release = Arc::new(Notify::new());
    let h = harness(|r| {
        r.register(
            "held",
            Arc::new(Held(release.clone())),
            HandlerSpec::default().pool("serial").pool_size(1),
        );
    });
    for _ in 0..3 {
        h.queue.enqueue("held", vec![]).await.unwrap();
    }

    assert_eq!(h.queue.dispatch_due().await.unwrap(), 1);
    assert_eq!(h.queue.dispatch_due().await.unwrap(), 0);

    release.notify_one();
    // The slot frees once the first job settles.
    let mut spawned = 0;
    for _ in 0..100 {
        spawned = h.queue.dispatch_due().await.unwrap();
        if spawned > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(spawned, 1);
    assert_eq!(h.queue.list(Some(JobState::Finished), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn do_sync_respects_the_pool_size() {
    let gauge = Arc::new(Gauge::default());
    let h = harness(|r| {
        r.register("serial", gauge.clone(), HandlerSpec::default().pool("serial").pool_size(1));
    });
    let timeout = Duration::from_secs(5);

    let (a, b, c) = tokio::join!(
        h.queue.do_sync("serial", vec![], timeout),
        h.queue.do_sync("serial", vec![], timeout),
        h.queue.do_sync("serial", vec![], timeout),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(gauge.calls.load(Ordering::SeqCst), 3);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn do_sync_waits_for_a_slot_held_by_a_background_job() {
    let release = Arc::new(Notify::new());
    let gauge = Arc::new(Gauge::default());
    let h = harness(|r| {
        r.register(
            "held",
            Arc::new(Held(release.clone())),
            HandlerSpec::default().pool("serial").pool_size(1),
        )
        .register("serial", gauge.clone(), HandlerSpec::default().pool("serial").pool_size(1));
    });
    h.queue.enqueue("held", vec![]).await.unwrap();
    assert_eq!(h.queue.dispatch_due().await.unwrap(), 1);

    let err = h
        .queue
        .do_sync("serial", vec![], Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded(..)));
    assert_eq!(gauge.calls.load(Ordering::SeqCst), 0);
    release.notify_one();
}

#[tokio::test]
async fn run_loop_processes_enqueued_jobs_until_shutdown() {
    let h = harness(|_| {});
    let queue = h.queue.clone();
    let dispatcher = tokio::spawn(async move { queue.run().await });

    let id = h.queue.enqueue("echo", vec![json!("hi")]).await.unwrap();
    for _ in 0..100 {
        if h.queue.get(id).await.unwrap().state == JobState::Finished {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.queue.get(id).await.unwrap().result, Some(json!("hi")));

    h.queue.shutdown();
    dispatcher.await.unwrap().unwrap();
}

#[tokio::test]
async fn recover_requeues_interrupted_background_jobs() {
    let h = harness(|_| {});
    let id = h.queue.enqueue("echo", vec![json!(5)]).await.unwrap();
    h.store
        .transition(id, JobState::Queued, JobState::Executing, JobUpdate::begin_attempt())
        .await
        .unwrap();

    assert_eq!(h.queue.recover().await.unwrap(), vec![id]);
    assert_eq!(h.queue.get(id).await.unwrap().state, JobState::Queued);
    h.queue.run_until_idle().await.unwrap();
    assert_eq!(h.queue.get(id).await.unwrap().state, JobState::Finished);
    assert!(h.queue.recover().await.unwrap().is_empty());
}

/// A synchronous job as a crashed caller left it.
fn orphaned_inline(h: &Harness, state: JobState, attempts: u32, run_at_secs: i64) -> Job {
    let now = h.clock.now();
    Job {
        id: JobId::new(),
        handler: "echo".into(),
        pool: "echo".into(),
        args: vec![json!("late")],
        state,
        attempts,
        max_attempts: 5,
        run_at: now + chrono::Duration::seconds(run_at_secs),
        inline: true,
        last_error: Some("attempt 1: 503".into()),
        result: None,
        created_at: now,
        updated_at: now,
        finished_at: None,
    }
}

#[tokio::test]
async fn recover_hands_orphaned_sync_jobs_to_the_dispatcher() {
    let h = harness(|_| {});
    let between_retries = orphaned_inline(&h, JobState::Queued, 1, 60);
    let mid_attempt = orphaned_inline(&h, JobState::Executing, 2, -5);
    h.store.insert_job(&between_retries).await.unwrap();
    h.store.insert_job(&mid_attempt).await.unwrap();

    let mut recovered = h.queue.recover().await.unwrap();
    recovered.sort_by_key(|id| id.to_string());
    let mut expected = vec![between_retries.id, mid_attempt.id];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(recovered, expected);

    let queued = h.queue.get(between_retries.id).await.unwrap();
    assert_eq!(queued.state, JobState::Queued);
    assert!(!queued.inline);
    assert_eq!(queued.run_at, between_retries.run_at, "backoff is kept");

    // The interrupted attempt runs right away; the other waits out its delay.
    h.queue.run_until_idle().await.unwrap();
    assert_eq!(h.queue.get(mid_attempt.id).await.unwrap().state, JobState::Finished);
    assert_eq!(h.queue.get(between_retries.id).await.unwrap().state, JobState::Queued);

    h.clock.advance(Duration::from_secs(60));
    h.queue.run_until_idle().await.unwrap();
    let done = h.queue.get(between_retries.id).await.unwrap();
    assert_eq!(done.state, JobState::Finished);
    assert_eq!(done.attempts, 2);
    assert_eq!(done.result, Some(json!("late")));

    let recovered_entries = h
        .queue
        .journal_since(0)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.kind, JournalKind::JobRecovered { .. }))
        .count();
    assert_eq!(recovered_entries, 2);
    assert!(h.queue.recover().await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Configuration and journal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn toml_overrides_the_registered_policy() {
    let config = JobsConfig::from_toml(
        r#"
        [handlers.flaky]
        policy = "none"
        "#,
    )
    .unwrap();
    let flaky = Flaky::new(1);
    let h = harness_with(config, |r| {
        r.register("flaky", flaky.clone(), fixed(5, 1));
    });

    let id = h.queue.enqueue("flaky", vec![]).await.unwrap();
    h.queue.run_until_idle().await.unwrap();
    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.max_attempts, 1);
    assert_eq!(job.state, JobState::Failed);
}

#[tokio::test]
async fn journal_records_each_transition_in_order() {
    let h = harness(|_| {});
    let id = h.queue.enqueue("echo", vec![]).await.unwrap();
    h.queue.run_until_idle().await.unwrap();

    let entries = h.queue.journal_since(0).await.unwrap();
    let kinds: Vec<&str> = entries
        .iter()
        .map(|e| match &e.kind {
            JournalKind::JobQueued { id: j, .. } if *j == id => "queued",
            JournalKind::JobStarted { id: j, attempt: 1 } if *j == id => "started",
            JournalKind::JobFinished { id: j, .. } if *j == id => "finished",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["queued", "started", "finished"]);
    assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));

    let last = entries.last().unwrap().seq;
    assert!(h.queue.journal_since(last).await.unwrap().is_empty());
}
