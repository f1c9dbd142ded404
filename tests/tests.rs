use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use gangpool::{
    Context,
    Executor,
    ExecutorError,
    Job,
    RejectedJob,
    Shutdown,
    TaskError,
    TaskStatus,
    WorkerPool,
};

fn small_pool() -> WorkerPool {
    WorkerPool::builder().max_workers(5).buffer_size(1).build()
}

fn sleeper(duration: Duration) -> impl Fn(&Context) -> Result<(), io::Error> + Send + Sync + 'static {
    move |_: &Context| {
        thread::sleep(duration);
        Ok(())
    }
}

fn until_cancelled(ctx: &Context) -> Result<(), io::Error> {
    while !ctx.is_cancelled() {
        thread::sleep(Duration::from_millis(5));
    }

    Ok(())
}

#[test]
#[should_panic(expected = "worker pool name must not contain null bytes")]
fn name_with_null_bytes_panics() {
    WorkerPool::builder().name("uh\0oh").build();
}

#[test]
#[should_panic(expected = "worker pool capacity must be non-zero")]
fn zero_capacity_panics() {
    WorkerPool::builder().max_workers(0);
}

#[test]
fn full_width_task_runs_immediately() {
    let pool = small_pool();

    let task = pool.submit(&Context::background(), sleeper(Duration::from_millis(300)), 5);
    assert_eq!(task.status(), TaskStatus::Running);
    assert_eq!(pool.running_workers(), 5);

    task.wait();
    assert_eq!(task.status(), TaskStatus::Done);
    assert!(task.err().is_none());

    pool.stop();
}

#[test]
fn saturated_pool_enqueues_then_rejects() {
    let pool = small_pool();
    let ctx = Context::background();

    let first = pool.submit(&ctx, sleeper(Duration::from_millis(300)), 5);
    assert_eq!(first.status(), TaskStatus::Running);

    let second = pool.submit(&ctx, sleeper(Duration::from_millis(10)), 5);
    assert_eq!(second.status(), TaskStatus::Enqueued);
    assert_eq!(pool.pending_tasks(), 1);

    let started = Instant::now();
    let third = pool.submit(&ctx, sleeper(Duration::from_millis(10)), 5);
    assert_eq!(third.status(), TaskStatus::QueueFull);
    assert!(matches!(third.err(), Some(TaskError::QueueFull)));
    assert!(started.elapsed() < Duration::from_millis(100));

    // The rejected handle behaves like a finished task.
    third.wait();
    third.kill();
    assert!(third.is_finished());
    assert_eq!(third.status(), TaskStatus::QueueFull);

    second.wait();
    assert_eq!(first.status(), TaskStatus::Done);
    assert_eq!(second.status(), TaskStatus::Done);
    assert_eq!(pool.pending_tasks(), 0);

    pool.stop();
}

#[test]
fn retried_task_keeps_its_backlog_slot() {
    let pool = WorkerPool::builder()
        .max_workers(2)
        .buffer_size(2)
        .retry_backoff(Duration::from_millis(1))
        .build();
    let ctx = Context::background();

    let blocker = pool.submit(&ctx, until_cancelled, 2);
    assert_eq!(blocker.status(), TaskStatus::Running);

    let waiting = (0..2)
        .map(|_| pool.submit(&ctx, sleeper(Duration::ZERO), 1))
        .collect::<Vec<_>>();

    for task in &waiting {
        assert_eq!(task.status(), TaskStatus::Enqueued);
    }

    // The drain thread keeps taking both tasks off the backlog and putting
    // them back. Submissions racing with it must never see a free slot.
    let started = Instant::now();
    let mut attempts = 0;

    while started.elapsed() < Duration::from_millis(200) {
        let task = pool.submit(&ctx, sleeper(Duration::ZERO), 1);
        assert_eq!(task.status(), TaskStatus::QueueFull);
        assert_eq!(pool.pending_tasks(), 2);
        attempts += 1;
    }

    assert!(attempts > 0);

    blocker.kill();

    for task in &waiting {
        assert!(task.wait_timeout(Duration::from_secs(5)));
        assert_eq!(task.status(), TaskStatus::Done);
    }

    assert_eq!(pool.pending_tasks(), 0);
    pool.stop();
}

#[test]
fn backed_off_task_still_counts_against_backlog() {
    let pool = WorkerPool::builder()
        .max_workers(1)
        .buffer_size(1)
        .retry_backoff(Duration::from_secs(30))
        .build();
    let ctx = Context::background();

    let blocker = pool.submit(&ctx, until_cancelled, 1);
    let waiting = pool.submit(&ctx, sleeper(Duration::ZERO), 1);
    assert_eq!(waiting.status(), TaskStatus::Enqueued);

    // Give the drain thread time to retry once and settle into its backoff.
    thread::sleep(Duration::from_millis(50));

    let rejected = pool.submit(&ctx, sleeper(Duration::ZERO), 1);
    assert_eq!(rejected.status(), TaskStatus::QueueFull);
    assert_eq!(pool.pending_tasks(), 1);

    // Stopping interrupts the backoff and kills the waiting task.
    let started = Instant::now();
    pool.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(blocker.status(), TaskStatus::Killed);
    assert_eq!(waiting.status(), TaskStatus::Killed);
}

#[test]
fn too_many_workers_is_rejected_regardless_of_load() {
    let pool = small_pool();

    let task = pool.submit(&Context::background(), sleeper(Duration::ZERO), 6);
    assert_eq!(task.status(), TaskStatus::TooManyWorkers);
    assert!(matches!(task.err(), Some(TaskError::TooManyWorkers)));
    assert_eq!(task.concurrence(), 0);
    assert_eq!(pool.running_workers(), 0);
    assert_eq!(pool.running_tasks(), 0);

    pool.stop();
}

#[test]
fn zero_concurrence_is_rejected() {
    let pool = small_pool();

    let task = pool.submit(&Context::background(), sleeper(Duration::ZERO), 0);
    assert_eq!(task.status(), TaskStatus::InvalidConcurrence);
    assert!(task.err().unwrap().is_rejection());

    pool.stop();
}

#[test]
fn submit_after_stop_is_rejected() {
    let pool = small_pool();
    pool.stop();

    assert!(pool.is_closed());

    let task = pool.submit(&Context::background(), sleeper(Duration::ZERO), 1);
    assert_eq!(task.status(), TaskStatus::PoolClosed);
    assert!(matches!(task.err(), Some(TaskError::PoolClosed)));
}

#[test]
fn function_error_is_surfaced_after_done() {
    let pool = small_pool();

    let task = pool.submit(
        &Context::background(),
        |_: &Context| Err(io::Error::new(io::ErrorKind::Other, "push failed")),
        1,
    );

    task.wait();
    assert_eq!(task.status(), TaskStatus::Done);

    let error = task.err().unwrap();
    assert_eq!(error.to_string(), "push failed");
    assert_eq!(error.downcast_ref::<io::Error>().unwrap().kind(), io::ErrorKind::Other);

    pool.stop();
}

#[test]
fn one_failing_worker_does_not_affect_siblings() {
    let pool = small_pool();
    let calls = Arc::new(AtomicUsize::new(0));

    let task = pool.submit(
        &Context::background(),
        {
            let calls = calls.clone();
            move |_: &Context| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(io::Error::new(io::ErrorKind::Other, "first call fails"))
                } else {
                    Ok(())
                }
            }
        },
        3,
    );

    task.wait();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(task.status(), TaskStatus::Done);
    assert_eq!(task.err().unwrap().to_string(), "first call fails");

    pool.stop();
}

#[test]
fn panicking_function_is_recorded_as_error() {
    let pool = small_pool();

    let task = pool.submit(&Context::background(), |_: &Context| -> Result<(), io::Error> {
        panic!("oh no!")
    }, 2);

    task.wait();
    assert_eq!(task.status(), TaskStatus::Done);

    match task.err() {
        Some(TaskError::Panicked(message)) => assert_eq!(message, "oh no!"),
        other => panic!("unexpected error: {:?}", other),
    }

    pool.stop();
}

#[test]
fn function_runs_once_per_worker() {
    let pool = small_pool();
    let calls = Arc::new(AtomicUsize::new(0));

    let task = pool.submit(
        &Context::background(),
        {
            let calls = calls.clone();
            move |_: &Context| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), io::Error>(())
            }
        },
        4,
    );

    task.wait();
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    pool.stop();
}

#[test]
fn terminal_status_and_error_are_stable() {
    let pool = small_pool();

    let task = pool.submit(
        &Context::background(),
        |_: &Context| Err(io::Error::new(io::ErrorKind::Other, "nope")),
        2,
    );

    task.wait();

    for _ in 0..10 {
        assert_eq!(task.status(), TaskStatus::Done);
        assert_eq!(task.err().unwrap().to_string(), "nope");
    }

    // Killing a finished task changes nothing.
    task.kill();
    assert_eq!(task.status(), TaskStatus::Done);

    pool.stop();
}

#[test]
fn kill_cancels_running_task() {
    let pool = small_pool();

    let task = pool.submit(&Context::background(), until_cancelled, 3);
    assert_eq!(task.status(), TaskStatus::Running);

    task.kill();
    assert_eq!(task.status(), TaskStatus::Killed);

    assert!(task.wait_timeout(Duration::from_secs(5)));
    assert_eq!(task.status(), TaskStatus::Killed);
    assert!(task.err().is_none());
    assert_eq!(pool.running_workers(), 0);

    pool.stop();
}

#[test]
fn cancelling_parent_context_kills_task() {
    let pool = small_pool();
    let ctx = Context::background();

    let task = pool.submit(&ctx, until_cancelled, 2);
    ctx.cancel();

    assert!(task.wait_timeout(Duration::from_secs(5)));
    assert_eq!(task.status(), TaskStatus::Killed);

    pool.stop();
}

#[test]
fn context_deadline_kills_task() {
    let pool = small_pool();
    let ctx = Context::background().with_timeout(Duration::from_millis(50));

    let task = pool.submit(&ctx, until_cancelled, 1);

    assert!(task.wait_timeout(Duration::from_secs(5)));
    assert_eq!(task.status(), TaskStatus::Killed);

    pool.stop();
}

#[test]
fn already_cancelled_context_skips_function() {
    let pool = small_pool();
    let ctx = Context::background();
    ctx.cancel();

    let calls = Arc::new(AtomicUsize::new(0));
    let task = pool.submit(
        &ctx,
        {
            let calls = calls.clone();
            move |_: &Context| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), io::Error>(())
            }
        },
        2,
    );

    task.wait();
    assert_eq!(task.status(), TaskStatus::Killed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    pool.stop();
}

#[test]
fn enqueued_task_runs_once_capacity_frees() {
    let pool = WorkerPool::builder()
        .max_workers(2)
        .buffer_size(4)
        .retry_backoff(Duration::from_millis(5))
        .build();
    let ctx = Context::background();

    let first = pool.submit(&ctx, sleeper(Duration::from_millis(50)), 2);
    let second = pool.submit(&ctx, sleeper(Duration::from_millis(10)), 1);
    let third = pool.submit(&ctx, sleeper(Duration::from_millis(10)), 2);

    assert_eq!(first.status(), TaskStatus::Running);
    assert_eq!(second.status(), TaskStatus::Enqueued);
    assert_eq!(third.status(), TaskStatus::Enqueued);

    // Waiting on an enqueued task covers its admission too.
    assert!(second.wait_timeout(Duration::from_secs(5)));
    assert!(third.wait_timeout(Duration::from_secs(5)));
    assert_eq!(second.status(), TaskStatus::Done);
    assert_eq!(third.status(), TaskStatus::Done);
    assert_eq!(pool.pending_tasks(), 0);

    pool.stop();
}

#[test]
fn kill_on_enqueued_task_does_nothing() {
    let pool = small_pool();
    let ctx = Context::background();

    let first = pool.submit(&ctx, sleeper(Duration::from_millis(100)), 5);
    let second = pool.submit(&ctx, sleeper(Duration::ZERO), 5);
    assert_eq!(second.status(), TaskStatus::Enqueued);

    second.kill();
    assert_eq!(second.status(), TaskStatus::Enqueued);

    first.wait();
    second.wait();
    assert_eq!(second.status(), TaskStatus::Done);

    pool.stop();
}

#[test]
fn stop_kills_running_and_pending_tasks() {
    let pool = small_pool();
    let ctx = Context::background();

    let running = pool.submit(&ctx, until_cancelled, 5);
    let pending = pool.submit(&ctx, until_cancelled, 5);
    assert_eq!(pending.status(), TaskStatus::Enqueued);

    pool.stop();

    assert!(running.is_finished());
    assert!(pending.is_finished());
    assert_eq!(running.status(), TaskStatus::Killed);
    assert_eq!(pending.status(), TaskStatus::Killed);
    assert_eq!(pool.pending_tasks(), 0);

    // Stopping again has nothing left to wait for.
    pool.stop();
}

#[test]
fn stop_timeout_expiring() {
    let pool = small_pool();

    // Ignores cancellation on purpose.
    let _task = pool.submit(&Context::background(), sleeper(Duration::from_millis(200)), 1);

    assert!(!pool.stop_timeout(Duration::from_millis(10)));
    assert!(pool.stop_timeout(Duration::from_secs(5)));
}

#[test]
fn shutdown_trait_stops_pool() {
    let pool = small_pool();
    let task = pool.submit(&Context::background(), until_cancelled, 2);

    let registry: Vec<Box<dyn Shutdown>> = vec![Box::new(pool)];

    for component in &registry {
        component.shutdown(Some(Duration::from_secs(5))).unwrap();
    }

    assert_eq!(task.status(), TaskStatus::Killed);
}

#[test]
fn dropping_pool_rejects_pending_but_finishes_running() {
    let pool = small_pool();
    let ctx = Context::background();

    let running = pool.submit(&ctx, sleeper(Duration::from_millis(50)), 5);
    let pending = pool.submit(&ctx, sleeper(Duration::ZERO), 1);
    assert_eq!(pending.status(), TaskStatus::Enqueued);

    drop(pool);

    assert!(pending.is_finished());
    assert_eq!(pending.status(), TaskStatus::Killed);

    running.wait();
    assert_eq!(running.status(), TaskStatus::Done);
}

#[test]
fn workers_run_on_named_threads() {
    let pool = WorkerPool::builder().name("push").max_workers(1).build();
    let names = Arc::new(std::sync::Mutex::new(Vec::new()));

    let task = pool.submit(
        &Context::background(),
        {
            let names = names.clone();
            move |_: &Context| {
                names
                    .lock()
                    .unwrap()
                    .push(thread::current().name().map(ToOwned::to_owned));
                Ok::<(), io::Error>(())
            }
        },
        1,
    );

    task.wait();
    assert_eq!(*names.lock().unwrap(), vec![Some(String::from("push-worker"))]);

    pool.stop();
}

struct RefusingExecutor;

impl Executor for RefusingExecutor {
    fn execute(&self, job: Job) -> Result<(), RejectedJob> {
        Err(RejectedJob::new(job, ExecutorError::Full))
    }
}

#[test]
fn executor_refusal_fails_workers() {
    let pool = WorkerPool::builder()
        .max_workers(2)
        .executor(RefusingExecutor)
        .build();

    let task = pool.submit(&Context::background(), sleeper(Duration::ZERO), 2);

    assert!(task.wait_timeout(Duration::from_secs(1)));
    assert_eq!(task.status(), TaskStatus::Done);
    assert!(matches!(task.err(), Some(TaskError::Executor(ExecutorError::Full))));
    assert_eq!(pool.running_workers(), 0);

    pool.stop();
}

/// Runs jobs after throwing away every other one it accepted.
struct LossyExecutor(AtomicUsize);

impl Executor for LossyExecutor {
    fn execute(&self, job: Job) -> Result<(), RejectedJob> {
        if self.0.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            thread::spawn(job);
        }

        Ok(())
    }
}

#[test]
fn dropped_jobs_still_release_capacity() {
    let pool = WorkerPool::builder()
        .max_workers(2)
        .executor(LossyExecutor(AtomicUsize::new(0)))
        .build();

    let task = pool.submit(&Context::background(), sleeper(Duration::from_millis(10)), 2);

    assert!(task.wait_timeout(Duration::from_secs(5)));
    assert_eq!(task.status(), TaskStatus::Done);
    assert!(matches!(task.err(), Some(TaskError::Executor(ExecutorError::Closed))));
    assert_eq!(pool.running_workers(), 0);

    pool.stop();
}

#[test]
fn concurrent_submissions_never_exceed_capacity() {
    let max_workers = 4;
    let pool = Arc::new(
        WorkerPool::builder()
            .max_workers(max_workers)
            .buffer_size(64)
            .retry_backoff(Duration::from_millis(1))
            .build(),
    );
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let submitters = (0..4)
        .map(|i| {
            let pool = pool.clone();
            let active = active.clone();
            let peak = peak.clone();

            thread::spawn(move || {
                (0..8)
                    .map(|j| {
                        let active = active.clone();
                        let peak = peak.clone();

                        pool.submit(
                            &Context::background(),
                            move |_: &Context| {
                                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(2));
                                active.fetch_sub(1, Ordering::SeqCst);
                                Ok::<(), io::Error>(())
                            },
                            1 + (i + j) % max_workers,
                        )
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();

    let handles = submitters
        .into_iter()
        .flat_map(|submitter| submitter.join().unwrap())
        .collect::<Vec<_>>();

    for handle in &handles {
        assert!(handle.wait_timeout(Duration::from_secs(10)));
        assert_eq!(handle.status(), TaskStatus::Done);
        assert!(pool.running_workers() <= max_workers);
    }

    assert!(peak.load(Ordering::SeqCst) <= max_workers);
    assert!(peak.load(Ordering::SeqCst) >= 1);

    pool.stop();
}
