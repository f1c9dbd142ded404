//! The execution substrate workers run on.
//!
//! The worker pool never spawns threads for workers directly. Every worker
//! invocation is handed to an [`Executor`], which bounds total concurrency a
//! second time. [`ThreadExecutor`] is the default implementation.

use std::{
    fmt,
    ops::{Range, RangeInclusive, RangeTo, RangeToInclusive},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use once_cell::sync::Lazy;

use crate::error::{ExecutorError, RejectedJob};

#[cfg(target_has_atomic = "64")]
type AtomicCounter = std::sync::atomic::AtomicU64;

#[cfg(not(target_has_atomic = "64"))]
type AtomicCounter = std::sync::atomic::AtomicU32;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded background execution substrate.
///
/// Implementations must never block in [`execute`](Executor::execute). A job
/// that cannot be accepted right away is refused with an error, which the
/// worker pool records as a failure of the worker that needed it.
pub trait Executor: Send + Sync {
    /// Run a job in the background.
    ///
    /// A refused job is handed back inside the error without having run.
    fn execute(&self, job: Job) -> Result<(), RejectedJob>;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, job: Job) -> Result<(), RejectedJob> {
        (**self).execute(job)
    }
}

/// A value describing a size constraint for a thread executor.
///
/// Any size constraint can be wrapped in [`PerCore`] to be made relative to the
/// number of available CPU cores on the current system.
pub trait SizeConstraint {
    /// Get the minimum number of threads to keep alive.
    fn min(&self) -> usize;

    /// Get the maximum number of threads to spawn.
    fn max(&self) -> usize;
}

impl SizeConstraint for usize {
    fn min(&self) -> usize {
        *self
    }

    fn max(&self) -> usize {
        *self
    }
}

impl SizeConstraint for Range<usize> {
    fn min(&self) -> usize {
        self.start
    }

    fn max(&self) -> usize {
        self.end
    }
}

impl SizeConstraint for RangeInclusive<usize> {
    fn min(&self) -> usize {
        *self.start()
    }

    fn max(&self) -> usize {
        *self.end()
    }
}

impl SizeConstraint for RangeTo<usize> {
    fn min(&self) -> usize {
        0
    }

    fn max(&self) -> usize {
        self.end
    }
}

impl SizeConstraint for RangeToInclusive<usize> {
    fn min(&self) -> usize {
        0
    }

    fn max(&self) -> usize {
        self.end
    }
}

/// Modifies a size constraint to be per available CPU core.
///
/// # Examples
///
/// ```
/// # use gangpool::PerCore;
/// // one thread per core
/// let size = PerCore(1);
///
/// // at least 1 thread per core and at most 2 threads per core
/// let size = PerCore(1..2);
/// ```
pub struct PerCore<T>(pub T);

static CORE_COUNT: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

pub(crate) fn core_count() -> usize {
    *CORE_COUNT
}

impl<T> From<T> for PerCore<T> {
    fn from(size: T) -> Self {
        Self(size)
    }
}

impl<T: SizeConstraint> SizeConstraint for PerCore<T> {
    fn min(&self) -> usize {
        *CORE_COUNT * self.0.min()
    }

    fn max(&self) -> usize {
        *CORE_COUNT * self.0.max()
    }
}

/// A builder for constructing a customized [`ThreadExecutor`].
///
/// # Examples
///
/// ```
/// let executor = gangpool::ThreadExecutor::builder()
///     .name("push-fanout")
///     .size(..8)
///     .queue_limit(8)
///     .build();
/// ```
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    size: Option<(usize, usize)>,
    stack_size: Option<usize>,
    queue_limit: Option<usize>,
    keep_alive: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            size: None,
            stack_size: None,
            queue_limit: None,
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl Builder {
    /// Set a custom thread name for threads spawned by this executor.
    ///
    /// # Panics
    ///
    /// Panics if the name contains null bytes (`\0`).
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        let name = name.into();

        if name.as_bytes().contains(&0) {
            panic!("thread executor name must not contain null bytes");
        }

        self.name = Some(name);
        self
    }

    /// Set the number of threads managed by this executor.
    ///
    /// If a `usize` is supplied, the executor will keep a fixed number of
    /// threads. If a range is supplied, the lower bound is the number of
    /// threads kept alive while the upper bound is the most threads the
    /// executor is allowed to burst up to.
    ///
    /// If not set, a size is selected from the number of CPU cores.
    ///
    /// # Panics
    ///
    /// Panics if an invalid range is supplied with a lower bound larger than
    /// the upper bound, or if the upper bound is 0.
    pub fn size<S: SizeConstraint>(mut self, size: S) -> Self {
        let (min, max) = (size.min(), size.max());

        if min > max {
            panic!("thread executor minimum size cannot be larger than maximum size");
        }

        if max == 0 {
            panic!("thread executor maximum size must be non-zero");
        }

        self.size = Some((min, max));
        self
    }

    /// Set the size of the stack (in bytes) for threads in this executor.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set a maximum number of jobs allowed to wait for a thread.
    ///
    /// Once the limit is reached, [`Executor::execute`] refuses new jobs with
    /// [`ExecutorError::Full`]. If set to zero, a job is only accepted when it
    /// can start right away. If not set, no limit is enforced.
    pub fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = Some(limit);
        self
    }

    /// Set a duration for how long to keep idle threads above the minimum
    /// alive.
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = duration;
        self
    }

    /// Create an executor according to the configuration set with this
    /// builder.
    pub fn build(self) -> ThreadExecutor {
        let size = self.size.unwrap_or_else(|| {
            let size = PerCore(1..2);

            (size.min(), size.max())
        });

        let shared = Shared {
            min_threads: size.0,
            max_threads: size.1,
            keep_alive: self.keep_alive,
            thread_count: Mutex::new(0),
            shutdown_cvar: Condvar::new(),
            running_jobs_count: AtomicUsize::new(0),
            completed_jobs_count: AtomicCounter::new(0),
            panicked_jobs_count: AtomicCounter::new(0),
        };

        let (queue_tx, queue_rx) = self.queue_limit.map(bounded).unwrap_or_else(unbounded);

        let executor = ThreadExecutor {
            thread_name: self.name,
            stack_size: self.stack_size,
            queue: Mutex::new(Some(queue_tx)),
            queue_rx,
            immediate_queue: bounded(0),
            shared: Arc::new(shared),
        };

        for _ in 0..size.0 {
            if let Err(e) = executor.spawn_thread(None) {
                log::warn!("failed to spawn core executor thread: {}", e);
            }
        }

        executor
    }
}

/// A bounded thread pool used as the default [`Executor`].
///
/// Jobs are handed directly to an idle thread when one is waiting. Otherwise
/// a new thread is spawned if the maximum size has not been reached, and as a
/// last resort the job is queued. A job is refused if the queue is full.
///
/// Dropping the executor lets its threads finish queued jobs and exit in the
/// background. Use one of the [`join`](ThreadExecutor::join) methods to wait
/// for that.
pub struct ThreadExecutor {
    thread_name: Option<String>,
    stack_size: Option<usize>,
    /// Taken on shutdown, which disconnects the queue for every thread.
    queue: Mutex<Option<Sender<Job>>>,
    queue_rx: Receiver<Job>,
    immediate_queue: (Sender<Job>, Receiver<Job>),
    shared: Arc<Shared>,
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadExecutor {
    /// Create a new executor with the default configuration.
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Get a builder for creating a customized executor.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Get the number of threads currently alive.
    pub fn threads(&self) -> usize {
        *self.shared.lock_thread_count()
    }

    /// Get the number of jobs queued for execution, but not yet started.
    #[inline]
    pub fn queued_jobs(&self) -> usize {
        self.queue_rx.len()
    }

    /// Get the number of jobs currently running.
    #[inline]
    pub fn running_jobs(&self) -> usize {
        self.shared.running_jobs_count.load(Ordering::Relaxed)
    }

    /// Get the number of jobs completed (successfully or otherwise).
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn completed_jobs(&self) -> u64 {
        self.shared.completed_jobs_count.load(Ordering::Relaxed).into()
    }

    /// Get the number of jobs that have panicked.
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn panicked_jobs(&self) -> u64 {
        self.shared.panicked_jobs_count.load(Ordering::Relaxed).into()
    }

    /// Stop accepting jobs and block until queued jobs have completed and all
    /// threads have exited.
    pub fn join(&self) {
        self.join_internal(None);
    }

    /// Like [`join`](ThreadExecutor::join), but give up after `timeout`.
    ///
    /// Returns `true` if every thread exited in time.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.join_deadline(Instant::now() + timeout)
    }

    /// Like [`join`](ThreadExecutor::join), but give up at `deadline`.
    ///
    /// Returns `true` if every thread exited in time.
    pub fn join_deadline(&self, deadline: Instant) -> bool {
        self.join_internal(Some(deadline))
    }

    fn join_internal(&self, deadline: Option<Instant>) -> bool {
        // Dropping the sender interrupts idle threads and tells every thread
        // the executor is shutting down.
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut thread_count = self.shared.lock_thread_count();

        while *thread_count > 0 {
            if let Some(deadline) = deadline {
                if let Some(timeout) = deadline.checked_duration_since(Instant::now()) {
                    thread_count = self
                        .shared
                        .shutdown_cvar
                        .wait_timeout(thread_count, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                } else {
                    return false;
                }
            } else {
                thread_count = self
                    .shared
                    .shutdown_cvar
                    .wait(thread_count)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        true
    }

    /// Spawn an additional thread, if the maximum size allows it.
    ///
    /// If an initial job channel is given, the thread runs the job waiting in
    /// it before polling for more work. The job stays in the channel if the
    /// thread cannot be spawned.
    fn spawn_thread(&self, initial_job: Option<Receiver<Job>>) -> Result<(), ExecutorError> {
        // Hold the count to keep concurrent spawns from overshooting the
        // maximum.
        let mut thread_count = self.shared.lock_thread_count();

        if *thread_count >= self.shared.max_threads {
            return Err(ExecutorError::Full);
        }

        let mut builder = thread::Builder::new();

        if let Some(name) = self.thread_name.as_ref() {
            builder = builder.name(name.clone());
        }

        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        *thread_count += 1;
        drop(thread_count);

        // The runner decrements the count again when it is dropped, including
        // when the spawn below fails and the closure is thrown away.
        let runner = Runner {
            counted: true,
            initial_job,
            queue: self.queue_rx.clone(),
            immediate_queue: self.immediate_queue.1.clone(),
            shared: self.shared.clone(),
        };

        builder
            .spawn(move || runner.run())
            .map(|_| ())
            .map_err(|e| ExecutorError::Spawn(e.to_string()))
    }
}

impl ThreadExecutor {
    /// Make sure a thread is alive to pick up a job just placed on the queue.
    ///
    /// Idle threads only retire while holding the thread count and seeing an
    /// empty queue, so a count of zero observed here after the job was queued
    /// means nobody is left to run it.
    fn ensure_queue_runner(&self) {
        let orphaned = *self.shared.lock_thread_count() == 0;

        if orphaned {
            match self.spawn_thread(None) {
                Ok(()) | Err(ExecutorError::Full) => {}
                Err(e) => log::warn!("no executor thread left for queued job: {}", e),
            }
        }
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) -> Result<(), RejectedJob> {
        let queue = match self.queue.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            Some(queue) => queue,
            None => return Err(RejectedJob::new(job, ExecutorError::Closed)),
        };

        // First, try to pass the job to an idle thread currently polling for
        // work.
        let job = match self.immediate_queue.0.try_send(job) {
            Ok(()) => return Ok(()),
            Err(e) => e.into_inner(),
        };

        // If possible, spawn an additional thread to run the job.
        let (handoff_tx, handoff_rx) = bounded(1);
        let _ = handoff_tx.send(job);

        if let Err(reason) = self.spawn_thread(Some(handoff_rx.clone())) {
            let job = match handoff_rx.try_recv() {
                Ok(job) => job,
                Err(_) => return Ok(()),
            };

            if reason != ExecutorError::Full {
                return Err(RejectedJob::new(job, reason));
            }

            // Finally, enqueue the job, but only if the queue isn't full.
            return match queue.try_send(job) {
                Ok(()) => {
                    self.ensure_queue_runner();
                    Ok(())
                }
                Err(TrySendError::Full(job)) => Err(RejectedJob::new(job, ExecutorError::Full)),
                Err(TrySendError::Disconnected(job)) => {
                    Err(RejectedJob::new(job, ExecutorError::Closed))
                }
            };
        }

        Ok(())
    }
}

impl fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadExecutor")
            .field("threads", &self.threads())
            .field("queued_jobs", &self.queued_jobs())
            .field("running_jobs", &self.running_jobs())
            .field("completed_jobs", &self.completed_jobs())
            .finish()
    }
}

/// Executor state shared by the owner and the threads.
struct Shared {
    min_threads: usize,
    max_threads: usize,
    keep_alive: Duration,
    thread_count: Mutex<usize>,
    shutdown_cvar: Condvar,
    running_jobs_count: AtomicUsize,
    completed_jobs_count: AtomicCounter,
    panicked_jobs_count: AtomicCounter,
}

impl Shared {
    fn lock_thread_count(&self) -> MutexGuard<'_, usize> {
        self.thread_count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The loop run by each executor thread.
struct Runner {
    /// Whether this thread is still included in the shared thread count.
    counted: bool,
    initial_job: Option<Receiver<Job>>,
    queue: Receiver<Job>,
    immediate_queue: Receiver<Job>,
    shared: Arc<Shared>,
}

impl Runner {
    fn run(mut self) {
        if let Some(job) = self.initial_job.take().and_then(|rx| rx.try_recv().ok()) {
            self.run_job(job);
        }

        loop {
            select! {
                recv(self.queue) -> job => match job {
                    Ok(job) => self.run_job(job),
                    // Executor shut down and the queue is drained.
                    Err(_) => break,
                },
                recv(self.immediate_queue) -> job => match job {
                    Ok(job) => self.run_job(job),
                    Err(_) => break,
                },
                default(self.shared.keep_alive) => {
                    let mut thread_count = self.shared.lock_thread_count();

                    // A job queued while this thread was timing out keeps
                    // it alive.
                    if *thread_count > self.shared.min_threads && self.queue.is_empty() {
                        *thread_count -= 1;
                        self.counted = false;
                        self.shared.shutdown_cvar.notify_all();
                        log::trace!("idle executor thread exiting");
                        break;
                    }
                }
            }
        }
    }

    fn run_job(&self, job: Job) {
        self.shared.running_jobs_count.fetch_add(1, Ordering::Relaxed);

        let panicked = catch_unwind(AssertUnwindSafe(job)).is_err();

        self.shared.running_jobs_count.fetch_sub(1, Ordering::Relaxed);
        self.shared.completed_jobs_count.fetch_add(1, Ordering::Relaxed);

        if panicked {
            log::warn!("executor job panicked");
            self.shared.panicked_jobs_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }

        let mut count = self.shared.lock_thread_count();
        *count = count.saturating_sub(1);
        self.shared.shutdown_cvar.notify_all();
    }
}
