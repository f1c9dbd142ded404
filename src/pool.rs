//! Implementation of the worker pool itself.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};

use crate::{
    context::Context,
    error::{BoxError, ShutdownError},
    executor::{core_count, Executor, ThreadExecutor},
    shutdown::Shutdown,
    task::{Task, TaskFn, TaskHandle, TaskStatus},
    worker::WorkerSet,
};

/// A builder for constructing a customized [`WorkerPool`].
///
/// # Examples
///
/// ```
/// let pool = gangpool::builder()
///     .name("push-fanout")
///     .max_workers(16)
///     .buffer_size(64)
///     .build();
/// # pool.stop();
/// ```
pub struct Builder {
    name: Option<String>,
    max_workers: Option<usize>,
    buffer_size: usize,
    retry_backoff: Duration,
    executor: Option<Arc<dyn Executor>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            max_workers: None,
            buffer_size: 0,
            retry_backoff: Duration::from_millis(20),
            executor: None,
        }
    }
}

impl Builder {
    /// Set a name for the pool.
    ///
    /// The queue drain thread is called `<name>-drain`, and threads of the
    /// default executor are called `<name>-worker`.
    ///
    /// # Panics
    ///
    /// Panics if the name contains null bytes (`\0`).
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        let name = name.into();

        if name.as_bytes().contains(&0) {
            panic!("worker pool name must not contain null bytes");
        }

        self.name = Some(name);
        self
    }

    /// Set the most workers allowed to run at once, across all tasks.
    ///
    /// If not set, one worker per CPU core is allowed.
    ///
    /// # Panics
    ///
    /// Panics if `max_workers` is 0.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        if max_workers == 0 {
            panic!("worker pool capacity must be non-zero");
        }

        self.max_workers = Some(max_workers);
        self
    }

    /// Set how many tasks may wait for capacity before new submissions are
    /// rejected with [`TaskStatus::QueueFull`].
    ///
    /// The default is zero, which rejects every submission that cannot start
    /// right away.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set how long the queue drain thread sleeps after a waiting task still
    /// did not fit. Defaults to 20 milliseconds.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Run workers on a custom executor.
    ///
    /// The executor must not run jobs on the calling thread. If not set, a
    /// [`ThreadExecutor`] with up to `max_workers` threads is created.
    pub fn executor<E: Executor + 'static>(mut self, executor: E) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Create a worker pool according to the configuration set with this
    /// builder.
    ///
    /// # Panics
    ///
    /// Panics if the queue drain thread cannot be spawned.
    pub fn build(self) -> WorkerPool {
        let name = self.name.unwrap_or_else(|| String::from("gangpool"));
        let max_workers = self.max_workers.unwrap_or_else(core_count);

        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(
                ThreadExecutor::builder()
                    .name(format!("{}-worker", name))
                    .size(..=max_workers)
                    .queue_limit(max_workers)
                    .build(),
            )
        });

        let shared = Arc::new(Shared {
            max_workers,
            buffer_size: self.buffer_size,
            retry_backoff: self.retry_backoff,
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            live_sets: Mutex::new(Vec::new()),
            // One slot more than the backlog so putting a retried task back
            // never blocks.
            queue: bounded(self.buffer_size + 1),
            executor,
            shutdown: Context::background(),
        });

        let drain = thread::Builder::new()
            .name(format!("{}-drain", name))
            .spawn({
                let shared = shared.clone();
                move || shared.drain_queue()
            })
            .unwrap_or_else(|e| panic!("failed to spawn queue drain thread: {}", e));

        log::debug!(
            "worker pool {} started with {} workers and a backlog of {}",
            name,
            max_workers,
            self.buffer_size
        );

        WorkerPool {
            name,
            shared,
            drain: Mutex::new(Some(drain)),
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("max_workers", &self.max_workers)
            .field("buffer_size", &self.buffer_size)
            .field("retry_backoff", &self.retry_backoff)
            .field("custom_executor", &self.executor.is_some())
            .finish()
    }
}

/// A scheduler for tasks that each need a fixed number of concurrently running
/// workers.
///
/// Every task is submitted with a _concurrence_, the number of workers that
/// run its function at the same time. The pool runs at most
/// [`max_workers`](Builder::max_workers) workers at once across all tasks.
///
/// # Admission
///
/// A submitted task starts right away if enough capacity is free. Otherwise it
/// waits in a bounded backlog, retried by a background thread as capacity is
/// released. When the backlog is full as well, the submission is rejected.
/// Submissions never block on capacity.
///
/// Waiting tasks are retried in roughly the order they arrived, but a smaller
/// task may overtake a larger one when only the smaller one fits.
///
/// # Cancellation
///
/// Workers receive a [`Context`] derived from the one given at submission.
/// Killing a task, cancelling that context, or stopping the pool cancels it.
/// Running code is never interrupted; task functions should check the context
/// where stopping early is useful.
///
/// # Shutdown
///
/// [`stop`](WorkerPool::stop) cancels every task and waits for all workers to
/// exit. Dropping the pool without stopping it rejects further submissions and
/// kills tasks still in the backlog, but leaves running tasks to finish in the
/// background.
pub struct WorkerPool {
    name: String,
    shared: Arc<Shared>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    /// Create a new worker pool with the default configuration.
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Get a builder for creating a customized worker pool.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The most workers allowed to run at once.
    #[inline]
    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    /// The most tasks allowed to wait for capacity.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Get the number of workers currently holding capacity.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    pub fn running_workers(&self) -> usize {
        let mut live_sets = self.shared.lock_live_sets();
        running_workers(&mut live_sets)
    }

    /// Get the number of tasks waiting for capacity.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    pub fn pending_tasks(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Get the number of tasks currently holding capacity.
    pub fn running_tasks(&self) -> usize {
        let mut live_sets = self.shared.lock_live_sets();
        running_workers(&mut live_sets);
        live_sets.len()
    }

    /// Returns `true` once the pool has been stopped or dropped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Submit a task that runs `func` on `concurrence` workers at once.
    ///
    /// The returned handle reports whether the task started right away
    /// ([`TaskStatus::Running`]), is waiting for capacity
    /// ([`TaskStatus::Enqueued`]), or was rejected. A rejected handle carries
    /// the reason as its status and error. This call never blocks on capacity.
    ///
    /// Each worker calls `func` once with the cancellation context of the
    /// task.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
    /// use gangpool::{Context, TaskStatus, WorkerPool};
    ///
    /// let pool = WorkerPool::builder().max_workers(4).build();
    /// let calls = Arc::new(AtomicUsize::new(0));
    ///
    /// let task = pool.submit(&Context::background(), {
    ///     let calls = calls.clone();
    ///     move |_: &Context| {
    ///         calls.fetch_add(1, Ordering::SeqCst);
    ///         Ok::<(), std::io::Error>(())
    ///     }
    /// }, 4);
    ///
    /// task.wait();
    /// assert_eq!(task.status(), TaskStatus::Done);
    /// assert_eq!(calls.load(Ordering::SeqCst), 4);
    /// # pool.stop();
    /// ```
    pub fn submit<F, E>(&self, ctx: &Context, func: F, concurrence: usize) -> TaskHandle
    where
        F: Fn(&Context) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        let func: TaskFn =
            Arc::new(move |ctx: &Context| -> Result<(), BoxError> { func(ctx).map_err(Into::into) });

        self.shared.submit(ctx, func, concurrence)
    }

    /// Stop the pool and block until every worker has exited.
    ///
    /// Further submissions are rejected with [`TaskStatus::PoolClosed`]. Tasks
    /// in the backlog are killed without running, and running tasks are
    /// killed and waited for. Calling this again waits for the same workers.
    pub fn stop(&self) {
        self.stop_internal(None);
    }

    /// Like [`stop`](WorkerPool::stop), but give up waiting after `timeout`.
    ///
    /// Returns `true` if every worker exited in time.
    pub fn stop_timeout(&self, timeout: Duration) -> bool {
        self.stop_internal(Some(Instant::now() + timeout))
    }

    fn stop_internal(&self, deadline: Option<Instant>) -> bool {
        self.close();

        // The pool is closed, so no sets can be added from here on.
        let live_sets = self.shared.lock_live_sets().clone();

        for set in &live_sets {
            set.stop_all();
        }

        log::debug!(
            "worker pool {} stopping, waiting on {} tasks",
            self.name,
            live_sets.len()
        );

        for set in &live_sets {
            match deadline {
                Some(deadline) => {
                    if !set.wait_deadline(deadline) {
                        return false;
                    }
                }
                None => set.wait(),
            }
        }

        true
    }

    /// Reject new work, stop the drain thread and kill everything still
    /// waiting in the backlog.
    fn close(&self) {
        {
            let _live_sets = self.shared.lock_live_sets();
            self.shared.closed.store(true, Ordering::Release);
        }

        self.shared.shutdown.cancel();

        let drain = self.drain.lock().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(drain) = drain {
            if drain.join().is_err() {
                log::warn!("queue drain thread of worker pool {} panicked", self.name);
            }
        }

        while let Ok(task) = self.shared.queue.1.try_recv() {
            self.shared.discard_pending(&task);
        }
    }
}

impl Shutdown for WorkerPool {
    fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
        match timeout {
            Some(timeout) if !self.stop_timeout(timeout) => Err(ShutdownError::TimedOut(timeout)),
            Some(_) => Ok(()),
            None => {
                self.stop();
                Ok(())
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("max_workers", &self.max_workers())
            .field("running_workers", &self.running_workers())
            .field("pending_tasks", &self.pending_tasks())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pool state shared by the owner and the queue drain thread.
struct Shared {
    max_workers: usize,
    buffer_size: usize,
    retry_backoff: Duration,
    /// Tasks waiting for capacity, including one the drain thread is holding
    /// between taking it off the queue and putting it back.
    pending: AtomicUsize,
    closed: AtomicBool,
    /// Worker sets holding capacity. Its lock is the admission lock.
    live_sets: Mutex<Vec<Arc<WorkerSet>>>,
    queue: (Sender<Arc<Task>>, Receiver<Arc<Task>>),
    executor: Arc<dyn Executor>,
    /// Cancelled to stop the drain thread.
    shutdown: Context,
}

impl Shared {
    fn lock_live_sets(&self) -> MutexGuard<'_, Vec<Arc<WorkerSet>>> {
        self.live_sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, ctx: &Context, func: TaskFn, concurrence: usize) -> TaskHandle {
        let mut live_sets = self.lock_live_sets();

        if self.closed.load(Ordering::Acquire) {
            return TaskHandle::rejected(TaskStatus::PoolClosed);
        }

        if concurrence == 0 {
            return TaskHandle::rejected(TaskStatus::InvalidConcurrence);
        }

        if concurrence > self.max_workers {
            return TaskHandle::rejected(TaskStatus::TooManyWorkers);
        }

        let task = Arc::new(Task::new(ctx.clone(), func, concurrence));

        if self.try_admit(&mut live_sets, &task) {
            return TaskHandle::admitted(task);
        }

        if self.pending.load(Ordering::Acquire) >= self.buffer_size {
            log::trace!("rejecting task of {} workers, backlog is full", concurrence);
            return TaskHandle::rejected(TaskStatus::QueueFull);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = self.queue.0.try_send(task.clone()) {
            // Unreachable while `pending` bounds the queue, but never block.
            self.pending.fetch_sub(1, Ordering::AcqRel);
            log::warn!("backlog unexpectedly refused a task: {}", e);
            return TaskHandle::rejected(TaskStatus::QueueFull);
        }

        log::debug!("enqueued task of {} workers", concurrence);

        TaskHandle::admitted(task)
    }

    /// Start the task if its workers fit next to the ones already running.
    ///
    /// Must be called with the admission lock held, whose guarded set list is
    /// passed in.
    fn try_admit(&self, live_sets: &mut Vec<Arc<WorkerSet>>, task: &Arc<Task>) -> bool {
        let running = running_workers(live_sets);

        if running + task.concurrence > self.max_workers {
            return false;
        }

        let set = WorkerSet::new(task);

        task.state.set_running();
        task.attach(set.clone());
        live_sets.push(set.clone());
        set.run(&task.func, self.executor.as_ref());

        log::debug!(
            "admitted task of {} workers, {} of {} running",
            task.concurrence,
            running + task.concurrence,
            self.max_workers
        );

        true
    }

    /// Retry a task taken off the backlog. Returns `false` if it still does
    /// not fit and must go back.
    fn admit_pending(&self, task: &Arc<Task>) -> bool {
        let mut live_sets = self.lock_live_sets();

        if self.closed.load(Ordering::Acquire) {
            drop(live_sets);
            self.discard_pending(task);
            return true;
        }

        if self.try_admit(&mut live_sets, task) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return true;
        }

        false
    }

    /// Kill a task that never left the backlog and release its waiters.
    fn discard_pending(&self, task: &Task) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        task.state.kill();
        task.state.finish(true);
    }

    /// Body of the queue drain thread.
    fn drain_queue(&self) {
        let shutdown = self.shutdown.done();

        loop {
            let task = select! {
                recv(shutdown) -> _ => break,
                recv(self.queue.1) -> task => match task {
                    Ok(task) => task,
                    Err(_) => break,
                },
            };

            if self.admit_pending(&task) {
                continue;
            }

            // Put the task back without counting it again. The queue has room
            // for every counted task plus one.
            match self.queue.0.try_send(task) {
                Ok(()) => {}
                Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                    log::warn!("backlog refused a retried task, killing it");
                    self.discard_pending(&task);
                }
            }

            log::trace!("no capacity for waiting task, backing off");

            select! {
                recv(shutdown) -> _ => break,
                default(self.retry_backoff) => {}
            }
        }

        log::trace!("queue drain thread exiting");
    }
}

/// Sum the workers of every live set, dropping sets that have drained.
fn running_workers(live_sets: &mut Vec<Arc<WorkerSet>>) -> usize {
    live_sets.retain(|set| set.running() > 0);
    live_sets.iter().map(|set| set.running()).sum()
}
