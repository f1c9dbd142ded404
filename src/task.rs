use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use once_cell::sync::OnceCell;

use crate::{
    context::Context,
    error::{BoxError, TaskError},
    worker::WorkerSet,
};

/// The function run by every worker of a task.
pub(crate) type TaskFn = Arc<dyn Fn(&Context) -> Result<(), BoxError> + Send + Sync + 'static>;

/// The lifecycle status of a submitted task.
///
/// An admitted task moves `Enqueued → Running → Done | Killed`, skipping
/// `Enqueued` if capacity was free at submission. The rejection statuses are
/// terminal from the start and never change.
///
/// There is no error status: a task whose workers returned errors still ends
/// as `Done`, so check [`TaskHandle::err`] after waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting in the pool's backlog for capacity.
    Enqueued,
    /// Workers have been launched.
    Running,
    /// Every worker exited without the task being cancelled.
    Done,
    /// The task was cancelled, by [`TaskHandle::kill`], its context, or the
    /// pool stopping.
    Killed,
    /// Rejected: the pool was saturated and its backlog full.
    QueueFull,
    /// Rejected: the task needs more workers than the pool capacity.
    TooManyWorkers,
    /// Rejected: the pool was stopped.
    PoolClosed,
    /// Rejected: the task asked for zero workers.
    InvalidConcurrence,
}

impl TaskStatus {
    /// Returns `true` if the status can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Enqueued | Self::Running)
    }

    /// Returns `true` if the task was never admitted.
    pub fn is_rejection(self) -> bool {
        self.rejection_error().is_some()
    }

    fn rejection_error(self) -> Option<TaskError> {
        match self {
            Self::QueueFull => Some(TaskError::QueueFull),
            Self::TooManyWorkers => Some(TaskError::TooManyWorkers),
            Self::PoolClosed => Some(TaskError::PoolClosed),
            Self::InvalidConcurrence => Some(TaskError::InvalidConcurrence),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Killed => "killed",
            Self::QueueFull => "queue full",
            Self::TooManyWorkers => "too many workers",
            Self::PoolClosed => "pool closed",
            Self::InvalidConcurrence => "invalid concurrence",
        })
    }
}

/// Status and completion flag shared between a task and its worker set.
pub(crate) struct TaskState {
    inner: Mutex<StateInner>,
    finished_cvar: Condvar,
}

struct StateInner {
    status: TaskStatus,
    /// Set once every worker has exited, or the task was dropped from the
    /// backlog without running.
    finished: bool,
}

impl TaskState {
    fn new(status: TaskStatus) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                status,
                finished: false,
            }),
            finished_cvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub(crate) fn set_running(&self) {
        self.lock().status = TaskStatus::Running;
    }

    /// Mark the task killed. Has no effect once the task finished.
    pub(crate) fn kill(&self) {
        let mut inner = self.lock();

        if !inner.finished {
            inner.status = TaskStatus::Killed;
        }
    }

    /// Mark the task finished and wake every waiter.
    ///
    /// A task already marked killed stays killed, as does one whose scope was
    /// cancelled.
    pub(crate) fn finish(&self, cancelled: bool) {
        let mut inner = self.lock();

        if inner.finished {
            return;
        }

        if cancelled {
            inner.status = TaskStatus::Killed;
        } else if inner.status != TaskStatus::Killed {
            inner.status = TaskStatus::Done;
        }

        inner.finished = true;
        drop(inner);

        self.finished_cvar.notify_all();
    }

    fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub(crate) fn wait(&self) {
        let mut inner = self.lock();

        while !inner.finished {
            inner = self
                .finished_cvar
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn wait_deadline(&self, deadline: Instant) -> bool {
        let mut inner = self.lock();

        while !inner.finished {
            match deadline.checked_duration_since(Instant::now()) {
                Some(timeout) => {
                    inner = self
                        .finished_cvar
                        .wait_timeout(inner, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => return false,
            }
        }

        true
    }
}

/// A task accepted by the pool, either running or waiting in the backlog.
pub(crate) struct Task {
    pub(crate) func: TaskFn,
    pub(crate) concurrence: usize,
    /// The context given at submission. Worker sets derive their scope from
    /// it.
    pub(crate) ctx: Context,
    pub(crate) state: Arc<TaskState>,
    worker_set: OnceCell<Arc<WorkerSet>>,
}

impl Task {
    pub(crate) fn new(ctx: Context, func: TaskFn, concurrence: usize) -> Self {
        Self {
            func,
            concurrence,
            ctx,
            state: Arc::new(TaskState::new(TaskStatus::Enqueued)),
            worker_set: OnceCell::new(),
        }
    }

    /// Attach the worker set created on admission. Only the first call has any
    /// effect.
    pub(crate) fn attach(&self, set: Arc<WorkerSet>) {
        if self.worker_set.set(set).is_err() {
            log::warn!("task admitted twice, ignoring second worker set");
        }
    }

    pub(crate) fn worker_set(&self) -> Option<&Arc<WorkerSet>> {
        self.worker_set.get()
    }
}

/// A handle to a task submitted to a [`WorkerPool`](crate::WorkerPool).
///
/// Every call to `submit` returns a handle, including rejected submissions.
/// A rejected handle reports its rejection through [`status`](Self::status)
/// and [`err`](Self::err), and its [`wait`](Self::wait) and
/// [`kill`](Self::kill) do nothing, so callers never need to branch on how a
/// submission went.
///
/// Dropping a handle does not cancel the task.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Handle,
}

#[derive(Clone)]
enum Handle {
    Admitted(Arc<Task>),
    Rejected(TaskStatus),
}

impl TaskHandle {
    pub(crate) fn admitted(task: Arc<Task>) -> Self {
        Self {
            inner: Handle::Admitted(task),
        }
    }

    pub(crate) fn rejected(status: TaskStatus) -> Self {
        debug_assert!(status.is_rejection());

        Self {
            inner: Handle::Rejected(status),
        }
    }

    /// Get the current status of the task.
    pub fn status(&self) -> TaskStatus {
        match &self.inner {
            Handle::Admitted(task) => task.state.status(),
            Handle::Rejected(status) => *status,
        }
    }

    /// Get the error of the task, if any.
    ///
    /// For a rejected submission this is the rejection reason. For an
    /// admitted task it is the error of the first worker, in launch order,
    /// that recorded one. Cancellation is not an error; check
    /// [`status`](Self::status) for [`TaskStatus::Killed`].
    pub fn err(&self) -> Option<TaskError> {
        match &self.inner {
            Handle::Admitted(task) => task.worker_set().and_then(|set| set.err()),
            Handle::Rejected(status) => status.rejection_error(),
        }
    }

    /// The number of workers the task runs with.
    ///
    /// Zero for rejected submissions.
    pub fn concurrence(&self) -> usize {
        match &self.inner {
            Handle::Admitted(task) => task.concurrence,
            Handle::Rejected(_) => 0,
        }
    }

    /// Returns `true` once every worker has exited.
    ///
    /// Rejected submissions are always finished.
    pub fn is_finished(&self) -> bool {
        match &self.inner {
            Handle::Admitted(task) => task.state.is_finished(),
            Handle::Rejected(_) => true,
        }
    }

    /// Block the current thread until every worker of the task has exited.
    ///
    /// A task still in the backlog is waited on through admission as well.
    /// Returns immediately for rejected submissions.
    pub fn wait(&self) {
        if let Handle::Admitted(task) = &self.inner {
            task.state.wait();
        }
    }

    /// Block until every worker of the task has exited or `timeout` passes.
    ///
    /// Returns `true` if the task finished in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match &self.inner {
            Handle::Admitted(task) => task.state.wait_deadline(Instant::now() + timeout),
            Handle::Rejected(_) => true,
        }
    }

    /// Request cancellation of a running task.
    ///
    /// The status becomes [`TaskStatus::Killed`] right away, but workers stop
    /// only when their function returns; use [`wait`](Self::wait) to block
    /// until they have. Does nothing for rejected submissions and for tasks
    /// still in the backlog.
    pub fn kill(&self) {
        if let Handle::Admitted(task) = &self.inner {
            if let Some(set) = task.worker_set() {
                set.stop_all();
            }
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("status", &self.status())
            .field("concurrence", &self.concurrence())
            .finish()
    }
}
