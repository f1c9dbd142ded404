use std::{error::Error, fmt, sync::Arc, time::Duration};

use crate::executor::Job;

/// A boxed error returned by a task function.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// The reason a task did not complete cleanly, or was never admitted.
///
/// Rejection variants are returned synchronously by
/// [`WorkerPool::submit`](crate::WorkerPool::submit) through the task handle.
/// The remaining variants are recorded by individual workers.
///
/// Task errors are cheap to clone, so reading them from a handle repeatedly
/// always yields the same value.
#[derive(Clone, thiserror::Error)]
pub enum TaskError {
    /// The pool is saturated and its backlog is full.
    #[error("worker pool is saturated and its queue is full")]
    QueueFull,

    /// The task asked for more workers than the pool could ever run at once.
    #[error("task requires more workers than the pool capacity")]
    TooManyWorkers,

    /// The pool has been stopped.
    #[error("worker pool is closed")]
    PoolClosed,

    /// The task asked for zero workers.
    #[error("task concurrence must be at least one")]
    InvalidConcurrence,

    /// The executor refused to run a worker.
    #[error("executor refused worker: {0}")]
    Executor(#[source] ExecutorError),

    /// The task function panicked in one of its workers.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task function returned an error in one of its workers.
    #[error("{0}")]
    Failed(Arc<dyn Error + Send + Sync + 'static>),
}

impl TaskError {
    pub(crate) fn failed(error: BoxError) -> Self {
        Self::Failed(Arc::from(error))
    }

    /// Returns `true` for the variants produced by admission rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::QueueFull | Self::TooManyWorkers | Self::PoolClosed | Self::InvalidConcurrence
        )
    }

    /// Attempt to view the error returned by the task function as a concrete
    /// type.
    ///
    /// ```
    /// use std::io;
    /// use gangpool::{Context, WorkerPool};
    ///
    /// let pool = WorkerPool::builder().max_workers(1).build();
    /// let task = pool.submit(&Context::background(), |_: &Context| {
    ///     Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
    /// }, 1);
    ///
    /// task.wait();
    /// let error = task.err().unwrap();
    /// assert_eq!(error.downcast_ref::<io::Error>().unwrap().kind(), io::ErrorKind::Other);
    /// # pool.stop();
    /// ```
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Failed(error) => error.downcast_ref(),
            _ => None,
        }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => f.write_str("QueueFull"),
            Self::TooManyWorkers => f.write_str("TooManyWorkers"),
            Self::PoolClosed => f.write_str("PoolClosed"),
            Self::InvalidConcurrence => f.write_str("InvalidConcurrence"),
            Self::Executor(e) => f.debug_tuple("Executor").field(e).finish(),
            Self::Panicked(message) => f.debug_tuple("Panicked").field(message).finish(),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

/// An error returned when an [`Executor`](crate::Executor) cannot accept a
/// job.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// Every thread is busy and the job queue is full.
    #[error("executor is full")]
    Full,

    /// The executor has been shut down.
    #[error("executor is closed")]
    Closed,

    /// A new thread could not be spawned.
    #[error("failed to spawn executor thread: {0}")]
    Spawn(String),
}

/// A job refused by an [`Executor`](crate::Executor).
///
/// Contains the original job, which has not been run. This allows the caller
/// to run it elsewhere, or to drop it after recording the reason.
pub struct RejectedJob {
    job: Job,
    reason: ExecutorError,
}

impl RejectedJob {
    /// Wrap a refused job together with the reason it was refused.
    pub fn new(job: Job, reason: ExecutorError) -> Self {
        Self { job, reason }
    }

    /// Why the job was refused.
    pub fn reason(&self) -> &ExecutorError {
        &self.reason
    }

    /// Extracts the inner job that could not be executed.
    pub fn into_inner(self) -> Job {
        self.job
    }
}

impl Error for RejectedJob {}

impl fmt::Debug for RejectedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedJob")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for RejectedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job rejected: {}", self.reason)
    }
}

/// An error returned when a graceful shutdown did not finish in time.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// Workers were still running when the timeout passed.
    #[error("shutdown timed out after {0:?} with workers still running")]
    TimedOut(Duration),
}
