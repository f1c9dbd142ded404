#![doc = include_str!("../README.md")]

mod context;
mod error;
mod executor;
mod pool;
mod shutdown;
mod task;
mod worker;

pub use crate::{
    context::{Context, Never},
    error::{BoxError, ExecutorError, RejectedJob, ShutdownError, TaskError},
    executor::{
        Builder as ThreadExecutorBuilder,
        Executor,
        Job,
        PerCore,
        SizeConstraint,
        ThreadExecutor,
    },
    pool::{Builder, WorkerPool},
    shutdown::Shutdown,
    task::{TaskHandle, TaskStatus},
};

/// Get a builder for creating a customized worker pool.
///
/// Shorthand for [`WorkerPool::builder`].
#[inline]
pub fn builder() -> Builder {
    WorkerPool::builder()
}
