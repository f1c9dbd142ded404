//! Workers and the per-task sets that own them.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use once_cell::sync::OnceCell;

use crate::{
    context::Context,
    error::{ExecutorError, TaskError},
    executor::Executor,
    task::{Task, TaskFn, TaskState},
};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

/// One invocation of a task function.
struct Worker {
    state: AtomicU8,
    err: OnceCell<TaskError>,
}

impl Worker {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            err: OnceCell::new(),
        }
    }

    /// Record an error unless one was recorded already.
    fn fail(&self, error: TaskError) {
        let _ = self.err.set(error);
    }
}

/// The workers assigned to one admitted task.
///
/// The set owns the cancellation scope of the task and counts its running
/// workers. Its capacity is released once that count reaches zero.
pub(crate) struct WorkerSet {
    ctx: Context,
    running: AtomicUsize,
    workers: Box<[Worker]>,
    state: Arc<TaskState>,
}

impl WorkerSet {
    pub(crate) fn new(task: &Task) -> Arc<Self> {
        Arc::new(Self {
            ctx: task.ctx.child(),
            running: AtomicUsize::new(0),
            workers: (0..task.concurrence).map(|_| Worker::new()).collect(),
            state: task.state.clone(),
        })
    }

    /// The number of workers that have not exited yet.
    #[inline]
    pub(crate) fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Launch every worker on the executor.
    pub(crate) fn run(self: &Arc<Self>, func: &TaskFn, executor: &dyn Executor) {
        // Count every worker up front so an early finisher cannot bring the
        // count to zero while later workers are still being launched.
        self.running.store(self.workers.len(), Ordering::Release);

        for index in 0..self.workers.len() {
            let job = WorkerJob {
                set: self.clone(),
                index,
                func: func.clone(),
                started: false,
            };

            if let Err(rejected) = executor.execute(Box::new(move || job.run())) {
                log::warn!("worker {} could not be launched: {}", index, rejected.reason());
                self.workers[index].fail(TaskError::Executor(rejected.reason().clone()));

                // Dropping the unrun job reports the worker as done.
                drop(rejected);
            }
        }
    }

    /// Cancel the scope of the set and mark the task killed.
    ///
    /// Workers already inside the task function keep running until it returns.
    pub(crate) fn stop_all(&self) {
        self.state.kill();
        self.ctx.cancel();
    }

    /// Block until every worker of the set has exited.
    pub(crate) fn wait(&self) {
        self.state.wait();
    }

    /// Block until every worker of the set has exited or `deadline` passes.
    pub(crate) fn wait_deadline(&self, deadline: Instant) -> bool {
        self.state.wait_deadline(deadline)
    }

    /// The error of the first worker in launch order that recorded one.
    pub(crate) fn err(&self) -> Option<TaskError> {
        self.workers.iter().find_map(|worker| worker.err.get().cloned())
    }

    fn run_worker(&self, index: usize, func: &TaskFn) {
        let worker = &self.workers[index];

        // Cancelled before the function got a chance to start.
        if self.ctx.is_cancelled() {
            return;
        }

        worker.state.store(RUNNING, Ordering::Release);

        let result = catch_unwind(AssertUnwindSafe(|| func(&self.ctx)));

        // Cancellation wins over whatever the function produced.
        if self.ctx.is_cancelled() {
            return;
        }

        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => worker.fail(TaskError::failed(error)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::warn!("worker {} panicked: {}", index, message);
                worker.fail(TaskError::Panicked(message));
            }
        }
    }

    /// Called exactly once per worker, when it exits.
    fn done(&self, index: usize) {
        let previous = self.workers[index].state.swap(DONE, Ordering::AcqRel);
        debug_assert_ne!(previous, DONE, "worker reported done twice");

        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            log::trace!("worker set of {} workers drained", self.workers.len());
            self.state.finish(self.ctx.is_cancelled());
        }
    }
}

/// The job handed to the executor for one worker.
///
/// Reports the worker done when dropped, whether or not it ran, so a job an
/// executor throws away cannot leave the set waiting forever.
struct WorkerJob {
    set: Arc<WorkerSet>,
    index: usize,
    func: TaskFn,
    started: bool,
}

impl WorkerJob {
    fn run(mut self) {
        self.started = true;
        self.set.run_worker(self.index, &self.func);
    }
}

impl Drop for WorkerJob {
    fn drop(&mut self) {
        if !self.started {
            self.set.workers[self.index].fail(TaskError::Executor(ExecutorError::Closed));
        }

        self.set.done(self.index);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}
