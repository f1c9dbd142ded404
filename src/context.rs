//! Cooperative cancellation handed to every worker invocation.
//!
//! A [`Context`] never interrupts running code. Work that wants to stop early
//! checks [`Context::is_cancelled`] at convenient points, or selects on
//! [`Context::done`] alongside its own channels.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        PoisonError,
        Weak,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{at, bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;

/// Sender side of the shared deadline timer thread.
static TIMERS: Lazy<Option<Sender<Timer>>> = Lazy::new(|| {
    let (tx, rx) = unbounded();

    match thread::Builder::new()
        .name("context-deadline".into())
        .spawn(move || run_timers(rx))
    {
        Ok(_) => Some(tx),
        Err(e) => {
            log::warn!("failed to spawn deadline timer thread: {}", e);
            None
        }
    }
});

/// Message type of the [`Context::done`] channel. It has no values, so the
/// channel only ever reports disconnection.
#[derive(Debug)]
pub enum Never {}

/// A cloneable cancellation token arranged in a tree.
///
/// Cancelling a context cancels every context derived from it. Clones share
/// the same state.
///
/// # Examples
///
/// ```
/// use gangpool::Context;
///
/// let parent = Context::background();
/// let child = parent.child();
///
/// parent.cancel();
/// assert!(child.is_cancelled());
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    state: Mutex<State>,
    done: Receiver<Never>,
}

struct State {
    /// Dropped on cancellation, which disconnects `done`.
    sender: Option<Sender<Never>>,
    children: Vec<Weak<Inner>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// Create a root context that is only cancelled explicitly.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner::new(None)),
        }
    }

    /// Derive a context that is cancelled together with this one.
    pub fn child(&self) -> Self {
        self.derive(None)
    }

    /// Derive a context that is cancelled once `timeout` elapses.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that is cancelled once `deadline` passes.
    ///
    /// Deadlines of every context are tracked by a single background timer
    /// thread, started on first use.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let ctx = self.derive(Some(deadline));

        if !ctx.is_cancelled() {
            let timer = Timer {
                deadline,
                ctx: Arc::downgrade(&ctx.inner),
            };

            match TIMERS.as_ref().map(|timers| timers.send(timer)) {
                Some(Ok(())) => {}
                _ => log::warn!("deadline timer unavailable, deadline will not fire"),
            }
        }

        ctx
    }

    /// Cancel this context and every context derived from it.
    ///
    /// Cancelling more than once has no further effect.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Returns `true` once this context has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The earliest deadline of this context or any of its ancestors.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// A channel that disconnects when the context is cancelled.
    ///
    /// Nothing is ever sent on it, so a `recv` returning an error means the
    /// context is done.
    ///
    /// ```
    /// use std::time::Duration;
    /// use crossbeam_channel::{after, select};
    /// use gangpool::Context;
    ///
    /// let ctx = Context::background();
    /// ctx.cancel();
    ///
    /// select! {
    ///     recv(ctx.done()) -> _ => {}
    ///     recv(after(Duration::from_secs(1))) -> _ => panic!("context should be done"),
    /// }
    /// ```
    pub fn done(&self) -> &Receiver<Never> {
        &self.inner.done
    }

    /// Block the current thread until the context is cancelled.
    pub fn wait(&self) {
        let _ = self.inner.done.recv();
    }

    /// Block until the context is cancelled or `timeout` passes.
    ///
    /// Returns `true` if the context was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.inner.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let deadline = match (self.inner.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let child = Arc::new(Inner::new(deadline));
        let mut state = self.inner.lock();

        if state.sender.is_none() {
            // Parent already cancelled.
            child.cancel();
        } else {
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&child));
        }

        Self { inner: child }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl Inner {
    fn new(deadline: Option<Instant>) -> Self {
        let (tx, rx) = bounded(0);

        Self {
            cancelled: AtomicBool::new(false),
            deadline,
            state: Mutex::new(State {
                sender: Some(tx),
                children: Vec::new(),
            }),
            done: rx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.lock();

            if state.sender.is_none() {
                return;
            }

            self.cancelled.store(true, Ordering::Release);
            state.sender = None;
            std::mem::take(&mut state.children)
        };

        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// A pending deadline. Holds the context weakly so that dropping it does
/// not wait for the deadline.
struct Timer {
    deadline: Instant,
    ctx: Weak<Inner>,
}

/// Body of the deadline timer thread.
fn run_timers(requests: Receiver<Timer>) {
    // Keyed by deadline plus a sequence number to keep equal deadlines apart.
    let mut timers: BTreeMap<(Instant, u64), Weak<Inner>> = BTreeMap::new();
    let mut seq = 0u64;
    let mut compact_at = 64;

    loop {
        let now = Instant::now();

        while let Some(entry) = timers.first_entry() {
            if entry.key().0 > now {
                break;
            }

            if let Some(inner) = entry.remove().upgrade() {
                log::trace!("context deadline exceeded");
                inner.cancel();
            }
        }

        let request = match timers.keys().next() {
            Some(&(next, _)) => select! {
                recv(requests) -> request => request,
                recv(at(next)) -> _ => continue,
            },
            None => requests.recv(),
        };

        let timer = match request {
            Ok(timer) => timer,
            Err(_) => break,
        };

        seq += 1;
        timers.insert((timer.deadline, seq), timer.ctx);

        // Contexts cancelled or dropped early would otherwise linger until
        // their deadline.
        if timers.len() >= compact_at {
            timers.retain(|_, ctx| {
                ctx.upgrade()
                    .map_or(false, |inner| !inner.cancelled.load(Ordering::Acquire))
            });
            compact_at = (timers.len() * 2).max(64);
        }
    }
}
