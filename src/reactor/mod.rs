//! Work loops
//!
//! A [`ReactorLoop`] runs a single-threaded scheduler over a deadline-ordered
//! [`TaskQueue`]. Each cycle it drains every due task, then blocks on a `mio::Poll`
//! until the next deadline, a wake-up from another thread, or readiness on one of
//! its registered file-descriptor sources.
//!
//! # Cycle
//! ```text
//! loop {
//!   ├─► pop due tasks, run each, re-arm repeating ones from completion time
//!   ├─► timeout = next deadline - now (none when the queue is empty)
//!   ├─► poll(timeout)
//!   │     ├─ waker token   ─► back to the drain step
//!   │     └─ source token  ─► source.on_ready()
//!   └─► exit once stop() was requested
//! }
//! ```

pub mod task_queue;

use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::event::EventRef;

pub use self::task_queue::{ScheduledTask, TaskQueue};

#[cfg(unix)]
use mio::{unix::SourceFd, Interest};
#[cfg(unix)]
use std::os::unix::io::RawFd;

const WAKE_TOKEN: Token = Token(0);

/// Readiness events fetched per poll by default
const EVENTS_CAPACITY: usize = 64;

/// Receiver of scheduled event deliveries
pub trait EventHandler: Send + Sync {
    /// Handle one event; the return value is published to result handles
    fn handle_event(self: Arc<Self>, event: &EventRef) -> bool;
}

/// Work carried by a scheduled task
pub enum Job {
    /// Run a closure (repeating timers call it once per period)
    Call(Box<dyn FnMut() + Send>),
    /// Deliver an event to a handler
    Deliver {
        handler: Weak<dyn EventHandler>,
        event: EventRef,
    },
    /// Deliver an event and publish the handler's result
    Request {
        handler: Weak<dyn EventHandler>,
        event: EventRef,
        reply: Option<oneshot::Sender<bool>>,
    },
}

impl Job {
    /// Wrap a closure
    pub fn call(f: impl FnMut() + Send + 'static) -> Self {
        Self::Call(Box::new(f))
    }

    /// Deliver `event` to `handler` without keeping the handler alive
    pub fn deliver<H: EventHandler + 'static>(handler: &Arc<H>, event: EventRef) -> Self {
        let handler: Weak<dyn EventHandler> = Arc::downgrade(handler) as Weak<dyn EventHandler>;
        Self::Deliver { handler, event }
    }

    fn run(&mut self, loop_name: &str, seq: u64) {
        match self {
            Self::Call(f) => f(),
            Self::Deliver { handler, event } => match handler.upgrade() {
                Some(handler) => {
                    handler.handle_event(event);
                }
                None => {
                    debug!(work_loop = loop_name, seq, "handler gone, skipping task");
                    // The stage vanished while queued; let the traversal move on
                    if event.is_pipeline() {
                        event.on_continue();
                    }
                }
            },
            Self::Request {
                handler,
                event,
                reply,
            } => {
                let result = match handler.upgrade() {
                    Some(handler) => handler.handle_event(event),
                    None => {
                        debug!(work_loop = loop_name, seq, "handler gone, request fails");
                        false
                    }
                };
                if let Some(reply) = reply.take() {
                    // The caller may have given up waiting
                    let _ = reply.send(result);
                }
            }
        }
    }
}

/// Completion handle for [`ReactorLoop::add_immediate_for_result`]
#[derive(Debug)]
pub struct ResultHandle {
    rx: Option<oneshot::Receiver<bool>>,
}

impl ResultHandle {
    /// A handle that already resolved to `false`
    #[must_use]
    pub fn failed() -> Self {
        Self { rx: None }
    }

    /// True when the handle resolves without blocking
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.rx.is_none()
    }

    /// Block the calling thread until the result is published
    ///
    /// Resolves to `false` when the task was discarded before running. Must not be
    /// called from inside an async runtime.
    #[must_use]
    pub fn wait(self) -> bool {
        match self.rx {
            Some(rx) => rx.blocking_recv().unwrap_or(false),
            None => false,
        }
    }
}

/// A file descriptor watched by a work loop
#[cfg(unix)]
pub trait FdSource: Send + Sync {
    /// Descriptor to register; must stay open while registered
    fn raw_fd(&self) -> RawFd;

    /// Readiness interest
    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    /// Called on the loop thread when the descriptor becomes ready
    fn on_ready(&self, readable: bool, writable: bool);
}

#[cfg(unix)]
struct FdEntry {
    token: Token,
    fd: RawFd,
    source: Arc<dyn FdSource>,
}

#[derive(Default)]
struct LoopState {
    queue: TaskQueue,
    /// Sequence of the task being executed right now
    current: Option<u64>,
    /// Set when the executing task was cancelled; suppresses its re-arm
    current_cancelled: bool,
}

struct Shared {
    name: String,
    state: Mutex<LoopState>,
    next_seq: AtomicU64,
    stopping: AtomicBool,
    started: AtomicBool,
    thread_id: Mutex<Option<ThreadId>>,
    poll: Mutex<Option<Poll>>,
    waker: Waker,
    #[cfg(unix)]
    registry: mio::Registry,
    #[cfg(unix)]
    sources: Mutex<HashMap<String, FdEntry>>,
    next_token: AtomicUsize,
    events_capacity: usize,
}

/// A named single-threaded scheduler
pub struct ReactorLoop {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReactorLoop {
    /// Create a stopped work loop
    ///
    /// # Errors
    /// Returns an error if the OS poller or its waker cannot be created
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        Self::with_event_capacity(name, EVENTS_CAPACITY)
    }

    /// Create a stopped work loop fetching up to `capacity` readiness events per
    /// poll
    ///
    /// # Errors
    /// Returns an error if the OS poller or its waker cannot be created
    pub fn with_event_capacity(name: impl Into<String>, capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        #[cfg(unix)]
        let registry = poll.registry().try_clone()?;

        Ok(Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(LoopState::default()),
                next_seq: AtomicU64::new(1),
                stopping: AtomicBool::new(false),
                started: AtomicBool::new(false),
                thread_id: Mutex::new(None),
                poll: Mutex::new(Some(poll)),
                waker,
                #[cfg(unix)]
                registry,
                #[cfg(unix)]
                sources: Mutex::new(HashMap::new()),
                next_token: AtomicUsize::new(1),
                events_capacity: capacity,
            }),
            thread: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Start the loop, on a dedicated thread or on the caller's thread
    ///
    /// With `new_thread == false` this call blocks until [`stop`](Self::stop).
    /// Starting twice is a no-op.
    ///
    /// # Errors
    /// Returns an error if the loop thread cannot be spawned
    pub fn start(&self, new_thread: bool) -> io::Result<()> {
        if self.shared.stopping.load(Ordering::Acquire)
            || self.shared.started.swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }

        if new_thread {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(self.shared.name.clone())
                .spawn(move || shared.run())?;
            *self.thread.lock() = Some(handle);
        } else {
            self.shared.run();
        }
        Ok(())
    }

    /// Stop the loop, discarding pending tasks
    ///
    /// Joins the loop thread unless called from it. Idempotent.
    pub fn stop(&self) {
        if self.shared.halt() {
            self.shared.wake();
        }

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                if handle.join().is_err() {
                    warn!(work_loop = %self.shared.name, "work loop thread panicked");
                }
            }
        }
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.thread_id.lock().is_some()
    }

    /// True when called from this loop's own thread
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        *self.shared.thread_id.lock() == Some(thread::current().id())
    }

    /// Number of tasks waiting in the queue
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Schedule `job` to run as soon as possible
    ///
    /// Returns the task's sequence id, or 0 if the loop is stopping.
    pub fn add_immediate(&self, job: Job) -> u64 {
        self.shared.schedule(job, Duration::ZERO, None)
    }

    /// Schedule `job` after `interval_secs`, optionally repeating
    ///
    /// A repeating task is re-armed from the time its previous run completed.
    /// Returns 0 if the loop is stopping or the interval is invalid or would
    /// overflow the clock.
    pub fn add_timer(&self, job: Job, interval_secs: f64, repeat: bool) -> u64 {
        let interval = match Duration::try_from_secs_f64(interval_secs) {
            Ok(interval) => interval,
            Err(e) => {
                warn!(work_loop = %self.shared.name, interval_secs, "invalid timer interval: {}", e);
                return 0;
            }
        };
        self.shared
            .schedule(job, interval, repeat.then_some(interval))
    }

    /// Schedule delivery of `event` to `handler` and return a handle on the result
    ///
    /// The handle is already resolved to `false` when the handler is gone or the
    /// loop is stopping, so the failure path never blocks.
    pub fn add_immediate_for_result(
        &self,
        handler: Weak<dyn EventHandler>,
        event: EventRef,
    ) -> ResultHandle {
        if handler.strong_count() == 0 || self.is_stopping() {
            return ResultHandle::failed();
        }

        let (tx, rx) = oneshot::channel();
        let job = Job::Request {
            handler,
            event,
            reply: Some(tx),
        };
        if self.shared.schedule(job, Duration::ZERO, None) == 0 {
            return ResultHandle::failed();
        }
        ResultHandle { rx: Some(rx) }
    }

    /// Cancel a task by sequence id
    ///
    /// A task that is executing right now cannot be removed; it is only kept from
    /// re-arming. Returns true if a pending task was removed.
    pub fn remove_task(&self, seq: u64) -> bool {
        if seq == 0 {
            return false;
        }
        let removed = {
            let mut state = self.shared.state.lock();
            if state.current == Some(seq) {
                state.current_cancelled = true;
                return false;
            }
            state.queue.remove(seq)
        };
        removed.is_some()
    }

    /// Watch a file descriptor under a unique name
    ///
    /// Returns false for duplicate names or if registration with the poller fails.
    #[cfg(unix)]
    pub fn register_fd_source(&self, name: &str, source: Arc<dyn FdSource>) -> bool {
        let mut sources = self.shared.sources.lock();
        if sources.contains_key(name) {
            warn!(work_loop = %self.shared.name, source = name, "duplicate fd source");
            return false;
        }

        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let fd = source.raw_fd();
        if let Err(e) = self
            .shared
            .registry
            .register(&mut SourceFd(&fd), token, source.interest())
        {
            warn!(work_loop = %self.shared.name, source = name, "failed to register fd: {}", e);
            return false;
        }

        sources.insert(name.to_string(), FdEntry { token, fd, source });
        true
    }

    /// Stop watching a named descriptor
    #[cfg(unix)]
    pub fn unregister_fd_source(&self, name: &str) -> bool {
        let Some(entry) = self.shared.sources.lock().remove(name) else {
            return false;
        };
        if let Err(e) = self.shared.registry.deregister(&mut SourceFd(&entry.fd)) {
            debug!(work_loop = %self.shared.name, source = name, "deregister failed: {}", e);
        }
        true
    }
}

impl Drop for ReactorLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ReactorLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorLoop")
            .field("name", &self.shared.name)
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(work_loop = %self.name, "failed to wake work loop: {}", e);
        }
    }

    /// Refuse further work and discard pending tasks
    ///
    /// Dropping a discarded request resolves its handle to `false`. Returns false
    /// if the loop was already stopping.
    fn halt(&self) -> bool {
        let discarded = {
            let mut state = self.state.lock();
            if self.stopping.swap(true, Ordering::AcqRel) {
                return false;
            }
            state.queue.drain()
        };
        debug!(
            work_loop = %self.name,
            discarded = discarded.len(),
            "stopping work loop"
        );
        // Dropped outside the lock: jobs may own other loops or reply channels
        drop(discarded);
        true
    }

    fn schedule(&self, job: Job, delay: Duration, interval: Option<Duration>) -> u64 {
        if self.stopping.load(Ordering::Acquire) {
            return 0;
        }
        let Some(deadline) = Instant::now().checked_add(delay) else {
            warn!(work_loop = %self.name, ?delay, "deadline overflows the clock");
            return 0;
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            // Re-checked under the lock so nothing lands after stop() drained
            if self.stopping.load(Ordering::Acquire) {
                return 0;
            }
            state.queue.push(ScheduledTask {
                seq,
                deadline,
                interval,
                job,
            });
        }
        self.wake();
        seq
    }

    fn run(&self) {
        let Some(mut poll) = self.poll.lock().take() else {
            warn!(work_loop = %self.name, "work loop is already running");
            return;
        };
        *self.thread_id.lock() = Some(thread::current().id());
        debug!(work_loop = %self.name, "work loop started");

        let mut events = Events::with_capacity(self.events_capacity);
        while !self.stopping.load(Ordering::Acquire) {
            self.drain_due();
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let timeout = self
                .state
                .lock()
                .queue
                .peek_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(work_loop = %self.name, "poll failed: {}", e);
                break;
            }

            for event in &events {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                self.dispatch_ready(event);
            }
        }

        // A failed poll ends the loop too; nothing queued after this could run
        self.halt();
        *self.thread_id.lock() = None;
        debug!(work_loop = %self.name, "work loop exited");
    }

    #[cfg(unix)]
    fn dispatch_ready(&self, event: &mio::event::Event) {
        let source = self
            .sources
            .lock()
            .values()
            .find(|entry| entry.token == event.token())
            .map(|entry| Arc::clone(&entry.source));
        match source {
            Some(source) => source.on_ready(event.is_readable(), event.is_writable()),
            None => trace!(work_loop = %self.name, "readiness for unregistered source"),
        }
    }

    #[cfg(not(unix))]
    fn dispatch_ready(&self, _event: &mio::event::Event) {}

    /// Run every task due at the start of this drain
    fn drain_due(&self) {
        let now = Instant::now();
        loop {
            let mut task = {
                let mut state = self.state.lock();
                match state.queue.pop_due(now) {
                    Some(task) => {
                        state.current = Some(task.seq);
                        state.current_cancelled = false;
                        task
                    }
                    None => return,
                }
            };

            task.job.run(&self.name, task.seq);

            let mut state = self.state.lock();
            let cancelled = state.current_cancelled;
            state.current = None;
            state.current_cancelled = false;

            let Some(interval) = task.interval else {
                continue;
            };
            if cancelled || self.stopping.load(Ordering::Acquire) {
                trace!(work_loop = %self.name, seq = task.seq, "repeating task not re-armed");
                continue;
            }
            match Instant::now().checked_add(interval) {
                Some(deadline) => {
                    task.deadline = deadline;
                    state.queue.push(task);
                }
                None => warn!(work_loop = %self.name, seq = task.seq, "re-arm overflows the clock"),
            }
        }
    }
}
