//! Broadcast event dispatch
//!
//! A [`DispatchQueue`] is a FIFO consumed by one dedicated thread that hands every
//! event to the registered listeners, either ordered (in registration order,
//! resumable from the sender, stoppable by any listener) or unordered (every
//! matching listener, unconditionally).

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

use crate::event::{EventRef, ManageType};

/// Receiver of broadcast events
pub trait Listener: Send + Sync {
    /// Name matched against an event's sender for ordered resume
    fn listener_name(&self) -> &str;

    /// Whether this listener's subscription covers `id`
    fn subscribes_to(&self, id: u32) -> bool;

    /// Ordered delivery; returning true stops delivery to later listeners
    fn on_ordered(self: Arc<Self>, event: &EventRef) -> bool;

    /// Unordered delivery
    fn on_unordered(self: Arc<Self>, event: &EventRef);
}

struct QueueState {
    fifo: VecDeque<EventRef>,
    listeners: Vec<Weak<dyn Listener>>,
    stopping: bool,
}

struct QueueShared {
    name: String,
    manage: ManageType,
    state: Mutex<QueueState>,
    available: Condvar,
}

/// FIFO event queue with a single consumer thread
pub struct DispatchQueue {
    shared: Arc<QueueShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    #[must_use]
    pub fn new(name: impl Into<String>, manage: ManageType) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                name: name.into(),
                manage,
                state: Mutex::new(QueueState {
                    fifo: VecDeque::new(),
                    listeners: Vec::new(),
                    stopping: false,
                }),
                available: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn manage_type(&self) -> ManageType {
        self.shared.manage
    }

    /// Append a listener; listeners are visited in registration order
    pub fn register_listener(&self, listener: Weak<dyn Listener>) {
        let mut state = self.shared.state.lock();
        state.listeners.retain(|l| l.strong_count() > 0);
        state.listeners.push(listener);
    }

    /// Number of live listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .listeners
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }

    /// Queue an event for delivery; returns false once the queue is stopping
    pub fn enqueue(&self, event: EventRef) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.stopping {
                return false;
            }
            state.fifo.push_back(event);
        }
        self.shared.available.notify_one();
        true
    }

    /// Events waiting for the consumer
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().fifo.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the consumer thread; starting twice is a no-op
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned
    pub fn start(&self) -> io::Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() || self.shared.state.lock().stopping {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        *thread = Some(
            thread::Builder::new()
                .name(self.shared.name.clone())
                .spawn(move || shared.consume())?,
        );
        Ok(())
    }

    /// Stop the consumer, discarding undelivered events. Idempotent.
    pub fn stop(&self) {
        let discarded = {
            let mut state = self.shared.state.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
            std::mem::take(&mut state.fifo)
        };
        debug!(queue = %self.shared.name, discarded = discarded.len(), "stopping dispatch queue");
        drop(discarded);
        self.shared.available.notify_all();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(queue = %self.shared.name, "dispatch thread panicked");
            }
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl QueueShared {
    fn consume(&self) {
        debug!(queue = %self.name, "dispatch queue started");
        loop {
            let (event, listeners) = {
                let mut state = self.state.lock();
                while state.fifo.is_empty() && !state.stopping {
                    self.available.wait(&mut state);
                }
                if state.stopping {
                    break;
                }
                let Some(event) = state.fifo.pop_front() else {
                    continue;
                };
                (event, state.listeners.clone())
            };

            match self.manage {
                ManageType::Ordered => deliver_ordered(&listeners, &event),
                ManageType::Unordered => deliver_unordered(&listeners, &event),
            };
        }
        debug!(queue = %self.name, "dispatch queue exited");
    }
}

/// Visit listeners after the sender until one asks to stop
///
/// An anonymous sender, or one that is not a live listener, starts delivery at the
/// first listener. Returns the number of listeners invoked.
fn deliver_ordered(listeners: &[Weak<dyn Listener>], event: &EventRef) -> usize {
    let live: Vec<Arc<dyn Listener>> = listeners.iter().filter_map(Weak::upgrade).collect();
    let sender = event.sender();

    let start = if sender.is_empty() {
        0
    } else {
        live.iter()
            .position(|l| l.listener_name() == sender)
            .map_or(0, |pos| pos + 1)
    };

    let mut invoked = 0;
    for listener in live.into_iter().skip(start) {
        if !listener.subscribes_to(event.id()) {
            continue;
        }
        invoked += 1;
        let name = listener.listener_name().to_string();
        if listener.on_ordered(event) {
            trace!(event = event.id(), listener = %name, "ordered delivery stopped");
            break;
        }
    }
    invoked
}

/// Invoke every live, subscribed listener in registration order
fn deliver_unordered(listeners: &[Weak<dyn Listener>], event: &EventRef) -> usize {
    let mut invoked = 0;
    for listener in listeners.iter().filter_map(Weak::upgrade) {
        if listener.subscribes_to(event.id()) {
            invoked += 1;
            listener.on_unordered(event);
        }
    }
    invoked
}
