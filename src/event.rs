//! Events flowing through the dispatch system
//!
//! An [`Event`] is shared by reference ([`EventRef`]) between its producer, the
//! queues it travels through and every plugin that handles it. Pipeline events
//! additionally carry a traversal: the remaining plugin sequence, the pending and
//! finished flags and the recycler hook fired once when the traversal ends.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::plugins::host::PluginRef;
use crate::reactor::Job;

/// Shared handle to an event
pub type EventRef = Arc<Event>;

/// Broadcast delivery mode of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ManageType {
    /// Listeners are visited in order and may stop delivery
    Ordered,
    /// Every matching listener is invoked
    #[default]
    Unordered,
}

/// Producer-side cleanup hook for pipeline events
pub trait Recycler: Send + Sync {
    /// Called exactly once when a pipeline event finishes
    fn recycle(&self, event: &Event);
}

/// Traversal state of a pipeline event
struct Trace {
    pipeline: Option<String>,
    remaining: VecDeque<PluginRef>,
    current: Option<String>,
    pending: bool,
    finished: bool,
    handoffs: u64,
    steps: u64,
    /// Emit queue-out / pipeline-done markers for this traversal
    audit: bool,
    recycler: Option<Weak<dyn Recycler>>,
}

impl Trace {
    fn new(recycler: Option<Weak<dyn Recycler>>) -> Self {
        Self {
            pipeline: None,
            remaining: VecDeque::new(),
            current: None,
            pending: false,
            finished: false,
            handoffs: 0,
            steps: 0,
            audit: false,
            recycler,
        }
    }
}

/// One unit of information flowing through the system
pub struct Event {
    message_type: String,
    id: u32,
    sender: Mutex<String>,
    created_at: DateTime<Utc>,
    manage: Mutex<ManageType>,
    payload: Mutex<Map<String, Value>>,
    trace: Option<Mutex<Trace>>,
}

impl Event {
    /// Create a plain (broadcast or targeted) event
    pub fn new(message_type: impl Into<String>, id: u32, sender: impl Into<String>) -> EventRef {
        Arc::new(Self::build(message_type.into(), id, sender.into(), None))
    }

    /// Create a pipeline event
    ///
    /// `recycler` is invoked once when the traversal finishes.
    pub fn pipeline(
        message_type: impl Into<String>,
        id: u32,
        sender: impl Into<String>,
        recycler: Option<Weak<dyn Recycler>>,
    ) -> EventRef {
        Arc::new(Self::build(
            message_type.into(),
            id,
            sender.into(),
            Some(Trace::new(recycler)),
        ))
    }

    fn build(message_type: String, id: u32, sender: String, trace: Option<Trace>) -> Self {
        Self {
            message_type,
            id,
            sender: Mutex::new(sender),
            created_at: Utc::now(),
            manage: Mutex::new(ManageType::default()),
            payload: Mutex::new(Map::new()),
            trace: trace.map(Mutex::new),
        }
    }

    /// Copy attributes and payload into a fresh event with an empty traversal
    #[must_use]
    pub fn duplicate(&self) -> EventRef {
        let trace = self
            .trace
            .as_ref()
            .map(|t| Trace::new(t.lock().recycler.clone()));
        let copy = Self {
            message_type: self.message_type.clone(),
            id: self.id,
            sender: Mutex::new(self.sender()),
            created_at: self.created_at,
            manage: Mutex::new(self.manage_type()),
            payload: Mutex::new(self.payload.lock().clone()),
            trace: trace.map(Mutex::new),
        };
        Arc::new(copy)
    }

    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name of the plugin that last emitted this event (empty = anonymous)
    #[must_use]
    pub fn sender(&self) -> String {
        self.sender.lock().clone()
    }

    pub fn set_sender(&self, sender: impl Into<String>) {
        *self.sender.lock() = sender.into();
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn manage_type(&self) -> ManageType {
        *self.manage.lock()
    }

    pub fn set_manage_type(&self, manage: ManageType) {
        *self.manage.lock() = manage;
    }

    /// Store a payload value
    pub fn set_value(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.payload.lock().insert(key.into(), value.into());
    }

    /// Read a payload value
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Value> {
        self.payload.lock().get(key).cloned()
    }

    /// Encode the payload for the wire codec
    ///
    /// # Errors
    /// Returns an error if a payload value cannot be serialized
    pub fn payload_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.payload.lock())
    }

    #[must_use]
    pub fn is_pipeline(&self) -> bool {
        self.trace.is_some()
    }

    /// Pipeline currently driving this event
    #[must_use]
    pub fn pipeline_name(&self) -> Option<String> {
        self.trace.as_ref().and_then(|t| t.lock().pipeline.clone())
    }

    /// Plugin that was last handed this event by its pipeline
    #[must_use]
    pub fn current_plugin(&self) -> Option<String> {
        self.trace.as_ref().and_then(|t| t.lock().current.clone())
    }

    /// Number of stages not yet visited
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.trace.as_ref().map_or(0, |t| t.lock().remaining.len())
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.trace.as_ref().is_some_and(|t| t.lock().pending)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.trace.as_ref().is_some_and(|t| t.lock().finished)
    }

    /// Ask to be revisited later instead of advancing to the next stage
    pub fn mark_pending(&self) {
        if let Some(trace) = &self.trace {
            trace.lock().pending = true;
        }
    }

    pub(crate) fn clear_pending(&self) {
        if let Some(trace) = &self.trace {
            trace.lock().pending = false;
        }
    }

    /// Count of traversal hand-offs (advances and repacks)
    ///
    /// Handlers compare snapshots of this value to tell whether the event was
    /// already moved on while they held it.
    #[must_use]
    pub fn handoffs(&self) -> u64 {
        self.trace.as_ref().map_or(0, |t| t.lock().handoffs)
    }

    /// Number of `on_continue` steps taken, including skipped stale stages and the
    /// terminal step
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.trace.as_ref().map_or(0, |t| t.lock().steps)
    }

    pub(crate) fn bump_handoffs(&self) {
        if let Some(trace) = &self.trace {
            trace.lock().handoffs += 1;
        }
    }

    /// Install a new traversal; the event must be a pipeline event that has not
    /// finished
    pub(crate) fn begin_traversal(
        &self,
        pipeline: &str,
        stages: Vec<PluginRef>,
        audit: bool,
    ) -> bool {
        let Some(trace) = &self.trace else {
            warn!(event = self.id, pipeline, "not a pipeline event");
            return false;
        };
        let mut t = trace.lock();
        if t.finished {
            debug!(event = self.id, pipeline, "event already finished");
            return false;
        }
        t.pipeline = Some(pipeline.to_string());
        t.remaining = stages.into();
        t.current = None;
        t.pending = false;
        t.audit = audit;
        true
    }

    /// Hand the event to the next live stage, or finish it when none is left
    pub fn on_continue(self: &Arc<Self>) {
        let Some(trace) = &self.trace else {
            return;
        };

        loop {
            let (next, audit) = {
                let mut t = trace.lock();
                if t.finished {
                    return;
                }
                t.steps += 1;
                match t.remaining.pop_front() {
                    Some(stage) => {
                        t.handoffs += 1;
                        (stage, t.audit)
                    }
                    None => {
                        drop(t);
                        self.on_finish();
                        return;
                    }
                }
            };

            let Some(plugin) = next.upgrade() else {
                debug!(event = self.id, plugin = next.name(), "skipping stale stage");
                continue;
            };
            trace.lock().current = Some(plugin.name().to_string());

            if !plugin.can_process_more_events() {
                debug!(plugin = plugin.name(), "plugin signalled backpressure");
                plugin.notify_paused();
            }

            if audit {
                trace!(
                    target: "kiln::audit",
                    marker = "queue-out",
                    event = self.id,
                    plugin = plugin.name()
                );
            }

            match plugin.work_loop() {
                Some(work_loop) => {
                    if work_loop.add_immediate(Job::deliver(&plugin, Arc::clone(self))) == 0 {
                        warn!(
                            event = self.id,
                            plugin = plugin.name(),
                            "work loop is stopping, finishing event"
                        );
                        self.on_finish();
                    }
                }
                None => {
                    plugin.on_event_proxy(self);
                }
            }
            return;
        }
    }

    /// Terminate the traversal; the recycler runs at most once
    pub fn on_finish(&self) {
        let Some(trace) = &self.trace else {
            return;
        };

        let (recycler, audit) = {
            let mut t = trace.lock();
            if t.finished {
                return;
            }
            t.finished = true;
            t.pending = false;
            t.remaining.clear();
            (t.recycler.take(), t.audit)
        };

        if audit {
            trace!(
                target: "kiln::audit",
                marker = "pipeline-done",
                event = self.id,
                pipeline = %self.pipeline_name().unwrap_or_default()
            );
        }

        if let Some(recycler) = recycler.and_then(|r| r.upgrade()) {
            recycler.recycle(self);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("message_type", &self.message_type)
            .field("id", &self.id)
            .field("sender", &self.sender())
            .field("manage", &self.manage_type())
            .field("pipeline", &self.pipeline_name())
            .finish_non_exhaustive()
    }
}
