use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::event::{Event, EventRef};
use crate::plugins::api::Plugin;
use crate::plugins::host::LoadedPlugin;
use crate::reactor::{Job, ReactorLoop};

/// Id carried by heartbeat events
pub const HEARTBEAT_EVENT_ID: u32 = 1;

/// Seconds between beats
pub const HEARTBEAT_INTERVAL_SECS: f64 = 1.0;

/// Originator that emits a numbered pipeline event on a repeating timer
pub struct Heartbeat {
    interval_secs: f64,
    beats: Arc<AtomicU64>,
    timer: Mutex<Option<(Weak<ReactorLoop>, u64)>>,
}

impl Heartbeat {
    #[must_use]
    pub fn new(interval_secs: f64) -> Self {
        Self {
            interval_secs,
            beats: Arc::new(AtomicU64::new(0)),
            timer: Mutex::new(None),
        }
    }

    /// Beats emitted so far
    #[must_use]
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(HEARTBEAT_INTERVAL_SECS)
    }
}

fn beat(host: &LoadedPlugin, beats: &AtomicU64) {
    let n = beats.fetch_add(1, Ordering::Relaxed) + 1;
    let event = Event::pipeline("heartbeat", HEARTBEAT_EVENT_ID, host.name(), None);
    event.set_value("beat", n);
    let entered = host.emit(&event);
    debug!(plugin = host.name(), beat = n, entered, "heartbeat");
}

impl Plugin for Heartbeat {
    fn on_event(&self, _host: &Arc<LoadedPlugin>, _event: &EventRef) -> bool {
        false
    }

    fn start_source(&self, host: &Arc<LoadedPlugin>) {
        let work_loop = match host.work_loop() {
            Some(work_loop) => work_loop,
            None => match host.platform() {
                Some(platform) => Arc::clone(platform.default_loop()),
                None => {
                    warn!(plugin = host.name(), "heartbeat has no loop to run on");
                    return;
                }
            },
        };

        // A pending beat must not keep the plugin alive
        let weak = Arc::downgrade(host);
        let beats = Arc::clone(&self.beats);
        let seq = work_loop.add_timer(
            Job::call(move || {
                if let Some(host) = weak.upgrade() {
                    beat(&host, &beats);
                }
            }),
            self.interval_secs,
            true,
        );
        if seq == 0 {
            warn!(plugin = host.name(), "failed to schedule heartbeat");
            return;
        }
        *self.timer.lock() = Some((Arc::downgrade(&work_loop), seq));
    }

    fn on_unload(&self, host: &Arc<LoadedPlugin>) {
        if let Some((work_loop, seq)) = self.timer.lock().take() {
            if let Some(work_loop) = work_loop.upgrade() {
                work_loop.remove_task(seq);
            }
        }
        debug!(plugin = host.name(), beats = self.beats(), "heartbeat stopped");
    }
}
