//! Plugins shipped with the binary
//!
//! - `heartbeat`: originator emitting a pipeline event every second
//! - `log_sink`: logs every event and finishes pipeline traversals

mod heartbeat;
mod log_sink;

pub use heartbeat::{Heartbeat, HEARTBEAT_EVENT_ID, HEARTBEAT_INTERVAL_SECS};
pub use log_sink::LogSink;

use crate::plugins::registry::PluginRegistry;

/// Register the builtin constructors; returns how many were newly added
pub fn register_builtin(registry: &PluginRegistry) -> usize {
    let mut added = 0;
    if registry.register("heartbeat", || Box::new(Heartbeat::default())) {
        added += 1;
    }
    if registry.register("log_sink", || Box::new(LogSink::new())) {
        added += 1;
    }
    added
}
