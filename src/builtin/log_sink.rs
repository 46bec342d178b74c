use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::event::EventRef;
use crate::plugins::api::Plugin;
use crate::plugins::host::LoadedPlugin;

/// Terminal stage: logs whatever reaches it and ends pipeline traversals
#[derive(Default)]
pub struct LogSink {
    received: AtomicU64,
}

impl LogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn log(&self, host: &LoadedPlugin, event: &EventRef, via: &str) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let payload = event.payload_json().unwrap_or_default();
        info!(
            plugin = host.name(),
            via,
            event = event.id(),
            message_type = event.message_type(),
            sender = %event.sender(),
            %payload,
            "event received"
        );
    }
}

impl Plugin for LogSink {
    fn on_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) -> bool {
        self.log(host, event, "direct");
        if event.is_pipeline() {
            event.on_finish();
        }
        true
    }

    fn on_unordered_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) {
        self.log(host, event, "broadcast");
    }

    fn on_ordered_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) -> bool {
        self.log(host, event, "ordered");
        false
    }

    fn on_unload(&self, host: &Arc<LoadedPlugin>) {
        debug!(plugin = host.name(), received = self.received(), "log sink closed");
    }
}
