/// Plugin API definitions
use std::ops::RangeInclusive;
use std::sync::Arc;

use super::host::LoadedPlugin;
use crate::event::{Event, EventRef};

/// Plugin API trait that all plugins must implement
///
/// Hooks receive the [`LoadedPlugin`] hosting the behavior so they can reach their
/// work loop, attached pipelines and the platform. Hooks run on the plugin's work
/// loop when it has one, otherwise on whichever thread delivered the event.
pub trait Plugin: Send + Sync {
    /// Plugin version string
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    /// Called once after the plugin is bound to its work loop
    fn on_load(&self, _host: &Arc<LoadedPlugin>) {}

    /// Called once before the plugin is destroyed
    fn on_unload(&self, _host: &Arc<LoadedPlugin>) {}

    /// Handle a pipeline stage or targeted call
    ///
    /// The return value is published to synchronous callers. Pipeline events the
    /// handler neither finishes, pends nor moves on are advanced automatically.
    fn on_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) -> bool;

    /// Cheap admission check used by pipelines
    fn can_process_event(&self, _event: &Event) -> bool {
        true
    }

    /// False when the plugin is saturated
    fn can_process_more_events(&self) -> bool {
        true
    }

    /// Notification that events are being handed over while saturated
    fn on_paused(&self, _host: &Arc<LoadedPlugin>) {}

    /// Inclusive range of broadcast event ids to receive; `None` receives all
    fn subscription(&self) -> Option<RangeInclusive<u32>> {
        None
    }

    /// Ordered broadcast; return true to stop delivery to later listeners
    fn on_ordered_event(&self, _host: &Arc<LoadedPlugin>, _event: &EventRef) -> bool {
        false
    }

    /// Unordered broadcast
    fn on_unordered_event(&self, _host: &Arc<LoadedPlugin>, _event: &EventRef) {}

    /// Start producing events; only called for plugins configured as originators
    fn start_source(&self, _host: &Arc<LoadedPlugin>) {}
}

/// Constructor stored in the plugin registry
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;
