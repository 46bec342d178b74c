//! Bound plugin instances and the tables that own them

use libloading::Library;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use super::api::Plugin;
use crate::dispatch::Listener;
use crate::event::EventRef;
use crate::pipeline::Pipeline;
use crate::platform::{Platform, PlatformInner};
use crate::reactor::{EventHandler, Job, ReactorLoop};

/// A plugin behavior bound into the runtime
pub struct LoadedPlugin {
    name: String,
    version: String,
    behavior: Box<dyn Plugin>,
    work_loop: Mutex<Option<Arc<ReactorLoop>>>,
    pipelines: Mutex<Vec<Weak<Pipeline>>>,
    platform: OnceCell<Weak<PlatformInner>>,
    // Declared after `behavior` so the code backing it is unloaded last
    library: Option<Library>,
}

impl LoadedPlugin {
    /// Wrap a statically linked behavior
    #[must_use]
    pub fn new(name: impl Into<String>, behavior: Box<dyn Plugin>) -> Arc<Self> {
        Self::build(name.into(), behavior, None)
    }

    /// Wrap a behavior constructed from a dynamically loaded library
    #[must_use]
    pub fn with_library(
        name: impl Into<String>,
        behavior: Box<dyn Plugin>,
        library: Library,
    ) -> Arc<Self> {
        Self::build(name.into(), behavior, Some(library))
    }

    fn build(name: String, behavior: Box<dyn Plugin>, library: Option<Library>) -> Arc<Self> {
        let version = behavior.version().to_string();
        Arc::new(Self {
            name,
            version,
            behavior,
            work_loop: Mutex::new(None),
            pipelines: Mutex::new(Vec::new()),
            platform: OnceCell::new(),
            library,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }

    #[must_use]
    pub fn behavior(&self) -> &dyn Plugin {
        self.behavior.as_ref()
    }

    /// Work loop this plugin's handlers run on
    #[must_use]
    pub fn work_loop(&self) -> Option<Arc<ReactorLoop>> {
        self.work_loop.lock().clone()
    }

    /// Bind a work loop, replacing any previous binding
    pub fn bind_work_loop(&self, work_loop: Arc<ReactorLoop>) {
        *self.work_loop.lock() = Some(work_loop);
    }

    /// Release the work loop binding
    pub fn unbind_work_loop(&self) -> Option<Arc<ReactorLoop>> {
        self.work_loop.lock().take()
    }

    /// Pipelines this plugin originates events into
    #[must_use]
    pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.pipelines.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Attach a pipeline this plugin feeds
    pub fn attach_pipeline(&self, pipeline: &Arc<Pipeline>) {
        let mut pipelines = self.pipelines.lock();
        if !pipelines
            .iter()
            .any(|p| p.upgrade().is_some_and(|p| Arc::ptr_eq(&p, pipeline)))
        {
            pipelines.push(Arc::downgrade(pipeline));
        }
    }

    /// Owning platform, if it is still alive
    #[must_use]
    pub fn platform(&self) -> Option<Platform> {
        self.platform
            .get()
            .and_then(Weak::upgrade)
            .map(Platform::from_inner)
    }

    /// Set the owning platform; later attempts are ignored
    pub(crate) fn set_platform(&self, platform: Weak<PlatformInner>) {
        if self.platform.set(platform).is_err() {
            trace!(plugin = %self.name, "platform already set");
        }
    }

    pub(crate) fn can_process_more_events(&self) -> bool {
        self.behavior.can_process_more_events()
    }

    pub(crate) fn notify_paused(self: &Arc<Self>) {
        self.behavior.on_paused(self);
    }

    pub(crate) fn load(self: &Arc<Self>) {
        self.behavior.on_load(self);
    }

    pub(crate) fn unload(self: &Arc<Self>) {
        self.behavior.on_unload(self);
    }

    pub(crate) fn start_source(self: &Arc<Self>) {
        self.behavior.start_source(self);
    }

    /// Entry point for every delivery to this plugin
    ///
    /// Pipeline events the handler neither finished, pended nor handed off are
    /// advanced to the next stage.
    pub fn on_event_proxy(self: &Arc<Self>, event: &EventRef) -> bool {
        event.clear_pending();
        let handoffs = event.handoffs();

        let result = self.behavior.on_event(self, event);

        if !event.is_pipeline() {
            if self.platform().is_some_and(|platform| platform.audit_enabled()) {
                trace!(target: "kiln::audit", marker = "delivered", event = event.id(), plugin = %self.name);
            }
            return result;
        }
        if !event.is_finished() && !event.is_pending() && event.handoffs() == handoffs {
            event.on_continue();
        }
        result
    }

    /// Revisit `event` after `delay_secs` on this plugin's work loop
    ///
    /// Marks the event pending. Returns the timer's sequence id, or 0 when the
    /// plugin has no work loop (nothing is scheduled then).
    pub fn delay_process_event(self: &Arc<Self>, event: &EventRef, delay_secs: f64) -> u64 {
        let Some(work_loop) = self.work_loop() else {
            debug!(plugin = %self.name, "no work loop, cannot delay event");
            return 0;
        };
        event.mark_pending();
        work_loop.add_timer(Job::deliver(self, Arc::clone(event)), delay_secs, false)
    }

    /// Drive `event` through every attached pipeline that admits it
    ///
    /// The first admitting pipeline gets `event` itself, later ones a duplicate.
    /// Returns the number of pipelines the event entered.
    pub fn emit(&self, event: &EventRef) -> usize {
        let mut entered = 0;
        for pipeline in self.pipelines() {
            if !pipeline.can_process_event(event) {
                trace!(plugin = %self.name, pipeline = pipeline.name(), "pipeline declined event");
                continue;
            }
            let instance = if entered == 0 {
                Arc::clone(event)
            } else {
                event.duplicate()
            };
            if pipeline.process_event(&instance) {
                entered += 1;
            }
        }
        entered
    }
}

impl EventHandler for LoadedPlugin {
    fn handle_event(self: Arc<Self>, event: &EventRef) -> bool {
        self.on_event_proxy(event)
    }
}

impl Listener for LoadedPlugin {
    fn listener_name(&self) -> &str {
        &self.name
    }

    fn subscribes_to(&self, id: u32) -> bool {
        self.behavior
            .subscription()
            .map_or(true, |range| range.contains(&id))
    }

    fn on_ordered(self: Arc<Self>, event: &EventRef) -> bool {
        self.behavior.on_ordered_event(&self, event)
    }

    fn on_unordered(self: Arc<Self>, event: &EventRef) {
        self.behavior.on_unordered_event(&self, event);
    }
}

impl Drop for LoadedPlugin {
    fn drop(&mut self) {
        if let Some(work_loop) = self.work_loop.get_mut().take() {
            if Arc::strong_count(&work_loop) == 1 {
                work_loop.stop();
            }
        }
        debug!(plugin = %self.name, dynamic = self.library.is_some(), "plugin destroyed");
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dynamic", &self.is_dynamic())
            .finish_non_exhaustive()
    }
}

/// Name-keyed table owning every loaded plugin
#[derive(Default)]
pub struct PluginTable {
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
}

impl PluginTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a plugin; returns false if the name is taken
    pub fn insert(&self, plugin: Arc<LoadedPlugin>) -> bool {
        let mut plugins = self.plugins.write();
        if plugins.contains_key(plugin.name()) {
            return false;
        }
        plugins.insert(plugin.name().to_string(), plugin);
        true
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.plugins.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.plugins.write().remove(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.read().contains_key(name)
    }

    /// Sorted plugin names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }
}

/// Non-owning reference to a plugin, resolved by name on use
///
/// The plugin need not exist when the reference is made.
#[derive(Clone)]
pub struct PluginRef {
    name: String,
    table: Weak<PluginTable>,
}

impl PluginRef {
    #[must_use]
    pub fn new(name: impl Into<String>, table: &Arc<PluginTable>) -> Self {
        Self {
            name: name.into(),
            table: Arc::downgrade(table),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current plugin under this name, if any
    #[must_use]
    pub fn upgrade(&self) -> Option<Arc<LoadedPlugin>> {
        self.table.upgrade()?.get(&self.name)
    }
}

impl std::fmt::Debug for PluginRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PluginRef").field(&self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        calls: Arc<AtomicUsize>,
    }

    impl Plugin for Counter {
        fn version(&self) -> &str {
            "2.1.0"
        }
        fn on_event(&self, _host: &Arc<LoadedPlugin>, _event: &EventRef) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn subscription(&self) -> Option<std::ops::RangeInclusive<u32>> {
            Some(100..=199)
        }
    }

    fn counter() -> (Arc<LoadedPlugin>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let plugin = LoadedPlugin::new("counter", Box::new(Counter { calls: Arc::clone(&calls) }));
        (plugin, calls)
    }

    #[test]
    fn test_plugin_metadata() {
        let (plugin, _) = counter();
        assert_eq!(plugin.name(), "counter");
        assert_eq!(plugin.version(), "2.1.0");
        assert!(!plugin.is_dynamic());
        assert!(plugin.work_loop().is_none());
        assert!(plugin.platform().is_none());
    }

    #[test]
    fn test_subscription_range() {
        let (plugin, _) = counter();
        assert!(plugin.subscribes_to(100));
        assert!(plugin.subscribes_to(199));
        assert!(!plugin.subscribes_to(200));
    }

    #[test]
    fn test_proxy_plain_event() {
        let (plugin, calls) = counter();
        assert!(plugin.on_event_proxy(&Event::new("t", 1, "")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_without_work_loop_is_noop() {
        let (plugin, _) = counter();
        let event = Event::pipeline("t", 1, "", None);
        assert_eq!(plugin.delay_process_event(&event, 0.01), 0);
        assert!(!event.is_pending());
    }

    #[test]
    fn test_plugin_ref_resolves_lazily() {
        let table = PluginTable::new();
        let reference = PluginRef::new("counter", &table);
        assert!(reference.upgrade().is_none());

        let (plugin, _) = counter();
        assert!(table.insert(Arc::clone(&plugin)));
        assert!(!table.insert(plugin));
        assert!(reference.upgrade().is_some());

        table.remove("counter");
        assert!(reference.upgrade().is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_drop_leaves_shared_work_loop_running() {
        let (plugin, _) = counter();
        let work_loop = Arc::new(ReactorLoop::new("shared").unwrap());
        work_loop.start(true).unwrap();
        plugin.bind_work_loop(Arc::clone(&work_loop));

        drop(plugin);
        // The test still holds the loop, so the plugin must not stop it
        assert!(!work_loop.is_stopping());
        work_loop.stop();
    }
}
