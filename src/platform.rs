//! Platform orchestrator
//!
//! The [`Platform`] owns every work loop, both broadcast queues, the pipeline table
//! and the plugin table. It creates plugins from the registry, wires them into
//! pipelines and implements the cross-plugin messaging API.
//!
//! # Startup
//! ```text
//! create plugins (now, or on a timer when delayed)
//!   └─► build pipelines (stages resolve lazily by name)
//!         └─► bind work loops, register listeners, on_load()
//!               └─► mark ready
//!                     └─► originators: attach pipelines, start_source()
//! ```

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::{PipelineEntry, PlatformConfig, PluginEntry};
use crate::dispatch::{DispatchQueue, Listener};
use crate::error::PlatformError;
use crate::event::{EventRef, ManageType};
use crate::pipeline::Pipeline;
use crate::plugins::host::{LoadedPlugin, PluginTable};
use crate::plugins::loader::DynamicLoader;
use crate::plugins::registry::PluginRegistry;
use crate::reactor::{EventHandler, Job, ReactorLoop};

/// Name of the shared work loop
pub const DEFAULT_LOOP: &str = "kiln-default";

/// Holders expected while an unload check runs: the table entry and the check's
/// own reference
const UNLOAD_BASELINE_HOLDERS: usize = 2;

pub(crate) struct PlatformInner {
    config: PlatformConfig,
    registry: Arc<PluginRegistry>,
    loader: DynamicLoader,
    plugins: Arc<PluginTable>,
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
    loops: Mutex<HashMap<String, Arc<ReactorLoop>>>,
    default_loop: Arc<ReactorLoop>,
    ordered: DispatchQueue,
    unordered: DispatchQueue,
    ready: AtomicBool,
    shut_down: AtomicBool,
}

/// Process-wide coordination point; cheap to clone
#[derive(Clone)]
pub struct Platform {
    inner: Arc<PlatformInner>,
}

fn thread_error(name: &str) -> impl FnOnce(io::Error) -> PlatformError + '_ {
    move |source| PlatformError::Thread {
        name: name.to_string(),
        source,
    }
}

impl Platform {
    /// Create the platform and start its shared work loop and broadcast queues
    ///
    /// # Errors
    /// Returns an error if a loop or queue thread cannot be started
    pub fn new(config: PlatformConfig, registry: Arc<PluginRegistry>) -> Result<Self, PlatformError> {
        let mut loader = DynamicLoader::new();
        for dir in config.runtime.library_dirs.iter().rev() {
            loader.add_search_path(dir.clone());
        }

        let default_loop =
            Arc::new(ReactorLoop::new(DEFAULT_LOOP).map_err(thread_error(DEFAULT_LOOP))?);
        default_loop.start(true).map_err(thread_error(DEFAULT_LOOP))?;

        let ordered = DispatchQueue::new("kiln-ordered", ManageType::Ordered);
        ordered.start().map_err(thread_error("kiln-ordered"))?;
        let unordered = DispatchQueue::new("kiln-unordered", ManageType::Unordered);
        unordered.start().map_err(thread_error("kiln-unordered"))?;

        Ok(Self {
            inner: Arc::new(PlatformInner {
                config,
                registry,
                loader,
                plugins: PluginTable::new(),
                pipelines: RwLock::new(HashMap::new()),
                loops: Mutex::new(HashMap::new()),
                default_loop,
                ordered,
                unordered,
                ready: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<PlatformInner>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    /// Whether this platform emits `kiln::audit` markers
    #[must_use]
    pub fn audit_enabled(&self) -> bool {
        self.inner.config.runtime.audit
    }

    /// True once startup wired every immediate plugin
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Build everything named in the configuration
    ///
    /// Failures abort only the plugin concerned. Returns the number of plugins
    /// loaded immediately.
    pub fn start(&self) -> usize {
        let config = &self.inner.config;

        let mut created = Vec::new();
        for entry in &config.plugins {
            if entry.delay_secs > 0.0 {
                self.schedule_delayed_plugin(entry.clone());
                continue;
            }
            match self.create_plugin(entry) {
                Ok(plugin) => created.push((plugin, entry)),
                Err(e) => warn!(plugin = %entry.name, "failed to create plugin: {}", e),
            }
        }

        for entry in &config.pipelines {
            self.build_pipeline(entry);
        }

        let mut loaded = 0;
        let mut sources = Vec::new();
        for (plugin, entry) in created {
            match self.load_plugin(&plugin, entry.work_loop.as_deref()) {
                Ok(()) => {
                    loaded += 1;
                    if !entry.pipelines.is_empty() {
                        sources.push((plugin, entry));
                    }
                }
                Err(e) => {
                    warn!(plugin = %entry.name, "failed to load plugin: {}", e);
                    self.discard_plugin(&entry.name);
                }
            }
        }

        self.inner.ready.store(true, Ordering::Release);

        for (plugin, entry) in sources {
            self.start_source(&plugin, &entry.pipelines);
        }

        info!(
            loaded,
            pipelines = config.pipelines.len(),
            "platform started"
        );
        loaded
    }

    /// Construct a plugin and add it to the plugin table (not yet loaded)
    ///
    /// # Errors
    /// Returns an error if the name is taken, its library cannot be loaded, or no
    /// constructor is registered for it.
    pub fn create_plugin(&self, entry: &PluginEntry) -> Result<Arc<LoadedPlugin>, PlatformError> {
        let name = entry.name.as_str();
        if self.inner.plugins.contains(name) {
            return Err(PlatformError::AlreadyLoaded(name.to_string()));
        }

        let library = if entry.dynamic {
            // SAFETY: plugin libraries come from the configured search paths,
            // which are trusted by whoever wrote the configuration
            Some(unsafe { self.inner.loader.load(name, &self.inner.registry)? })
        } else {
            None
        };

        let Some(behavior) = self.inner.registry.create(name) else {
            if library.is_some() {
                self.inner.registry.unregister(name);
            }
            return Err(PlatformError::MissingConstructor(name.to_string()));
        };

        let plugin = match library {
            Some(library) => LoadedPlugin::with_library(name, behavior, library),
            None => LoadedPlugin::new(name, behavior),
        };
        if !self.inner.plugins.insert(Arc::clone(&plugin)) {
            if plugin.is_dynamic() {
                self.inner.registry.unregister(name);
            }
            return Err(PlatformError::AlreadyLoaded(name.to_string()));
        }

        debug!(plugin = name, version = plugin.version(), "plugin created");
        Ok(plugin)
    }

    /// Build a pipeline; its stages need not exist yet
    pub fn build_pipeline(&self, entry: &PipelineEntry) -> Arc<Pipeline> {
        let pipeline = Arc::new(
            Pipeline::new(entry.name.as_str(), &entry.plugins, &self.inner.plugins)
                .with_audit(self.audit_enabled()),
        );
        let previous = self
            .inner
            .pipelines
            .write()
            .insert(entry.name.clone(), Arc::clone(&pipeline));
        if previous.is_some() {
            warn!(pipeline = %entry.name, "pipeline redefined");
        }
        debug!(pipeline = %entry.name, stages = pipeline.len(), "pipeline built");
        pipeline
    }

    /// Bind a created plugin to its work loop, subscribe it to broadcasts and run
    /// its load hook
    ///
    /// # Errors
    /// Returns an error if a new work loop thread cannot be started
    pub fn load_plugin(
        &self,
        plugin: &Arc<LoadedPlugin>,
        work_loop: Option<&str>,
    ) -> Result<(), PlatformError> {
        plugin.set_platform(Arc::downgrade(&self.inner));

        if let Some(name) = work_loop {
            plugin.bind_work_loop(self.obtain_work_loop(name)?);
        }

        let listener: Weak<dyn Listener> = Arc::downgrade(plugin) as Weak<dyn Listener>;
        self.inner.ordered.register_listener(Weak::clone(&listener));
        self.inner.unordered.register_listener(listener);

        plugin.load();
        info!(
            plugin = plugin.name(),
            version = plugin.version(),
            work_loop = work_loop.unwrap_or("-"),
            "plugin loaded"
        );
        Ok(())
    }

    /// Attach an originator to its pipelines and start producing on its work loop
    /// (or on this thread when it has none)
    pub fn start_source(&self, plugin: &Arc<LoadedPlugin>, pipelines: &[String]) {
        for name in pipelines {
            match self.pipeline(name) {
                Some(pipeline) => plugin.attach_pipeline(&pipeline),
                None => warn!(plugin = plugin.name(), pipeline = %name, "unknown pipeline"),
            }
        }

        match plugin.work_loop() {
            Some(work_loop) => {
                let weak = Arc::downgrade(plugin);
                let seq = work_loop.add_immediate(Job::call(move || {
                    if let Some(plugin) = weak.upgrade() {
                        plugin.start_source();
                    }
                }));
                if seq == 0 {
                    warn!(plugin = plugin.name(), "work loop stopping, source not started");
                }
            }
            None => plugin.start_source(),
        }
    }

    /// Create, load and (for originators) start one plugin
    ///
    /// # Errors
    /// Returns an error if the plugin cannot be created or loaded
    pub fn add_plugin(&self, entry: &PluginEntry) -> Result<Arc<LoadedPlugin>, PlatformError> {
        let plugin = self.create_plugin(entry)?;
        if let Err(e) = self.load_plugin(&plugin, entry.work_loop.as_deref()) {
            self.discard_plugin(&entry.name);
            return Err(e);
        }
        if !entry.pipelines.is_empty() {
            self.start_source(&plugin, &entry.pipelines);
        }
        Ok(plugin)
    }

    fn schedule_delayed_plugin(&self, entry: PluginEntry) {
        let weak = Arc::downgrade(&self.inner);
        let delay = entry.delay_secs;
        let name = entry.name.clone();
        let seq = self.inner.default_loop.add_timer(
            Job::call(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = Platform::from_inner(inner).add_plugin(&entry) {
                    warn!(plugin = %entry.name, "failed to add delayed plugin: {}", e);
                }
            }),
            delay,
            false,
        );
        if seq == 0 {
            warn!(plugin = %name, delay, "could not schedule delayed plugin");
        } else {
            debug!(plugin = %name, delay, "plugin creation delayed");
        }
    }

    fn discard_plugin(&self, name: &str) {
        if let Some(plugin) = self.inner.plugins.remove(name) {
            if plugin.is_dynamic() {
                self.inner.registry.unregister(name);
            }
        }
    }

    fn obtain_work_loop(&self, name: &str) -> Result<Arc<ReactorLoop>, PlatformError> {
        if name == DEFAULT_LOOP {
            return Ok(Arc::clone(&self.inner.default_loop));
        }

        let mut loops = self.inner.loops.lock();
        if let Some(existing) = loops.get(name) {
            return Ok(Arc::clone(existing));
        }

        let work_loop = Arc::new(ReactorLoop::new(name).map_err(thread_error(name))?);
        work_loop.start(true).map_err(thread_error(name))?;
        loops.insert(name.to_string(), Arc::clone(&work_loop));
        debug!(work_loop = name, "work loop created");
        Ok(work_loop)
    }

    #[must_use]
    pub fn plugin(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.inner.plugins.get(name)
    }

    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.inner.plugins.names()
    }

    #[must_use]
    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.inner.pipelines.read().get(name).cloned()
    }

    /// A private work loop by name
    #[must_use]
    pub fn work_loop(&self, name: &str) -> Option<Arc<ReactorLoop>> {
        if name == DEFAULT_LOOP {
            return Some(Arc::clone(&self.inner.default_loop));
        }
        self.inner.loops.lock().get(name).cloned()
    }

    #[must_use]
    pub fn default_loop(&self) -> &Arc<ReactorLoop> {
        &self.inner.default_loop
    }

    /// Broadcast with ordered, stoppable delivery
    pub fn post_ordered_event(&self, event: &EventRef) -> bool {
        if !self.is_ready() {
            debug!(event = event.id(), "platform not ready, ordered event dropped");
            return false;
        }
        event.set_manage_type(ManageType::Ordered);
        self.inner.ordered.enqueue(Arc::clone(event))
    }

    /// Broadcast to every subscribed listener
    pub fn post_unordered_event(&self, event: &EventRef) -> bool {
        if !self.is_ready() {
            debug!(event = event.id(), "platform not ready, unordered event dropped");
            return false;
        }
        event.set_manage_type(ManageType::Unordered);
        self.inner.unordered.enqueue(Arc::clone(event))
    }

    /// Run `callee`'s handler on its work loop (or the shared loop) and block until
    /// it returns
    ///
    /// Returns the handler's result, or false if the callee is unknown, its loop
    /// is stopping, or the call comes from that loop's own thread.
    pub fn post_sync_event_to_target(&self, caller: &str, callee: &str, event: &EventRef) -> bool {
        let Some(target) = self.inner.plugins.get(callee) else {
            debug!(caller, callee, "sync call to unknown plugin");
            return false;
        };
        let work_loop = target
            .work_loop()
            .unwrap_or_else(|| Arc::clone(&self.inner.default_loop));

        if work_loop.is_current_thread() {
            warn!(
                caller,
                callee,
                work_loop = work_loop.name(),
                "sync call from the target's own work loop refused"
            );
            return false;
        }

        let handler: Weak<dyn EventHandler> = Arc::downgrade(&target) as Weak<dyn EventHandler>;
        drop(target);
        work_loop
            .add_immediate_for_result(handler, Arc::clone(event))
            .wait()
    }

    /// Schedule `callee`'s handler on its work loop (or the shared loop) and return
    pub fn post_async_event_to_target(&self, caller: &str, callee: &str, event: &EventRef) -> bool {
        let Some(target) = self.inner.plugins.get(callee) else {
            debug!(caller, callee, "async call to unknown plugin");
            return false;
        };
        let work_loop = target
            .work_loop()
            .unwrap_or_else(|| Arc::clone(&self.inner.default_loop));
        work_loop.add_immediate(Job::deliver(&target, Arc::clone(event))) != 0
    }

    /// Drive a duplicate of `event` through `pipeline`
    ///
    /// With `from_current` the duplicate skips every stage up to and including the
    /// plugin currently holding `event`. The original is not advanced automatically
    /// afterwards.
    pub fn repack(&self, event: &EventRef, pipeline: &str, from_current: bool) -> bool {
        let Some(target) = self.pipeline(pipeline) else {
            warn!(event = event.id(), pipeline, "repack into unknown pipeline");
            return false;
        };
        if !event.is_pipeline() {
            return false;
        }

        let duplicate = event.duplicate();
        event.bump_handoffs();
        let after = if from_current {
            event.current_plugin()
        } else {
            None
        };
        target.process_event_after(&duplicate, after.as_deref())
    }

    /// Unload `name` once nothing but the platform holds it
    ///
    /// The check runs on the shared work loop and reschedules itself while other
    /// references remain. Returns false if the plugin is unknown or the check could
    /// not be scheduled.
    pub fn request_unload_plugin(&self, name: &str) -> bool {
        if !self.inner.plugins.contains(name) {
            return false;
        }
        self.schedule_unload_check(name.to_string()) != 0
    }

    fn schedule_unload_check(&self, name: String) -> u64 {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.runtime.unload_retry_ms as f64 / 1000.0;
        self.inner.default_loop.add_timer(
            Job::call(move || {
                if let Some(inner) = weak.upgrade() {
                    Platform::from_inner(inner).check_unload(&name);
                }
            }),
            delay,
            false,
        )
    }

    fn check_unload(&self, name: &str) {
        let Some(plugin) = self.inner.plugins.get(name) else {
            debug!(plugin = name, "plugin already unloaded");
            return;
        };
        let holders = Arc::strong_count(&plugin);
        drop(plugin);

        if holders > UNLOAD_BASELINE_HOLDERS {
            debug!(plugin = name, holders, "plugin still referenced, retrying unload");
            self.schedule_unload_check(name.to_string());
            return;
        }
        self.unload_plugin(name);
    }

    /// Remove a plugin now, stopping its work loop if nothing else uses it
    pub fn unload_plugin(&self, name: &str) -> bool {
        let Some(plugin) = self.inner.plugins.remove(name) else {
            return false;
        };

        plugin.unload();
        if plugin.is_dynamic() {
            // Before the library goes away with the plugin
            self.inner.registry.unregister(name);
        }
        if let Some(work_loop) = plugin.unbind_work_loop() {
            self.release_work_loop(work_loop);
        }

        info!(plugin = name, "plugin unloaded");
        true
    }

    fn release_work_loop(&self, work_loop: Arc<ReactorLoop>) {
        if Arc::ptr_eq(&work_loop, &self.inner.default_loop) {
            return;
        }

        let mut loops = self.inner.loops.lock();
        // Table entry plus `work_loop` itself
        if Arc::strong_count(&work_loop) > 2 {
            return;
        }
        loops.remove(work_loop.name());
        drop(loops);

        debug!(work_loop = work_loop.name(), "stopping unused work loop");
        work_loop.stop();
    }

    /// Unload every plugin and stop all queues and work loops. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.ready.store(false, Ordering::Release);

        self.inner.ordered.stop();
        self.inner.unordered.stop();

        for name in self.inner.plugins.names() {
            self.unload_plugin(&name);
        }

        let loops: Vec<Arc<ReactorLoop>> = self.inner.loops.lock().drain().map(|(_, l)| l).collect();
        for work_loop in loops {
            work_loop.stop();
        }
        self.inner.default_loop.stop();
        info!("platform shut down");
    }
}
