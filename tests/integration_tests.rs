use kiln::config::{PipelineEntry, PlatformConfig, PluginEntry};
use kiln::event::{Event, EventRef, Recycler};
use kiln::plugins::{LoadedPlugin, Plugin, PluginRegistry};
use kiln::Platform;
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Poll `cond` until it holds or `timeout` elapses
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

type Log = Arc<Mutex<Vec<String>>>;

/// Records every pipeline visit as "<plugin>:<event id>"
struct Recorder {
    log: Log,
}

impl Plugin for Recorder {
    fn on_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) -> bool {
        self.log.lock().push(format!("{}:{}", host.name(), event.id()));
        true
    }
}

struct Counted(AtomicUsize);

impl Recycler for Counted {
    fn recycle(&self, _event: &Event) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn recorder_registry(names: &[&'static str], log: &Log) -> Arc<PluginRegistry> {
    let registry = Arc::new(PluginRegistry::new());
    for name in names {
        let log = Arc::clone(log);
        registry.register(name, move || Box::new(Recorder { log: Arc::clone(&log) }));
    }
    registry
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = PlatformConfig::default();
        config.plugins.push(PluginEntry::new("heartbeat").on_loop("src").feeding("main"));
        config.pipelines.push(PipelineEntry {
            name: "main".to_string(),
            plugins: vec!["log_sink".to_string()],
        });
        config.runtime.unload_retry_ms = 25;
        config.save_to_file(&path).unwrap();

        let loaded = PlatformConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.plugins, config.plugins);
        assert_eq!(loaded.pipelines, config.pipelines);
        assert_eq!(loaded.runtime.unload_retry_ms, 25);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "plugins: [[[").unwrap();
        assert!(PlatformConfig::load_from_file(&path).is_err());
    }
}

#[cfg(test)]
mod startup_tests {
    use super::*;

    #[test]
    fn test_startup_skips_failed_plugins() {
        let log: Log = Arc::default();
        let registry = recorder_registry(&["a"], &log);
        let mut config = PlatformConfig::default();
        config.plugins.push(PluginEntry::new("a").on_loop("w"));
        config.plugins.push(PluginEntry::new("missing"));
        config.plugins.push(PluginEntry {
            dynamic: true,
            ..PluginEntry::new("no_such_library")
        });

        let platform = Platform::new(config, registry).unwrap();
        assert_eq!(platform.start(), 1);
        assert!(platform.is_ready());
        assert_eq!(platform.plugin_names(), vec!["a"]);
        assert!(platform.work_loop("w").is_some());
        platform.shutdown();
    }

    #[test]
    fn test_delayed_plugin_appears_later() {
        let log: Log = Arc::default();
        let registry = recorder_registry(&["late"], &log);
        let mut config = PlatformConfig::default();
        config.plugins.push(PluginEntry::new("late").delayed(0.05));

        let platform = Platform::new(config, registry).unwrap();
        assert_eq!(platform.start(), 0);
        assert!(platform.plugin("late").is_none());
        assert!(wait_until(Duration::from_secs(2), || platform.plugin("late").is_some()));
        platform.shutdown();
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;

    /// Originator that emits one pipeline event when started
    struct OneShot {
        recycler: Arc<Counted>,
    }

    impl Plugin for OneShot {
        fn on_event(&self, _host: &Arc<LoadedPlugin>, _event: &EventRef) -> bool {
            false
        }

        fn start_source(&self, host: &Arc<LoadedPlugin>) {
            let weak: Weak<dyn Recycler> = Arc::downgrade(&self.recycler) as Weak<dyn Recycler>;
            let event = Event::pipeline("diag", 42, host.name(), Some(weak));
            host.emit(&event);
        }
    }

    #[test]
    fn test_originator_drives_pipeline_across_loops() {
        let log: Log = Arc::default();
        let registry = recorder_registry(&["a", "b", "c"], &log);
        let recycler = Arc::new(Counted(AtomicUsize::new(0)));
        let shared = Arc::clone(&recycler);
        registry.register("source", move || {
            Box::new(OneShot {
                recycler: Arc::clone(&shared),
            })
        });

        let mut config = PlatformConfig::default();
        config.plugins.push(PluginEntry::new("a").on_loop("one"));
        config.plugins.push(PluginEntry::new("b"));
        config.plugins.push(PluginEntry::new("c").on_loop("two"));
        config.plugins.push(PluginEntry::new("source").on_loop("src").feeding("main"));
        config.pipelines.push(PipelineEntry {
            name: "main".to_string(),
            plugins: vec!["a".into(), "ghost".into(), "b".into(), "c".into()],
        });

        let platform = Platform::new(config, registry).unwrap();
        platform.start();

        assert!(wait_until(Duration::from_secs(2), || recycler.0.load(Ordering::SeqCst) == 1));
        assert_eq!(*log.lock(), vec!["a:42", "b:42", "c:42"]);
        platform.shutdown();
        assert_eq!(recycler.0.load(Ordering::SeqCst), 1);
    }

    /// Repacks every event it sees into "side", continuing after itself
    struct Splitter;

    impl Plugin for Splitter {
        fn on_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) -> bool {
            if let Some(platform) = host.platform() {
                platform.repack(event, "side", true);
            }
            true
        }
    }

    #[test]
    fn test_repack_suppresses_auto_advance() {
        let log: Log = Arc::default();
        let registry = recorder_registry(&["after", "tail"], &log);
        registry.register("split", || Box::new(Splitter));

        let mut config = PlatformConfig::default();
        for name in ["split", "after", "tail"] {
            config.plugins.push(PluginEntry::new(name));
        }
        config.pipelines.push(PipelineEntry {
            name: "main".to_string(),
            plugins: vec!["split".into(), "tail".into()],
        });
        config.pipelines.push(PipelineEntry {
            name: "side".to_string(),
            plugins: vec!["split".into(), "after".into()],
        });

        let platform = Platform::new(config, registry).unwrap();
        platform.start();

        let event = Event::pipeline("diag", 5, "test", None);
        assert!(platform.pipeline("main").unwrap().process_event(&event));

        // The duplicate skipped "split" in "side"; the original was not advanced
        assert_eq!(*log.lock(), vec!["after:5"]);
        assert!(!event.is_finished());
        assert_eq!(event.current_plugin().as_deref(), Some("split"));
        platform.shutdown();
    }

    /// Holds each event once before letting it continue
    struct Delayer {
        seen: AtomicBool,
    }

    impl Plugin for Delayer {
        fn on_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) -> bool {
            if !self.seen.swap(true, Ordering::SeqCst) {
                host.delay_process_event(event, 0.05);
            }
            true
        }
    }

    #[test]
    fn test_delay_process_event_revisits_later() {
        let log: Log = Arc::default();
        let registry = recorder_registry(&["next"], &log);
        registry.register("slow", || {
            Box::new(Delayer {
                seen: AtomicBool::new(false),
            })
        });

        let mut config = PlatformConfig::default();
        config.plugins.push(PluginEntry::new("slow").on_loop("slow"));
        config.plugins.push(PluginEntry::new("next"));
        config.pipelines.push(PipelineEntry {
            name: "main".to_string(),
            plugins: vec!["slow".into(), "next".into()],
        });

        let platform = Platform::new(config, registry).unwrap();
        platform.start();

        let started = Instant::now();
        let event = Event::pipeline("diag", 9, "test", None);
        platform.pipeline("main").unwrap().process_event(&event);

        assert!(wait_until(Duration::from_secs(2), || event.is_finished()));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(*log.lock(), vec!["next:9"]);
        platform.shutdown();
    }
}

#[cfg(test)]
mod messaging_tests {
    use super::*;

    /// Answers true for even ids and records which thread it ran on
    struct Parity {
        threads: Arc<Mutex<Vec<String>>>,
    }

    impl Plugin for Parity {
        fn on_event(&self, _host: &Arc<LoadedPlugin>, event: &EventRef) -> bool {
            let name = thread::current().name().unwrap_or_default().to_string();
            self.threads.lock().push(name);
            event.id() % 2 == 0
        }
    }

    fn parity_platform(threads: &Arc<Mutex<Vec<String>>>) -> Platform {
        let registry = Arc::new(PluginRegistry::new());
        let threads = Arc::clone(threads);
        registry.register("parity", move || {
            Box::new(Parity {
                threads: Arc::clone(&threads),
            })
        });
        let mut config = PlatformConfig::default();
        config.plugins.push(PluginEntry::new("parity").on_loop("parity-loop"));
        let platform = Platform::new(config, registry).unwrap();
        platform.start();
        platform
    }

    #[test]
    fn test_sync_call_runs_on_callee_loop() {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let platform = parity_platform(&threads);

        assert!(platform.post_sync_event_to_target("test", "parity", &Event::new("q", 4, "test")));
        assert!(!platform.post_sync_event_to_target("test", "parity", &Event::new("q", 3, "test")));
        assert_eq!(*threads.lock(), vec!["parity-loop", "parity-loop"]);
        platform.shutdown();
    }

    #[test]
    fn test_async_call_returns_immediately() {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let platform = parity_platform(&threads);

        assert!(platform.post_async_event_to_target("test", "parity", &Event::new("q", 1, "test")));
        assert!(wait_until(Duration::from_secs(2), || threads.lock().len() == 1));
        platform.shutdown();
    }

    /// Calls `target` synchronously from inside its own handler
    struct Reentrant {
        target: &'static str,
        result: Arc<Mutex<Option<bool>>>,
    }

    impl Plugin for Reentrant {
        fn on_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) -> bool {
            if let Some(platform) = host.platform() {
                let result = platform.post_sync_event_to_target(host.name(), self.target, event);
                *self.result.lock() = Some(result);
            }
            true
        }
    }

    #[test]
    fn test_sync_call_from_shared_loop_is_refused() {
        let result = Arc::new(Mutex::new(None));
        let registry = Arc::new(PluginRegistry::new());
        let shared = Arc::clone(&result);
        registry.register("caller", move || {
            Box::new(Reentrant {
                target: "callee",
                result: Arc::clone(&shared),
            })
        });
        registry.register("callee", || Box::new(Reentrant {
            target: "nobody",
            result: Arc::default(),
        }));

        let mut config = PlatformConfig::default();
        config.plugins.push(PluginEntry::new("caller").on_loop("same"));
        config.plugins.push(PluginEntry::new("callee").on_loop("same"));
        let platform = Platform::new(config, registry).unwrap();
        platform.start();

        platform.post_async_event_to_target("test", "caller", &Event::new("q", 1, "test"));
        assert!(wait_until(Duration::from_secs(2), || result.lock().is_some()));
        assert_eq!(*result.lock(), Some(false));
        platform.shutdown();
    }

    /// Broadcast listener with an optional id range that can stop ordered delivery
    struct Listener {
        range: Option<RangeInclusive<u32>>,
        stop: bool,
        log: Log,
    }

    impl Plugin for Listener {
        fn on_event(&self, _host: &Arc<LoadedPlugin>, _event: &EventRef) -> bool {
            false
        }

        fn subscription(&self) -> Option<RangeInclusive<u32>> {
            self.range.clone()
        }

        fn on_ordered_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) -> bool {
            self.log.lock().push(format!("{}:{}", host.name(), event.id()));
            self.stop
        }

        fn on_unordered_event(&self, host: &Arc<LoadedPlugin>, event: &EventRef) {
            self.log.lock().push(format!("{}:{}", host.name(), event.id()));
        }
    }

    fn listener_platform(log: &Log) -> Platform {
        let registry = Arc::new(PluginRegistry::new());
        for (name, range, stop) in [
            ("l1", Some(10..=20), true),
            ("l2", None, false),
            ("l3", Some(10..=20), false),
        ] {
            let log = Arc::clone(log);
            registry.register(name, move || {
                Box::new(Listener {
                    range: range.clone(),
                    stop,
                    log: Arc::clone(&log),
                })
            });
        }
        let mut config = PlatformConfig::default();
        for name in ["l1", "l2", "l3"] {
            config.plugins.push(PluginEntry::new(name));
        }
        let platform = Platform::new(config, registry).unwrap();
        platform.start();
        platform
    }

    #[test]
    fn test_ordered_broadcast_stops_at_first_claim() {
        let log: Log = Arc::default();
        let platform = listener_platform(&log);

        assert!(platform.post_ordered_event(&Event::new("b", 15, "")));
        // l1 resumes after itself; l2 and l3 do not stop
        assert!(platform.post_ordered_event(&Event::new("b", 15, "l1")));

        assert!(wait_until(Duration::from_secs(2), || log.lock().len() == 3));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(*log.lock(), vec!["l1:15", "l2:15", "l3:15"]);
        platform.shutdown();
    }

    #[test]
    fn test_unordered_broadcast_honours_subscriptions() {
        let log: Log = Arc::default();
        let platform = listener_platform(&log);

        let event = Event::new("b", 30, "");
        assert!(platform.post_unordered_event(&event));
        assert!(wait_until(Duration::from_secs(2), || !log.lock().is_empty()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(*log.lock(), vec!["l2:30"]);
        assert_eq!(event.manage_type(), kiln::ManageType::Unordered);
        platform.shutdown();
    }
}

#[cfg(test)]
mod unload_tests {
    use super::*;

    struct Tracked {
        unloaded: Arc<AtomicBool>,
    }

    impl Plugin for Tracked {
        fn on_event(&self, _host: &Arc<LoadedPlugin>, _event: &EventRef) -> bool {
            true
        }

        fn on_unload(&self, _host: &Arc<LoadedPlugin>) {
            self.unloaded.store(true, Ordering::SeqCst);
        }
    }

    fn tracked_platform(unloaded: &Arc<AtomicBool>) -> Platform {
        let registry = Arc::new(PluginRegistry::new());
        let flag = Arc::clone(unloaded);
        registry.register("victim", move || {
            Box::new(Tracked {
                unloaded: Arc::clone(&flag),
            })
        });
        let mut config = PlatformConfig::default();
        config.plugins.push(PluginEntry::new("victim").on_loop("victim-loop"));
        config.runtime.unload_retry_ms = 10;
        let platform = Platform::new(config, registry).unwrap();
        platform.start();
        platform
    }

    #[test]
    fn test_request_unload_converges() {
        let unloaded = Arc::new(AtomicBool::new(false));
        let platform = tracked_platform(&unloaded);

        assert!(platform.request_unload_plugin("victim"));
        assert!(wait_until(Duration::from_secs(2), || platform.plugin("victim").is_none()));
        assert!(unloaded.load(Ordering::SeqCst));
        assert!(platform.work_loop("victim-loop").is_none());
        assert!(!platform.request_unload_plugin("victim"));
        platform.shutdown();
    }

    #[test]
    fn test_external_holder_blocks_unload() {
        let unloaded = Arc::new(AtomicBool::new(false));
        let platform = tracked_platform(&unloaded);

        let held = platform.plugin("victim").unwrap();
        assert!(platform.request_unload_plugin("victim"));
        thread::sleep(Duration::from_millis(100));
        assert!(platform.plugin("victim").is_some());
        assert!(!unloaded.load(Ordering::SeqCst));

        drop(held);
        assert!(wait_until(Duration::from_secs(2), || unloaded.load(Ordering::SeqCst)));
        assert!(platform.plugin("victim").is_none());
        platform.shutdown();
    }

    #[test]
    fn test_shutdown_unloads_everything() {
        let unloaded = Arc::new(AtomicBool::new(false));
        let platform = tracked_platform(&unloaded);

        platform.shutdown();
        assert!(unloaded.load(Ordering::SeqCst));
        assert!(!platform.is_ready());
        assert!(!platform.post_unordered_event(&Event::new("b", 1, "")));
    }
}
