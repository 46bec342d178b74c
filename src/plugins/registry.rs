//! Plugin constructor registry
//!
//! Maps plugin names to constructors. The platform is handed an explicit registry;
//! [`PluginRegistry::global`] is a lazily created process-wide instance for
//! binaries and dynamic libraries that self-register into it.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::api::{Plugin, PluginFactory};

static GLOBAL: Lazy<Arc<PluginRegistry>> = Lazy::new(|| Arc::new(PluginRegistry::new()));

/// Name to constructor table
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, PluginFactory>>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Register a constructor; returns false if the name is already taken
    pub fn register<F>(&self, name: &str, factory: F) -> bool
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write();
        if factories.contains_key(name) {
            warn!(plugin = name, "constructor already registered");
            return false;
        }
        factories.insert(name.to_string(), Arc::new(factory));
        debug!(plugin = name, "registered plugin constructor");
        true
    }

    /// Remove a constructor
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.factories.write().remove(name).is_some();
        if removed {
            debug!(plugin = name, "unregistered plugin constructor");
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Construct a plugin behavior by name
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Box<dyn Plugin>> {
        let factory = self.factories.read().get(name).cloned()?;
        Some(factory())
    }

    /// Sorted registered names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRef;
    use crate::plugins::host::LoadedPlugin;

    struct Nop;

    impl Plugin for Nop {
        fn on_event(&self, _host: &Arc<LoadedPlugin>, _event: &EventRef) -> bool {
            false
        }
    }

    #[test]
    fn test_register_and_create() {
        let registry = PluginRegistry::new();
        assert!(registry.register("nop", || Box::new(Nop)));
        assert!(!registry.register("nop", || Box::new(Nop)));
        assert!(registry.contains("nop"));
        assert!(registry.create("nop").is_some());
        assert!(registry.create("other").is_none());
        assert_eq!(registry.names(), vec!["nop".to_string()]);
    }

    #[test]
    fn test_unregister() {
        let registry = PluginRegistry::new();
        registry.register("nop", || Box::new(Nop));
        assert!(registry.unregister("nop"));
        assert!(!registry.unregister("nop"));
        assert!(registry.create("nop").is_none());
    }

    #[test]
    fn test_global_is_shared() {
        let a = PluginRegistry::global();
        let b = PluginRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
