use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use super::registry::PluginRegistry;

/// Symbol every plugin library exports
pub const REGISTER_SYMBOL: &[u8] = b"_kiln_plugin_register\0";

/// Function signature for the plugin entry point
///
/// The library registers its constructor(s) into the given registry.
pub type PluginRegister = unsafe fn(&PluginRegistry);

/// Errors that can occur when loading plugin libraries
#[derive(Debug, Error)]
pub enum LoaderError {
    /// No library file for the plugin in any search path
    #[error("no library for plugin '{name}' in {searched:?}")]
    NotFound { name: String, searched: Vec<PathBuf> },

    /// Failed to load the shared library
    #[error("failed to load library {path}: {reason}")]
    LoadFailed { path: PathBuf, reason: String },

    /// The library does not export the entry point
    #[error("library {0} has no _kiln_plugin_register entry point")]
    MissingEntryPoint(PathBuf),

    /// The entry point ran but did not register the expected constructor
    #[error("library for plugin '{0}' did not register a constructor")]
    NotRegistered(String),
}

/// Resolves and loads plugin libraries
#[derive(Debug, Clone)]
pub struct DynamicLoader {
    search_paths: Vec<PathBuf>,
}

impl DynamicLoader {
    /// Create a loader with the default search paths
    #[must_use]
    pub fn new() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("."),
                PathBuf::from("/usr/lib/kiln/plugins"),
                PathBuf::from("/usr/local/lib/kiln/plugins"),
            ],
        }
    }

    /// Add a search path, searched before the defaults
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.insert(0, path.into());
    }

    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Locate the library file for `name` (`lib<name>.so` on Linux)
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let file = libloading::library_filename(name);
        self.search_paths
            .iter()
            .map(|dir| dir.join(&file))
            .find(|path| path.is_file())
    }

    /// Load the library for `name` and let it self-register into `registry`
    ///
    /// # Safety
    ///
    /// Loading runs arbitrary code from the library. It must export
    /// `_kiln_plugin_register` with the [`PluginRegister`] signature and be built
    /// against the same version of this crate.
    ///
    /// # Errors
    /// Returns an error if the library cannot be found or loaded, lacks the entry
    /// point, or does not register a constructor named `name`.
    pub unsafe fn load(&self, name: &str, registry: &PluginRegistry) -> Result<Library, LoaderError> {
        let path = self.resolve(name).ok_or_else(|| LoaderError::NotFound {
            name: name.to_string(),
            searched: self.search_paths.clone(),
        })?;
        // SAFETY: caller guarantees the library is trusted
        let library = unsafe { self.open(&path)? };

        {
            // SAFETY: symbol type is part of the plugin contract
            let register: Symbol<PluginRegister> = unsafe {
                library
                    .get(REGISTER_SYMBOL)
                    .map_err(|_| LoaderError::MissingEntryPoint(path.clone()))?
            };
            // SAFETY: the library stays loaded for the duration of the call
            unsafe { register(registry) };
        }

        if !registry.contains(name) {
            return Err(LoaderError::NotRegistered(name.to_string()));
        }
        info!(plugin = name, path = %path.display(), "loaded plugin library");
        Ok(library)
    }

    unsafe fn open(&self, path: &Path) -> Result<Library, LoaderError> {
        debug!(path = %path.display(), "opening plugin library");
        // SAFETY: forwarded from `load`
        unsafe { Library::new(path) }.map_err(|e| LoaderError::LoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl Default for DynamicLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_prefers_added_paths() {
        let dir = tempdir().unwrap();
        let file = dir.path().join(libloading::library_filename("probe"));
        std::fs::write(&file, b"not a library").unwrap();

        let mut loader = DynamicLoader::new();
        assert!(loader.resolve("probe").is_none());
        loader.add_search_path(dir.path());
        assert_eq!(loader.search_paths()[0], dir.path());
        assert_eq!(loader.resolve("probe"), Some(file));
    }

    #[test]
    fn test_load_missing_library() {
        let loader = DynamicLoader { search_paths: Vec::new() };
        let registry = PluginRegistry::new();
        let err = unsafe { loader.load("absent", &registry) }.unwrap_err();
        assert!(matches!(err, LoaderError::NotFound { .. }));
    }

    #[test]
    fn test_load_invalid_library() {
        let dir = tempdir().unwrap();
        let file = dir.path().join(libloading::library_filename("broken"));
        std::fs::write(&file, b"not a library").unwrap();

        let loader = DynamicLoader { search_paths: vec![dir.path().to_path_buf()] };
        let registry = PluginRegistry::new();
        let err = unsafe { loader.load("broken", &registry) }.unwrap_err();
        assert!(matches!(err, LoaderError::LoadFailed { .. }));
        assert!(!registry.contains("broken"));
    }
}
