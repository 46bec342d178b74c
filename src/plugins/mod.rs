//! Plugin system
//!
//! - [`api`]: the [`Plugin`](api::Plugin) behavior trait
//! - [`host`]: bound instances ([`LoadedPlugin`](host::LoadedPlugin)) and their table
//! - [`registry`]: name to constructor registry
//! - [`loader`]: dynamic library loading with libloading

pub mod api;
pub mod host;
pub mod loader;
pub mod registry;

pub use api::{Plugin, PluginFactory};
pub use host::{LoadedPlugin, PluginRef, PluginTable};
pub use loader::{DynamicLoader, LoaderError};
pub use registry::PluginRegistry;
