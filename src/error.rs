use std::io;
use thiserror::Error;

use crate::plugins::loader::LoaderError;

/// Errors raised while building the platform or creating plugins
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Nothing registered a constructor under this name
    #[error("no constructor registered for plugin '{0}'")]
    MissingConstructor(String),

    /// A plugin with this name is already loaded
    #[error("plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// The plugin's library could not be loaded
    #[error(transparent)]
    Loader(#[from] LoaderError),

    /// A work loop or dispatch thread could not be created
    #[error("failed to start '{name}': {source}")]
    Thread {
        name: String,
        #[source]
        source: io::Error,
    },
}
