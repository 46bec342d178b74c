use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Platform configuration: which plugins to load and how to wire them
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlatformConfig {
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
    #[serde(default)]
    pub pipelines: Vec<PipelineEntry>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// One plugin to create at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginEntry {
    pub name: String,

    /// Seconds to wait before creating the plugin (0 = immediately)
    #[serde(default)]
    pub delay_secs: f64,

    /// Load the plugin's constructor from a shared library
    #[serde(default)]
    pub dynamic: bool,

    /// Work loop thread to bind to; plugins without one run on the caller's thread
    #[serde(default)]
    pub work_loop: Option<String>,

    /// Pipelines this plugin originates events into
    #[serde(default)]
    pub pipelines: Vec<String>,
}

impl PluginEntry {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay_secs: 0.0,
            dynamic: false,
            work_loop: None,
            pipelines: Vec::new(),
        }
    }

    #[must_use]
    pub fn on_loop(mut self, work_loop: impl Into<String>) -> Self {
        self.work_loop = Some(work_loop.into());
        self
    }

    #[must_use]
    pub fn feeding(mut self, pipeline: impl Into<String>) -> Self {
        self.pipelines.push(pipeline.into());
        self
    }

    #[must_use]
    pub fn delayed(mut self, delay_secs: f64) -> Self {
        self.delay_secs = delay_secs;
        self
    }
}

/// A named, ordered plugin sequence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineEntry {
    pub name: String,
    #[serde(default)]
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Emit queue-out / pipeline-done audit markers
    #[serde(default)]
    pub audit: bool,

    /// Delay between reference-count checks of a pending unload
    #[serde(default = "default_unload_retry_ms")]
    pub unload_retry_ms: u64,

    /// Extra directories searched for plugin libraries
    #[serde(default)]
    pub library_dirs: Vec<PathBuf>,
}

fn default_unload_retry_ms() -> u64 {
    100
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            audit: false,
            unload_retry_ms: default_unload_retry_ms(),
            library_dirs: Vec::new(),
        }
    }
}

impl PlatformConfig {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: PlatformConfig =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        Ok(home.join(".kiln").join("config.yaml"))
    }
}
