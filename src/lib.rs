//! Kiln - in-process event dispatch and plugin orchestration
//!
//! Kiln loads independent plugins, routes typed events between them as broadcasts
//! or through ordered pipelines, and runs their work on dedicated or shared work
//! loops. Plugins can call each other asynchronously or block for a result.
//!
//! # Modules
//!
//! - [`reactor`]: timer-ordered work loops with readiness multiplexing
//! - [`dispatch`]: ordered and unordered broadcast queues
//! - [`event`]: events and pipeline traversal state
//! - [`pipeline`]: named plugin sequences
//! - [`plugins`]: plugin trait, registry, dynamic loading and bound instances
//! - [`platform`]: the orchestrator tying it all together
//! - [`config`]: YAML configuration
//! - [`builtin`]: plugins shipped with the binary

pub mod builtin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod platform;
pub mod plugins;
pub mod reactor;

pub use error::PlatformError;
pub use event::{Event, EventRef, ManageType};
pub use pipeline::Pipeline;
pub use platform::{Platform, DEFAULT_LOOP};
pub use plugins::{LoadedPlugin, Plugin, PluginRegistry};
pub use reactor::{Job, ReactorLoop, ResultHandle};
