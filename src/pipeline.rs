//! Named, ordered plugin sequences
//!
//! A [`Pipeline`] is immutable once built. Driving an event through it copies the
//! stage list into the event, so the traversal never observes later changes.

use std::sync::Arc;
use tracing::debug;

use crate::event::{Event, EventRef};
use crate::plugins::host::{PluginRef, PluginTable};

/// Ordered sequence of plugin references
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    stages: Vec<PluginRef>,
    audit: bool,
}

impl Pipeline {
    /// Build a pipeline over plugin names resolved lazily through `table`
    pub fn new<S: AsRef<str>>(name: impl Into<String>, plugins: &[S], table: &Arc<PluginTable>) -> Self {
        Self {
            name: name.into(),
            stages: plugins
                .iter()
                .map(|plugin| PluginRef::new(plugin.as_ref(), table))
                .collect(),
            audit: false,
        }
    }

    /// Emit audit markers for traversals started by this pipeline
    #[must_use]
    pub fn with_audit(mut self, audit: bool) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn audits(&self) -> bool {
        self.audit
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn plugin_names(&self) -> Vec<&str> {
        self.stages.iter().map(PluginRef::name).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Admission check against the first live stage only
    #[must_use]
    pub fn can_process_event(&self, event: &Event) -> bool {
        self.stages
            .iter()
            .find_map(PluginRef::upgrade)
            .is_some_and(|plugin| plugin.behavior().can_process_event(event))
    }

    /// Start a traversal of every stage
    pub fn process_event(&self, event: &EventRef) -> bool {
        self.process_event_after(event, None)
    }

    /// Start a traversal at the stage following `after`
    ///
    /// When `after` is not part of this pipeline the whole sequence is used.
    pub fn process_event_after(&self, event: &EventRef, after: Option<&str>) -> bool {
        let start = after
            .and_then(|name| self.stages.iter().position(|stage| stage.name() == name))
            .map_or(0, |pos| pos + 1);

        if !event.begin_traversal(&self.name, self.stages[start..].to_vec(), self.audit) {
            return false;
        }
        debug!(
            pipeline = %self.name,
            event = event.id(),
            stages = self.stages.len() - start,
            "event entered pipeline"
        );
        event.on_continue();
        true
    }
}
