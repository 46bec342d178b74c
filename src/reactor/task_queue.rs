//! Deadline-ordered task queue
//!
//! Entries are keyed by `(deadline, sequence)`, so ties on the deadline resolve in
//! insertion order. A side index maps each sequence id to its deadline, which makes
//! removal by identity a logarithmic operation.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::Job;

/// One pending unit of work
pub struct ScheduledTask {
    /// Identity used for cancellation; never 0 for a live task
    pub seq: u64,
    /// When the task becomes due
    pub deadline: Instant,
    /// Re-arm interval for repeating tasks
    pub interval: Option<Duration>,
    /// What to run
    pub job: Job,
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("seq", &self.seq)
            .field("deadline", &self.deadline)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Min-ordered collection of scheduled tasks
#[derive(Default)]
pub struct TaskQueue {
    tasks: BTreeMap<(Instant, u64), ScheduledTask>,
    index: HashMap<u64, Instant>,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or reinsert) a task
    pub fn push(&mut self, task: ScheduledTask) {
        if let Some(old) = self.index.insert(task.seq, task.deadline) {
            // Same identity scheduled twice: the newer deadline wins
            self.tasks.remove(&(old, task.seq));
        }
        self.tasks.insert((task.deadline, task.seq), task);
    }

    /// Deadline of the earliest task
    #[must_use]
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.tasks.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest task if it is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<ScheduledTask> {
        let (&key, _) = self.tasks.iter().next()?;
        if key.0 > now {
            return None;
        }
        self.index.remove(&key.1);
        self.tasks.remove(&key)
    }

    /// Remove a task by sequence id
    pub fn remove(&mut self, seq: u64) -> Option<ScheduledTask> {
        let deadline = self.index.remove(&seq)?;
        self.tasks.remove(&(deadline, seq))
    }

    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        self.index.contains_key(&seq)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Take every pending task out of the queue
    pub fn drain(&mut self) -> Vec<ScheduledTask> {
        self.index.clear();
        std::mem::take(&mut self.tasks).into_values().collect()
    }
}
