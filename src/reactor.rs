use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::{Reactor, SourceHandle, TaskId};

/// Single-threaded reactor driven by an explicit poll loop.
///
/// Registered handles are treated as always readable. Encoder output and regular files never
/// stay readable-but-empty for long, and an empty poll costs one `NotReady`.
#[derive(Debug, Default)]
pub struct LoopReactor {
    readable: BTreeSet<SourceHandle>,
    tasks: BTreeMap<TaskId, (SourceHandle, Instant)>,
    next_task: u64,
    registrations: usize,
}

impl LoopReactor {
    /// Handles to wake at `now`: every registered handle, then every due task's handle.
    /// Due tasks are consumed.
    pub fn due_wakeups(&mut self, now: Instant) -> Vec<SourceHandle> {
        let mut out = self.readable.iter().copied().collect::<Vec<_>>();
        let due = self
            .tasks
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in due {
            if let Some((handle, _)) = self.tasks.remove(&id) {
                out.push(handle);
            }
        }
        out
    }

    /// Time until the earliest scheduled task, if any.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.tasks
            .values()
            .map(|(_, deadline)| deadline.saturating_duration_since(now))
            .min()
    }

    pub fn is_idle(&self) -> bool {
        self.readable.is_empty() && self.tasks.is_empty()
    }

    pub fn is_registered(&self, handle: SourceHandle) -> bool {
        self.readable.contains(&handle)
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Number of registrations that were not already active.
    pub fn registration_count(&self) -> usize {
        self.registrations
    }
}

impl Reactor for LoopReactor {
    fn register_readable(&mut self, handle: SourceHandle) {
        if self.readable.insert(handle) {
            self.registrations += 1;
        }
    }

    fn unregister(&mut self, handle: SourceHandle) {
        self.readable.remove(&handle);
    }

    fn schedule_task(&mut self, handle: SourceHandle, delay: Duration) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        self.tasks.insert(id, (handle, Instant::now() + delay));
        id
    }

    fn unschedule(&mut self, task: TaskId) {
        self.tasks.remove(&task);
    }
}
