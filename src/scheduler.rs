use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifies one readable resource to the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceHandle(pub u64);

impl SourceHandle {
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

/// Readiness notification capability provided by the caller's event loop.
///
/// The reactor never owns a source. When a registered handle becomes readable, or a scheduled
/// task comes due, the event loop calls back into the source that owns the handle.
pub trait Reactor {
    fn register_readable(&mut self, handle: SourceHandle);

    fn unregister(&mut self, handle: SourceHandle);

    fn schedule_task(&mut self, handle: SourceHandle, delay: Duration) -> TaskId;

    fn unschedule(&mut self, task: TaskId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadDiscipline {
    /// The caller accepts a blocking read per request.
    #[default]
    Synchronous,
    /// The caller must never block. Data arrives through reactor wakeups.
    EventDriven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDecision {
    ReadNow,
    Await,
}

#[derive(Debug)]
pub struct ReadScheduler {
    discipline: ReadDiscipline,
    retry_delay: Duration,
    has_started_reading: bool,
    awaiting: bool,
    retry_task: Option<TaskId>,
}

impl ReadScheduler {
    pub fn new(discipline: ReadDiscipline, retry_delay: Duration) -> Self {
        Self {
            discipline,
            retry_delay,
            has_started_reading: false,
            awaiting: false,
            retry_task: None,
        }
    }

    /// Decides how a fresh request is served.
    ///
    /// A seekable source under the event-driven discipline registers its readiness callback on
    /// the first request only. A non-seekable source cannot be polled that way, so it reads
    /// every time.
    pub fn begin_request(
        &mut self,
        reactor: &mut dyn Reactor,
        handle: SourceHandle,
        seekable: bool,
    ) -> ReadDecision {
        match self.discipline {
            ReadDiscipline::Synchronous => ReadDecision::ReadNow,
            ReadDiscipline::EventDriven if !seekable => ReadDecision::ReadNow,
            ReadDiscipline::EventDriven => {
                if !self.has_started_reading {
                    reactor.register_readable(handle);
                    self.has_started_reading = true;
                }
                self.awaiting = true;
                ReadDecision::Await
            }
        }
    }

    /// Re-arms a non-seekable read that found nothing.
    pub fn schedule_retry(&mut self, reactor: &mut dyn Reactor, handle: SourceHandle) {
        if let Some(task) = self.retry_task.take() {
            reactor.unschedule(task);
        }
        self.retry_task = Some(reactor.schedule_task(handle, self.retry_delay));
        self.awaiting = true;
    }

    /// Called when the reactor wakes the source. Returns whether a request is waiting for data.
    pub fn on_wakeup(&mut self) -> bool {
        self.retry_task = None;
        self.awaiting
    }

    pub fn complete(&mut self) {
        self.awaiting = false;
    }

    /// Cancels the pending continuation and drops the readiness registration.
    pub fn stop(&mut self, reactor: &mut dyn Reactor, handle: SourceHandle) {
        if let Some(task) = self.retry_task.take() {
            reactor.unschedule(task);
        }
        if self.has_started_reading {
            reactor.unregister(handle);
            self.has_started_reading = false;
        }
        self.awaiting = false;
    }

    pub fn discipline(&self) -> ReadDiscipline {
        self.discipline
    }

    pub fn is_awaiting(&self) -> bool {
        self.awaiting
    }

    pub fn has_started_reading(&self) -> bool {
        self.has_started_reading
    }
}
