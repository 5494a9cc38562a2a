//! Single-occupancy slot for a background task (refresh timer, reconnect
//! timer, heartbeat). Spawning into an occupied slot aborts the old task.

use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Identifies one spawn of a [`TaskSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Default)]
struct SlotInner {
    seq: u64,
    current: Option<(Ticket, JoinHandle<()>)>,
}

#[derive(Default)]
pub struct TaskSlot {
    inner: Mutex<SlotInner>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F, Fut>(&self, make: F)
    where
        F: FnOnce(Ticket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let ticket = Ticket(inner.seq);
        if let Some((_, old)) = inner.current.take() {
            old.abort();
        }
        inner.current = Some((ticket, tokio::spawn(make(ticket))));
    }

    /// Abort whatever occupies the slot.
    pub fn cancel(&self) -> bool {
        match self.inner.lock().current.take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Called by a running task before it does its work: detaches it from the
    /// slot so a later `spawn`/`cancel` cannot abort it mid-flight. Returns
    /// false if the task has been superseded and should stop.
    pub fn release(&self, ticket: Ticket) -> bool {
        let mut inner = self.inner.lock();
        match &inner.current {
            Some((current, _)) if *current == ticket => {
                inner.current = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .current
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }
}
