use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::host::Event;
use crate::models::TimerId;

/// One-shot timers keyed back to a store key by name.
///
/// A fired timer only carries the key name and its id; the receiver must
/// re-resolve the key and tolerate it being gone or retyped.
pub trait TimerService {
    fn schedule(&mut self, key: &str, after: Duration) -> TimerId;

    /// Returns `false` if the timer was unknown or already delivered.
    fn cancel(&mut self, id: TimerId) -> bool;

    /// Called by the host once a fired timer has been delivered.
    fn fired(&mut self, _id: TimerId) {}

    /// Timers scheduled and not yet cancelled or delivered.
    fn armed(&self) -> usize;
}

/// Timers backed by the tokio runtime. Each timer is a sleeping task that
/// posts `Event::TimerFired` into the host's event channel.
pub struct TokioTimers {
    events: mpsc::UnboundedSender<Event>,
    next_id: u64,
    handles: HashMap<TimerId, AbortHandle>,
}

impl TokioTimers {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            next_id: 0,
            handles: HashMap::new(),
        }
    }
}

impl TimerService for TokioTimers {
    fn schedule(&mut self, key: &str, after: Duration) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let events = self.events.clone();
        let key = key.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if events.send(Event::TimerFired { id, key }).is_err() {
                debug!("Timer {} fired after the host stopped", id);
            }
        });
        self.handles.insert(id, task.abort_handle());
        id
    }

    fn cancel(&mut self, id: TimerId) -> bool {
        match self.handles.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn fired(&mut self, id: TimerId) {
        self.handles.remove(&id);
    }

    fn armed(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for handle in self.handles.values() {
            handle.abort();
        }
    }
}

/// Virtual-clock timers for tests and benchmarks.
///
/// Nothing fires on its own; the owner polls `next_due` with a deadline and
/// delivers what comes back.
#[derive(Debug, Default)]
pub struct ManualTimers {
    now: Duration,
    next_id: u64,
    pending: BTreeMap<(Duration, TimerId), String>,
    due_at: HashMap<TimerId, Duration>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Pops the earliest timer due at or before `deadline`, moving the clock
    /// to its due time.
    pub fn next_due(&mut self, deadline: Duration) -> Option<(TimerId, String)> {
        let (&(due, id), _) = self.pending.iter().next()?;
        if due > deadline {
            return None;
        }
        let key = self.pending.remove(&(due, id))?;
        self.due_at.remove(&id);
        self.now = self.now.max(due);
        Some((id, key))
    }

    pub fn settle(&mut self, deadline: Duration) {
        self.now = self.now.max(deadline);
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.due_at.contains_key(&id)
    }

    pub fn key_of(&self, id: TimerId) -> Option<&str> {
        let due = self.due_at.get(&id)?;
        self.pending.get(&(*due, id)).map(String::as_str)
    }
}

impl TimerService for ManualTimers {
    fn schedule(&mut self, key: &str, after: Duration) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let due = self.now + after;
        self.pending.insert((due, id), key.to_string());
        self.due_at.insert(id, due);
        id
    }

    fn cancel(&mut self, id: TimerId) -> bool {
        match self.due_at.remove(&id) {
            Some(due) => self.pending.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    fn armed(&self) -> usize {
        self.pending.len()
    }
}
