use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{LockError, Result};

/// Opaque identifier of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Identifier handed out by a timer service for one scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Parses a lease argument in milliseconds.
///
/// Only base-10 integers are accepted; negative values are rejected.
pub fn parse_lease(arg: &str) -> Result<Duration> {
    let millis: i64 = arg.parse().map_err(|_| LockError::InvalidTimeout)?;
    if millis < 0 {
        return Err(LockError::InvalidTimeout);
    }
    Ok(Duration::from_millis(millis as u64))
}

/// One queued or holding request for a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter {
    pub client: ClientId,
    pub lease: Duration,
    /// Armed expiry timer; only ever set on the head.
    pub timer: Option<TimerId>,
    pub enqueued_at: DateTime<Utc>,
    /// When this waiter became the holder. `None` while it is still queued.
    pub granted_at: Option<DateTime<Utc>>,
}

impl Waiter {
    pub fn new(client: ClientId, lease: Duration) -> Self {
        Self {
            client,
            lease,
            timer: None,
            enqueued_at: Utc::now(),
            granted_at: None,
        }
    }
}

/// FIFO of waiters for one lock name. The head is the holder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockQueue {
    waiters: VecDeque<Waiter>,
}

impl LockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, client: ClientId, lease: Duration) {
        self.waiters.push_back(Waiter::new(client, lease));
    }

    pub fn pop(&mut self) -> Option<Waiter> {
        self.waiters.pop_front()
    }

    /// Removes the waiter for `client` wherever it sits in the queue.
    pub fn remove(&mut self, client: ClientId) -> Option<Waiter> {
        let index = self.position(client)?;
        self.waiters.remove(index)
    }

    pub fn head(&self) -> Option<&Waiter> {
        self.waiters.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Waiter> {
        self.waiters.front_mut()
    }

    pub fn holder(&self) -> Option<ClientId> {
        self.head().map(|w| w.client)
    }

    pub fn position(&self, client: ClientId) -> Option<usize> {
        self.waiters.iter().position(|w| w.client == client)
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.position(client).is_some()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Waiter> {
        self.waiters.iter()
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_usage(&self) -> usize {
        mem::size_of::<Self>() + self.waiters.capacity() * mem::size_of::<Waiter>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    AlreadyHeld,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHolder,
    NotLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The replayed client is the head and now holds an armed lease.
    Granted,
    /// The lock vanished while the client was suspended.
    Vacant,
}

/// Read-only view of a lock, as reported by `LOCKINFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub holder: ClientId,
    pub lease_ms: u64,
    pub timer_armed: bool,
    pub held_since: Option<DateTime<Utc>>,
    pub waiting: Vec<ClientId>,
    pub memory_bytes: usize,
}

impl LockStatus {
    pub fn from_queue(queue: &LockQueue) -> Option<Self> {
        let head = queue.head()?;
        Some(Self {
            holder: head.client,
            lease_ms: head.lease.as_millis() as u64,
            timer_armed: head.timer.is_some(),
            held_since: head.granted_at,
            waiting: queue.iter().skip(1).map(|w| w.client).collect(),
            memory_bytes: queue.memory_usage(),
        })
    }
}
