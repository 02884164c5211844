//! FIFO lease lock state machine.
//!
//! Each lock name maps to a [`LockQueue`] stored in the keyspace. The head of
//! the queue holds the lock and is the only waiter with an armed lease timer.
//! A queue that empties is removed together with its key.
//!
//! Hand-off to the next waiter happens in two steps: release or expiry
//! signals the key as ready, and the gateway then replays each suspended
//! client in FIFO order through [`LockManager::on_replay`], which arms the
//! new holder's lease.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    error::{LockError, Result},
    gateway::BlockingGateway,
    metrics::{bump, LockMetrics},
    models::{
        parse_lease, AcquireOutcome, ClientId, LockQueue, LockStatus, ReleaseOutcome, ReplayOutcome, TimerId,
    },
    store::{Keyspace, Value},
    timer::TimerService,
};

/// The collaborators a lock operation runs against.
pub struct LockCtx<'a> {
    pub keyspace: &'a mut Keyspace,
    pub timers: &'a mut dyn TimerService,
    pub gateway: &'a mut dyn BlockingGateway,
}

#[derive(Debug, Default)]
pub struct LockManager {
    metrics: LockMetrics,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    /// Grants `key` to `client` or queues it behind the current holder.
    ///
    /// A key holding another type is deleted before `WrongType` is returned.
    /// An unparsable lease leaves existing state untouched.
    pub fn acquire(&self, ctx: &mut LockCtx<'_>, key: &str, client: ClientId, lease: &str) -> Result<AcquireOutcome> {
        if let Err(err) = ctx.keyspace.lock_queue(key) {
            ctx.keyspace.remove(key);
            bump(&self.metrics.wrong_type);
            return Err(err);
        }
        let lease = parse_lease(lease)?;

        let Some(queue) = ctx.keyspace.lock_queue_mut(key)? else {
            let mut queue = LockQueue::new();
            queue.push(client, lease);
            if let Some(head) = queue.head_mut() {
                head.timer = Some(ctx.timers.schedule(key, lease));
                head.granted_at = Some(Utc::now());
            }
            ctx.keyspace.insert(key, Value::Lock(queue));
            bump(&self.metrics.granted_immediately);
            info!("Lock granted: '{}' to {} for {:?}", key, client, lease);
            return Ok(AcquireOutcome::Granted);
        };

        if queue.holder() == Some(client) {
            bump(&self.metrics.already_held);
            return Ok(AcquireOutcome::AlreadyHeld);
        }
        if queue.contains(client) {
            debug!("{} is already waiting on '{}'", client, key);
            return Ok(AcquireOutcome::Queued);
        }

        queue.push(client, lease);
        let depth = queue.len();
        ctx.gateway.suspend(client, key);
        bump(&self.metrics.queued);
        debug!("Lock queued: '{}' for {} (depth {})", key, client, depth);
        Ok(AcquireOutcome::Queued)
    }

    /// Releases `key` if `client` holds it, arming the next holder's lease.
    pub fn release(&self, ctx: &mut LockCtx<'_>, key: &str, client: ClientId) -> Result<ReleaseOutcome> {
        let Some(queue) = ctx.keyspace.lock_queue_mut(key)? else {
            bump(&self.metrics.release_rejected);
            return Ok(ReleaseOutcome::NotLocked);
        };
        if queue.holder() != Some(client) {
            bump(&self.metrics.release_rejected);
            return Ok(ReleaseOutcome::NotHolder);
        }

        if let Some(timer) = queue.pop().and_then(|w| w.timer) {
            ctx.timers.cancel(timer);
        }
        bump(&self.metrics.released);
        info!("Lock released: '{}' by {}", key, client);

        match queue.head_mut() {
            None => {
                ctx.keyspace.remove(key);
            }
            Some(next) => {
                next.timer = Some(ctx.timers.schedule(key, next.lease));
                debug!("Lock '{}' passes to {}", key, next.client);
                ctx.gateway.signal_ready(key);
            }
        }
        Ok(ReleaseOutcome::Released)
    }

    /// Timer callback: evicts the holder whose lease ran out.
    ///
    /// A timer that no longer matches the head's armed timer, or whose key is
    /// gone or retyped, is stale and ignored. The next holder's lease is not
    /// armed here; that happens when its suspended connection is replayed.
    pub fn on_lease_expiry(&self, ctx: &mut LockCtx<'_>, key: &str, timer: TimerId) {
        let queue = match ctx.keyspace.lock_queue_mut(key) {
            Ok(Some(queue)) => queue,
            Ok(None) | Err(_) => {
                bump(&self.metrics.stale_timers);
                debug!("Stale {} for '{}': key gone or retyped", timer, key);
                return;
            }
        };
        if queue.head().and_then(|w| w.timer) != Some(timer) {
            bump(&self.metrics.stale_timers);
            debug!("Stale {} for '{}': not the holder's lease", timer, key);
            return;
        }

        let expired = queue.pop();
        bump(&self.metrics.expired);
        if let Some(waiter) = expired {
            info!("Lock lease expired: '{}' held by {}", key, waiter.client);
        }

        if queue.is_empty() {
            ctx.keyspace.remove(key);
        } else {
            ctx.gateway.signal_ready(key);
        }
    }

    /// Replays a suspended `client` after `key` was signalled ready.
    ///
    /// Only the head may take the lock. Any other client gets
    /// `ProtocolViolation` and must stay suspended.
    pub fn on_replay(&self, ctx: &mut LockCtx<'_>, key: &str, client: ClientId) -> Result<ReplayOutcome> {
        let queue = match ctx.keyspace.lock_queue_mut(key) {
            Ok(Some(queue)) => queue,
            Ok(None) => return Ok(ReplayOutcome::Vacant),
            Err(err) => {
                bump(&self.metrics.wrong_type);
                return Err(err);
            }
        };
        if queue.is_empty() {
            ctx.keyspace.remove(key);
            return Ok(ReplayOutcome::Vacant);
        }

        let holder = queue.holder();
        if holder != Some(client) {
            if queue.contains(client) {
                debug!("{} replayed on '{}' but {:?} is first in line", client, key, holder);
            } else {
                bump(&self.metrics.protocol_violations);
                warn!("{} replayed on '{}' without a queue entry (head {:?})", client, key, holder);
            }
            return Err(LockError::ProtocolViolation {
                key: key.to_string(),
                client,
                holder,
            });
        }

        if let Some(head) = queue.head_mut() {
            if let Some(previous) = head.timer.take() {
                ctx.timers.cancel(previous);
            }
            head.timer = Some(ctx.timers.schedule(key, head.lease));
            head.granted_at = Some(Utc::now());
        }
        bump(&self.metrics.granted_on_replay);
        info!("Lock granted: '{}' to {} after waiting", key, client);
        Ok(ReplayOutcome::Granted)
    }

    /// Drops `client` from the queue after its suspended connection closed.
    pub fn on_disconnect(&self, ctx: &mut LockCtx<'_>, key: &str, client: ClientId) {
        let queue = match ctx.keyspace.lock_queue_mut(key) {
            Ok(Some(queue)) => queue,
            Ok(None) => return,
            Err(_) => {
                debug!("{} disconnected from '{}' which is no longer a lock", client, key);
                return;
            }
        };

        if let Some(waiter) = queue.remove(client) {
            if let Some(timer) = waiter.timer {
                ctx.timers.cancel(timer);
            }
            bump(&self.metrics.disconnected_waiters);
            debug!("{} left the queue for '{}'", client, key);
        }
        if queue.is_empty() {
            ctx.keyspace.remove(key);
        }
    }

    pub fn status(&self, keyspace: &Keyspace, key: &str) -> Result<Option<LockStatus>> {
        Ok(keyspace
            .lock_queue(key)?
            .and_then(LockStatus::from_queue))
    }
}
