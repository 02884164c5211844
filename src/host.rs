//! Single-node host around the lock manager.
//!
//! The host owns the keyspace, the timer service and the wait list, and
//! applies one event at a time: a client command, a fired timer, or a
//! disconnect. After every event it replays clients suspended on keys that
//! were signalled ready.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    error::{LockError, Result},
    gateway::{BlockingGateway, WaitList},
    locks::{LockCtx, LockManager},
    metrics::stats_json,
    models::{AcquireOutcome, ClientId, LockStatus, ReleaseOutcome, ReplayOutcome, TimerId},
    protocol::Reply,
    store::{Keyspace, Value},
    timer::{ManualTimers, TimerService, TokioTimers},
};

/// Everything the host reacts to.
#[derive(Debug)]
pub enum Event {
    Command {
        client: ClientId,
        args: Vec<String>,
        reply: oneshot::Sender<Reply>,
    },
    Disconnected {
        client: ClientId,
    },
    TimerFired {
        id: TimerId,
        key: String,
    },
    Shutdown,
}

pub struct Host<T: TimerService> {
    keyspace: Keyspace,
    timers: T,
    gateway: WaitList,
    locks: LockManager,
    unblocked: Vec<(ClientId, Reply)>,
}

impl<T: TimerService> Host<T> {
    pub fn new(timers: T) -> Self {
        Self {
            keyspace: Keyspace::new(),
            timers,
            gateway: WaitList::new(),
            locks: LockManager::new(),
            unblocked: Vec::new(),
        }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn timers(&self) -> &T {
        &self.timers
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn is_blocked(&self, client: ClientId) -> bool {
        self.gateway.is_blocked(client)
    }

    fn split(&mut self) -> (&LockManager, LockCtx<'_>) {
        (
            &self.locks,
            LockCtx {
                keyspace: &mut self.keyspace,
                timers: &mut self.timers,
                gateway: &mut self.gateway,
            },
        )
    }

    /// Runs one command. `None` means the client is now suspended and will
    /// get its reply through `drain_unblocked`.
    pub fn handle_command(&mut self, client: ClientId, args: &[String]) -> Option<Reply> {
        let reply = match self.dispatch(client, args) {
            Ok(Some(reply)) => Some(reply),
            Ok(None) => None,
            Err(err) => Some(Reply::from(err)),
        };
        self.serve_ready();
        reply
    }

    pub fn handle_timer(&mut self, id: TimerId, key: &str) {
        self.timers.fired(id);
        let (locks, mut ctx) = self.split();
        locks.on_lease_expiry(&mut ctx, key, id);
        self.serve_ready();
    }

    pub fn handle_disconnect(&mut self, client: ClientId) {
        if let Some(key) = self.gateway.unblock(client) {
            let (locks, mut ctx) = self.split();
            locks.on_disconnect(&mut ctx, &key, client);
        }
        self.unblocked.retain(|(c, _)| *c != client);
        self.serve_ready();
    }

    /// Replies for clients resumed since the last call, in resume order.
    pub fn drain_unblocked(&mut self) -> Vec<(ClientId, Reply)> {
        std::mem::take(&mut self.unblocked)
    }

    /// Replays suspended clients on every ready key, oldest first, until no
    /// key is left ready.
    fn serve_ready(&mut self) {
        loop {
            let ready = self.gateway.take_ready();
            if ready.is_empty() {
                return;
            }
            for key in ready {
                for client in self.gateway.blocked_on(&key) {
                    let (locks, mut ctx) = self.split();
                    let reply = match locks.on_replay(&mut ctx, &key, client) {
                        Ok(ReplayOutcome::Granted) => Reply::Integer(1),
                        Ok(ReplayOutcome::Vacant) => Reply::Integer(0),
                        // Not first in line yet: the client stays suspended and is
                        // replayed again the next time this key is signalled.
                        Err(LockError::ProtocolViolation { .. }) => continue,
                        Err(err) => Reply::from(err),
                    };
                    self.gateway.unblock(client);
                    self.unblocked.push((client, reply));
                }
            }
        }
    }

    fn dispatch(&mut self, client: ClientId, args: &[String]) -> Result<Option<Reply>> {
        let Some(name) = args.first() else {
            return Ok(None);
        };
        let command = name.to_ascii_uppercase();
        let arity_ok = match command.as_str() {
            "LOCK" | "SET" => args.len() == 3,
            "UNLOCK" | "LOCKINFO" | "GET" | "TYPE" => args.len() == 2,
            "DEL" | "EXISTS" => args.len() >= 2,
            "PING" => args.len() <= 2,
            "STATS" => args.len() == 1,
            _ => return Err(LockError::UnknownCommand(name.clone())),
        };
        if !arity_ok {
            return Err(LockError::arity(name));
        }

        let reply = match command.as_str() {
            "LOCK" => {
                let (locks, mut ctx) = self.split();
                match locks.acquire(&mut ctx, &args[1], client, &args[2])? {
                    AcquireOutcome::Granted => Reply::Integer(1),
                    AcquireOutcome::AlreadyHeld => Reply::Integer(0),
                    AcquireOutcome::Queued => return Ok(None),
                }
            }
            "UNLOCK" => {
                let (locks, mut ctx) = self.split();
                match locks.release(&mut ctx, &args[1], client)? {
                    ReleaseOutcome::Released => Reply::Integer(1),
                    ReleaseOutcome::NotHolder | ReleaseOutcome::NotLocked => Reply::Integer(0),
                }
            }
            "LOCKINFO" => match self.locks.status(&self.keyspace, &args[1])? {
                Some(status) => lock_info_reply(&status),
                None => Reply::nil(),
            },
            "PING" => match args.get(1) {
                Some(message) => Reply::bulk(message.as_bytes()),
                None => Reply::Simple("PONG".to_string()),
            },
            "SET" => {
                let previous = self.keyspace.insert(&args[1], Value::Str(args[2].clone()));
                self.on_overwrite(&args[1], previous);
                Reply::ok()
            }
            "GET" => match self.keyspace.get(&args[1]) {
                None => Reply::nil(),
                Some(Value::Str(s)) => Reply::bulk(s.as_bytes()),
                Some(Value::Lock(_)) => return Err(LockError::WrongType),
            },
            "DEL" => {
                let mut deleted = 0;
                for key in &args[1..] {
                    let previous = self.keyspace.remove(key);
                    if previous.is_some() {
                        deleted += 1;
                    }
                    self.on_overwrite(key, previous);
                }
                Reply::Integer(deleted)
            }
            "EXISTS" => Reply::Integer(args[1..].iter().filter(|k| self.keyspace.contains(k)).count() as i64),
            "TYPE" => Reply::Simple(self.keyspace.type_name(&args[1]).unwrap_or("none").to_string()),
            "STATS" => {
                let stats = stats_json(
                    &self.locks.metrics().snapshot(),
                    self.keyspace.lock_count(),
                    self.gateway.blocked_count(),
                    self.timers.armed(),
                );
                Reply::bulk(stats.to_string())
            }
            _ => unreachable!("arity table covers every command"),
        };
        Ok(Some(reply))
    }

    /// A lock value was replaced or deleted outside the lock manager; its
    /// suspended clients must be replayed against whatever is there now.
    fn on_overwrite(&mut self, key: &str, previous: Option<Value>) {
        if let Some(Value::Lock(queue)) = previous {
            debug!("Lock '{}' dropped with {} waiter(s)", key, queue.len());
            self.gateway.signal_ready(key);
        }
    }
}

fn lock_info_reply(status: &LockStatus) -> Reply {
    Reply::Array(vec![
        Reply::bulk("holder"),
        Reply::Integer(status.holder.0 as i64),
        Reply::bulk("lease_ms"),
        Reply::Integer(status.lease_ms as i64),
        Reply::bulk("timer_armed"),
        Reply::Integer(i64::from(status.timer_armed)),
        Reply::bulk("held_since"),
        status
            .held_since
            .map_or_else(Reply::nil, |at| Reply::bulk(at.to_rfc3339())),
        Reply::bulk("waiting"),
        Reply::Array(status.waiting.iter().map(|c| Reply::Integer(c.0 as i64)).collect()),
        Reply::bulk("memory_bytes"),
        Reply::Integer(status.memory_bytes as i64),
    ])
}

impl Host<ManualTimers> {
    /// Moves the virtual clock forward, delivering due timers in order.
    pub fn advance(&mut self, by: Duration) {
        let deadline = self.timers.now() + by;
        while let Some((id, key)) = self.timers.next_due(deadline) {
            self.handle_timer(id, &key);
        }
        self.timers.settle(deadline);
    }
}

impl Host<TokioTimers> {
    /// Event loop. Parks the reply channel of every suspended client and
    /// completes it when the client is resumed.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>, stats_interval: Option<Duration>) {
        let mut parked: HashMap<ClientId, oneshot::Sender<Reply>> = HashMap::new();
        let mut stats_tick = stats_interval.map(tokio::time::interval);
        info!("Lock host started");

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = async {
                    match stats_tick.as_mut() {
                        Some(tick) => { tick.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.log_stats();
                    continue;
                }
            };

            match event {
                Some(Event::Command { client, args, reply }) => match self.handle_command(client, &args) {
                    Some(response) => {
                        if reply.send(response).is_err() {
                            debug!("{} went away before its reply", client);
                        }
                    }
                    None => {
                        parked.insert(client, reply);
                    }
                },
                Some(Event::Disconnected { client }) => {
                    parked.remove(&client);
                    self.handle_disconnect(client);
                }
                Some(Event::TimerFired { id, key }) => self.handle_timer(id, &key),
                Some(Event::Shutdown) | None => break,
            }

            for (client, response) in self.drain_unblocked() {
                match parked.remove(&client) {
                    Some(reply) => {
                        if reply.send(response).is_err() {
                            debug!("{} went away before it was resumed", client);
                        }
                    }
                    None => warn!("Resumed {} has no parked reply", client),
                }
            }
        }

        self.log_stats();
        info!("Lock host stopped");
    }

    fn log_stats(&self) {
        let snapshot = self.locks.metrics().snapshot();
        info!(
            locks = self.keyspace.lock_count(),
            blocked = self.gateway.blocked_count(),
            timers = self.timers.armed(),
            grants = snapshot.total_grants(),
            released = snapshot.released,
            expired = snapshot.expired,
            "Lock stats"
        );
    }
}
