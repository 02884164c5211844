use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::models::ClientId;

/// Suspends connections on a key and wakes them when the key is signalled.
///
/// The lock manager only ever parks a client and announces readiness; the
/// host decides when to replay and delivers the replies.
pub trait BlockingGateway {
    fn suspend(&mut self, client: ClientId, key: &str);
    fn signal_ready(&mut self, key: &str);
}

/// Per-key FIFO wait lists plus the set of keys signalled since the last
/// drain.
#[derive(Debug, Default)]
pub struct WaitList {
    blocked: HashMap<String, VecDeque<ClientId>>,
    clients: HashMap<ClientId, String>,
    ready: Vec<String>,
    ready_set: HashSet<String>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready keys in signal order, each at most once.
    pub fn take_ready(&mut self) -> Vec<String> {
        self.ready_set.clear();
        std::mem::take(&mut self.ready)
    }

    /// Clients suspended on `key`, oldest first.
    pub fn blocked_on(&self, key: &str) -> Vec<ClientId> {
        self.blocked
            .get(key)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Resumes `client`, returning the key it was suspended on.
    pub fn unblock(&mut self, client: ClientId) -> Option<String> {
        let key = self.clients.remove(&client)?;
        if let Some(clients) = self.blocked.get_mut(&key) {
            clients.retain(|c| *c != client);
            if clients.is_empty() {
                self.blocked.remove(&key);
            }
        }
        Some(key)
    }

    pub fn is_blocked(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn blocked_count(&self) -> usize {
        self.clients.len()
    }
}

impl BlockingGateway for WaitList {
    fn suspend(&mut self, client: ClientId, key: &str) {
        if let Some(previous) = self.clients.get(&client) {
            debug!("{} already suspended on '{}'", client, previous);
            return;
        }
        self.clients.insert(client, key.to_string());
        self.blocked.entry(key.to_string()).or_default().push_back(client);
    }

    fn signal_ready(&mut self, key: &str) {
        if !self.blocked.contains_key(key) {
            return;
        }
        if self.ready_set.insert(key.to_string()) {
            self.ready.push(key.to_string());
        }
    }
}
