// src/core/secure/pending.rs

//! The proxy-wide set of connections with undelivered secure output.
//!
//! Membership holds a counted reference to the connection, so a member can
//! never be torn down while it is in the set. The lock is only held while the
//! set itself is being spliced; flushing happens on a snapshot.

use crate::connection::Client;
use crate::core::metrics;
use indexmap::IndexMap;
use parking_lot::Mutex;

#[derive(Default)]
pub struct PendingWrites {
    members: Mutex<IndexMap<u64, Client>>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `client` if it is not already a member. Returns true if added.
    pub fn insert(&self, client: &Client) -> bool {
        let mut members = self.members.lock();
        if members.contains_key(&client.id()) {
            return false;
        }
        members.insert(client.id(), client.get());
        metrics::SECURE_PENDING.set(members.len() as f64);
        true
    }

    /// Removes a member, handing back its reference for the caller to drop.
    pub fn remove(&self, id: u64) -> Option<Client> {
        let mut members = self.members.lock();
        let removed = members.shift_remove(&id);
        if removed.is_some() {
            metrics::SECURE_PENDING.set(members.len() as f64);
        }
        removed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.members.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Extra references to every current member, in insertion order.
    pub fn snapshot(&self) -> Vec<Client> {
        self.members.lock().values().map(Client::get).collect()
    }

    /// Empties the set.
    pub fn drain(&self) -> Vec<Client> {
        let drained: Vec<Client> = self.members.lock().drain(..).map(|(_, c)| c).collect();
        metrics::SECURE_PENDING.set(0.0);
        drained
    }
}
