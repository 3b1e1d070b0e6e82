//! Pending command transactions
//!
//! Ids are handed out in increasing order starting at 1 and skip any id that
//! is still pending, so a wrapped counter can never alias a live request.
//! Transaction id 0 is reserved for commands that expect no reply.

use std::collections::HashMap;

/// Map from transaction id to whatever is waiting for the reply
#[derive(Debug)]
pub struct TransactionTable<T> {
    next_id: u32,
    pending: HashMap<u32, T>,
}

impl<T> TransactionTable<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Store `waiter` under a fresh id and return the id
    pub fn register(&mut self, waiter: T) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.pending.contains_key(&id) {
                self.pending.insert(id, waiter);
                return id;
            }
        }
    }

    /// Take the waiter for `id`; `None` if nothing is pending under it
    pub fn complete(&mut self, id: u32) -> Option<T> {
        self.pending.remove(&id)
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove every pending entry
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, T)> + '_ {
        self.pending.drain()
    }
}

impl<T> Default for TransactionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
