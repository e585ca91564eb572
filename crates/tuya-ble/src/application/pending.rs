//! Outstanding requests keyed by sequence number.
//!
//! A request registers its sequence number before its first packet is
//! written.  The inbound dispatcher resolves the entry whose number matches
//! a frame's `response_to` field, so responses may arrive in any order.

use std::collections::HashMap;

use tokio::sync::oneshot;

#[derive(Debug)]
pub struct PendingRequests<T> {
    waiters: HashMap<u32, oneshot::Sender<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `seq` and returns the receiver its outcome will arrive on.
    ///
    /// Registering a number that is still outstanding replaces the older
    /// waiter, which then observes a closed channel.
    pub fn register(&mut self, seq: u32) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(seq, tx);
        rx
    }

    /// Completes the request `seq`.  Returns `false` if nobody was waiting.
    pub fn resolve(&mut self, seq: u32, outcome: T) -> bool {
        match self.waiters.remove(&seq) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn remove(&mut self, seq: u32) -> bool {
        self.waiters.remove(&seq).is_some()
    }

    /// Drops every waiter; their receivers report the channel as closed.
    pub fn clear(&mut self) -> usize {
        let n = self.waiters.len();
        self.waiters.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
