use std::collections::HashMap;

use tether_core::{IdAllocator, RequestId};
use tokio::sync::oneshot;

use crate::error::CallError;

/// What a suspended caller is woken with
pub type Outcome<P> = std::result::Result<Option<P>, CallError>;

/// Outstanding requests of one channel, keyed by correlation id
pub struct PendingTable<P> {
    waiters: HashMap<RequestId, oneshot::Sender<Outcome<P>>>,
    ids: IdAllocator,
}

impl<P> Default for PendingTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PendingTable<P> {
    pub fn new() -> Self {
        Self {
            waiters: HashMap::new(),
            ids: IdAllocator::new("request"),
        }
    }

    /// Park `waiter` under a fresh correlation id
    pub fn register(&mut self, waiter: oneshot::Sender<Outcome<P>>) -> tether_core::Result<RequestId> {
        let id = self.ids.next_id()?;
        self.waiters.insert(id, waiter);
        Ok(id)
    }

    /// Wake the waiter for `id`. False when nothing is waiting under it.
    pub fn resolve(&mut self, id: RequestId, outcome: Outcome<P>) -> bool {
        match self.waiters.remove(&id) {
            Some(waiter) => {
                // the caller may have given up already; the entry is gone either way
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every waiter with `reason`, returning how many there were
    pub fn fail_all(&mut self, reason: CallError) -> usize {
        let count = self.waiters.len();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(reason.clone()));
        }
        count
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.waiters.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
