use crate::error::{Error, Result};

/// Identifies a bound actor within one channel. 0 means "no target".
pub type ActorId = u32;

/// Pairs a request with its response. 0 means "no reply expected".
pub type RequestId = u32;

/// Identifies a client-side notification sink.
pub type ObserverId = u32;

/// Caller-chosen id of a single notification.
pub type NotificationId = u32;

/// Override value stamped into tag-overridable payloads.
pub type Tag = u64;

/// Monotonic id source owned by a single table
///
/// Hands out 1, 2, 3, ... and never reuses a value. 0 is reserved and is
/// never produced.
#[derive(Debug)]
pub struct IdAllocator {
    kind: &'static str,
    next: u32,
}

impl IdAllocator {
    pub fn new(kind: &'static str) -> Self {
        Self { kind, next: 1 }
    }

    pub fn next_id(&mut self) -> Result<u32> {
        if self.next == 0 {
            return Err(Error::IdSpaceExhausted(self.kind));
        }
        let id = self.next;
        // wraps to 0 after u32::MAX, which marks the space as spent
        self.next = self.next.wrapping_add(1);
        Ok(id)
    }
}
