//! Ticket correlation for async frames.
//!
//! Every async dispatch copies the caller's frame into a pooled
//! [`FrameDescriptor`] and files it under a fresh ticket.  The completion
//! path resolves the ticket back to that copy, reports it, and recycles it.

use std::collections::HashMap;

use tracing::debug;

use qrun_core::error::{Result, RuntimeError};
use qrun_core::frame::FrameDescriptor;

// ─── Frame pool ─────────────────────────────────────────────────────────────

/// Fixed number of reusable frame copies.
#[derive(Debug)]
pub struct FramePool {
    capacity: usize,
    frame_len: usize,
    free: Vec<FrameDescriptor>,
}

impl FramePool {
    /// `capacity` frames, each pre-sized to `frame_len` buffers.
    pub fn new(capacity: usize, frame_len: usize) -> Self {
        Self {
            capacity,
            frame_len,
            free: (0..capacity).map(|_| FrameDescriptor::with_len(frame_len)).collect(),
        }
    }

    /// A pooled frame holding a copy of `src`.
    pub fn acquire(&mut self, src: &FrameDescriptor) -> Result<FrameDescriptor> {
        let mut frame = self.free.pop().ok_or(RuntimeError::PoolExhausted {
            capacity: self.capacity,
        })?;
        frame.copy_from(src);
        Ok(frame)
    }

    /// Hand a frame back; extra frames beyond capacity are dropped.
    pub fn recycle(&mut self, frame: FrameDescriptor) {
        if self.free.len() < self.capacity {
            self.free.push(frame);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

// ─── Ticket tracker ─────────────────────────────────────────────────────────

/// Maps live tickets to the frame copies they were issued for.
///
/// Tickets start at 1, wrap from `u64::MAX` back to 1 and skip any value
/// still live, so 0 is never issued and a ticket has at most one mapping.
#[derive(Debug)]
pub struct FrameTicketTracker {
    next: u64,
    live: HashMap<u64, FrameDescriptor>,
    pool: FramePool,
}

impl FrameTicketTracker {
    pub fn new(pool_capacity: usize, frame_len: usize) -> Self {
        Self {
            next: 1,
            live: HashMap::with_capacity(pool_capacity),
            pool: FramePool::new(pool_capacity, frame_len),
        }
    }

    /// Copy `frame` into the pool and file it under a new ticket.
    pub fn issue(&mut self, frame: &FrameDescriptor) -> Result<u64> {
        let copy = self.pool.acquire(frame)?;
        let ticket = self.mint();
        self.live.insert(ticket, copy);
        debug!(ticket, in_flight = self.live.len(), "frame ticket issued");
        Ok(ticket)
    }

    fn mint(&mut self) -> u64 {
        loop {
            let ticket = self.next;
            self.next = match self.next.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !self.live.contains_key(&ticket) {
                return ticket;
            }
        }
    }

    /// Take the frame filed under `ticket`; the caller recycles it.
    pub fn resolve(&mut self, ticket: u64) -> Option<FrameDescriptor> {
        self.live.remove(&ticket)
    }

    pub fn recycle(&mut self, frame: FrameDescriptor) {
        self.pool.recycle(frame);
    }

    /// Withdraw a ticket whose job never reached the backend.
    pub fn cancel(&mut self, ticket: u64) -> bool {
        match self.live.remove(&ticket) {
            Some(frame) => {
                self.pool.recycle(frame);
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.live.len()
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Next ticket that would be considered; exposed for wrap tests.
    #[cfg(test)]
    fn set_next(&mut self, next: u64) {
        self.next = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrun_core::frame::{BufferDescriptor, ErrorPayload, NotifyStatus};

    fn frame(marker: u64) -> FrameDescriptor {
        FrameDescriptor::from_buffers(vec![
            BufferDescriptor::Empty,
            BufferDescriptor::Error(ErrorPayload::new(NotifyStatus::failed(marker))),
        ])
    }

    #[test]
    fn tickets_start_at_one_and_increase() {
        let mut tracker = FrameTicketTracker::new(4, 2);
        assert_eq!(tracker.issue(&frame(1)).expect("ticket"), 1);
        assert_eq!(tracker.issue(&frame(2)).expect("ticket"), 2);
        assert_eq!(tracker.in_flight(), 2);
    }

    #[test]
    fn ticket_wraps_past_zero_and_skips_live_values() {
        let mut tracker = FrameTicketTracker::new(4, 2);
        assert_eq!(tracker.issue(&frame(1)).expect("ticket"), 1);
        tracker.set_next(u64::MAX);
        assert_eq!(tracker.issue(&frame(2)).expect("ticket"), u64::MAX);
        // 0 is never issued and 1 is still live.
        assert_eq!(tracker.issue(&frame(3)).expect("ticket"), 2);
    }

    #[test]
    fn resolve_returns_the_copied_frame_once() {
        let mut tracker = FrameTicketTracker::new(2, 2);
        let ticket = tracker.issue(&frame(9)).expect("ticket");
        let copy = tracker.resolve(ticket).expect("live ticket");
        assert_eq!(copy, frame(9));
        assert!(tracker.resolve(ticket).is_none());
        tracker.recycle(copy);
        assert_eq!(tracker.pool().available(), 2);
    }

    #[test]
    fn exhausted_pool_is_no_mem_until_recycled() {
        let mut tracker = FrameTicketTracker::new(2, 2);
        tracker.issue(&frame(1)).expect("first");
        let second = tracker.issue(&frame(2)).expect("second");
        let err = tracker.issue(&frame(3)).expect_err("pool of two");
        assert!(matches!(err, RuntimeError::PoolExhausted { capacity: 2 }));
        assert!(err.to_string().contains("Frame Desc Pool is Full"));

        assert!(tracker.cancel(second));
        assert!(!tracker.cancel(second));
        tracker.issue(&frame(4)).expect("slot returned by cancel");
    }

    #[test]
    fn pool_never_grows_past_capacity() {
        let mut pool = FramePool::new(1, 3);
        assert_eq!(pool.frame_len(), 3);
        pool.recycle(FrameDescriptor::with_len(3));
        assert_eq!(pool.available(), 1);
    }
}
