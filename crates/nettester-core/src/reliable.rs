//! Per-channel reliable sequencing.
//!
//! Every reliable frame on a channel carries a sequence number, starting at 1
//! and increasing by one per frame. The receiver acknowledges the highest
//! contiguous sequence it holds; the sender keeps each frame until an ack
//! covers it and retransmits on a capped exponential backoff.
//!
//! ```text
//! Sender                              Receiver
//!   │  Data { seq: 1 }                    │
//!   │────────────────────────────────────>│ deliver 1
//!   │  Data { seq: 2 }                    │
//!   │─────────────X (dropped)             │
//!   │  Data { seq: 3 }                    │
//!   │────────────────────────────────────>│ (buffered, waiting for 2)
//!   │  Ack { 1 }                          │
//!   │<────────────────────────────────────│
//!   │  (deadline passes, resend 2)        │
//!   │────────────────────────────────────>│ deliver 2, then 3
//!   │  Ack { 3 }                          │
//!   │<────────────────────────────────────│
//! ```
//!
//! Time is the connection's logical clock, never the wall clock.

use crate::config::RetransmitPolicy;
use std::collections::BTreeMap;
use std::time::Duration;

/// An unacknowledged frame awaiting retransmission
#[derive(Debug, Clone)]
struct PendingFrame<T> {
    frame: T,
    last_sent: Duration,
    attempts: u32,
}

/// Sending half of a reliable channel
#[derive(Debug)]
pub struct ReliableSender<T> {
    next_seq: u32,
    pending: BTreeMap<u32, PendingFrame<T>>,
    retransmits: u64,
}

impl<T> Default for ReliableSender<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReliableSender<T> {
    /// Create a new sender; the first sequence is 1
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            pending: BTreeMap::new(),
            retransmits: 0,
        }
    }

    /// Allocate the next sequence number
    pub fn next_sequence(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        seq
    }

    /// Remember a frame sent at `now` until it is acknowledged
    pub fn track(&mut self, sequence: u32, frame: T, now: Duration) {
        self.pending.insert(
            sequence,
            PendingFrame {
                frame,
                last_sent: now,
                attempts: 1,
            },
        );
    }

    /// Apply a cumulative ack, returning how many frames it released
    pub fn on_ack(&mut self, highest: u32) -> usize {
        let still_pending = match highest.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        let released = self.pending.len();
        self.pending = still_pending;
        released
    }

    /// Number of frames awaiting acknowledgment
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Total retransmissions handed out
    #[must_use]
    pub fn retransmits(&self) -> u64 {
        self.retransmits
    }

    /// Drop all unacknowledged frames
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl<T: Clone> ReliableSender<T> {
    /// Frames whose retransmit deadline has passed, in sequence order.
    ///
    /// Each returned frame counts as a new attempt sent at `now`. There is
    /// no attempt limit; the connection timeout bounds retries.
    pub fn due(&mut self, now: Duration, policy: &RetransmitPolicy) -> Vec<(u32, T)> {
        let mut due = Vec::new();
        for (seq, pending) in &mut self.pending {
            let deadline = pending.last_sent + policy.delay(pending.attempts);
            if now >= deadline {
                pending.last_sent = now;
                pending.attempts = pending.attempts.saturating_add(1);
                due.push((*seq, pending.frame.clone()));
            }
        }
        self.retransmits += due.len() as u64;
        due
    }
}

/// Receiving half of a reliable channel
#[derive(Debug)]
pub struct ReliableReceiver<T> {
    next_expected: u32,
    buffer: BTreeMap<u32, T>,
    window: u32,
    duplicates: u64,
}

impl<T> ReliableReceiver<T> {
    /// Create a receiver buffering at most `window` frames ahead of the gap
    #[must_use]
    pub fn new(window: u32) -> Self {
        Self {
            next_expected: 1,
            buffer: BTreeMap::new(),
            window: window.max(1),
            duplicates: 0,
        }
    }

    /// Accept a frame, returning everything now deliverable in order.
    ///
    /// Duplicates and frames too far ahead of the gap return nothing; the
    /// caller still acks so the sender learns where we are.
    pub fn receive(&mut self, sequence: u32, item: T) -> Vec<T> {
        if sequence < self.next_expected || self.buffer.contains_key(&sequence) {
            self.duplicates += 1;
            tracing::trace!("Duplicate reliable frame {}", sequence);
            return Vec::new();
        }

        if sequence - self.next_expected >= self.window {
            tracing::debug!(
                "Reliable frame {} beyond reorder window (expecting {})",
                sequence,
                self.next_expected
            );
            return Vec::new();
        }

        if sequence != self.next_expected {
            self.buffer.insert(sequence, item);
            return Vec::new();
        }

        let mut deliverable = vec![item];
        self.next_expected += 1;
        while let Some(buffered) = self.buffer.remove(&self.next_expected) {
            deliverable.push(buffered);
            self.next_expected += 1;
        }
        deliverable
    }

    /// Highest sequence received with no gaps before it (0 before any)
    #[must_use]
    pub fn highest_contiguous(&self) -> u32 {
        self.next_expected - 1
    }

    /// Frames buffered out of order
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Duplicate frames seen so far
    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}
