//! Per-session sliding window.
//!
//! Outbound payload-bearing messages get a sequence number when they enter
//! the queue. A message the transport can take right away goes to the
//! pending queue and is returned for sending; otherwise it waits in the
//! cache queue until [`MessageQueue::promote`]. Pending messages leave only
//! when the peer's ack proves receipt, and are resent in order after a
//! reconnect, ahead of anything cached.
//!
//! Both queues are bounded. Exceeding a bound is fatal to the session.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use sessionwire::queue::MessageQueue;
//! use sessionwire::protocol::SocketMessage;
//!
//! let mut queue = MessageQueue::with_origin(100, 16, 16);
//! let msg = SocketMessage::OneWay { payload: Bytes::from_static(&[0]) };
//! let sent = queue.enqueue(msg, true).unwrap().unwrap();
//! assert_eq!(sent.seq, 100);
//!
//! queue.on_ack_received(101).unwrap();
//! assert_eq!(queue.pending_len(), 0);
//! ```

use std::collections::VecDeque;

use rand::Rng;

use crate::error::{Result, SessionError};
use crate::protocol::SocketMessage;

/// Exclusive upper bound of a random sequence origin.
pub const SEQUENCE_ORIGIN_LIMIT: u64 = 1 << 31;

/// A message with its assigned sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub seq: u64,
    pub message: SocketMessage,
}

/// What to do with an inbound sequenced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// In order: hand the payload to the application.
    Deliver,
    /// Already delivered before a reconnect: drop it.
    Duplicate,
}

#[derive(Debug)]
pub struct MessageQueue {
    /// Last assigned outbound sequence.
    sequencer: u64,
    /// Next inbound sequence expected; 0 until the first frame arrives.
    ack: u64,
    pending: VecDeque<QueuedMessage>,
    cache: VecDeque<QueuedMessage>,
    max_pending: usize,
    max_cache: usize,
    duplicates: u64,
}

impl MessageQueue {
    /// Queue with a random non-zero sequence origin.
    pub fn new(max_pending: usize, max_cache: usize) -> Self {
        let origin = rand::thread_rng().gen_range(1..SEQUENCE_ORIGIN_LIMIT);
        Self::with_origin(origin, max_pending, max_cache)
    }

    /// Queue whose first assigned sequence is `origin` (must be non-zero).
    pub fn with_origin(origin: u64, max_pending: usize, max_cache: usize) -> Self {
        debug_assert!(origin != 0);
        Self {
            sequencer: origin.max(1) - 1,
            ack: 0,
            pending: VecDeque::new(),
            cache: VecDeque::new(),
            max_pending,
            max_cache,
            duplicates: 0,
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequencer += 1;
        self.sequencer
    }

    /// Accept an outbound message.
    ///
    /// Returns the message to send now when `writable` and nothing is
    /// waiting in the cache; otherwise the message is cached and `None` is
    /// returned.
    ///
    /// # Errors
    ///
    /// [`SessionError::QueueOverflow`] when the target queue is full.
    pub fn enqueue(
        &mut self,
        message: SocketMessage,
        writable: bool,
    ) -> Result<Option<QueuedMessage>> {
        let direct = writable && self.cache.is_empty();
        if direct && self.pending.len() >= self.max_pending {
            return Err(SessionError::QueueOverflow {
                queue: "pending",
                limit: self.max_pending,
            });
        }
        if !direct && self.cache.len() >= self.max_cache {
            return Err(SessionError::QueueOverflow {
                queue: "cache",
                limit: self.max_cache,
            });
        }

        let queued = QueuedMessage {
            seq: self.next_sequence(),
            message,
        };
        if direct {
            self.pending.push_back(queued.clone());
            Ok(Some(queued))
        } else {
            self.cache.push_back(queued);
            Ok(None)
        }
    }

    /// Move every cached message to pending, returning them for sending.
    pub fn promote(&mut self) -> Result<Vec<QueuedMessage>> {
        if self.pending.len() + self.cache.len() > self.max_pending {
            return Err(SessionError::QueueOverflow {
                queue: "pending",
                limit: self.max_pending,
            });
        }
        let promoted: Vec<_> = self.cache.drain(..).collect();
        self.pending.extend(promoted.iter().cloned());
        Ok(promoted)
    }

    /// Legal ack window `[lower, upper]`.
    ///
    /// Cached messages hold sequences but were never written, so the peer
    /// can acknowledge at most up to the first of them.
    pub fn ack_bounds(&self) -> (u64, u64) {
        let upper = self.cache.front().map_or(self.sequencer + 1, |m| m.seq);
        let lower = self.pending.front().map_or(upper, |m| m.seq);
        (lower, upper)
    }

    /// Whether a peer ack fits the window. An ack of 0 always does.
    pub fn is_ack_ok(&self, ack: u64) -> bool {
        if ack == 0 {
            return true;
        }
        let (lower, upper) = self.ack_bounds();
        (lower..=upper).contains(&ack)
    }

    /// Apply a peer ack, dropping every pending message below it.
    ///
    /// Returns the number of messages released.
    pub fn on_ack_received(&mut self, ack: u64) -> Result<usize> {
        if ack == 0 {
            return Ok(0);
        }
        if !self.is_ack_ok(ack) {
            let (lower, upper) = self.ack_bounds();
            return Err(SessionError::AckOutOfRange { ack, lower, upper });
        }
        let mut released = 0;
        while self.pending.front().is_some_and(|m| m.seq < ack) {
            self.pending.pop_front();
            released += 1;
        }
        Ok(released)
    }

    /// Account for an inbound sequenced frame.
    pub fn on_receive(&mut self, seq: u64) -> Result<Received> {
        if self.ack == 0 || seq == self.ack {
            self.ack = seq + 1;
            return Ok(Received::Deliver);
        }
        if seq < self.ack {
            self.duplicates += 1;
            return Ok(Received::Duplicate);
        }
        Err(SessionError::SequenceGap {
            expected: self.ack,
            received: seq,
        })
    }

    /// Pending messages to resend after a reconnect, oldest first.
    pub fn on_reconnect(&self) -> Vec<QueuedMessage> {
        self.pending.iter().cloned().collect()
    }

    /// Everything to write on a fresh link: pending resends, then the cache.
    pub fn resend_batch(&mut self) -> Result<Vec<QueuedMessage>> {
        let mut batch = self.on_reconnect();
        batch.extend(self.promote()?);
        Ok(batch)
    }

    /// Drop both queues and release their buffers.
    pub fn clear(&mut self) {
        self.pending = VecDeque::new();
        self.cache = VecDeque::new();
    }

    pub fn sequencer(&self) -> u64 {
        self.sequencer
    }

    pub fn ack(&self) -> u64 {
        self.ack
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}
