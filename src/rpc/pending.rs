//! Outstanding RPC calls awaiting a response.
//!
//! Owned by the session actor; never shared. Each entry carries a deadline,
//! and [`PendingCalls::expire`] completes overdue calls with
//! [`SessionError::Timeout`]. A response for an id no longer present is
//! reported back to the caller of [`PendingCalls::complete`] so it can be
//! logged and dropped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec::Value;
use crate::error::{Result, SessionError};

/// Callback completed on the session's own worker.
pub type ReplyCallback = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// Where a response goes.
pub enum Reply {
    Channel(oneshot::Sender<Result<Value>>),
    Callback(ReplyCallback),
}

impl Reply {
    fn complete(self, result: Result<Value>) {
        match self {
            Reply::Channel(tx) => {
                let _ = tx.send(result);
            }
            Reply::Callback(f) => f(result),
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Channel(_) => f.write_str("Reply::Channel"),
            Reply::Callback(_) => f.write_str("Reply::Callback"),
        }
    }
}

static REQUEST_IDS: OnceLock<AtomicU64> = OnceLock::new();

/// Process-unique request id.
///
/// Counter with a random start so ids from a restarted process do not
/// collide with responses still in flight for the old one. Never zero.
pub fn next_request_id() -> u64 {
    let counter = REQUEST_IDS.get_or_init(|| AtomicU64::new(rand::thread_rng().gen_range(1..u64::MAX / 2)));
    loop {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    reply: Reply,
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    entries: HashMap<u64, Entry>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request_id: u64, deadline: Instant, reply: Reply) {
        self.deadlines.push(Reverse((deadline, request_id)));
        self.entries.insert(request_id, Entry { deadline, reply });
    }

    /// Complete the call for `request_id`. Returns `false` if it is unknown
    /// or already expired.
    pub fn complete(&mut self, request_id: u64, result: Result<Value>) -> bool {
        match self.entries.remove(&request_id) {
            Some(entry) => {
                entry.reply.complete(result);
                true
            }
            None => false,
        }
    }

    /// Fail every call whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            // Heap entries of completed calls linger until popped.
            let live = self.entries.get(&id).is_some_and(|e| e.deadline == deadline);
            if live {
                if let Some(entry) = self.entries.remove(&id) {
                    entry.reply.complete(Err(SessionError::Timeout));
                    expired += 1;
                }
            }
        }
        expired
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.entries.get(&id).is_some_and(|e| e.deadline == deadline) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Fail everything, e.g. when the session closes.
    pub fn fail_all(&mut self, make_error: impl Fn() -> SessionError) {
        self.deadlines.clear();
        for (_, entry) in self.entries.drain() {
            entry.reply.complete(Err(make_error()));
        }
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
