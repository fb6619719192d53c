//! Session worker threads.
//!
//! A [`ShardPool`] runs N OS threads, each driving its own current-thread
//! tokio runtime. A session is pinned to `hash(session_id) % N` for its whole
//! life, so all of its state is touched by exactly one thread.

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use crate::error::{Result, SessionError};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_SHARD: Cell<Option<ShardId>> = const { Cell::new(None) };
}

/// Identifies one worker of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardId {
    pub pool: usize,
    pub index: usize,
}

struct Shard {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

pub struct ShardPool {
    id: usize,
    shards: Vec<Shard>,
}

impl std::fmt::Debug for ShardPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardPool")
            .field("id", &self.id)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl ShardPool {
    /// Start `count` worker threads named `{name}-shard-{i}`.
    pub fn new(name: &str, count: usize) -> Result<Arc<Self>> {
        if count == 0 {
            return Err(SessionError::InvalidConfig("shard count must be > 0".to_string()));
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let mut shards = Vec::with_capacity(count);

        for index in 0..count {
            let (handle_tx, handle_rx) = std::sync::mpsc::channel();
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let shard_id = ShardId { pool: id, index };

            let thread = std::thread::Builder::new()
                .name(format!("{name}-shard-{index}"))
                .spawn(move || {
                    let runtime = match Builder::new_current_thread().enable_all().build() {
                        Ok(rt) => rt,
                        Err(e) => {
                            let _ = handle_tx.send(Err(e));
                            return;
                        }
                    };
                    CURRENT_SHARD.with(|c| c.set(Some(shard_id)));
                    let _ = handle_tx.send(Ok(runtime.handle().clone()));
                    runtime.block_on(async {
                        let _ = shutdown_rx.await;
                    });
                    tracing::trace!(pool = id, index, "shard stopped");
                })?;

            let handle = handle_rx
                .recv()
                .map_err(|_| SessionError::InvalidConfig("shard thread exited during start".to_string()))??;

            shards.push(Shard {
                handle,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            });
        }

        tracing::debug!(pool = id, shards = count, "shard pool started");
        Ok(Arc::new(Self { id, shards }))
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Worker that owns `session_id`.
    pub fn shard_for(&self, session_id: &str) -> ShardId {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        ShardId {
            pool: self.id,
            index: (hasher.finish() % self.shards.len() as u64) as usize,
        }
    }

    pub fn handle(&self, shard: ShardId) -> &Handle {
        &self.shards[shard.index % self.shards.len()].handle
    }

    pub fn spawn<F>(&self, shard: ShardId, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle(shard).spawn(future)
    }

    /// The worker the calling thread belongs to, if any.
    pub fn current() -> Option<ShardId> {
        CURRENT_SHARD.with(|c| c.get())
    }
}

impl Drop for ShardPool {
    fn drop(&mut self) {
        for shard in &mut self.shards {
            if let Some(tx) = shard.shutdown.take() {
                let _ = tx.send(());
            }
            // Never join from one of our own workers.
            let on_own_worker = Self::current().is_some_and(|c| c.pool == self.id);
            if let Some(thread) = shard.thread.take() {
                if !on_own_worker {
                    let _ = thread.join();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_assignment_is_stable() {
        let pool = ShardPool::new("test", 4).unwrap();
        let a = pool.shard_for("player-1");
        assert_eq!(a, pool.shard_for("player-1"));
        assert!(a.index < 4);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_zero_shards_rejected() {
        assert!(ShardPool::new("test", 0).is_err());
    }

    #[tokio::test]
    async fn test_tasks_run_on_their_shard() {
        let pool = ShardPool::new("test", 2).unwrap();
        assert_eq!(ShardPool::current(), None);

        for key in ["a", "b", "c", "d"] {
            let shard = pool.shard_for(key);
            let seen = pool.spawn(shard, async { ShardPool::current() }).await.unwrap();
            assert_eq!(seen, Some(shard));
        }
    }

    #[test]
    fn test_pools_are_distinct() {
        let a = ShardPool::new("a", 1).unwrap();
        let b = ShardPool::new("b", 1).unwrap();
        assert_ne!(a.shard_for("x"), b.shard_for("x"));
    }
}
