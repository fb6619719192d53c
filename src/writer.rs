//! Dedicated writer task for one physical link.
//!
//! Frames are encoded by the session actor and handed over through an mpsc
//! channel; the task batches whatever is ready into one vectored write.
//!
//! ```text
//! Session actor ─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► transport
//! ```
//!
//! The pending-frame counter doubles as the link's "writable" signal: while
//! it is at the limit the session caches new messages instead of sending.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};

/// Default maximum pending frames before the link reports not writable.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A fully encoded frame.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub bytes: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Pending frames at which the link stops accepting new ones.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, pending: Arc<AtomicUsize>, max_pending: usize) -> Self {
        Self {
            tx,
            pending,
            max_pending,
        }
    }

    /// Send a frame, waiting for channel space.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            SessionError::ConnectionClosed
        })
    }

    /// Send a frame without waiting.
    ///
    /// Fails if the link is saturated or its task has stopped.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(SessionError::QueueOverflow {
                queue: "writer",
                limit: self.max_pending,
            });
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => SessionError::QueueOverflow {
                    queue: "writer",
                    limit: self.max_pending,
                },
                mpsc::error::TrySendError::Closed(_) => SessionError::ConnectionClosed,
            }
        })
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Whether the link can take another frame right now.
    #[inline]
    pub fn is_writable(&self) -> bool {
        !self.tx.is_closed() && !self.is_backpressure_active()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task on `runtime`.
pub fn spawn_writer_task<W>(
    runtime: &Handle,
    writer: W,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));
    let handle = WriterHandle::new(tx, pending.clone(), config.max_pending_frames);
    let task = runtime.spawn(writer_loop(rx, writer, pending));
    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);
        if let Err(e) = result {
            tracing::debug!(error = %e, "writer task stopping");
            return Err(e);
        }
    }
}

/// Write a batch of frames with vectored writes, finishing partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices for the part of `batch` after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;
    for frame in batch {
        let end = offset + frame.size();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.bytes[start..]));
        }
        offset = end;
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(len: usize, fill: u8) -> OutboundFrame {
        OutboundFrame::new(Bytes::from(vec![fill; len]))
    }

    #[tokio::test]
    async fn test_writer_delivers_in_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) =
            spawn_writer_task(&Handle::current(), client, &WriterConfig::default());

        for i in 0..10u8 {
            handle.try_send(frame(4, i)).unwrap();
        }

        let mut buf = vec![0u8; 40];
        server.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(4).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_pending_count_drains() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) =
            spawn_writer_task(&Handle::current(), client, &WriterConfig::default());
        handle.send(frame(8, 1)).await.unwrap();

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.pending_count(), 0);
        assert!(handle.is_writable());
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(100));
        let handle = WriterHandle::new(tx, pending, 100);

        assert!(!handle.is_writable());
        assert!(matches!(
            handle.try_send(frame(1, 0)),
            Err(SessionError::QueueOverflow { queue: "writer", .. })
        ));
        assert_eq!(handle.pending_count(), 100);
    }

    #[tokio::test]
    async fn test_try_send_after_task_gone() {
        let (tx, rx) = mpsc::channel::<OutboundFrame>(10);
        drop(rx);
        let handle = WriterHandle::new(tx, Arc::new(AtomicUsize::new(0)), 10);
        assert!(!handle.is_writable());
        assert!(matches!(
            handle.try_send(frame(1, 0)),
            Err(SessionError::ConnectionClosed)
        ));
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![frame(5, 0), frame(3, 1)];
        assert_eq!(build_remaining_slices(&batch, 0).len(), 2);

        let partial = build_remaining_slices(&batch, 2);
        assert_eq!(partial[0].len(), 3);
        assert_eq!(partial[1].len(), 3);

        let second_only = build_remaining_slices(&batch, 6);
        assert_eq!(second_only.len(), 1);
        assert_eq!(second_only[0].len(), 2);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| frame(3, i)).collect();
        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 15);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) =
            spawn_writer_task(&Handle::current(), client, &WriterConfig::default());
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}
