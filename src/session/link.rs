//! One physical connection attached to a session.
//!
//! The reader task decodes frames on the application runtime and forwards
//! them to the session worker tagged with the link's generation; events
//! from a replaced link are recognised by their stale generation and
//! ignored. Writes go through the batched writer task. Frames that find the
//! writer saturated wait in a local outbox so the wire order never changes.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};
use crate::protocol::{Decoded, Frame, FrameBuffer};
use crate::transport::{BoxReader, Connection};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Something that happened on a link, reported to the session worker.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// Client connect attempt produced a connection.
    Opened { generation: u64, conn: Connection },
    /// Client connect attempt failed.
    Failed { generation: u64, error: SessionError },
    Frame { generation: u64, frame: Frame },
    /// Frame discarded below the corruption threshold.
    Corrupt { generation: u64, error: SessionError },
    /// Link gone; `None` means clean EOF.
    Closed { generation: u64, error: Option<SessionError> },
}

impl LinkEvent {
    pub(crate) fn generation(&self) -> u64 {
        match self {
            LinkEvent::Opened { generation, .. }
            | LinkEvent::Failed { generation, .. }
            | LinkEvent::Frame { generation, .. }
            | LinkEvent::Corrupt { generation, .. }
            | LinkEvent::Closed { generation, .. } => *generation,
        }
    }
}

pub(crate) struct Link {
    generation: u64,
    peer: String,
    writer: WriterHandle,
    _writer_task: JoinHandle<Result<()>>,
    reader_task: JoinHandle<()>,
    outbox: VecDeque<Bytes>,
}

impl Link {
    /// Start reader and writer tasks for `conn` on `runtime`.
    ///
    /// `buffer` may already hold bytes read past the handshake; `backlog`
    /// holds frames decoded from them, delivered before anything new.
    pub(crate) fn start(
        generation: u64,
        conn: Connection,
        buffer: FrameBuffer,
        backlog: Vec<Decoded>,
        events: mpsc::Sender<LinkEvent>,
        runtime: &Handle,
        writer_config: &WriterConfig,
    ) -> Self {
        let Connection {
            reader,
            writer,
            peer,
        } = conn;
        let (writer, writer_task) = spawn_writer_task(runtime, writer, writer_config);
        let reader_task = runtime.spawn(read_loop(generation, reader, buffer, backlog, events));
        Self {
            generation,
            peer,
            writer,
            _writer_task: writer_task,
            reader_task,
            outbox: VecDeque::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue `bytes` for the wire, behind anything already waiting.
    pub(crate) fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.outbox.push_back(bytes);
        self.flush()
    }

    /// Move waiting frames to the writer until it saturates.
    pub(crate) fn flush(&mut self) -> Result<()> {
        while let Some(bytes) = self.outbox.pop_front() {
            match self.writer.try_send(OutboundFrame::new(bytes.clone())) {
                Ok(()) => {}
                Err(SessionError::QueueOverflow { .. }) => {
                    self.outbox.push_front(bytes);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Whether a new frame would go straight to the writer.
    pub(crate) fn is_writable(&self) -> bool {
        self.outbox.is_empty() && self.writer.is_writable()
    }

    pub(crate) fn has_backlog(&self) -> bool {
        !self.outbox.is_empty()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // The writer drains what it already holds once its handle is gone.
        self.reader_task.abort();
    }
}

async fn read_loop(
    generation: u64,
    mut reader: BoxReader,
    mut buffer: FrameBuffer,
    backlog: Vec<Decoded>,
    events: mpsc::Sender<LinkEvent>,
) {
    for item in backlog {
        if events.send(decoded_event(generation, item)).await.is_err() {
            return;
        }
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let error = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(SessionError::Io(e)),
        };
        match buffer.push(&buf[..n]) {
            Ok(items) => {
                for item in items {
                    if events.send(decoded_event(generation, item)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => break Some(e),
        }
    };
    let _ = events.send(LinkEvent::Closed { generation, error }).await;
}

fn decoded_event(generation: u64, item: Decoded) -> LinkEvent {
    match item {
        Decoded::Frame(frame) => LinkEvent::Frame { generation, frame },
        Decoded::Corrupt(error) => LinkEvent::Corrupt { generation, error },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SocketMessage;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};

    fn ping(seq: u64) -> Bytes {
        Frame::data(seq, 0, SocketMessage::PingPong).encode()
    }

    #[tokio::test]
    async fn test_reader_forwards_frames_then_eof() {
        let (local, mut remote) = duplex(4096);
        let (events_tx, mut events) = mpsc::channel(16);
        let _link = Link::start(
            7,
            Connection::from_stream(local, "test"),
            FrameBuffer::new(),
            Vec::new(),
            events_tx,
            &Handle::current(),
            &WriterConfig::default(),
        );

        remote.write_all(&ping(1)).await.unwrap();
        drop(remote);

        match events.recv().await.unwrap() {
            LinkEvent::Frame { generation, frame } => {
                assert_eq!(generation, 7);
                assert!(matches!(frame, Frame::Data { seq: 1, .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::Closed {
                generation: 7,
                error: None
            }
        ));
    }

    #[tokio::test]
    async fn test_backlog_delivered_first() {
        let (local, _remote) = duplex(4096);
        let (events_tx, mut events) = mpsc::channel(16);
        let backlog = vec![Decoded::Frame(Frame::data(5, 0, SocketMessage::PingPong))];
        let _link = Link::start(
            1,
            Connection::from_stream(local, "test"),
            FrameBuffer::new(),
            backlog,
            events_tx,
            &Handle::current(),
            &WriterConfig::default(),
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::Frame {
                frame: Frame::Data { seq: 5, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_outbox_preserves_order_under_backpressure() {
        let (local, mut remote) = duplex(64 * 1024);
        let (events_tx, _events) = mpsc::channel(16);
        let config = WriterConfig {
            max_pending_frames: 1,
            channel_capacity: 1,
        };
        let mut link = Link::start(
            1,
            Connection::from_stream(local, "test"),
            FrameBuffer::new(),
            Vec::new(),
            events_tx,
            &Handle::current(),
            &config,
        );

        for seq in 1..=5 {
            link.write(ping(seq)).unwrap();
        }
        let frame_len = ping(1).len();
        let mut received = Vec::new();
        let mut buf = vec![0u8; 1024];
        while received.len() < 5 * frame_len {
            link.flush().unwrap();
            let read = tokio::time::timeout(Duration::from_millis(10), remote.read(&mut buf)).await;
            if let Ok(n) = read {
                received.extend_from_slice(&buf[..n.unwrap()]);
            }
        }
        assert!(!link.has_backlog());

        let mut frames = FrameBuffer::new();
        let seqs: Vec<u64> = frames
            .push(&received)
            .unwrap()
            .into_iter()
            .map(|d| match d {
                Decoded::Frame(Frame::Data { seq, .. }) => seq,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }
}
