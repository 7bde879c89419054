//! Multi-client relay buffer over a named byte channel.
//!
//! One read loop drains the FIFO; every inbound chunk lands in a bounded
//! retained window (oldest evicted first) and is broadcast to all attached
//! sinks in attachment order. A newly attached sink is replayed the whole
//! retained window before it joins live broadcasts, so late joiners see
//! the most recent history instead of a blank gap.
//!
//! Backpressure policy: sink writes are best-effort and never block the
//! read loop or other sinks. A slow sink accumulates its own backlog and
//! is detached only on hard error (its receiver is gone), never for being
//! slow.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RelayError, RelayResult, RelayStats};
use crate::config::RelayConfig;

/// Identifier for one attached sink, unique within a buffer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

impl std::fmt::Display for SinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

struct RetainedChunk {
    data: Bytes,
    received_at: Instant,
}

struct SinkEntry {
    id: SinkId,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct Inner {
    window: VecDeque<RetainedChunk>,
    buffered_bytes: usize,
    sinks: Vec<SinkEntry>,
    next_sink_id: u64,
    started_at: Option<Instant>,
    read_task: Option<JoinHandle<()>>,
}

/// Bounded-memory fan-out buffer reading one named channel.
///
/// Created per session instance once the channel exists; stopped (and
/// discarded) when the channel closes or the session tears down.
pub struct RelayBuffer {
    path: PathBuf,
    max_buffered_bytes: usize,
    read_chunk_size: usize,
    bytes_read: AtomicU64,
    chunk_count: AtomicU64,
    active: AtomicBool,
    ready: AtomicBool,
    ready_notify: Notify,
    inner: Mutex<Inner>,
}

impl RelayBuffer {
    /// Creates a buffer for the given channel path. Nothing is opened or
    /// spawned until [`start`](Self::start).
    pub fn new(path: impl Into<PathBuf>, config: &RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            max_buffered_bytes: config.max_buffered_bytes,
            read_chunk_size: config.read_chunk_size,
            bytes_read: AtomicU64::new(0),
            chunk_count: AtomicU64::new(0),
            active: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
            inner: Mutex::new(Inner {
                window: VecDeque::new(),
                buffered_bytes: 0,
                sinks: Vec::new(),
                next_sink_id: 0,
                started_at: None,
                read_task: None,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validates the channel and spawns the read loop.
    ///
    /// The FIFO is opened non-blocking, so this returns immediately even
    /// when no producer has attached yet; [`wait_ready`](Self::wait_ready)
    /// reports when one has.
    ///
    /// # Errors
    /// - `RelayError::ChannelMissing` - Nothing at the channel path
    /// - `RelayError::NotAChannel` - The path is not a FIFO
    /// - `RelayError::AlreadyReading` - The read loop is already running
    /// - `RelayError::Io` - The channel could not be opened
    pub fn start(self: &Arc<Self>) -> RelayResult<()> {
        use std::os::unix::fs::FileTypeExt;

        let metadata =
            std::fs::metadata(&self.path).map_err(|_| RelayError::ChannelMissing {
                path: self.path.clone(),
            })?;
        if !metadata.file_type().is_fifo() {
            return Err(RelayError::NotAChannel {
                path: self.path.clone(),
            });
        }

        let file = open_nonblocking(&self.path).map_err(|source| RelayError::Io {
            operation: format!("open channel {}", self.path.display()),
            source,
        })?;

        let mut inner = self.inner.lock();
        if inner.read_task.is_some() {
            return Err(RelayError::AlreadyReading);
        }
        inner.started_at = Some(Instant::now());
        self.active.store(true, Ordering::Release);
        inner.read_task = Some(tokio::spawn(Arc::clone(self).read_loop(file)));

        info!("Relay buffer reading channel: {}", self.path.display());
        Ok(())
    }

    /// Waits until a producer has attached to the channel.
    ///
    /// Returns false on timeout; callers are expected to proceed anyway
    /// rather than hang, since capture tools can take arbitrarily long to
    /// deliver a first byte.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.ready.load(Ordering::Acquire) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let notified = self.ready_notify.notified();
            if self.ready.load(Ordering::Acquire) {
                return true;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                // A wakeup between the flag check and registration is
                // lost; re-check before reporting a timeout.
                return self.ready.load(Ordering::Acquire);
            }
        }
    }

    /// True while the read loop is running and the channel has not
    /// closed or errored.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Attaches a new sink and replays the retained window to it.
    ///
    /// The replay happens under the broadcast lock, so the sink receives
    /// exactly the retained history followed by every later chunk, with
    /// no gap and no duplicate at the seam.
    pub fn attach(self: &Arc<Self>) -> RelaySink {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::unbounded_channel();

        for chunk in &inner.window {
            if tx.send(chunk.data.clone()).is_err() {
                break;
            }
        }

        let id = SinkId(inner.next_sink_id);
        inner.next_sink_id += 1;
        inner.sinks.push(SinkEntry { id, tx });
        info!("{id} attached ({} total)", inner.sinks.len());

        RelaySink {
            id,
            rx,
            buffer: Arc::downgrade(self),
        }
    }

    /// Removes a sink. Safe to call repeatedly; also invoked automatically
    /// when a sink's receiver goes away or the sink is dropped.
    pub fn detach(&self, id: SinkId) {
        let mut inner = self.inner.lock();
        let before = inner.sinks.len();
        inner.sinks.retain(|s| s.id != id);
        if inner.sinks.len() < before {
            info!("{id} detached ({} remaining)", inner.sinks.len());
        }
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> RelayStats {
        let inner = self.inner.lock();
        RelayStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            chunk_count: self.chunk_count.load(Ordering::Relaxed),
            buffered_bytes: inner.buffered_bytes,
            buffered_chunks: inner.window.len(),
            attached_sinks: inner.sinks.len(),
            uptime: inner.started_at.map(|t| t.elapsed()).unwrap_or_default(),
        }
    }

    /// Ends the read loop, force-closes every attached sink, and clears
    /// the retained window. Idempotent.
    pub fn stop(&self) {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        let mut inner = self.inner.lock();
        if let Some(task) = inner.read_task.take() {
            task.abort();
        }
        // Dropping the senders ends each sink's stream.
        let sink_count = inner.sinks.len();
        inner.sinks.clear();
        inner.window.clear();
        inner.buffered_bytes = 0;
        if was_active {
            info!("Relay buffer stopped ({sink_count} sinks closed)");
        }
    }

    async fn read_loop(self: Arc<Self>, mut file: std::fs::File) {
        use std::io::Read;

        let mut buf = vec![0u8; self.read_chunk_size];
        let mut saw_producer = false;

        loop {
            if !self.active.load(Ordering::Acquire) {
                return;
            }
            // The fd is non-blocking, so reads return immediately: 0 means
            // no producer holds the channel open, WouldBlock means a
            // producer is attached but has nothing for us yet.
            match file.read(&mut buf) {
                Ok(0) => {
                    if saw_producer {
                        info!("Channel closed by producer: {}", self.path.display());
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Ok(n) => {
                    if !saw_producer {
                        saw_producer = true;
                        self.mark_ready();
                    }
                    self.ingest(Bytes::copy_from_slice(&buf[..n]));
                    tokio::task::yield_now().await;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if !saw_producer {
                        saw_producer = true;
                        self.mark_ready();
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Channel read error on {}: {e}", self.path.display());
                    break;
                }
            }
        }

        self.active.store(false, Ordering::Release);
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.ready_notify.notify_waiters();
        info!("Producer attached to channel: {}", self.path.display());
    }

    fn ingest(&self, data: Bytes) {
        let size = data.len();
        self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
        let chunks = self.chunk_count.fetch_add(1, Ordering::Relaxed) + 1;

        let mut inner = self.inner.lock();
        inner.window.push_back(RetainedChunk {
            data: data.clone(),
            received_at: Instant::now(),
        });
        inner.buffered_bytes += size;

        // The just-pushed chunk always survives eviction; with chunk reads
        // far below the window cap the retained total stays within bounds.
        while inner.buffered_bytes > self.max_buffered_bytes && inner.window.len() > 1 {
            if let Some(evicted) = inner.window.pop_front() {
                inner.buffered_bytes -= evicted.data.len();
                debug!(
                    "Evicted {} bytes retained for {:?}",
                    evicted.data.len(),
                    evicted.received_at.elapsed()
                );
            }
        }

        let mut dead = Vec::new();
        for sink in &inner.sinks {
            if sink.tx.send(data.clone()).is_err() {
                dead.push(sink.id);
            }
        }
        if !dead.is_empty() {
            inner.sinks.retain(|s| !dead.contains(&s.id));
            debug!("Removed {} dead sink(s) during broadcast", dead.len());
        }

        if chunks % 100 == 0 {
            debug!(
                "Relay: {chunks} chunks | window {} bytes | {} sinks",
                inner.buffered_bytes,
                inner.sinks.len()
            );
        }
    }
}

/// One attached downstream byte consumer.
///
/// Yields chunks in channel arrival order: first the retained window as of
/// attachment, then every live chunk. The stream ends when the buffer
/// stops. Dropping the sink detaches it from the buffer.
pub struct RelaySink {
    id: SinkId,
    rx: mpsc::UnboundedReceiver<Bytes>,
    buffer: std::sync::Weak<RelayBuffer>,
}

impl RelaySink {
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Receives the next chunk, or None once the buffer has stopped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for callers draining an already-filled sink.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    #[cfg(test)]
    fn close_receiver(&mut self) {
        self.rx.close();
    }
}

impl futures::Stream for RelaySink {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for RelaySink {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.upgrade() {
            buffer.detach(self.id);
        }
    }
}

fn open_nonblocking(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use proptest::prelude::*;

    use super::*;
    use crate::relay::RelayChannel;

    fn test_config(max_bytes: usize) -> RelayConfig {
        RelayConfig {
            max_buffered_bytes: max_bytes,
            read_chunk_size: 64 * 1024,
        }
    }

    fn drain(sink: &mut RelaySink) -> Vec<u8> {
        let mut received = Vec::new();
        while let Some(chunk) = sink.try_recv() {
            received.extend_from_slice(&chunk);
        }
        received
    }

    #[test]
    fn late_joiner_gets_window_then_live_bytes() {
        let buffer = RelayBuffer::new("/unused", &test_config(1024 * 1024));

        buffer.ingest(Bytes::from_static(b"aaaa"));
        buffer.ingest(Bytes::from_static(b"bbbb"));

        let mut sink = buffer.attach();
        buffer.ingest(Bytes::from_static(b"cccc"));

        assert_eq!(drain(&mut sink), b"aaaabbbbcccc");
    }

    #[test]
    fn retained_window_never_exceeds_maximum() {
        let buffer = RelayBuffer::new("/unused", &test_config(1000));

        for i in 0..20u8 {
            buffer.ingest(Bytes::from(vec![i; 400]));
        }

        let stats = buffer.stats();
        assert!(stats.buffered_bytes <= 1000);
        assert_eq!(stats.bytes_read, 20 * 400);

        // The window holds only the most recent chunks.
        let mut sink = buffer.attach();
        let received = drain(&mut sink);
        assert_eq!(received.len(), stats.buffered_bytes);
        assert_eq!(received[0], 18);
        assert_eq!(*received.last().unwrap(), 19);
    }

    #[test]
    fn dead_sink_is_removed_without_disturbing_others() {
        let buffer = RelayBuffer::new("/unused", &test_config(1024 * 1024));

        let mut dead = buffer.attach();
        let mut live = buffer.attach();
        assert_eq!(buffer.stats().attached_sinks, 2);

        dead.close_receiver();
        buffer.ingest(Bytes::from_static(b"1111"));
        assert_eq!(buffer.stats().attached_sinks, 1);

        buffer.ingest(Bytes::from_static(b"2222"));
        assert_eq!(drain(&mut live), b"11112222");
    }

    #[test]
    fn dropping_a_sink_detaches_it() {
        let buffer = RelayBuffer::new("/unused", &test_config(1024));

        let sink = buffer.attach();
        assert_eq!(buffer.stats().attached_sinks, 1);
        drop(sink);
        assert_eq!(buffer.stats().attached_sinks, 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_ends_sinks() {
        let buffer = RelayBuffer::new("/unused", &test_config(1024));
        buffer.ingest(Bytes::from_static(b"data"));
        let mut sink = buffer.attach();

        buffer.stop();
        buffer.stop();

        // The replayed chunk is still delivered, then the stream ends.
        assert_eq!(sink.recv().await, Some(Bytes::from_static(b"data")));
        assert_eq!(sink.recv().await, None);

        let stats = buffer.stats();
        assert_eq!(stats.buffered_bytes, 0);
        assert_eq!(stats.attached_sinks, 0);
        assert!(!buffer.is_active());
    }

    #[tokio::test]
    async fn start_rejects_missing_and_non_fifo_paths() {
        let dir = tempfile::tempdir().unwrap();

        let missing = RelayBuffer::new(dir.path().join("absent.pipe"), &test_config(1024));
        assert!(matches!(
            missing.start(),
            Err(RelayError::ChannelMissing { .. })
        ));

        let regular = dir.path().join("regular.pipe");
        std::fs::write(&regular, b"not a fifo").unwrap();
        let buffer = RelayBuffer::new(regular, &test_config(1024));
        assert!(matches!(buffer.start(), Err(RelayError::NotAChannel { .. })));
    }

    #[tokio::test]
    async fn relays_fifo_bytes_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RelayChannel::create(dir.path(), "e2e").unwrap();

        let buffer = RelayBuffer::new(channel.path(), &test_config(1024 * 1024));
        buffer.start().unwrap();
        let mut sink = buffer.attach();

        let path = channel.path().to_path_buf();
        let writer = tokio::task::spawn_blocking(move || {
            // Blocks until the read side is open, which start() already did.
            let mut fifo = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            for i in 0..3u8 {
                fifo.write_all(&[i; 1000]).unwrap();
            }
        });

        assert!(buffer.wait_ready(Duration::from_secs(5)).await);

        let mut received = Vec::new();
        while received.len() < 3000 {
            let chunk = tokio::time::timeout(Duration::from_secs(5), sink.recv())
                .await
                .expect("timed out waiting for relayed bytes")
                .expect("sink ended early");
            received.extend_from_slice(&chunk);
        }
        writer.await.unwrap();

        let mut expected = Vec::new();
        for i in 0..3u8 {
            expected.extend_from_slice(&[i; 1000]);
        }
        assert_eq!(received, expected);

        // Producer hung up; the loop notices and goes inactive.
        let deadline = Instant::now() + Duration::from_secs(5);
        while buffer.is_active() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!buffer.is_active());
    }

    proptest! {
        /// For any chunk sequence and attach point, a sink receives exactly
        /// the retained window at attach time followed by all later bytes.
        #[test]
        fn sink_stream_has_no_gaps(
            chunks in prop::collection::vec((0u8..=255, 1usize..512), 1..40),
            attach_at in 0usize..40,
            max_bytes in 256usize..4096,
        ) {
            let attach_at = attach_at.min(chunks.len());
            let buffer = RelayBuffer::new("/unused", &test_config(max_bytes));

            // Reference model of the retained window.
            let mut model: VecDeque<Vec<u8>> = VecDeque::new();
            let mut model_bytes = 0usize;
            let mut expected = Vec::new();

            for (i, (fill, len)) in chunks.iter().enumerate() {
                if i == attach_at {
                    for chunk in &model {
                        expected.extend_from_slice(chunk);
                    }
                }
                let payload = vec![*fill; *len];
                if i >= attach_at {
                    expected.extend_from_slice(&payload);
                }
                model.push_back(payload.clone());
                model_bytes += payload.len();
                while model_bytes > max_bytes && model.len() > 1 {
                    model_bytes -= model.pop_front().unwrap().len();
                }
            }

            let mut sink = None;
            for (i, (fill, len)) in chunks.iter().enumerate() {
                if i == attach_at {
                    sink = Some(buffer.attach());
                }
                buffer.ingest(Bytes::from(vec![*fill; *len]));
            }
            let mut sink = sink.unwrap_or_else(|| buffer.attach());
            if attach_at >= chunks.len() {
                expected.clear();
                for chunk in &model {
                    expected.extend_from_slice(chunk);
                }
            }

            prop_assert_eq!(drain(&mut sink), expected);
        }
    }
}
