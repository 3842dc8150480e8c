//! # Packet Queues
//!
//! One queue per elementary stream between the container parser (producer)
//! and the decode stage (consumer):
//! - FIFO of complete packets, presentation order as produced
//! - Blocking pop with timeout for a consumer thread
//! - Instant flush on seek
//! - End-of-stream signalling
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐    ┌─────────────────────────┐    ┌─────────┐
//! │ Parser │───►│ DemuxStream (audio)     │───►│ Decoder │
//! │        │    │  partial ─► PacketQueue │    │         │
//! │        │───►│ DemuxStream (video)     │───►│         │
//! └────────┘    └─────────────────────────┘    └─────────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::packet::{Packet, PacketBuilder};

// ============================================================================
// Stream Description
// ============================================================================

/// Logical elementary stream channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
}

/// What the container says about one stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Container-level stream id
    pub id: u32,
    /// Codec name or FourCC
    pub codec: String,
    pub name: Option<String>,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Nominal frame rate for video
    pub fps: f64,
    /// Raw BITMAPINFOHEADER / WAVEFORMATEX for the decoder
    #[serde(skip)]
    pub header: Bytes,
}

// ============================================================================
// Packet Queue
// ============================================================================

/// Queue counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub bytes: usize,
    pub pushed: u64,
    pub popped: u64,
}

struct QueueInner {
    packets: Mutex<VecDeque<Packet>>,
    /// Signalled on push and on end of stream
    ready: Condvar,
    bytes: AtomicUsize,
    eos: AtomicBool,
    pushed: AtomicU64,
    popped: AtomicU64,
    /// Incremented on every flush
    generation: AtomicU64,
}

/// Thread-safe packet FIFO; clones share the same queue.
#[derive(Clone)]
pub struct PacketQueue {
    inner: Arc<QueueInner>,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                packets: Mutex::new(VecDeque::with_capacity(64)),
                ready: Condvar::new(),
                bytes: AtomicUsize::new(0),
                eos: AtomicBool::new(false),
                pushed: AtomicU64::new(0),
                popped: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    // ========================================================================
    // Producer API (Parser)
    // ========================================================================

    pub fn push(&self, packet: Packet) {
        let mut queue = self.inner.packets.lock();
        self.inner.bytes.fetch_add(packet.len(), Ordering::Relaxed);
        queue.push_back(packet);
        self.inner.pushed.fetch_add(1, Ordering::Relaxed);
        self.inner.ready.notify_one();
    }

    /// Mark that no more packets will follow.
    pub fn signal_eos(&self) {
        let _queue = self.inner.packets.lock();
        self.inner.eos.store(true, Ordering::SeqCst);
        self.inner.ready.notify_all();
    }

    /// Drop everything queued and clear end-of-stream.
    pub fn flush(&self) {
        let mut queue = self.inner.packets.lock();
        let dropped = queue.len();
        queue.clear();
        self.inner.bytes.store(0, Ordering::Relaxed);
        self.inner.eos.store(false, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.ready.notify_all();
        if dropped > 0 {
            tracing::debug!("Flushed {} queued packets", dropped);
        }
    }

    // ========================================================================
    // Consumer API (Decoder)
    // ========================================================================

    pub fn pop(&self) -> Option<Packet> {
        let mut queue = self.inner.packets.lock();
        let packet = queue.pop_front()?;
        self.inner.bytes.fetch_sub(packet.len(), Ordering::Relaxed);
        self.inner.popped.fetch_add(1, Ordering::Relaxed);
        Some(packet)
    }

    /// Pop, waiting up to `timeout` for the producer. Returns `None` on
    /// timeout or once the stream has ended and drained.
    pub fn pop_blocking(&self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.packets.lock();

        while queue.is_empty() {
            if self.inner.eos.load(Ordering::SeqCst) {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.inner.ready.wait_for(&mut queue, remaining);
        }

        let packet = queue.pop_front()?;
        self.inner.bytes.fetch_sub(packet.len(), Ordering::Relaxed);
        self.inner.popped.fetch_add(1, Ordering::Relaxed);
        Some(packet)
    }

    /// PTS of the next packet without removing it.
    pub fn peek_pts(&self) -> Option<f64> {
        self.inner.packets.lock().front().and_then(|p| p.pts)
    }

    pub fn len(&self) -> usize {
        self.inner.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.packets.lock().is_empty()
    }

    /// Payload bytes currently queued.
    pub fn bytes(&self) -> usize {
        self.inner.bytes.load(Ordering::Relaxed)
    }

    pub fn is_eos(&self) -> bool {
        self.inner.eos.load(Ordering::SeqCst)
    }

    /// Changes whenever the queue is flushed; consumers compare it to spot seeks.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let queue = self.inner.packets.lock();
        QueueStats {
            queued: queue.len(),
            bytes: self.inner.bytes.load(Ordering::Relaxed),
            pushed: self.inner.pushed.load(Ordering::Relaxed),
            popped: self.inner.popped.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Demux Stream
// ============================================================================

/// One logical channel: which container stream feeds it, its queue and the
/// packet currently being reassembled.
pub struct DemuxStream {
    kind: StreamKind,
    info: Option<StreamInfo>,
    queue: PacketQueue,
    partial: Option<PacketBuilder>,
}

impl DemuxStream {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            info: None,
            queue: PacketQueue::new(),
            partial: None,
        }
    }

    /// Route container stream `info.id` into this channel.
    pub fn select(&mut self, info: StreamInfo) {
        tracing::info!("Selected {:?} stream {} ({})", self.kind, info.id, info.codec);
        self.info = Some(info);
        self.partial = None;
    }

    pub fn is_selected(&self) -> bool {
        self.info.is_some()
    }

    /// Selected container stream id.
    pub fn id(&self) -> Option<u32> {
        self.info.as_ref().map(|i| i.id)
    }

    pub fn accepts(&self, id: u32) -> bool {
        self.id() == Some(id)
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    pub fn push(&self, packet: Packet) {
        tracing::trace!(
            "{:?} packet: {} bytes, pts {:?}, pos {}",
            self.kind,
            packet.len(),
            packet.pts,
            packet.pos
        );
        self.queue.push(packet);
    }

    pub fn partial_mut(&mut self) -> Option<&mut PacketBuilder> {
        self.partial.as_mut()
    }

    pub fn take_partial(&mut self) -> Option<PacketBuilder> {
        self.partial.take()
    }

    /// Start assembling a new unit. Returns the one it replaces, if any.
    pub fn start_partial(&mut self, builder: PacketBuilder) -> Option<PacketBuilder> {
        self.partial.replace(builder)
    }

    /// Seek cancellation: drop queued packets and the partial one.
    pub fn flush(&mut self) {
        self.partial = None;
        self.queue.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn packet(n: u8, pts: f64) -> Packet {
        Packet::new(1, vec![n; 10], Some(pts), n as u64 * 100)
    }

    #[test]
    fn test_fifo_and_byte_accounting() {
        let queue = PacketQueue::new();
        queue.push(packet(1, 0.0));
        queue.push(packet(2, 0.04));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.bytes(), 20);
        assert_eq!(queue.peek_pts(), Some(0.0));

        assert_eq!(queue.pop().unwrap().data[0], 1);
        assert_eq!(queue.bytes(), 10);
        assert_eq!(queue.pop().unwrap().data[0], 2);
        assert!(queue.pop().is_none());

        let stats = queue.stats();
        assert_eq!((stats.pushed, stats.popped), (2, 2));
    }

    #[test]
    fn test_flush_clears_eos_and_bumps_generation() {
        let queue = PacketQueue::new();
        queue.push(packet(1, 0.0));
        queue.signal_eos();
        assert!(queue.is_eos());

        let generation = queue.generation();
        queue.flush();
        assert!(queue.is_empty());
        assert_eq!(queue.bytes(), 0);
        assert!(!queue.is_eos());
        assert_eq!(queue.generation(), generation + 1);
    }

    #[test]
    fn test_pop_blocking_across_threads() {
        let queue = PacketQueue::new();
        let consumer = queue.clone();
        let handle = thread::spawn(move || {
            let mut got = Vec::new();
            while let Some(p) = consumer.pop_blocking(Duration::from_secs(5)) {
                got.push(p.data[0]);
            }
            got
        });

        for n in 0..5 {
            queue.push(packet(n, n as f64));
        }
        queue.signal_eos();

        assert_eq!(handle.join().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_pop_blocking_times_out() {
        let queue = PacketQueue::new();
        assert!(queue.pop_blocking(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_stream_flush_drops_partial() {
        let mut stream = DemuxStream::new(StreamKind::Audio);
        stream.select(StreamInfo {
            id: 1,
            codec: "mp3".into(),
            ..Default::default()
        });
        assert!(stream.accepts(1));
        stream.push(packet(1, 0.0));
        stream.start_partial(PacketBuilder::new(1, 3, None, 0, false));
        stream.flush();
        assert!(stream.take_partial().is_none());
        assert!(stream.queue().is_empty());
    }
}
