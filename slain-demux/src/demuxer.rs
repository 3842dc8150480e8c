//! # Demuxer
//!
//! Session facade over the container parsers. The Format Detector picks a
//! parser once at open time; every later call dispatches through the closed
//! [`Container`] enum and the per-session [`DemuxContext`].
//!
//! ```text
//! ByteSource ─► [cache] ─► MediaStream ─► Container ─► DemuxStream (audio) ─► PacketQueue
//!                                                   └► DemuxStream (video) ─► PacketQueue
//! ```

use serde::{Deserialize, Serialize};

use crate::asf_demux::AsfDemuxer;
use crate::avi_demux::AviDemuxer;
use crate::cache;
use crate::config::{CacheConfig, DemuxConfig};
use crate::detect::{self, ContainerFormat};
use crate::error::{DemuxError, Result};
use crate::index::{IndexEntry, IndexFlags, SeekIndex};
use crate::mpeg_ps::MpegPsDemuxer;
use crate::packet::Packet;
use crate::packet_queue::{DemuxStream, PacketQueue, StreamInfo, StreamKind};
use crate::source::{self, ByteSource};
use crate::stream::MediaStream;

// ============================================================================
// Session Description
// ============================================================================

/// Parser synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Unsynced,
    Probing,
    Synced,
}

/// Container-level description of an open source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub format: ContainerFormat,
    /// Seconds, when the container declares it
    pub duration: Option<f64>,
    pub audio: Vec<StreamInfo>,
    pub video: Vec<StreamInfo>,
    /// Container carries its own index
    pub indexed: bool,
    pub seekable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DemuxStats {
    pub packets: u64,
    pub bytes: u64,
    pub corrupt_chunks: u64,
    pub segment_mismatches: u64,
    /// Oversized, unroutable or broken units thrown away
    pub discarded_packets: u64,
    /// Bytes passed over while hunting for sync
    pub skipped_bytes: u64,
    pub resyncs: u64,
    pub seeks: u64,
}

/// Handle returned by stream selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub kind: StreamKind,
    pub id: u32,
}

// ============================================================================
// Demux Context
// ============================================================================

/// Mutable state of one open session, handed to the active parser.
pub struct DemuxContext {
    pub(crate) input: MediaStream,
    pub(crate) audio: DemuxStream,
    pub(crate) video: DemuxStream,
    pub(crate) index: SeekIndex,
    pub(crate) sync: SyncState,
    pub(crate) stats: DemuxStats,
    pub(crate) info: MediaInfo,
    pub(crate) config: DemuxConfig,
    pub(crate) last_error: Option<DemuxError>,
}

impl DemuxContext {
    pub(crate) fn new(input: MediaStream, format: ContainerFormat, config: DemuxConfig) -> Self {
        let seekable = input.is_seekable();
        Self {
            input,
            audio: DemuxStream::new(StreamKind::Audio),
            video: DemuxStream::new(StreamKind::Video),
            index: SeekIndex::new(),
            sync: SyncState::Unsynced,
            stats: DemuxStats::default(),
            info: MediaInfo {
                format,
                duration: None,
                audio: Vec::new(),
                video: Vec::new(),
                indexed: false,
                seekable,
            },
            config,
            last_error: None,
        }
    }

    pub(crate) fn stream(&self, kind: StreamKind) -> &DemuxStream {
        match kind {
            StreamKind::Audio => &self.audio,
            StreamKind::Video => &self.video,
        }
    }

    pub(crate) fn stream_mut(&mut self, kind: StreamKind) -> &mut DemuxStream {
        match kind {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
        }
    }

    /// Channel fed by container stream `id`, for formats with one id space.
    pub(crate) fn route(&self, id: u32) -> Option<StreamKind> {
        if self.video.accepts(id) {
            Some(StreamKind::Video)
        } else if self.audio.accepts(id) {
            Some(StreamKind::Audio)
        } else {
            None
        }
    }

    /// Stream whose packets feed the lazily built seek table.
    pub(crate) fn primary_kind(&self) -> StreamKind {
        if self.video.is_selected() || !self.audio.is_selected() {
            StreamKind::Video
        } else {
            StreamKind::Audio
        }
    }

    fn known(&self, kind: StreamKind) -> &Vec<StreamInfo> {
        match kind {
            StreamKind::Audio => &self.info.audio,
            StreamKind::Video => &self.info.video,
        }
    }

    /// Record a stream found in the container. Returns false if already known.
    pub(crate) fn discover(&mut self, kind: StreamKind, info: StreamInfo) -> bool {
        if self.known(kind).iter().any(|s| s.id == info.id) {
            return false;
        }
        tracing::debug!("Found {:?} stream {} ({})", kind, info.id, info.codec);
        match kind {
            StreamKind::Audio => self.info.audio.push(info),
            StreamKind::Video => self.info.video.push(info),
        }
        true
    }

    /// Select the first known stream of `kind` if nothing is selected yet.
    pub(crate) fn auto_select(&mut self, kind: StreamKind) {
        if self.stream(kind).is_selected() {
            return;
        }
        if let Some(info) = self.known(kind).first().cloned() {
            self.stream_mut(kind).select(info);
        }
    }

    pub(crate) fn select(&mut self, kind: StreamKind, id: u32) -> Result<()> {
        let info = self
            .known(kind)
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(DemuxError::NoSuchStream(id))?;
        let stream = self.stream_mut(kind);
        stream.flush();
        stream.select(info);
        Ok(())
    }

    /// Hand a finished packet to its queue.
    pub(crate) fn emit(&mut self, kind: StreamKind, packet: Packet) {
        self.stats.packets += 1;
        self.stats.bytes += packet.len() as u64;

        if !self.index.is_embedded() && kind == self.primary_kind() {
            if let Some(pts) = packet.pts {
                let flags = if packet.keyframe || kind == StreamKind::Audio {
                    IndexFlags::SYNC
                } else {
                    IndexFlags::empty()
                };
                self.index.push_if_new(IndexEntry {
                    pts,
                    seq: self.stats.packets,
                    offset: packet.pos,
                    flags,
                });
            }
        }

        self.stream(kind).push(packet);
    }

    /// Log and remember a non-fatal inconsistency.
    pub(crate) fn note(&mut self, err: DemuxError) {
        tracing::warn!("{}", err);
        match &err {
            DemuxError::ChunkCorrupt { .. } => self.stats.corrupt_chunks += 1,
            DemuxError::SegmentMismatch { .. } => self.stats.segment_mismatches += 1,
            _ => {}
        }
        self.last_error = Some(err);
    }

    /// Drop everything in flight after a reposition.
    pub(crate) fn flush_streams(&mut self) {
        self.audio.flush();
        self.video.flush();
    }
}

// ============================================================================
// Container Dispatch
// ============================================================================

enum Container {
    Avi(AviDemuxer),
    Mpeg(MpegPsDemuxer),
    Asf(AsfDemuxer),
}

impl Container {
    fn open(ctx: &mut DemuxContext) -> Result<Self> {
        Ok(match ctx.info.format {
            ContainerFormat::Avi => Container::Avi(AviDemuxer::open(ctx)?),
            ContainerFormat::Mpeg => Container::Mpeg(MpegPsDemuxer::open(ctx)?),
            ContainerFormat::Asf => Container::Asf(AsfDemuxer::open(ctx)?),
        })
    }

    fn fill_buffer(&mut self, ctx: &mut DemuxContext, want: Option<StreamKind>) -> Result<bool> {
        match self {
            Container::Avi(d) => d.fill_buffer(ctx, want),
            Container::Mpeg(d) => d.fill_buffer(ctx),
            Container::Asf(d) => d.fill_buffer(ctx),
        }
    }

    fn seek(&mut self, ctx: &mut DemuxContext, target: f64) -> Result<()> {
        match self {
            Container::Avi(d) => d.seek(ctx, target),
            Container::Mpeg(d) => d.seek(ctx, target),
            Container::Asf(d) => d.seek(ctx, target),
        }
    }

    /// Push out whatever was still being reassembled.
    fn flush_partials(&mut self, ctx: &mut DemuxContext) -> usize {
        match self {
            Container::Asf(d) => d.flush_partials(ctx),
            Container::Avi(_) | Container::Mpeg(_) => 0,
        }
    }
}

// ============================================================================
// Demuxer Facade
// ============================================================================

/// Packet currently being drained by `read_data`.
struct ReadCursor {
    packet: Packet,
    offset: usize,
}

/// One open media source.
pub struct Demuxer {
    ctx: DemuxContext,
    container: Container,
    at_eof: bool,
    reading: [Option<ReadCursor>; 2],
}

fn slot(kind: StreamKind) -> usize {
    match kind {
        StreamKind::Audio => 0,
        StreamKind::Video => 1,
    }
}

fn with_cache(source: Box<dyn ByteSource>, config: &DemuxConfig) -> Result<Box<dyn ByteSource>> {
    let cache = match &config.cache {
        Some(cache) => cache.clone(),
        None if !source.is_seekable() => {
            tracing::debug!("Source is not seekable, using the network cache");
            CacheConfig::network()
        }
        None => return Ok(source),
    };
    Ok(cache::wrap(source, &cache)?)
}

impl Demuxer {
    /// Open `uri`, with the read-ahead cache if the config asks for it.
    pub fn open(uri: &str, config: DemuxConfig) -> Result<Self> {
        Self::open_source(source::open(uri)?, config)
    }

    /// Demux an already opened source. `config.cache` wraps it in a
    /// read-ahead cache; forward-only sources get the network cache even
    /// when none is configured.
    pub fn open_source(source: Box<dyn ByteSource>, config: DemuxConfig) -> Result<Self> {
        let source = with_cache(source, &config)?;
        let mut input = MediaStream::new(source);
        let format = detect::detect(&mut input, config.detect_prefix)?;
        let mut ctx = DemuxContext::new(input, format, config);
        let container = Container::open(&mut ctx)?;

        tracing::info!(
            "Opened {}: {} audio, {} video stream(s), duration {:?}",
            format,
            ctx.info.audio.len(),
            ctx.info.video.len(),
            ctx.info.duration
        );

        Ok(Self {
            ctx,
            container,
            at_eof: false,
            reading: [None, None],
        })
    }

    pub fn format(&self) -> ContainerFormat {
        self.ctx.info.format
    }

    pub fn info(&self) -> &MediaInfo {
        &self.ctx.info
    }

    pub fn duration(&self) -> Option<f64> {
        self.ctx.info.duration
    }

    pub fn stats(&self) -> &DemuxStats {
        &self.ctx.stats
    }

    pub fn sync_state(&self) -> SyncState {
        self.ctx.sync
    }

    pub fn seek_index(&self) -> &SeekIndex {
        &self.ctx.index
    }

    /// All streams of `kind` the container announced.
    pub fn streams(&self, kind: StreamKind) -> &[StreamInfo] {
        match kind {
            StreamKind::Audio => &self.ctx.info.audio,
            StreamKind::Video => &self.ctx.info.video,
        }
    }

    pub fn last_error(&self) -> Option<&DemuxError> {
        self.ctx.last_error.as_ref()
    }

    pub fn take_last_error(&mut self) -> Option<DemuxError> {
        self.ctx.last_error.take()
    }

    // ========================================================================
    // Stream Selection
    // ========================================================================

    /// The stream feeding `kind`, selecting the first available one if needed.
    pub fn select_stream(&mut self, kind: StreamKind) -> Option<StreamId> {
        self.ctx.auto_select(kind);
        self.ctx.stream(kind).id().map(|id| StreamId { kind, id })
    }

    /// Switch `kind` to container stream `id`.
    pub fn select_stream_id(&mut self, kind: StreamKind, id: u32) -> Result<StreamId> {
        self.ctx.select(kind, id)?;
        self.reading[slot(kind)] = None;
        Ok(StreamId { kind, id })
    }

    /// Consumer handle for a decode thread.
    pub fn queue(&self, kind: StreamKind) -> PacketQueue {
        self.ctx.stream(kind).queue().clone()
    }

    pub fn pop_packet(&mut self, stream: StreamId) -> Option<Packet> {
        let ds = self.ctx.stream(stream.kind);
        if !ds.accepts(stream.id) {
            return None;
        }
        ds.queue().pop()
    }

    // ========================================================================
    // Demuxing
    // ========================================================================

    /// One demux step. Returns false at end of data or after a fatal error.
    pub fn fill_buffer(&mut self) -> bool {
        self.step(None)
    }

    fn step(&mut self, want: Option<StreamKind>) -> bool {
        if self.at_eof {
            return false;
        }
        match self.container.fill_buffer(&mut self.ctx, want) {
            Ok(true) => true,
            Ok(false) => self.finish(),
            Err(err) => {
                tracing::error!("{} demux stopped: {}", self.ctx.info.format, err);
                self.ctx.last_error = Some(err);
                self.finish();
                false
            }
        }
    }

    /// End of data: flush partial packets and close the queues.
    fn finish(&mut self) -> bool {
        let flushed = self.container.flush_partials(&mut self.ctx);
        self.ctx.audio.queue().signal_eos();
        self.ctx.video.queue().signal_eos();
        self.at_eof = true;
        tracing::debug!("End of stream ({} partial packets flushed)", flushed);
        flushed > 0
    }

    /// Demux until `kind` has a packet queued. Returns false once that
    /// stream has nothing more to give.
    pub fn fill_stream(&mut self, kind: StreamKind) -> bool {
        if !self.ctx.stream(kind).is_selected() {
            return false;
        }
        loop {
            let queue = self.ctx.stream(kind).queue();
            if !queue.is_empty() {
                return true;
            }
            if queue.is_eos() {
                return false;
            }
            if !self.step(Some(kind)) {
                return !self.ctx.stream(kind).queue().is_empty();
            }
        }
    }

    /// Next packet of `kind`, demuxing on demand.
    pub fn next_packet(&mut self, kind: StreamKind) -> Option<Packet> {
        if let Some(packet) = self.ctx.stream(kind).queue().pop() {
            return Some(packet);
        }
        if self.fill_stream(kind) {
            self.ctx.stream(kind).queue().pop()
        } else {
            None
        }
    }

    /// Copy elementary stream bytes of `kind`, crossing packet boundaries.
    /// Returns 0 at end of stream.
    pub fn read_data(&mut self, kind: StreamKind, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let mut cursor = match self.reading[slot(kind)].take() {
                Some(cursor) if cursor.offset < cursor.packet.len() => cursor,
                _ => match self.next_packet(kind) {
                    Some(packet) => ReadCursor { packet, offset: 0 },
                    None => break,
                },
            };
            let n = (cursor.packet.len() - cursor.offset).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&cursor.packet.data[cursor.offset..cursor.offset + n]);
            cursor.offset += n;
            done += n;
            self.reading[slot(kind)] = Some(cursor);
        }
        done
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    /// Reposition to `target` seconds. Queued and partial packets are dropped
    /// and the parser resynchronizes from the new position.
    pub fn seek(&mut self, target: f64) -> Result<()> {
        let target = target.max(0.0);
        tracing::debug!("Seek to {:.3}s", target);

        self.ctx.flush_streams();
        self.reading = [None, None];
        self.ctx.sync = SyncState::Probing;
        self.ctx.stats.seeks += 1;
        self.at_eof = false;

        self.container.seek(&mut self.ctx, target)
    }
}

/// Open a source, parse its headers and describe it as JSON.
pub fn probe(uri: &str, config: &DemuxConfig) -> Result<serde_json::Value> {
    let demuxer = Demuxer::open(uri, config.clone())?;
    Ok(serde_json::to_value(demuxer.info())?)
}
