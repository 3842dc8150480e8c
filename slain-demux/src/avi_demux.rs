// AVI DEMUXER - RIFF/AVI parser for the demux pipeline
//
// AVI is Microsoft's container from 1992.
// Still common for legacy content and screen recordings.
// Data lives in 'movi' chunks tagged ##dc / ##wb; an idx1 table (or the
// OpenDML indx / ix## pair) points at each one.
//
// Indexed files are read through per-stream cursors over the index so every
// chunk is validated against its entry before it is trusted. Files without a
// usable index are walked chunk by chunk, scanning forward for the next
// plausible chunk id when the structure breaks.

use std::io;

use bytes::Bytes;

use crate::demuxer::{DemuxContext, SyncState};
use crate::detect::ContainerFormat;
use crate::error::{DemuxError, Result};
use crate::index::{IndexEntry, IndexFlags, SeekIndex};
use crate::packet::Packet;
use crate::packet_queue::{StreamInfo, StreamKind};
use crate::stream::MediaStream;

// ============================================================================
// RIFF/AVI Constants
// ============================================================================

const RIFF: u32 = 0x46464952;  // "RIFF" little-endian
const AVI_: u32 = 0x20495641;  // "AVI " little-endian
const LIST: u32 = 0x5453494C;  // "LIST" little-endian
const HDRL: u32 = 0x6C726468;  // "hdrl" - header list
const AVIH: u32 = 0x68697661;  // "avih" - main AVI header
const STRL: u32 = 0x6C727473;  // "strl" - stream list
const STRH: u32 = 0x68727473;  // "strh" - stream header
const STRF: u32 = 0x66727473;  // "strf" - stream format
const STRN: u32 = 0x6E727473;  // "strn" - stream name
const INDX: u32 = 0x78646E69;  // "indx" - OpenDML super index
const MOVI: u32 = 0x69766F6D;  // "movi" - movie data
const IDX1: u32 = 0x31786469;  // "idx1" - index
const JUNK: u32 = 0x4B4E554A;  // "JUNK" - padding

// Stream types
const VIDS: u32 = 0x73646976;  // "vids" - video stream
const AUDS: u32 = 0x73647561;  // "auds" - audio stream

// Video codecs (FourCC)
const XVID: u32 = 0x44495658;
const DIVX: u32 = 0x58564944;
const DX50: u32 = 0x30355844;
const H264: u32 = 0x34363248;
const AVC1: u32 = 0x31435641;
const X264: u32 = 0x34363278;
const MJPG: u32 = 0x47504A4D;
const I420: u32 = 0x30323449;  // Raw YUV
const YV12: u32 = 0x32315659;
const CVID: u32 = 0x64697663;  // Cinepak
const IV50: u32 = 0x30355649;  // Intel Indeo 5

const AVIIF_KEYFRAME: u32 = 0x10;

// OpenDML index types
const AVI_INDEX_OF_INDEXES: u8 = 0x00;
const AVI_INDEX_OF_CHUNKS: u8 = 0x01;
const ODML_NON_KEY: u32 = 0x8000_0000;

/// Header chunks larger than this are skipped rather than loaded.
const MAX_HEADER_CHUNK: u32 = 16 * 1024 * 1024;
/// Data chunks larger than this are not trusted when the length is unknown.
const MAX_STREAMED_CHUNK: u32 = 64 * 1024 * 1024;

// ============================================================================
// Main Header (AVIH)
// ============================================================================

#[derive(Debug, Clone, Default)]
struct MainHeader {
    microsec_per_frame: u32,
    max_bytes_per_sec: u32,
    flags: u32,
    total_frames: u32,
    streams: u32,
    width: u32,
    height: u32,
}

impl MainHeader {
    fn parse(b: &[u8]) -> Self {
        Self {
            microsec_per_frame: le_u32(b, 0),
            max_bytes_per_sec: le_u32(b, 4),
            flags: le_u32(b, 12),
            total_frames: le_u32(b, 16),
            streams: le_u32(b, 24),
            width: le_u32(b, 32),
            height: le_u32(b, 36),
        }
    }
}

// ============================================================================
// Stream Header (STRH)
// ============================================================================

#[derive(Debug, Clone, Default)]
struct StreamHeader {
    fcc_type: u32,      // vids, auds, txts
    fcc_handler: u32,   // Codec FourCC
    flags: u32,
    scale: u32,
    rate: u32,
    start: u32,
    length: u32,
    sample_size: u32,
    // rcFrame rectangle (ignored)
}

impl StreamHeader {
    fn parse(b: &[u8]) -> Self {
        Self {
            fcc_type: le_u32(b, 0),
            fcc_handler: le_u32(b, 4),
            flags: le_u32(b, 8),
            scale: le_u32(b, 20),
            rate: le_u32(b, 24),
            start: le_u32(b, 28),
            length: le_u32(b, 32),
            sample_size: le_u32(b, 44),
        }
    }

    /// Presentation time of frame `n`, exact in integer units until the
    /// final division.
    fn frame_time(&self, n: u64) -> f64 {
        if self.rate == 0 {
            return 0.0;
        }
        (n * self.scale as u64) as f64 / self.rate as f64
    }

    /// Seconds of audio carried by a chunk of `len` bytes.
    fn chunk_duration(&self, len: u32) -> f64 {
        if self.rate == 0 {
            return 0.0;
        }
        if self.sample_size > 0 {
            ((len / self.sample_size) as u64 * self.scale as u64) as f64 / self.rate as f64
        } else {
            self.scale as f64 / self.rate as f64
        }
    }

    fn kind(&self) -> Option<StreamKind> {
        match self.fcc_type {
            VIDS => Some(StreamKind::Video),
            AUDS => Some(StreamKind::Audio),
            _ => None,
        }
    }
}

struct AviTrack {
    header: StreamHeader,
    info: StreamInfo,
    /// Offsets of this stream's ix## standard index chunks
    odml_indexes: Vec<u64>,
}

// ============================================================================
// Index Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkRef {
    ckid: u32,
    flags: u32,
    /// Absolute offset of the chunk header
    offset: u64,
    len: u32,
}

impl ChunkRef {
    fn stream(&self) -> Option<u32> {
        stream_of(self.ckid)
    }

    fn is_keyframe(&self) -> bool {
        self.flags & AVIIF_KEYFRAME != 0
    }
}

/// Stream number from a '##xx' chunk id.
fn stream_of(ckid: u32) -> Option<u32> {
    let b = ckid.to_le_bytes();
    if b[0].is_ascii_digit() && b[1].is_ascii_digit() {
        Some(((b[0] - b'0') * 10 + (b[1] - b'0')) as u32)
    } else {
        None
    }
}

fn chunk_suffix(ckid: u32) -> [u8; 2] {
    let b = ckid.to_le_bytes();
    [b[2], b[3]]
}

/// '##dc', '##db', '##wb', '##pc' or '##tx'.
fn is_data_chunk(ckid: u32) -> bool {
    stream_of(ckid).is_some() && matches!(&chunk_suffix(ckid), b"dc" | b"db" | b"wb" | b"pc" | b"tx")
}

/// Palette changes and text chunks carry no elementary stream data.
fn is_side_chunk(ckid: u32) -> bool {
    matches!(&chunk_suffix(ckid), b"pc" | b"tx")
}

/// 'ix##' OpenDML standard index chunk inside 'movi'.
fn is_odml_chunk(ckid: u32) -> bool {
    let b = ckid.to_le_bytes();
    b[0] == b'i' && b[1] == b'x'
}

/// Result of servicing one index entry.
enum Step {
    Emitted,
    Skipped,
    End,
}

// ============================================================================
// AVI Demuxer
// ============================================================================

pub struct AviDemuxer {
    main: MainHeader,
    tracks: Vec<AviTrack>,
    movi_start: u64,
    movi_end: u64,
    /// Index entries sorted by file offset; empty in sequential mode
    chunks: Vec<ChunkRef>,
    /// Presentation time of each entry in `chunks`
    times: Vec<f64>,
    /// Next index entry to inspect, per channel
    cursors: [usize; 2],
    non_interleaved: bool,
    video_frame: u64,
    audio_clock: f64,
    mismatches: u32,
    mismatch_bytes: u64,
}

fn slot(kind: StreamKind) -> usize {
    match kind {
        StreamKind::Audio => 0,
        StreamKind::Video => 1,
    }
}

fn is_eof(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}

fn read_chunk_header(input: &mut MediaStream) -> io::Result<(u32, u32)> {
    let fourcc = input.read_u32_le()?;
    let size = input.read_u32_le()?;
    Ok((fourcc, size))
}

/// Skip a chunk body, honouring RIFF word alignment.
fn skip_chunk(input: &mut MediaStream, size: u64) -> io::Result<()> {
    input.skip(size + (size & 1))
}

/// Whether a chunk of `len` bytes at `offset` can be read at all.
fn chunk_fits(input: &MediaStream, offset: u64, len: u32) -> bool {
    match input.len() {
        Some(total) => offset + 8 + len as u64 <= total,
        None => len <= MAX_STREAMED_CHUNK,
    }
}

impl AviDemuxer {
    pub fn open(ctx: &mut DemuxContext) -> Result<Self> {
        let mut demuxer = Self {
            main: MainHeader::default(),
            tracks: Vec::new(),
            movi_start: 0,
            movi_end: 0,
            chunks: Vec::new(),
            times: Vec::new(),
            cursors: [0, 0],
            non_interleaved: false,
            video_frame: 0,
            audio_clock: 0.0,
            mismatches: 0,
            mismatch_bytes: 0,
        };

        let mut idx1 = Vec::new();
        {
            let input = &mut ctx.input;
            let riff = input.read_u32_le()?;
            let _file_size = input.read_u32_le()?;
            let form = input.read_u32_le()?;
            if riff != RIFF || form != AVI_ {
                return Err(DemuxError::invalid(ContainerFormat::Avi, "missing RIFF 'AVI ' header"));
            }
            demuxer.parse_chunks(input, &mut idx1)?;
        }

        if demuxer.movi_start == 0 {
            return Err(DemuxError::invalid(ContainerFormat::Avi, "no 'movi' list"));
        }
        if demuxer.tracks.is_empty() {
            return Err(DemuxError::invalid(ContainerFormat::Avi, "no stream headers"));
        }

        let mut chunks = if ctx.input.is_seekable() {
            demuxer.read_odml_index(&mut ctx.input)
        } else {
            Vec::new()
        };
        if chunks.is_empty() && !idx1.is_empty() {
            chunks = demuxer.rebase_idx1(idx1);
        }
        chunks.sort_by_key(|c| c.offset);
        demuxer.chunks = chunks;

        for track in &demuxer.tracks {
            if let Some(kind) = track.header.kind() {
                ctx.discover(kind, track.info.clone());
            }
        }
        ctx.auto_select(StreamKind::Video);
        ctx.auto_select(StreamKind::Audio);

        demuxer.detect_interleaving(ctx);
        demuxer.times = demuxer.chunk_times(ctx);
        if !demuxer.chunks.is_empty() {
            ctx.index = demuxer.build_seek_index(ctx);
        }
        ctx.info.indexed = !demuxer.chunks.is_empty();
        ctx.info.duration = demuxer.duration();

        ctx.input.seek(demuxer.movi_start)?;
        ctx.sync = SyncState::Synced;

        tracing::info!(
            "AVI: {} stream(s), {}x{}, {} index entries{}",
            demuxer.tracks.len(),
            demuxer.main.width,
            demuxer.main.height,
            demuxer.chunks.len(),
            if demuxer.non_interleaved { ", non-interleaved" } else { "" }
        );
        Ok(demuxer)
    }

    // ========================================================================
    // Header Parsing
    // ========================================================================

    fn parse_chunks(&mut self, input: &mut MediaStream, idx1: &mut Vec<ChunkRef>) -> Result<()> {
        loop {
            let (fourcc, size) = match read_chunk_header(input) {
                Ok(h) => h,
                Err(e) if is_eof(&e) => break,
                Err(e) => return Err(e.into()),
            };

            match fourcc {
                LIST => {
                    let list_type = input.read_u32_le()?;
                    let body = size.saturating_sub(4) as u64;
                    match list_type {
                        HDRL => self.parse_hdrl(input, body)?,
                        MOVI if self.movi_start == 0 => {
                            self.movi_start = input.tell();
                            self.movi_end = self.movi_start + body;
                            if !input.is_seekable() {
                                // Cannot come back for idx1; read the data linearly.
                                return Ok(());
                            }
                            skip_chunk(input, body)?;
                        }
                        _ => skip_chunk(input, body)?,
                    }
                }
                IDX1 => self.parse_idx1(input, size, idx1)?,
                // 'RIFF' 'AVIX' extensions are reached through the OpenDML index.
                _ => skip_chunk(input, size as u64)?,
            }

            if input.len().is_some_and(|len| input.tell() + 8 > len) {
                break;
            }
        }
        Ok(())
    }

    fn parse_hdrl(&mut self, input: &mut MediaStream, size: u64) -> Result<()> {
        let end = input.tell() + size;

        while input.tell() + 8 <= end {
            let fourcc = input.read_u32_le()?;
            let chunk_size = input.read_u32_le()?;

            match fourcc {
                AVIH if chunk_size <= MAX_HEADER_CHUNK => {
                    let body = input.read_vec(chunk_size as usize)?;
                    self.main = MainHeader::parse(&body);
                    if chunk_size & 1 == 1 {
                        input.skip(1)?;
                    }
                }
                LIST => {
                    let list_type = input.read_u32_le()?;
                    let body = chunk_size.saturating_sub(4) as u64;
                    if list_type == STRL {
                        self.parse_strl(input, body)?;
                    } else {
                        skip_chunk(input, body)?;
                    }
                }
                _ => skip_chunk(input, chunk_size as u64)?,
            }
        }

        if input.tell() != end {
            input.seek(end)?;
        }
        tracing::debug!(
            "avih: {} us/frame, {} frames, {} streams, flags {:#x}, {} B/s",
            self.main.microsec_per_frame,
            self.main.total_frames,
            self.main.streams,
            self.main.flags,
            self.main.max_bytes_per_sec
        );
        Ok(())
    }

    fn parse_strl(&mut self, input: &mut MediaStream, size: u64) -> Result<()> {
        let end = input.tell() + size;
        let mut track = AviTrack {
            header: StreamHeader::default(),
            info: StreamInfo {
                id: self.tracks.len() as u32,
                ..Default::default()
            },
            odml_indexes: Vec::new(),
        };

        while input.tell() + 8 <= end {
            let fourcc = input.read_u32_le()?;
            let chunk_size = input.read_u32_le()?;
            if !matches!(fourcc, STRH | STRF | STRN | INDX) || chunk_size > MAX_HEADER_CHUNK {
                skip_chunk(input, chunk_size as u64)?;
                continue;
            }

            let body = input.read_vec(chunk_size as usize)?;
            if chunk_size & 1 == 1 {
                input.skip(1)?;
            }

            match fourcc {
                STRH => {
                    track.header = StreamHeader::parse(&body);
                    let h = &track.header;
                    if h.kind() == Some(StreamKind::Video) && h.scale > 0 {
                        track.info.fps = h.rate as f64 / h.scale as f64;
                    }
                }
                STRF => {
                    match track.header.kind() {
                        Some(StreamKind::Video) => parse_bitmap_info(&body, &mut track.info),
                        Some(StreamKind::Audio) => parse_wave_format(&body, &mut track.info),
                        None => {}
                    }
                    track.info.header = Bytes::from(body);
                }
                STRN => {
                    let name: Vec<u8> = body.into_iter().take_while(|&b| b != 0).collect();
                    track.info.name = Some(String::from_utf8_lossy(&name).into_owned());
                }
                INDX => track.odml_indexes = parse_super_index(&body),
                _ => {}
            }
        }

        if track.info.codec.is_empty() {
            track.info.codec = fourcc_to_string(track.header.fcc_handler);
        }
        tracing::debug!(
            "strl {}: type {}, handler {}, scale {}/{}, start {}, length {}, flags {:#x}",
            track.info.id,
            fourcc_to_string(track.header.fcc_type),
            fourcc_to_string(track.header.fcc_handler),
            track.header.scale,
            track.header.rate,
            track.header.start,
            track.header.length,
            track.header.flags
        );

        self.tracks.push(track);
        if input.tell() != end {
            input.seek(end)?;
        }
        Ok(())
    }

    fn parse_idx1(&mut self, input: &mut MediaStream, size: u32, out: &mut Vec<ChunkRef>) -> Result<()> {
        let count = size / 16;
        out.reserve(count as usize);
        for _ in 0..count {
            let ckid = input.read_u32_le()?;
            let flags = input.read_u32_le()?;
            let offset = input.read_u32_le()? as u64;
            let len = input.read_u32_le()?;
            // 'rec ' list entries and the like carry no data.
            if stream_of(ckid).is_some() {
                out.push(ChunkRef { ckid, flags, offset, len });
            }
        }
        skip_chunk(input, (size % 16) as u64)?;
        tracing::debug!("idx1: {} entries", out.len());
        Ok(())
    }

    /// idx1 offsets are relative to the 'movi' fourcc in most files and
    /// absolute in some; the first entry tells which.
    fn rebase_idx1(&self, mut entries: Vec<ChunkRef>) -> Vec<ChunkRef> {
        let base = match entries.first() {
            Some(first) if first.offset < self.movi_start => self.movi_start - 4,
            _ => 0,
        };
        for entry in &mut entries {
            entry.offset += base;
        }
        entries
    }

    /// Load every ix## chunk named by the per-stream super indexes.
    fn read_odml_index(&self, input: &mut MediaStream) -> Vec<ChunkRef> {
        let mut chunks = Vec::new();
        for track in &self.tracks {
            for &offset in &track.odml_indexes {
                match read_standard_index(input, offset) {
                    Ok(entries) => chunks.extend(entries),
                    Err(e) => tracing::warn!("Unreadable OpenDML index at {:#x}: {}", offset, e),
                }
            }
        }
        if !chunks.is_empty() {
            tracing::debug!("OpenDML index: {} entries", chunks.len());
        }
        chunks
    }

    fn detect_interleaving(&mut self, ctx: &DemuxContext) {
        let config = &ctx.config.avi;
        let first = |kind: StreamKind| {
            let id = ctx.stream(kind).id()?;
            self.chunks.iter().find(|c| c.stream() == Some(id)).map(|c| c.offset)
        };
        self.non_interleaved = match (first(StreamKind::Audio), first(StreamKind::Video)) {
            (Some(a), Some(v)) => {
                config.force_non_interleaved || a.abs_diff(v) > config.non_interleaved_threshold
            }
            _ => config.force_non_interleaved,
        };
        if self.non_interleaved && !config.force_non_interleaved {
            tracing::info!("Non-interleaved AVI: streams serviced by timestamp");
        }
    }

    fn track(&self, id: u32) -> Option<&AviTrack> {
        self.tracks.get(id as usize)
    }

    /// Seek table from the embedded index, over the primary stream.
    fn build_seek_index(&self, ctx: &DemuxContext) -> SeekIndex {
        let kind = ctx.primary_kind();
        let Some(id) = ctx.stream(kind).id() else {
            return SeekIndex::new();
        };
        if self.track(id).is_none() {
            return SeekIndex::new();
        }

        let entries = self
            .chunks
            .iter()
            .zip(&self.times)
            .filter(|(c, _)| c.stream() == Some(id) && !is_side_chunk(c.ckid))
            .enumerate()
            .map(|(n, (chunk, &pts))| IndexEntry {
                pts,
                seq: n as u64,
                offset: chunk.offset,
                flags: if kind == StreamKind::Audio || chunk.is_keyframe() {
                    IndexFlags::SYNC
                } else {
                    IndexFlags::empty()
                },
            })
            .collect();
        SeekIndex::from_embedded(entries)
    }

    /// Timestamps of all index entries, walked in file order so they do not
    /// depend on which stream is read first. Video counts frames; audio runs
    /// a clock per stream that interleaved files move forward to the video
    /// frame preceding it.
    fn chunk_times(&self, ctx: &DemuxContext) -> Vec<f64> {
        let anchor = ctx.video.id();
        let mut frames = vec![0u64; self.tracks.len()];
        let mut clocks = vec![0.0f64; self.tracks.len()];
        let mut video_pts = 0.0f64;

        self.chunks
            .iter()
            .map(|chunk| {
                let Some(id) = chunk.stream().filter(|&id| (id as usize) < self.tracks.len()) else {
                    return 0.0;
                };
                let t = id as usize;
                let header = &self.tracks[t].header;
                match header.kind() {
                    Some(StreamKind::Video) => {
                        let pts = header.frame_time(frames[t]);
                        frames[t] += 1;
                        if anchor == Some(id) {
                            video_pts = pts;
                        }
                        pts
                    }
                    Some(StreamKind::Audio) => {
                        if !self.non_interleaved && clocks[t] < video_pts {
                            clocks[t] = video_pts;
                        }
                        let pts = clocks[t];
                        clocks[t] += header.chunk_duration(chunk.len);
                        pts
                    }
                    None => 0.0,
                }
            })
            .collect()
    }

    fn duration(&self) -> Option<f64> {
        let video = self.tracks.iter().find(|t| t.header.kind() == Some(StreamKind::Video));
        if let Some(t) = video.filter(|t| t.header.rate > 0 && t.header.length > 0) {
            return Some(t.header.frame_time(t.header.length as u64));
        }
        if self.main.microsec_per_frame > 0 && self.main.total_frames > 0 {
            return Some(self.main.total_frames as f64 * self.main.microsec_per_frame as f64 / 1e6);
        }
        None
    }

    // ========================================================================
    // Packet Reading
    // ========================================================================

    /// Read one chunk into its queue. With `want`, only that channel is
    /// serviced and its queue is closed once its index entries run out.
    pub fn fill_buffer(&mut self, ctx: &mut DemuxContext, want: Option<StreamKind>) -> Result<bool> {
        if self.chunks.is_empty() {
            return self.fill_sequential(ctx);
        }

        loop {
            let kind = match want {
                Some(kind) => kind,
                None => match self.next_kind(ctx) {
                    Some(kind) => kind,
                    None => return Ok(false),
                },
            };
            let Some(i) = self.next_entry(ctx, kind) else {
                if want.is_some() {
                    ctx.stream(kind).queue().signal_eos();
                    return Ok(true);
                }
                return Ok(false);
            };
            self.cursors[slot(kind)] = i + 1;

            match self.read_indexed(ctx, kind, i)? {
                Step::Emitted => return Ok(true),
                Step::Skipped => continue,
                Step::End => return Ok(false),
            }
        }
    }

    /// Index position of the next entry for `kind`'s selected stream.
    fn next_entry(&mut self, ctx: &DemuxContext, kind: StreamKind) -> Option<usize> {
        let id = ctx.stream(kind).id()?;
        let start = self.cursors[slot(kind)].min(self.chunks.len());
        match self.chunks[start..].iter().position(|c| c.stream() == Some(id)) {
            Some(rel) => {
                self.cursors[slot(kind)] = start + rel;
                Some(start + rel)
            }
            None => {
                self.cursors[slot(kind)] = self.chunks.len();
                None
            }
        }
    }

    /// File order when interleaved, the stream that is behind otherwise.
    fn next_kind(&mut self, ctx: &DemuxContext) -> Option<StreamKind> {
        let audio = self.next_entry(ctx, StreamKind::Audio);
        let video = self.next_entry(ctx, StreamKind::Video);
        match (audio, video) {
            (None, None) => None,
            (Some(_), None) => Some(StreamKind::Audio),
            (None, Some(_)) => Some(StreamKind::Video),
            (Some(a), Some(v)) => {
                let audio_first = if self.non_interleaved {
                    self.times[a] <= self.times[v]
                } else {
                    a < v
                };
                Some(if audio_first { StreamKind::Audio } else { StreamKind::Video })
            }
        }
    }

    fn read_indexed(&mut self, ctx: &mut DemuxContext, kind: StreamKind, i: usize) -> Result<Step> {
        let entry = self.chunks[i];
        let pts = self.times[i];
        if is_side_chunk(entry.ckid) {
            return Ok(Step::Skipped);
        }
        if ctx.input.len().is_some_and(|len| entry.offset + 8 > len) {
            tracing::debug!("Index entry at {:#x} lies past end of file", entry.offset);
            return Ok(Step::End);
        }

        let data = match Self::read_checked(&mut ctx.input, &entry) {
            Ok(Ok(data)) => data,
            Ok(Err(reason)) => {
                self.mismatches += 1;
                self.mismatch_bytes += entry.len as u64;
                ctx.note(DemuxError::ChunkCorrupt {
                    offset: entry.offset,
                    reason,
                });
                if self.mismatches > ctx.config.avi.max_index_mismatches {
                    return Err(DemuxError::DemuxDesync {
                        format: ContainerFormat::Avi,
                        skipped: self.mismatch_bytes,
                    });
                }
                return Ok(Step::Skipped);
            }
            Err(e) if is_eof(&e) => {
                tracing::debug!("Truncated chunk at {:#x}", entry.offset);
                return Ok(Step::End);
            }
            Err(e) => return Err(e.into()),
        };
        self.mismatches = 0;
        self.mismatch_bytes = 0;

        ctx.sync = SyncState::Synced;
        if data.is_empty() {
            return Ok(Step::Skipped);
        }

        let keyframe = kind == StreamKind::Audio || entry.is_keyframe();
        let stream = entry.stream().unwrap_or_default();
        ctx.emit(kind, Packet::new(stream, data, Some(pts), entry.offset).with_keyframe(keyframe));
        Ok(Step::Emitted)
    }

    /// Read the chunk an index entry points at. The inner error is a
    /// validation failure; the outer one is I/O.
    fn read_checked(input: &mut MediaStream, entry: &ChunkRef) -> io::Result<std::result::Result<Vec<u8>, String>> {
        input.seek(entry.offset)?;
        let ckid = input.read_u32_le()?;
        let len = input.read_u32_le()?;
        if ckid != entry.ckid {
            return Ok(Err(format!(
                "chunk id '{}' where index expects '{}'",
                fourcc_to_string(ckid),
                fourcc_to_string(entry.ckid)
            )));
        }
        if len.abs_diff(entry.len) > 1 {
            return Ok(Err(format!("length {} where index expects {}", len, entry.len)));
        }
        if !chunk_fits(input, entry.offset, len) {
            return Ok(Err(format!("length {} runs past end of file", len)));
        }
        Ok(Ok(input.read_vec(len as usize)?))
    }

    /// Timestamp of a chunk met by the linear walk, moving the stream clock
    /// past it.
    fn advance_clock(&mut self, kind: StreamKind, entry: &ChunkRef) -> f64 {
        let Some(header) = entry.stream().and_then(|id| self.track(id)).map(|t| t.header.clone()) else {
            return 0.0;
        };
        match kind {
            StreamKind::Video => {
                let pts = header.frame_time(self.video_frame);
                self.video_frame += 1;
                if !self.non_interleaved {
                    self.audio_clock = self.audio_clock.max(pts);
                }
                pts
            }
            StreamKind::Audio => {
                let pts = self.audio_clock;
                self.audio_clock += header.chunk_duration(entry.len);
                pts
            }
        }
    }

    /// Walk 'movi' chunk by chunk when there is no index to follow.
    fn fill_sequential(&mut self, ctx: &mut DemuxContext) -> Result<bool> {
        loop {
            let pos = ctx.input.tell();
            if pos + 8 > self.movi_end || ctx.input.eof() {
                return Ok(false);
            }
            let (ckid, len) = match read_chunk_header(&mut ctx.input) {
                Ok(h) => h,
                Err(e) if is_eof(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            let fits = pos + 8 + len as u64 <= self.movi_end && chunk_fits(&ctx.input, pos, len);

            match ckid {
                LIST if fits => {
                    // Descend into 'rec ' groups.
                    ctx.input.read_u32_le()?;
                }
                JUNK | IDX1 if fits => skip_chunk(&mut ctx.input, len as u64)?,
                _ if is_odml_chunk(ckid) && fits => skip_chunk(&mut ctx.input, len as u64)?,
                _ if is_data_chunk(ckid) && fits => {
                    let stream = stream_of(ckid).unwrap_or_default();
                    let kind = match ctx.route(stream) {
                        Some(kind) if !is_side_chunk(ckid) => kind,
                        _ => {
                            skip_chunk(&mut ctx.input, len as u64)?;
                            continue;
                        }
                    };
                    let data = match ctx.input.read_vec(len as usize) {
                        Ok(data) => data,
                        Err(e) if is_eof(&e) => return Ok(false),
                        Err(e) => return Err(e.into()),
                    };
                    if len & 1 == 1 {
                        ctx.input.skip(1)?;
                    }

                    let entry = ChunkRef {
                        ckid,
                        flags: AVIIF_KEYFRAME,
                        offset: pos,
                        len,
                    };
                    let pts = self.advance_clock(kind, &entry);
                    ctx.sync = SyncState::Synced;
                    if data.is_empty() {
                        continue;
                    }
                    // Without an index every video chunk is treated as a sync point.
                    let packet = Packet::new(stream, data, Some(pts), pos).with_keyframe(true);
                    ctx.emit(kind, packet);
                    return Ok(true);
                }
                _ => {
                    if !self.resync(ctx, pos)? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Scan forward from `start` for the next plausible chunk header.
    fn resync(&mut self, ctx: &mut DemuxContext, start: u64) -> Result<bool> {
        tracing::debug!("AVI structure broken at {:#x}, scanning for next chunk", start);
        ctx.sync = SyncState::Unsynced;
        ctx.input.seek(start + 1)?;

        let budget = ctx.config.avi.resync_budget;
        let mut window = 0u32;
        let mut scanned = 0u64;
        loop {
            let Some(b) = ctx.input.next_byte()? else {
                return Ok(false);
            };
            window = (window >> 8) | ((b as u32) << 24);
            scanned += 1;

            if scanned >= 4 && (is_data_chunk(window) || window == LIST) {
                let at = ctx.input.tell() - 4;
                ctx.input.seek(at)?;
                ctx.stats.skipped_bytes += at - start;
                ctx.stats.resyncs += 1;
                ctx.sync = SyncState::Probing;
                tracing::debug!("AVI resynced at {:#x} after {} bytes", at, at - start);
                return Ok(true);
            }
            if scanned > budget {
                ctx.stats.skipped_bytes += scanned;
                return Err(DemuxError::DemuxDesync {
                    format: ContainerFormat::Avi,
                    skipped: scanned,
                });
            }
        }
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    pub fn seek(&mut self, ctx: &mut DemuxContext, target: f64) -> Result<()> {
        self.mismatches = 0;
        self.mismatch_bytes = 0;
        if self.chunks.is_empty() {
            return self.seek_sequential(ctx, target);
        }

        let entry = ctx.index.lookup(target).and_then(|h| ctx.index.get(h)).copied();
        let (offset, pts) = match entry {
            Some(e) => (e.offset, e.pts),
            None => (self.movi_start, 0.0),
        };
        let at = self.chunks.partition_point(|c| c.offset < offset);
        self.cursors = [at, at];
        if ctx.primary_kind() == StreamKind::Video {
            self.position_audio(ctx, pts);
        }

        tracing::debug!("AVI seek to {:.3}s: entry at {:#x}, pts {:.3}", target, offset, pts);
        ctx.input.seek(offset)?;
        Ok(())
    }

    /// Point the audio cursor at the chunk playing at `pts`.
    fn position_audio(&mut self, ctx: &DemuxContext, pts: f64) {
        let Some(id) = ctx.audio.id() else {
            return;
        };
        let Some(header) = self.track(id).map(|t| t.header.clone()) else {
            return;
        };

        let found = self
            .chunks
            .iter()
            .zip(&self.times)
            .position(|(c, &t)| c.stream() == Some(id) && t + header.chunk_duration(c.len) > pts);
        self.cursors[slot(StreamKind::Audio)] = found.unwrap_or(self.chunks.len());
    }

    /// No index: go back to a chunk seen earlier, or guess from the byte rate
    /// and let resync find the next chunk.
    fn seek_sequential(&mut self, ctx: &mut DemuxContext, target: f64) -> Result<()> {
        let known = ctx.index.lookup(target).and_then(|h| ctx.index.get(h)).copied();
        let (pos, pts) = match known {
            Some(e) if ctx.index.last().is_some_and(|last| target <= last.pts) => (e.offset, e.pts),
            _ => {
                let span = self.movi_end.saturating_sub(self.movi_start);
                let fraction = match self.duration() {
                    Some(d) if d > 0.0 => (target / d).clamp(0.0, 1.0),
                    _ => 0.0,
                };
                let guess = self.movi_start + (span as f64 * fraction) as u64;
                (guess.min(self.movi_end.saturating_sub(8)).max(self.movi_start), target)
            }
        };

        if let Some(track) = ctx.video.id().and_then(|id| self.track(id)) {
            let h = &track.header;
            self.video_frame = if h.scale > 0 {
                (pts * h.rate as f64 / h.scale as f64).round() as u64
            } else {
                0
            };
        }
        self.audio_clock = pts;

        tracing::debug!("AVI sequential seek to {:.3}s: byte {:#x}", target, pos);
        ctx.input.seek(pos)?;
        Ok(())
    }
}

// ============================================================================
// OpenDML Index
// ============================================================================

/// Offsets of the standard index chunks listed in an 'indx' super index.
fn parse_super_index(b: &[u8]) -> Vec<u64> {
    let longs_per_entry = le_u16(b, 0);
    let index_type = b.get(3).copied().unwrap_or(0xFF);
    let entries = le_u32(b, 4) as usize;
    if index_type != AVI_INDEX_OF_INDEXES || longs_per_entry != 4 {
        return Vec::new();
    }
    (0..entries)
        .map(|i| 24 + i * 16)
        .take_while(|&at| at + 16 <= b.len())
        .map(|at| le_u64(b, at))
        .filter(|&offset| offset > 0)
        .collect()
}

fn read_standard_index(input: &mut MediaStream, offset: u64) -> io::Result<Vec<ChunkRef>> {
    input.seek(offset)?;
    let fourcc = input.read_u32_le()?;
    let size = input.read_u32_le()?;
    if !is_odml_chunk(fourcc) || size > MAX_HEADER_CHUNK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("'{}' is not a standard index", fourcc_to_string(fourcc)),
        ));
    }
    let b = input.read_vec(size as usize)?;

    let longs_per_entry = le_u16(&b, 0) as usize;
    let index_type = b.get(3).copied().unwrap_or(0xFF);
    let entries = le_u32(&b, 4) as usize;
    let ckid = le_u32(&b, 8);
    let base = le_u64(&b, 12);
    if index_type != AVI_INDEX_OF_CHUNKS || longs_per_entry < 2 {
        return Ok(Vec::new());
    }

    let stride = longs_per_entry * 4;
    Ok((0..entries)
        .map(|i| 24 + i * stride)
        .take_while(|&at| at + 8 <= b.len())
        .filter_map(|at| {
            let off = le_u32(&b, at) as u64;
            let size = le_u32(&b, at + 4);
            // Entries point at the data; the chunk header sits 8 bytes earlier.
            (base + off).checked_sub(8).map(|header| ChunkRef {
                ckid,
                flags: if size & ODML_NON_KEY == 0 { AVIIF_KEYFRAME } else { 0 },
                offset: header,
                len: size & !ODML_NON_KEY,
            })
        })
        .collect())
}

// ============================================================================
// Helper Functions
// ============================================================================

pub(crate) fn le_u16(b: &[u8], at: usize) -> u16 {
    b.get(at..at + 2).map_or(0, |s| u16::from_le_bytes([s[0], s[1]]))
}

pub(crate) fn le_u32(b: &[u8], at: usize) -> u32 {
    b.get(at..at + 4).map_or(0, |s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

pub(crate) fn le_u64(b: &[u8], at: usize) -> u64 {
    b.get(at..at + 8).map_or(0, |s| {
        let mut v = [0u8; 8];
        v.copy_from_slice(s);
        u64::from_le_bytes(v)
    })
}

pub(crate) fn fourcc_to_string(fourcc: u32) -> String {
    let bytes = fourcc.to_le_bytes();
    bytes.iter()
        .filter(|&&b| b.is_ascii_graphic() || b == b' ')
        .map(|&b| b as char)
        .collect()
}

fn identify_codec(fourcc: u32) -> Option<&'static str> {
    let upper = u32::from_le_bytes(fourcc.to_le_bytes().map(|b| b.to_ascii_uppercase()));
    match upper {
        H264 | AVC1 | X264 => Some("h264"),
        XVID | DIVX | DX50 => Some("mpeg4"),
        MJPG => Some("mjpeg"),
        I420 | YV12 => Some("rawvideo"),
        CVID => Some("cinepak"),
        IV50 => Some("indeo5"),
        _ => None,
    }
}

/// Codec name for a WAVEFORMATEX format tag.
pub(crate) fn wave_format_name(tag: u16) -> String {
    match tag {
        0x0001 => "pcm".to_string(),
        0x0055 => "mp3".to_string(),
        0x2000 => "ac3".to_string(),
        0x00FF => "aac".to_string(),
        0x0160 => "wmav1".to_string(),
        0x0161 => "wmav2".to_string(),
        other => format!("0x{:04x}", other),
    }
}

/// BITMAPINFOHEADER
pub(crate) fn parse_bitmap_info(b: &[u8], info: &mut StreamInfo) {
    if b.len() < 20 {
        return;
    }
    info.width = (le_u32(b, 4) as i32).unsigned_abs();
    info.height = (le_u32(b, 8) as i32).unsigned_abs();
    info.bits_per_sample = le_u16(b, 14);
    let compression = le_u32(b, 16);
    info.codec = identify_codec(compression)
        .map(str::to_string)
        .unwrap_or_else(|| fourcc_to_string(compression));
}

/// WAVEFORMATEX
pub(crate) fn parse_wave_format(b: &[u8], info: &mut StreamInfo) {
    if b.len() < 14 {
        return;
    }
    info.codec = wave_format_name(le_u16(b, 0));
    info.channels = le_u16(b, 2);
    info.sample_rate = le_u32(b, 4);
    info.bits_per_sample = le_u16(b, 14);
}
