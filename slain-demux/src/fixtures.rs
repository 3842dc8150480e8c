//! Synthetic inputs for unit tests: byte sources that count or fail, and
//! builders for small AVI, MPEG-PS and ASF files.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BufMut;

use crate::asf_demux::{
    AUDIO_MEDIA_GUID, AUDIO_SPREAD_GUID, DATA_GUID, FILE_PROPERTIES_GUID, SIMPLE_INDEX_GUID,
    STREAM_PROPERTIES_GUID, VIDEO_MEDIA_GUID,
};
use crate::source::ByteSource;

/// Deterministic pseudo-random bytes.
pub fn lcg_bytes(seed: u64, n: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

// ============================================================================
// Counting Source
// ============================================================================

#[derive(Clone, Default)]
pub struct Counters {
    reads: Arc<AtomicUsize>,
    seeks: Arc<AtomicUsize>,
}

impl Counters {
    /// (reads, seeks) issued so far.
    pub fn snapshot(&self) -> (usize, usize) {
        (self.reads.load(Ordering::SeqCst), self.seeks.load(Ordering::SeqCst))
    }
}

/// Wraps a source, counting calls and optionally failing after a byte budget
/// or refusing to seek backwards.
pub struct CountingSource<S: ByteSource> {
    inner: S,
    counters: Counters,
    fail_after: Option<usize>,
    delivered: usize,
    forward_only: bool,
}

impl<S: ByteSource> CountingSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            counters: Counters::default(),
            fail_after: None,
            delivered: 0,
            forward_only: false,
        }
    }

    pub fn fail_after(mut self, bytes: usize) -> Self {
        self.fail_after = Some(bytes);
        self
    }

    /// Behave like a socket: not seekable, and backward seeks fail.
    pub fn forward_only(mut self) -> Self {
        self.forward_only = true;
        self
    }

    pub fn counters(&self) -> Counters {
        self.counters.clone()
    }
}

impl<S: ByteSource> ByteSource for CountingSource<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let mut want = buf.len();
        if let Some(limit) = self.fail_after {
            let left = limit.saturating_sub(self.delivered);
            if left == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected read failure"));
            }
            want = want.min(left);
        }
        let n = self.inner.read(&mut buf[..want])?;
        self.delivered += n;
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.counters.seeks.fetch_add(1, Ordering::SeqCst);
        if self.forward_only && pos < self.inner.tell() {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "backward seek on forward-only source"));
        }
        self.inner.seek(pos)
    }

    fn tell(&self) -> u64 {
        self.inner.tell()
    }

    fn eof(&self) -> bool {
        self.inner.eof()
    }

    fn len(&self) -> Option<u64> {
        self.inner.len()
    }

    fn is_seekable(&self) -> bool {
        !self.forward_only && self.inner.is_seekable()
    }
}

// ============================================================================
// RIFF helpers
// ============================================================================

/// Open a chunk; returns the position of its size field.
fn begin(out: &mut Vec<u8>, fourcc: &[u8; 4]) -> usize {
    out.extend_from_slice(fourcc);
    let at = out.len();
    out.put_u32_le(0);
    at
}

/// Patch the size of a chunk opened with `begin` and word-align.
fn end(out: &mut Vec<u8>, at: usize) {
    let size = (out.len() - at - 4) as u32;
    out[at..at + 4].copy_from_slice(&size.to_le_bytes());
    if size & 1 == 1 {
        out.push(0);
    }
}

// ============================================================================
// AVI
// ============================================================================

#[derive(Clone, Copy)]
enum AviStream {
    Video { rate: u32, scale: u32 },
    Audio { sample_rate: u32, sample_size: u32 },
}

pub struct AviChunk {
    stream: u32,
    suffix: [u8; 2],
    data: Vec<u8>,
    keyframe: bool,
}

impl AviChunk {
    pub fn video(stream: u32, data: Vec<u8>, keyframe: bool) -> Self {
        Self {
            stream,
            suffix: *b"dc",
            data,
            keyframe,
        }
    }

    pub fn audio(stream: u32, data: Vec<u8>) -> Self {
        Self {
            stream,
            suffix: *b"wb",
            data,
            keyframe: true,
        }
    }

    fn ckid(&self) -> [u8; 4] {
        two_digit(self.stream, self.suffix)
    }
}

fn two_digit(stream: u32, suffix: [u8; 2]) -> [u8; 4] {
    [b'0' + (stream / 10) as u8, b'0' + (stream % 10) as u8, suffix[0], suffix[1]]
}

#[derive(Clone, Copy, PartialEq)]
enum IndexMode {
    Relative,
    Absolute,
    Missing,
}

/// Writes a RIFF AVI: header list, one 'strl' per stream in order of
/// addition (stream ids follow that order), 'movi' and 'idx1'.
pub struct AviBuilder {
    streams: Vec<AviStream>,
    chunks: Vec<AviChunk>,
    index: IndexMode,
    odml: bool,
    corrupt: Vec<(usize, i64)>,
    garbage: Vec<(usize, Vec<u8>)>,
}

impl Default for AviBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AviBuilder {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            chunks: Vec::new(),
            index: IndexMode::Relative,
            odml: false,
            corrupt: Vec::new(),
            garbage: Vec::new(),
        }
    }

    pub fn video(mut self, rate: u32, scale: u32) -> Self {
        self.streams.push(AviStream::Video { rate, scale });
        self
    }

    /// `sample_size` 0 writes a VBR MP3 stream.
    pub fn audio(mut self, sample_rate: u32, sample_size: u32) -> Self {
        self.streams.push(AviStream::Audio { sample_rate, sample_size });
        self
    }

    pub fn chunk(mut self, chunk: AviChunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    /// Make idx1 entry `i` disagree with the chunk by `delta` bytes.
    pub fn corrupt_index_len(mut self, i: usize, delta: i64) -> Self {
        self.corrupt.push((i, delta));
        self
    }

    pub fn absolute_index(mut self) -> Self {
        self.index = IndexMode::Absolute;
        self
    }

    pub fn no_index(mut self) -> Self {
        self.index = IndexMode::Missing;
        self
    }

    /// Insert raw bytes inside 'movi' ahead of chunk `i`.
    pub fn garbage_before(mut self, i: usize, bytes: Vec<u8>) -> Self {
        self.garbage.push((i, bytes));
        self
    }

    /// Add OpenDML super indexes pointing at ix## chunks.
    pub fn odml_index(mut self) -> Self {
        self.odml = true;
        self
    }

    fn frames(&self, stream: u32) -> u32 {
        self.chunks.iter().filter(|c| c.stream == stream).count() as u32
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let riff = begin(&mut out, b"RIFF");
        out.extend_from_slice(b"AVI ");

        let hdrl = begin(&mut out, b"LIST");
        out.extend_from_slice(b"hdrl");
        self.write_avih(&mut out);

        let mut indx_patches = Vec::new();
        for (id, stream) in self.streams.iter().enumerate() {
            let strl = begin(&mut out, b"LIST");
            out.extend_from_slice(b"strl");
            self.write_strh(&mut out, id as u32, *stream);
            write_strf(&mut out, *stream);
            if self.odml {
                let indx = begin(&mut out, b"indx");
                out.put_u16_le(4);
                out.put_u8(0);
                out.put_u8(0); // index of indexes
                out.put_u32_le(1);
                out.extend_from_slice(&two_digit(id as u32, suffix_of(*stream)));
                out.put_bytes(0, 12);
                indx_patches.push(out.len());
                out.put_u64_le(0);
                out.put_u32_le(0);
                out.put_u32_le(self.frames(id as u32));
                end(&mut out, indx);
            }
            end(&mut out, strl);
        }
        end(&mut out, hdrl);

        let movi = begin(&mut out, b"LIST");
        out.extend_from_slice(b"movi");
        let movi_start = out.len();
        let mut offsets = Vec::with_capacity(self.chunks.len());
        for (i, chunk) in self.chunks.iter().enumerate() {
            for (_, bytes) in self.garbage.iter().filter(|(at, _)| *at == i) {
                out.extend_from_slice(bytes);
            }
            offsets.push(out.len());
            let at = begin(&mut out, &chunk.ckid());
            out.extend_from_slice(&chunk.data);
            end(&mut out, at);
        }

        if self.odml {
            for (id, stream) in self.streams.iter().enumerate() {
                let id = id as u32;
                let patch = indx_patches[id as usize];
                let pos = out.len() as u64;
                out[patch..patch + 8].copy_from_slice(&pos.to_le_bytes());

                let ix = begin(&mut out, &[b'i', b'x', b'0' + (id / 10) as u8, b'0' + (id % 10) as u8]);
                out.put_u16_le(2);
                out.put_u8(0);
                out.put_u8(1); // index of chunks
                out.put_u32_le(self.frames(id));
                out.extend_from_slice(&two_digit(id, suffix_of(*stream)));
                out.put_u64_le(movi_start as u64);
                out.put_u32_le(0);
                for (i, chunk) in self.chunks.iter().enumerate().filter(|(_, c)| c.stream == id) {
                    out.put_u32_le((offsets[i] + 8 - movi_start) as u32);
                    let mut size = chunk.data.len() as u32;
                    if !chunk.keyframe {
                        size |= 0x8000_0000;
                    }
                    out.put_u32_le(size);
                }
                end(&mut out, ix);
            }
        }
        end(&mut out, movi);

        if self.index != IndexMode::Missing {
            let idx1 = begin(&mut out, b"idx1");
            for (i, chunk) in self.chunks.iter().enumerate() {
                out.extend_from_slice(&chunk.ckid());
                out.put_u32_le(if chunk.keyframe { 0x10 } else { 0 });
                let offset = match self.index {
                    IndexMode::Absolute => offsets[i],
                    _ => offsets[i] - (movi_start - 4),
                };
                out.put_u32_le(offset as u32);
                let delta: i64 = self.corrupt.iter().filter(|(at, _)| *at == i).map(|(_, d)| d).sum();
                out.put_u32_le((chunk.data.len() as i64 + delta) as u32);
            }
            end(&mut out, idx1);
        }

        end(&mut out, riff);
        out
    }

    fn write_avih(&self, out: &mut Vec<u8>) {
        let usec = self
            .streams
            .iter()
            .find_map(|s| match *s {
                AviStream::Video { rate, scale } if rate > 0 => Some((1_000_000u64 * scale as u64 / rate as u64) as u32),
                _ => None,
            })
            .unwrap_or(0);
        let video_frames = self
            .chunks
            .iter()
            .filter(|c| c.suffix == *b"dc")
            .count() as u32;

        let avih = begin(out, b"avih");
        out.put_u32_le(usec);
        out.put_u32_le(0); // max bytes per second
        out.put_u32_le(0); // padding granularity
        out.put_u32_le(if self.index == IndexMode::Missing { 0 } else { 0x10 });
        out.put_u32_le(video_frames);
        out.put_u32_le(0); // initial frames
        out.put_u32_le(self.streams.len() as u32);
        out.put_u32_le(0); // suggested buffer size
        out.put_u32_le(320);
        out.put_u32_le(240);
        out.put_bytes(0, 16);
        end(out, avih);
    }

    fn write_strh(&self, out: &mut Vec<u8>, id: u32, stream: AviStream) {
        let (fcc, handler, scale, rate, sample_size) = match stream {
            AviStream::Video { rate, scale } => (b"vids", *b"XVID", scale, rate, 0),
            AviStream::Audio { sample_rate, sample_size } if sample_size > 0 => {
                (b"auds", [0; 4], sample_size, sample_rate * sample_size, sample_size)
            }
            AviStream::Audio { sample_rate, .. } => (b"auds", [0; 4], 1152, sample_rate, 0),
        };

        let strh = begin(out, b"strh");
        out.extend_from_slice(fcc);
        out.extend_from_slice(&handler);
        out.put_u32_le(0); // flags
        out.put_u16_le(0); // priority
        out.put_u16_le(0); // language
        out.put_u32_le(0); // initial frames
        out.put_u32_le(scale);
        out.put_u32_le(rate);
        out.put_u32_le(0); // start
        out.put_u32_le(self.frames(id));
        out.put_u32_le(0); // suggested buffer size
        out.put_u32_le(u32::MAX); // quality
        out.put_u32_le(sample_size);
        for v in [0u16, 0, 320, 240] {
            out.put_u16_le(v);
        }
        end(out, strh);
    }
}

fn suffix_of(stream: AviStream) -> [u8; 2] {
    match stream {
        AviStream::Video { .. } => *b"dc",
        AviStream::Audio { .. } => *b"wb",
    }
}

fn write_strf(out: &mut Vec<u8>, stream: AviStream) {
    let strf = begin(out, b"strf");
    match stream {
        AviStream::Video { .. } => put_bitmap_info(out, b"XVID"),
        AviStream::Audio { sample_rate, sample_size } => {
            let (tag, avg, align) = if sample_size > 0 {
                (1u16, sample_rate * sample_size, sample_size as u16)
            } else {
                (0x55, 16_000, 1)
            };
            put_wave_format(out, tag, sample_rate, avg, align);
        }
    }
    end(out, strf);
}

/// 40-byte BITMAPINFOHEADER, 320x240.
fn put_bitmap_info(out: &mut Vec<u8>, compression: &[u8; 4]) {
    out.put_u32_le(40);
    out.put_i32_le(320);
    out.put_i32_le(240);
    out.put_u16_le(1); // planes
    out.put_u16_le(24); // bit count
    out.extend_from_slice(compression);
    out.put_bytes(0, 20);
}

/// 18-byte stereo 16-bit WAVEFORMATEX.
fn put_wave_format(out: &mut Vec<u8>, tag: u16, sample_rate: u32, avg_bytes: u32, block_align: u16) {
    out.put_u16_le(tag);
    out.put_u16_le(2);
    out.put_u32_le(sample_rate);
    out.put_u32_le(avg_bytes);
    out.put_u16_le(block_align);
    out.put_u16_le(16);
    out.put_u16_le(0);
}

// ============================================================================
// MPEG Program Stream
// ============================================================================

/// 33-bit timestamp in the 5-byte marker layout, `prefix` in the top nibble.
fn put_timestamp(out: &mut Vec<u8>, prefix: u8, ts: u64) {
    out.put_u8((prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1);
    out.put_u16(((((ts >> 15) & 0x7FFF) << 1) | 1) as u16);
    out.put_u16((((ts & 0x7FFF) << 1) | 1) as u16);
}

/// MPEG-2 pack header, mux rate 25200 (x50 bytes/s), no stuffing.
pub fn ps_pack_header(scr: u64) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x01, 0xBA];
    let base = scr;
    out.put_u8(0x44 | ((((base >> 30) & 0x07) as u8) << 3) | (((base >> 28) & 0x03) as u8));
    out.put_u8(((base >> 20) & 0xFF) as u8);
    out.put_u8(((((base >> 15) & 0x1F) as u8) << 3) | 0x04 | (((base >> 13) & 0x03) as u8));
    out.put_u8(((base >> 5) & 0xFF) as u8);
    out.put_u8((((base & 0x1F) as u8) << 3) | 0x04);
    out.put_u8(0x01); // extension + marker
    let mux_rate: u32 = 25_200;
    out.put_u8((mux_rate >> 14) as u8);
    out.put_u8((mux_rate >> 6) as u8);
    out.put_u8((((mux_rate & 0x3F) as u8) << 2) | 0x03);
    out.put_u8(0xF8); // no stuffing
    out
}

/// MPEG-1 pack header.
pub fn ps_pack_header_mpeg1(scr: u64) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x01, 0xBA];
    put_timestamp(&mut out, 0x2, scr);
    let mux_rate: u32 = 25_200;
    out.put_u8(0x80 | (mux_rate >> 15) as u8);
    out.put_u8((mux_rate >> 7) as u8);
    out.put_u8((((mux_rate & 0x7F) as u8) << 1) | 1);
    out
}

pub fn ps_system_header() -> Vec<u8> {
    vec![0x00, 0x00, 0x01, 0xBB, 0x00, 0x06, 0x80, 0x01, 0x01, 0x04, 0xE1, 0xFF]
}

/// MPEG-2 PES packet with an optional PTS.
pub fn ps_pes(id: u8, pts: Option<u64>, payload: &[u8]) -> Vec<u8> {
    let mut header = vec![0x81];
    match pts {
        Some(pts) => {
            header.extend([0x80, 5]);
            put_timestamp(&mut header, 0x2, pts);
        }
        None => header.extend([0x00, 0]),
    }
    pes(id, &header, payload)
}

/// MPEG-1 PES packet with an optional PTS.
pub fn ps_pes_mpeg1(id: u8, pts: Option<u64>, payload: &[u8]) -> Vec<u8> {
    let mut header = Vec::new();
    match pts {
        Some(pts) => put_timestamp(&mut header, 0x2, pts),
        None => header.push(0x0F),
    }
    pes(id, &header, payload)
}

fn pes(id: u8, header: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x01, id];
    out.put_u16((header.len() + payload.len()) as u16);
    out.extend_from_slice(header);
    out.extend_from_slice(payload);
    out
}

// ============================================================================
// ASF
// ============================================================================

const HEADER_GUID: [u8; 16] = [
    0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C,
];
const NO_ERROR_CORRECTION_GUID: [u8; 16] = [
    0x00, 0x57, 0xFB, 0x20, 0x55, 0x5B, 0xCF, 0x11, 0xA8, 0xFD, 0x00, 0x80, 0x5F, 0x5C, 0x44, 0x2B,
];

/// One payload inside a data packet.
pub enum AsfSegment {
    Fragment {
        stream: u8,
        seq: u32,
        offset: u32,
        time_ms: u32,
        keyframe: bool,
        data: Vec<u8>,
    },
    Grouped {
        stream: u8,
        seq: u32,
        time_ms: u32,
        payloads: Vec<Vec<u8>>,
    },
}

impl AsfSegment {
    pub fn fragment(stream: u8, seq: u32, offset: u32, time_ms: u32, data: Vec<u8>) -> Self {
        Self::Fragment {
            stream,
            seq,
            offset,
            time_ms,
            keyframe: false,
            data,
        }
    }

    pub fn keyframe(self) -> Self {
        match self {
            Self::Fragment { stream, seq, offset, time_ms, data, .. } => Self::Fragment {
                stream,
                seq,
                offset,
                time_ms,
                keyframe: true,
                data,
            },
            grouped => grouped,
        }
    }

    pub fn grouped(stream: u8, seq: u32, time_ms: u32, payloads: Vec<Vec<u8>>) -> Self {
        Self::Grouped {
            stream,
            seq,
            time_ms,
            payloads,
        }
    }

    /// Stream byte, sequence (u8), offset/time (u32), replicated data, then
    /// the body with a u16 length when the packet carries several payloads.
    fn encode(&self, out: &mut Vec<u8>, multiple: bool) {
        let body = match self {
            Self::Fragment { stream, seq, offset, time_ms, keyframe, data } => {
                out.put_u8(stream | if *keyframe { 0x80 } else { 0 });
                out.put_u8(*seq as u8);
                out.put_u32_le(*offset);
                out.put_u8(8);
                out.put_u32_le(offset + data.len() as u32);
                out.put_u32_le(*time_ms);
                data.clone()
            }
            Self::Grouped { stream, seq, time_ms, payloads } => {
                out.put_u8(*stream);
                out.put_u8(*seq as u8);
                out.put_u32_le(*time_ms);
                out.put_u8(1);
                out.put_u8(0); // time delta
                let mut body = Vec::new();
                for p in payloads {
                    body.put_u8(p.len() as u8);
                    body.extend_from_slice(p);
                }
                body
            }
        };
        if multiple {
            out.put_u16_le(body.len() as u16);
        }
        out.extend_from_slice(&body);
    }
}

/// Writes an ASF file with fixed-size packets.
pub struct AsfBuilder {
    packet_size: u32,
    preroll_ms: u64,
    play_duration: u64,
    streams: Vec<Vec<u8>>,
    packets: Vec<Vec<u8>>,
    index: Option<(u64, Vec<u32>)>,
}

impl AsfBuilder {
    pub fn new(packet_size: u32) -> Self {
        Self {
            packet_size,
            preroll_ms: 0,
            play_duration: 0,
            streams: Vec::new(),
            packets: Vec::new(),
            index: None,
        }
    }

    /// WMA v2 stream; `spread` is (span, virtual packet, virtual chunk).
    pub fn audio_stream(mut self, number: u8, spread: Option<(u8, u16, u16)>) -> Self {
        let mut type_data = Vec::new();
        put_wave_format(&mut type_data, 0x161, 44_100, 16_000, 1487);
        let ec = spread.map(|(span, vpacket, vchunk)| {
            let mut ec = Vec::new();
            ec.put_u8(span);
            ec.put_u16_le(vpacket);
            ec.put_u16_le(vchunk);
            ec.put_u16_le(1);
            ec.put_u8(0);
            ec
        });
        self.streams.push(stream_properties(AUDIO_MEDIA_GUID, number, &type_data, ec));
        self
    }

    /// WMV3 stream, 320x240.
    pub fn video_stream(mut self, number: u8) -> Self {
        let mut type_data = Vec::new();
        type_data.put_u32_le(320);
        type_data.put_u32_le(240);
        type_data.put_u8(2);
        type_data.put_u16_le(40);
        put_bitmap_info(&mut type_data, b"WMV3");
        self.streams.push(stream_properties(VIDEO_MEDIA_GUID, number, &type_data, None));
        self
    }

    pub fn preroll(mut self, ms: u64) -> Self {
        self.preroll_ms = ms;
        self
    }

    /// Play duration in seconds, preroll included.
    pub fn duration(mut self, secs: f64) -> Self {
        self.play_duration = (secs * 1e7) as u64;
        self
    }

    /// Multiple-payload packet with a 3-byte error correction prefix.
    pub fn packet(mut self, time_ms: u32, segments: Vec<AsfSegment>) -> Self {
        let mut p = vec![0x82, 0x00, 0x00, 0x11, 0x5D];
        let padding_at = p.len();
        p.put_u16_le(0);
        p.put_u32_le(time_ms);
        p.put_u16_le(0);
        p.put_u8(0x80 | segments.len() as u8);
        for segment in &segments {
            segment.encode(&mut p, true);
        }
        self.finish(p, padding_at);
        self
    }

    /// Single-payload packet without error correction data.
    pub fn single_packet(mut self, time_ms: u32, segment: AsfSegment) -> Self {
        let mut p = vec![0x10, 0x5D];
        let padding_at = p.len();
        p.put_u16_le(0);
        p.put_u32_le(time_ms);
        p.put_u16_le(0);
        segment.encode(&mut p, false);
        self.finish(p, padding_at);
        self
    }

    /// Simple index: one packet number per `interval` (100 ns units).
    pub fn simple_index(mut self, interval: u64, packets: Vec<u32>) -> Self {
        self.index = Some((interval, packets));
        self
    }

    fn finish(&mut self, mut p: Vec<u8>, padding_at: usize) {
        let size = self.packet_size as usize;
        assert!(p.len() <= size, "packet overflows {} bytes", size);
        let padding = (size - p.len()) as u16;
        p[padding_at..padding_at + 2].copy_from_slice(&padding.to_le_bytes());
        p.resize(size, 0);
        self.packets.push(p);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut props = Vec::new();
        props.extend_from_slice(&FILE_PROPERTIES_GUID);
        props.put_u64_le(104);
        props.put_bytes(0, 16); // file id
        props.put_u64_le(0); // file size
        props.put_u64_le(0); // creation date
        props.put_u64_le(self.packets.len() as u64);
        props.put_u64_le(self.play_duration);
        props.put_u64_le(self.play_duration);
        props.put_u64_le(self.preroll_ms);
        props.put_u32_le(0x02); // seekable
        props.put_u32_le(self.packet_size);
        props.put_u32_le(self.packet_size);
        props.put_u32_le(128_000);

        let objects: Vec<&[u8]> = std::iter::once(props.as_slice())
            .chain(self.streams.iter().map(|s| s.as_slice()))
            .collect();
        let header_size: usize = 30 + objects.iter().map(|o| o.len()).sum::<usize>();

        let mut out = Vec::new();
        out.extend_from_slice(&HEADER_GUID);
        out.put_u64_le(header_size as u64);
        out.put_u32_le(objects.len() as u32);
        out.put_u8(0x01);
        out.put_u8(0x02);
        for object in objects {
            out.extend_from_slice(object);
        }

        out.extend_from_slice(&DATA_GUID);
        out.put_u64_le(50 + (self.packets.len() * self.packet_size as usize) as u64);
        out.put_bytes(0, 16);
        out.put_u64_le(self.packets.len() as u64);
        out.put_u16_le(0x0101);
        for packet in &self.packets {
            out.extend_from_slice(packet);
        }

        if let Some((interval, packets)) = &self.index {
            out.extend_from_slice(&SIMPLE_INDEX_GUID);
            out.put_u64_le((24 + 32 + packets.len() * 6) as u64);
            out.put_bytes(0, 16);
            out.put_u64_le(*interval);
            out.put_u32_le(1);
            out.put_u32_le(packets.len() as u32);
            for &packet in packets {
                out.put_u32_le(packet);
                out.put_u16_le(1);
            }
        }
        out
    }
}

fn stream_properties(kind: [u8; 16], number: u8, type_data: &[u8], spread: Option<Vec<u8>>) -> Vec<u8> {
    let (ec_guid, ec_data) = match spread {
        Some(data) => (AUDIO_SPREAD_GUID, data),
        None => (NO_ERROR_CORRECTION_GUID, Vec::new()),
    };
    let mut out = Vec::new();
    out.extend_from_slice(&STREAM_PROPERTIES_GUID);
    out.put_u64_le((24 + 54 + type_data.len() + ec_data.len()) as u64);
    out.extend_from_slice(&kind);
    out.extend_from_slice(&ec_guid);
    out.put_u64_le(0); // time offset
    out.put_u32_le(type_data.len() as u32);
    out.put_u32_le(ec_data.len() as u32);
    out.put_u16_le(number as u16);
    out.put_u32_le(0);
    out.extend_from_slice(type_data);
    out.extend_from_slice(&ec_data);
    out
}
