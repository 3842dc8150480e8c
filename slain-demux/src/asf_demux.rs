// ASF DEMUXER - Advanced Systems Format (WMV/WMA) Parser
//
// ASF is the container behind .wmv, .wma and .asf files and MMS streams.
// A header object describes the streams, then a data object holds
// fixed-size packets. Each packet carries payload segments: fragments of
// media objects tagged with stream number, object sequence number and the
// fragment's offset into the object.
//
// Objects are reassembled per stream; a change of sequence number closes
// the object being built. Audio may be interleaved across packets
// ("audio spread") and is transposed back on completion.

use std::io;

use bytes::{Buf, Bytes};

use crate::avi_demux::{parse_bitmap_info, parse_wave_format};
use crate::demuxer::{DemuxContext, SyncState};
use crate::detect::{ContainerFormat, ASF_HEADER_GUID};
use crate::error::{DemuxError, Result};
use crate::index::{IndexEntry, IndexFlags, SeekIndex};
use crate::packet::PacketBuilder;
use crate::packet_queue::{StreamInfo, StreamKind};
use crate::stream::MediaStream;

// ============================================================================
// GUIDs (on-disk byte order)
// ============================================================================

type Guid = [u8; 16];

pub(crate) const DATA_GUID: Guid = [
    0x36, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C,
];
pub(crate) const FILE_PROPERTIES_GUID: Guid = [
    0xA1, 0xDC, 0xAB, 0x8C, 0x47, 0xA9, 0xCF, 0x11, 0x8E, 0xE4, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65,
];
pub(crate) const STREAM_PROPERTIES_GUID: Guid = [
    0x91, 0x07, 0xDC, 0xB7, 0xB7, 0xA9, 0xCF, 0x11, 0x8E, 0xE6, 0x00, 0xC0, 0x0C, 0x20, 0x53, 0x65,
];
pub(crate) const VIDEO_MEDIA_GUID: Guid = [
    0xC0, 0xEF, 0x19, 0xBC, 0x4D, 0x5B, 0xCF, 0x11, 0xA8, 0xFD, 0x00, 0x80, 0x5F, 0x5C, 0x44, 0x2B,
];
pub(crate) const AUDIO_MEDIA_GUID: Guid = [
    0x40, 0x9E, 0x69, 0xF8, 0x4D, 0x5B, 0xCF, 0x11, 0xA8, 0xFD, 0x00, 0x80, 0x5F, 0x5C, 0x44, 0x2B,
];
pub(crate) const AUDIO_SPREAD_GUID: Guid = [
    0x50, 0xCD, 0xC3, 0xBF, 0x8F, 0x61, 0xCF, 0x11, 0x8B, 0xB2, 0x00, 0xAA, 0x00, 0xB4, 0xE2, 0x20,
];
pub(crate) const SIMPLE_INDEX_GUID: Guid = [
    0x90, 0x08, 0x00, 0x33, 0xB1, 0xE5, 0xCF, 0x11, 0x89, 0xF4, 0x00, 0xA0, 0xC9, 0x03, 0x49, 0xCB,
];

/// GUID + size
const OBJECT_HEADER_SIZE: u64 = 24;
/// Data object fields before the first packet
const DATA_OBJECT_HEADER_SIZE: u64 = 50;
/// Header objects larger than this are not loaded.
const MAX_OBJECT_SIZE: u64 = 16 * 1024 * 1024;
/// Largest data packet accepted from the file properties object.
const MAX_PACKET_SIZE: u32 = 1024 * 1024;

// ============================================================================
// Header Structures
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct FileProperties {
    file_size: u64,
    data_packets: u64,
    /// 100 ns units, includes preroll
    play_duration: u64,
    /// Milliseconds
    preroll: u64,
    min_packet_size: u32,
    max_packet_size: u32,
    max_bitrate: u32,
}

/// Audio interleaving parameters from the error-correction data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AudioSpread {
    span: u8,
    packet_size: u16,
    chunk_size: u16,
}

#[derive(Debug, Clone)]
struct AsfStream {
    kind: StreamKind,
    info: StreamInfo,
    spread: Option<AudioSpread>,
}

fn truncated(what: &str) -> DemuxError {
    DemuxError::invalid(ContainerFormat::Asf, format!("truncated {}", what))
}

fn parse_file_properties(body: &[u8]) -> Result<FileProperties> {
    let mut b = body;
    if b.remaining() < 80 {
        return Err(truncated("file properties object"));
    }
    b.advance(16); // file id
    let file_size = b.get_u64_le();
    b.advance(8); // creation date
    let data_packets = b.get_u64_le();
    let play_duration = b.get_u64_le();
    b.advance(8); // send duration
    let preroll = b.get_u64_le();
    b.advance(4); // flags
    Ok(FileProperties {
        file_size,
        data_packets,
        play_duration,
        preroll,
        min_packet_size: b.get_u32_le(),
        max_packet_size: b.get_u32_le(),
        max_bitrate: b.get_u32_le(),
    })
}

fn parse_stream_properties(body: &[u8]) -> Result<Option<AsfStream>> {
    let mut b = body;
    if b.remaining() < 54 {
        return Err(truncated("stream properties object"));
    }
    let mut stream_type = [0u8; 16];
    b.copy_to_slice(&mut stream_type);
    let mut ec_type = [0u8; 16];
    b.copy_to_slice(&mut ec_type);
    b.advance(8); // time offset
    let type_len = b.get_u32_le() as usize;
    let ec_len = b.get_u32_le() as usize;
    let number = (b.get_u16_le() & 0x7F) as u32;
    b.advance(4);
    if b.remaining() < type_len + ec_len {
        return Err(truncated("stream properties object"));
    }
    let type_data = &b[..type_len];
    let ec_data = &b[type_len..type_len + ec_len];

    let mut info = StreamInfo {
        id: number,
        ..Default::default()
    };
    let kind = if stream_type == AUDIO_MEDIA_GUID {
        parse_wave_format(type_data, &mut info);
        info.header = Bytes::copy_from_slice(type_data);
        StreamKind::Audio
    } else if stream_type == VIDEO_MEDIA_GUID {
        // width, height, reserved flags, format data size
        if let Some(bitmap) = type_data.get(11..) {
            parse_bitmap_info(bitmap, &mut info);
            info.header = Bytes::copy_from_slice(bitmap);
        }
        StreamKind::Video
    } else {
        tracing::debug!("Skipping ASF stream {} of unsupported type", number);
        return Ok(None);
    };

    let spread = if ec_type == AUDIO_SPREAD_GUID && ec_data.len() >= 5 {
        let mut e = ec_data;
        Some(AudioSpread {
            span: e.get_u8(),
            packet_size: e.get_u16_le(),
            chunk_size: e.get_u16_le(),
        })
    } else {
        None
    };

    Ok(Some(AsfStream { kind, info, spread }))
}

/// Undo audio spread: the object was written as `span` rows of
/// `packet_size / chunk_size` chunks and is read back column by column.
fn descramble(data: &[u8], spread: AudioSpread) -> Option<Vec<u8>> {
    let h = spread.span as usize;
    let b = spread.chunk_size as usize;
    if h <= 1 || b == 0 {
        return None;
    }
    let w = spread.packet_size as usize / b;
    if w == 0 || data.len() != h * w * b {
        return None;
    }

    let mut out = Vec::with_capacity(data.len());
    for x in 0..w {
        for y in 0..h {
            let at = (y * w + x) * b;
            out.extend_from_slice(&data[at..at + b]);
        }
    }
    Some(out)
}

// ============================================================================
// Packet Parsing
// ============================================================================

type ParseResult<T> = std::result::Result<T, &'static str>;

fn need(b: &[u8], n: usize) -> ParseResult<()> {
    if b.remaining() < n {
        Err("payload runs past end of packet")
    } else {
        Ok(())
    }
}

/// Field whose width is given by a 2-bit length type.
fn read_var(b: &mut &[u8], code: u8) -> ParseResult<usize> {
    Ok(match code & 3 {
        0 => 0,
        1 => {
            need(b, 1)?;
            b.get_u8() as usize
        }
        2 => {
            need(b, 2)?;
            b.get_u16_le() as usize
        }
        _ => {
            need(b, 4)?;
            b.get_u32_le() as usize
        }
    })
}

/// One media object fragment pulled out of a packet.
struct Fragment<'a> {
    stream: u32,
    seq: u32,
    /// Offset into the object; `None` for grouped payloads
    offset: Option<usize>,
    time_ms: u32,
    keyframe: bool,
    data: &'a [u8],
}

/// Split one data packet into fragments.
fn parse_packet(data: &[u8], packet_size: usize) -> ParseResult<Vec<Fragment<'_>>> {
    let mut b = data;
    need(b, 1)?;
    if b[0] & 0x80 != 0 {
        let ec = 1 + (b[0] & 0x0F) as usize;
        need(b, ec)?;
        b.advance(ec);
    }

    need(b, 2)?;
    let flags = b.get_u8();
    let segtype = b.get_u8();
    let plen = read_var(&mut b, flags >> 5)?;
    let _sequence = read_var(&mut b, flags >> 1)?;
    let padding = read_var(&mut b, flags >> 3)?;
    need(b, 6)?;
    let time = b.get_u32_le();
    let _duration = b.get_u16_le();

    let multiple = flags & 1 != 0;
    let (segsizetype, segments) = if multiple {
        need(b, 1)?;
        let p = b.get_u8();
        (p >> 6, (p & 0x3F) as usize)
    } else {
        (0, 1)
    };

    let end = if plen == 0 { packet_size.saturating_sub(padding) } else { plen }.min(data.len());
    let mut fragments = Vec::with_capacity(segments);

    for _ in 0..segments {
        need(b, 1)?;
        let stream_byte = b.get_u8();
        let stream = (stream_byte & 0x7F) as u32;
        let keyframe = stream_byte & 0x80 != 0;
        let seq = read_var(&mut b, segtype >> 4)? as u32;
        let x = read_var(&mut b, segtype >> 2)?;
        let rlen = read_var(&mut b, segtype)?;

        let (offset, time_ms, grouped) = if rlen >= 8 {
            need(b, rlen)?;
            b.advance(4); // object size
            let t = b.get_u32_le();
            b.advance(rlen - 8);
            (Some(x), t, false)
        } else if rlen == 1 {
            // Grouped payloads: x is the presentation time.
            need(b, 1)?;
            b.advance(1); // time delta
            (None, x as u32, true)
        } else {
            need(b, rlen)?;
            b.advance(rlen);
            (Some(x), time, false)
        };

        let len = if multiple {
            read_var(&mut b, segsizetype)?
        } else {
            let consumed = data.len() - b.remaining();
            end.checked_sub(consumed).ok_or("payload starts past packet length")?
        };
        need(b, len)?;
        let payload = &b[..len];
        b.advance(len);

        if grouped {
            let mut g = payload;
            let mut seq = seq;
            while g.has_remaining() {
                let sub = g.get_u8() as usize;
                need(g, sub)?;
                fragments.push(Fragment {
                    stream,
                    seq,
                    offset: None,
                    time_ms,
                    keyframe,
                    data: &g[..sub],
                });
                g.advance(sub);
                seq = seq.wrapping_add(1);
            }
        } else {
            fragments.push(Fragment {
                stream,
                seq,
                offset,
                time_ms,
                keyframe,
                data: payload,
            });
        }
    }

    Ok(fragments)
}

// ============================================================================
// ASF Demuxer
// ============================================================================

pub struct AsfDemuxer {
    packet_size: u32,
    data_start: u64,
    /// 0 when the header does not say (broadcast)
    total_packets: u64,
    next_packet: u64,
    preroll_ms: u64,
    subtract_preroll: bool,
    streams: Vec<AsfStream>,
}

fn read_guid(input: &mut MediaStream) -> io::Result<Guid> {
    let mut guid = [0u8; 16];
    input.read_exact(&mut guid)?;
    Ok(guid)
}

fn read_object_header(input: &mut MediaStream, pos: u64) -> io::Result<(Guid, u64)> {
    input.seek(pos)?;
    let guid = read_guid(input)?;
    let size = input.read_u64_le()?;
    Ok((guid, size))
}

impl AsfDemuxer {
    pub fn open(ctx: &mut DemuxContext) -> Result<Self> {
        let input = &mut ctx.input;
        let header_start = input.tell();
        if read_guid(input)? != ASF_HEADER_GUID {
            return Err(DemuxError::invalid(ContainerFormat::Asf, "missing header object"));
        }
        let header_size = input.read_u64_le()?;
        let objects = input.read_u32_le()?;
        input.skip(2)?; // reserved
        let header_end = header_start + header_size;

        let mut props = None;
        let mut streams = Vec::new();
        for _ in 0..objects {
            if input.tell() + OBJECT_HEADER_SIZE > header_end {
                break;
            }
            let guid = read_guid(input)?;
            let size = input.read_u64_le()?;
            if size < OBJECT_HEADER_SIZE {
                return Err(DemuxError::invalid(ContainerFormat::Asf, "object smaller than its header"));
            }
            let body_len = size - OBJECT_HEADER_SIZE;
            if body_len > MAX_OBJECT_SIZE || !(guid == FILE_PROPERTIES_GUID || guid == STREAM_PROPERTIES_GUID) {
                input.skip(body_len)?;
                continue;
            }
            let body = input.read_vec(body_len as usize)?;
            if guid == FILE_PROPERTIES_GUID {
                props = Some(parse_file_properties(&body)?);
            } else if let Some(stream) = parse_stream_properties(&body)? {
                streams.push(stream);
            }
        }

        let props = props.ok_or_else(|| DemuxError::invalid(ContainerFormat::Asf, "no file properties object"))?;
        if props.min_packet_size != props.max_packet_size || props.max_packet_size == 0 {
            return Err(DemuxError::invalid(
                ContainerFormat::Asf,
                format!("variable packet size {}..{}", props.min_packet_size, props.max_packet_size),
            ));
        }
        if props.max_packet_size > MAX_PACKET_SIZE {
            return Err(DemuxError::invalid(
                ContainerFormat::Asf,
                format!("packet size {} exceeds {}", props.max_packet_size, MAX_PACKET_SIZE),
            ));
        }

        if input.tell() != header_end {
            input.seek(header_end)?;
        }
        let data_object = input.tell();
        if read_guid(input)? != DATA_GUID {
            return Err(DemuxError::invalid(ContainerFormat::Asf, "data object does not follow header"));
        }
        let data_size = input.read_u64_le()?;
        input.skip(16)?; // file id
        let total_packets = input.read_u64_le()?;
        input.skip(2)?; // reserved
        let data_start = input.tell();

        let mut demuxer = Self {
            packet_size: props.max_packet_size,
            data_start,
            total_packets: if total_packets > 0 { total_packets } else { props.data_packets },
            next_packet: 0,
            preroll_ms: props.preroll,
            subtract_preroll: ctx.config.asf.subtract_preroll,
            streams,
        };

        if ctx.input.is_seekable() && data_size >= DATA_OBJECT_HEADER_SIZE {
            let index = demuxer.read_simple_index(&mut ctx.input, data_object + data_size);
            if !index.is_empty() {
                ctx.index = index;
            }
            ctx.input.seek(data_start)?;
        }

        for stream in &demuxer.streams {
            let mut info = stream.info.clone();
            if info.codec.is_empty() {
                info.codec = "unknown".to_string();
            }
            ctx.discover(stream.kind, info);
        }
        ctx.auto_select(StreamKind::Video);
        ctx.auto_select(StreamKind::Audio);

        let play = props.play_duration as f64 / 1e7;
        let preroll = if demuxer.subtract_preroll { props.preroll as f64 / 1000.0 } else { 0.0 };
        ctx.info.duration = (props.play_duration > 0).then(|| (play - preroll).max(0.0));
        ctx.info.indexed = ctx.index.is_embedded();
        ctx.sync = SyncState::Synced;

        tracing::info!(
            "ASF: {} stream(s), {} packets of {} bytes, preroll {} ms, {} bytes, max {} bit/s",
            demuxer.streams.len(),
            demuxer.total_packets,
            demuxer.packet_size,
            props.preroll,
            props.file_size,
            props.max_bitrate
        );
        Ok(demuxer)
    }

    /// Look for a simple index object after the data object.
    fn read_simple_index(&self, input: &mut MediaStream, mut pos: u64) -> SeekIndex {
        let Some(len) = input.len() else {
            return SeekIndex::new();
        };
        while pos + OBJECT_HEADER_SIZE <= len {
            let Ok((guid, size)) = read_object_header(input, pos) else {
                break;
            };
            if size < OBJECT_HEADER_SIZE {
                break;
            }
            if guid == SIMPLE_INDEX_GUID && size - OBJECT_HEADER_SIZE <= MAX_OBJECT_SIZE {
                match input.read_vec((size - OBJECT_HEADER_SIZE) as usize) {
                    Ok(body) => return self.parse_simple_index(&body),
                    Err(e) => {
                        tracing::warn!("Unreadable ASF simple index: {}", e);
                        break;
                    }
                }
            }
            pos += size;
        }
        SeekIndex::new()
    }

    fn parse_simple_index(&self, body: &[u8]) -> SeekIndex {
        let mut b = body;
        if b.remaining() < 32 {
            return SeekIndex::new();
        }
        b.advance(16); // file id
        let interval = b.get_u64_le();
        let _max_packet_count = b.get_u32_le();
        let count = b.get_u32_le() as usize;

        let preroll = if self.subtract_preroll { self.preroll_ms as f64 / 1000.0 } else { 0.0 };
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            if b.remaining() < 6 {
                break;
            }
            let packet = b.get_u32_le() as u64;
            let _packet_count = b.get_u16_le();
            entries.push(IndexEntry {
                pts: (i as u64 * interval) as f64 / 1e7 - preroll,
                seq: packet,
                offset: self.data_start + packet * self.packet_size as u64,
                flags: IndexFlags::SYNC,
            });
        }
        for e in &mut entries {
            e.pts = e.pts.max(0.0);
        }
        SeekIndex::from_embedded(entries)
    }

    // ========================================================================
    // Packet Reading
    // ========================================================================

    /// Parse the next data packet. Returns false past the last packet.
    pub fn fill_buffer(&mut self, ctx: &mut DemuxContext) -> Result<bool> {
        if self.total_packets > 0 && self.next_packet >= self.total_packets {
            return Ok(false);
        }
        let pos = self.data_start + self.next_packet * self.packet_size as u64;
        if ctx.input.len().is_some_and(|len| pos + self.packet_size as u64 > len) {
            tracing::debug!("ASF data ends inside packet {}", self.next_packet);
            return Ok(false);
        }
        if ctx.input.tell() != pos {
            ctx.input.seek(pos)?;
        }
        let data = match ctx.input.read_vec(self.packet_size as usize) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        self.next_packet += 1;

        match parse_packet(&data, self.packet_size as usize) {
            Ok(fragments) => {
                for fragment in fragments {
                    self.reassemble(ctx, fragment, pos);
                }
                ctx.sync = SyncState::Synced;
            }
            Err(reason) => ctx.note(DemuxError::ChunkCorrupt {
                offset: pos,
                reason: reason.to_string(),
            }),
        }
        Ok(true)
    }

    fn pts(&self, time_ms: u32) -> f64 {
        let t = if self.subtract_preroll {
            (time_ms as u64).saturating_sub(self.preroll_ms)
        } else {
            time_ms as u64
        };
        t as f64 / 1000.0
    }

    fn reassemble(&self, ctx: &mut DemuxContext, fragment: Fragment<'_>, pos: u64) {
        let Some(kind) = ctx.route(fragment.stream) else {
            return;
        };

        if let Some(partial) = ctx.stream_mut(kind).partial_mut().filter(|p| p.seq() == fragment.seq) {
            let expected = partial.len();
            partial.append(fragment.data);
            if fragment.offset.is_some_and(|o| o != expected) {
                ctx.note(DemuxError::SegmentMismatch {
                    stream: fragment.stream,
                    expected,
                    got: fragment.offset.unwrap_or_default(),
                });
            }
            return;
        }

        if let Some(done) = ctx.stream_mut(kind).take_partial() {
            self.close(ctx, kind, done);
        }

        if fragment.offset.is_some_and(|o| o > 0) {
            tracing::debug!(
                "Dropping stream {} object {}: first fragment at offset {:?}",
                fragment.stream,
                fragment.seq,
                fragment.offset
            );
            ctx.stats.discarded_packets += 1;
            return;
        }

        let mut builder = PacketBuilder::new(
            fragment.stream,
            fragment.seq,
            Some(self.pts(fragment.time_ms)),
            pos,
            fragment.keyframe || kind == StreamKind::Audio,
        );
        builder.append(fragment.data);
        ctx.stream_mut(kind).start_partial(builder);
    }

    /// Emit a completed object, descrambling spread audio.
    fn close(&self, ctx: &mut DemuxContext, kind: StreamKind, builder: PacketBuilder) {
        if builder.is_empty() {
            return;
        }
        let spread = self
            .streams
            .iter()
            .find(|s| s.info.id == builder.stream())
            .and_then(|s| s.spread);
        let mut packet = builder.finish();
        if let Some(data) = spread.and_then(|sp| descramble(&packet.data, sp)) {
            packet.data = Bytes::from(data);
        }
        ctx.emit(kind, packet);
    }

    /// Emit the objects still being assembled at end of input.
    pub fn flush_partials(&mut self, ctx: &mut DemuxContext) -> usize {
        let mut flushed = 0;
        for kind in [StreamKind::Audio, StreamKind::Video] {
            if let Some(partial) = ctx.stream_mut(kind).take_partial() {
                if !partial.is_empty() {
                    self.close(ctx, kind, partial);
                    flushed += 1;
                }
            }
        }
        flushed
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    /// Seek to a packet boundary, through the simple index when there is one.
    pub fn seek(&mut self, ctx: &mut DemuxContext, target: f64) -> Result<()> {
        let covered = ctx.index.is_embedded() || ctx.index.last().is_some_and(|last| target <= last.pts);
        let indexed = if covered {
            ctx.index
                .lookup(target)
                .and_then(|h| ctx.index.get(h))
                .map(|e| (e.offset.saturating_sub(self.data_start)) / self.packet_size as u64)
        } else {
            None
        };

        let packet = match indexed {
            Some(packet) => packet,
            None => match ctx.info.duration {
                Some(d) if d > 0.0 && self.total_packets > 0 => {
                    let k = (target / d * self.total_packets as f64) as u64;
                    k.min(self.total_packets - 1)
                }
                _ => 0,
            },
        };

        tracing::debug!(
            "ASF seek to {:.3}s: packet {} ({})",
            target,
            packet,
            if indexed.is_some() { "index" } else { "estimate" }
        );
        self.next_packet = packet;
        ctx.input.seek(self.data_start + packet * self.packet_size as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DemuxConfig;
    use crate::demuxer::Demuxer;
    use crate::fixtures::{AsfBuilder, AsfSegment};
    use crate::packet::Packet;
    use crate::source::MemorySource;

    fn open(data: Vec<u8>, config: DemuxConfig) -> Demuxer {
        Demuxer::open_source(Box::new(MemorySource::new(data)), config).unwrap()
    }

    fn drain(demuxer: &mut Demuxer, kind: StreamKind) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(p) = demuxer.next_packet(kind) {
            out.push(p);
        }
        out
    }

    #[test]
    fn test_header_parsing() {
        let data = AsfBuilder::new(512)
            .audio_stream(1, None)
            .video_stream(2)
            .preroll(3000)
            .duration(13.0)
            .build();
        let demuxer = open(data, DemuxConfig::default());
        assert_eq!(demuxer.format(), ContainerFormat::Asf);

        let audio = &demuxer.streams(StreamKind::Audio)[0];
        assert_eq!((audio.id, audio.codec.as_str(), audio.sample_rate), (1, "wmav2", 44_100));
        let video = &demuxer.streams(StreamKind::Video)[0];
        assert_eq!((video.id, video.codec.as_str(), video.width), (2, "WMV3", 320));
        assert_eq!(demuxer.duration(), Some(10.0));
    }

    #[test]
    fn test_fragments_reassemble_across_packets() {
        let data = AsfBuilder::new(512)
            .video_stream(2)
            .packet(0, vec![AsfSegment::fragment(2, 5, 0, 0, vec![1; 100]).keyframe()])
            .packet(0, vec![AsfSegment::fragment(2, 5, 100, 0, vec![2; 50])])
            .packet(40, vec![AsfSegment::fragment(2, 6, 0, 40, vec![3; 30])])
            .build();
        let mut demuxer = open(data, DemuxConfig::default());
        let queue = demuxer.queue(StreamKind::Video);

        assert!(demuxer.fill_buffer());
        assert!(demuxer.fill_buffer());
        assert!(queue.is_empty());
        assert!(demuxer.fill_buffer());
        assert_eq!(queue.len(), 1);

        let packets = drain(&mut demuxer, StreamKind::Video);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 150);
        assert_eq!(packets[0].data[99], 1);
        assert_eq!(packets[0].data[100], 2);
        assert!(packets[0].keyframe);
        assert_eq!(packets[1].len(), 30);
        assert_eq!(packets[1].pts, Some(0.04));
    }

    #[test]
    fn test_offset_gap_is_reported() {
        let data = AsfBuilder::new(512)
            .video_stream(2)
            .packet(0, vec![
                AsfSegment::fragment(2, 7, 0, 0, vec![1; 10]),
                AsfSegment::fragment(2, 7, 20, 0, vec![2; 10]),
            ])
            .build();
        let mut demuxer = open(data, DemuxConfig::default());
        let packets = drain(&mut demuxer, StreamKind::Video);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 20);
        assert_eq!(demuxer.stats().segment_mismatches, 1);
        assert!(matches!(
            demuxer.last_error(),
            Some(DemuxError::SegmentMismatch { stream: 2, expected: 10, got: 20 })
        ));
    }

    #[test]
    fn test_object_without_start_is_dropped() {
        let data = AsfBuilder::new(512)
            .video_stream(2)
            .packet(0, vec![AsfSegment::fragment(2, 9, 5, 0, vec![1; 10])])
            .packet(0, vec![AsfSegment::fragment(2, 10, 0, 0, vec![2; 10])])
            .build();
        let mut demuxer = open(data, DemuxConfig::default());
        let packets = drain(&mut demuxer, StreamKind::Video);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data[0], 2);
        assert_eq!(demuxer.stats().discarded_packets, 1);
    }

    #[test]
    fn test_audio_spread_is_undone() {
        let mut object = Vec::new();
        for n in 0..4u8 {
            object.extend([n; 4]);
        }
        let data = AsfBuilder::new(512)
            .audio_stream(1, Some((2, 8, 4)))
            .packet(0, vec![AsfSegment::fragment(1, 1, 0, 0, object)])
            .build();
        let mut demuxer = open(data, DemuxConfig::default());
        let packets = drain(&mut demuxer, StreamKind::Audio);

        let rows: Vec<u8> = packets[0].data.chunks(4).map(|c| c[0]).collect();
        assert_eq!(rows, vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_descramble_requires_exact_size() {
        let spread = AudioSpread {
            span: 2,
            packet_size: 8,
            chunk_size: 4,
        };
        assert!(descramble(&[0u8; 15], spread).is_none());
        let single = AudioSpread { span: 1, ..spread };
        assert!(descramble(&[0u8; 16], single).is_none());
    }

    #[test]
    fn test_grouped_payloads() {
        let data = AsfBuilder::new(512)
            .audio_stream(1, None)
            .preroll(500)
            .packet(2000, vec![AsfSegment::grouped(1, 3, 2000, vec![vec![1; 5], vec![2; 6], vec![3; 7]])])
            .build();
        let mut demuxer = open(data, DemuxConfig::default());
        let packets = drain(&mut demuxer, StreamKind::Audio);
        assert_eq!(packets.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![5, 6, 7]);
        assert!(packets.iter().all(|p| p.pts == Some(1.5)));
    }

    #[test]
    fn test_preroll_subtraction() {
        let build = || {
            AsfBuilder::new(512)
                .video_stream(2)
                .preroll(1000)
                .packet(3000, vec![AsfSegment::fragment(2, 1, 0, 3000, vec![1; 8])])
                .build()
        };
        let mut demuxer = open(build(), DemuxConfig::default());
        assert_eq!(demuxer.next_packet(StreamKind::Video).unwrap().pts, Some(2.0));

        let mut config = DemuxConfig::default();
        config.asf.subtract_preroll = false;
        let mut demuxer = open(build(), config);
        assert_eq!(demuxer.next_packet(StreamKind::Video).unwrap().pts, Some(3.0));
    }

    #[test]
    fn test_single_payload_packet() {
        let data = AsfBuilder::new(256)
            .video_stream(2)
            .single_packet(1000, AsfSegment::fragment(2, 1, 0, 1000, vec![7; 40]))
            .build();
        let mut demuxer = open(data, DemuxConfig::default());
        let packets = drain(&mut demuxer, StreamKind::Video);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].data[..], &[7u8; 40][..]);
    }

    #[test]
    fn test_simple_index_seek() {
        let mut builder = AsfBuilder::new(256).video_stream(2).duration(10.0);
        for k in 0..10u8 {
            let t = k as u32 * 1000;
            builder = builder.packet(t, vec![AsfSegment::fragment(2, k as u32, 0, t, vec![k; 16]).keyframe()]);
        }
        let data = builder.simple_index(10_000_000, (0..10).collect()).build();
        let mut demuxer = open(data, DemuxConfig::default());
        assert!(demuxer.info().indexed);

        demuxer.seek(4.5).unwrap();
        let packet = demuxer.next_packet(StreamKind::Video).unwrap();
        assert_eq!(packet.data[0], 4);
        assert_eq!(packet.pts, Some(4.0));
        assert_eq!(demuxer.sync_state(), SyncState::Synced);
    }

    #[test]
    fn test_oversized_packet_size_is_rejected() {
        let data = AsfBuilder::new(2 * 1024 * 1024).video_stream(2).build();
        let result = Demuxer::open_source(Box::new(MemorySource::new(data)), DemuxConfig::default());
        assert!(matches!(result, Err(DemuxError::InvalidHeader { .. })));
    }

    #[test]
    fn test_truncated_last_packet_ends_stream() {
        let mut data = AsfBuilder::new(256)
            .video_stream(2)
            .packet(0, vec![AsfSegment::fragment(2, 1, 0, 0, vec![1; 8]).keyframe()])
            .packet(40, vec![AsfSegment::fragment(2, 2, 0, 40, vec![2; 8])])
            .build();
        data.truncate(data.len() - 100);
        let mut demuxer = open(data, DemuxConfig::default());
        let packets = drain(&mut demuxer, StreamKind::Video);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data[0], 1);
        assert!(demuxer.last_error().is_none());
    }

    #[test]
    fn test_truncated_payload_is_reported() {
        let mut packet = vec![0x82, 0x00, 0x00, 0x11, 0x5D, 0x00, 0x00];
        packet.extend([0u8; 6]);
        packet.push(0x81); // one payload, u16 lengths follow but nothing else
        assert!(parse_packet(&packet, 256).is_err());
    }
}
