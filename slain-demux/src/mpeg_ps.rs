// MPEG-PS DEMUXER - MPEG-1/MPEG-2 Program Stream Parser
//
// Program streams carry:
// • DVD-Video (VOB files)
// • VCD / SVCD (.dat, .mpg)
// • Camcorder and capture-card .mpg files
//
// Variable-length packs of PES packets, found by scanning for 00 00 01
// start codes. No structure to lean on when bytes are damaged, so the
// parser tracks whether it currently trusts the stream.

use std::io;

use crate::demuxer::{DemuxContext, SyncState};
use crate::detect::{ContainerFormat, PACK_START_CODE, SYSTEM_HEADER_START_CODE};
use crate::error::{DemuxError, Result};
use crate::packet::Packet;
use crate::packet_queue::{StreamInfo, StreamKind};
use crate::stream::MediaStream;

// ============================================================================
// Constants
// ============================================================================

const PROGRAM_END_CODE: u32 = 0x1B9;
const PROGRAM_STREAM_MAP: u32 = 0x1BC;
const PRIVATE_STREAM_1: u32 = 0x1BD;
const PADDING_STREAM: u32 = 0x1BE;
const PRIVATE_STREAM_2: u32 = 0x1BF;

// Elementary stream start codes seen when the input is not a program stream
const PICTURE_START_CODE: u32 = 0x100;
const FIRST_SLICE_CODE: u32 = 0x101;

// Start codes inside video payload that mark a random access point
const SEQUENCE_HEADER: u8 = 0xB3;
const GOP_START: u8 = 0xB8;

const PTS_CLOCK: f64 = 90_000.0;

/// Mux rate is stored in units of 50 bytes per second.
const MUX_RATE_UNIT: u32 = 50;

/// Used for seek estimates before any pack header has been seen.
const FALLBACK_BYTE_RATE: u32 = 1_260_000;

// ============================================================================
// Timestamps
// ============================================================================

/// 33-bit timestamp from the 5-byte PTS/DTS/SCR layout. Every marker bit
/// must be set; anything else is garbage.
fn decode_timestamp(c: u8, d: u16, e: u16) -> Option<u64> {
    if c & 1 == 0 || d & 1 == 0 || e & 1 == 0 {
        return None;
    }
    Some(((c as u64 >> 1) & 7) << 30 | ((d as u64) >> 1) << 15 | (e as u64) >> 1)
}

fn read_timestamp(b: &[u8]) -> Option<f64> {
    let t = b.get(..5)?;
    let d = u16::from_be_bytes([t[1], t[2]]);
    let e = u16::from_be_bytes([t[3], t[4]]);
    decode_timestamp(t[0], d, e).map(|ticks| ticks as f64 / PTS_CLOCK)
}

/// Truncated input reads as `None`.
fn or_eof<T>(r: io::Result<T>) -> Result<Option<T>> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// True if `data` contains a sequence header or GOP start code.
fn has_random_access_point(data: &[u8]) -> bool {
    data.windows(4)
        .any(|w| w[..3] == [0, 0, 1] && matches!(w[3], SEQUENCE_HEADER | GOP_START))
}

// ============================================================================
// Pack Header
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PackHeader {
    scr: Option<f64>,
    /// Bytes per second
    mux_rate: u32,
    mpeg2: bool,
}

fn read_pack_header(input: &mut MediaStream) -> io::Result<Option<PackHeader>> {
    let c = match input.peek(1)?.first() {
        Some(&c) => c,
        None => return Ok(None),
    };

    if c >> 6 == 1 {
        let b = input.read_vec(10)?;
        let scr = ((b[0] as u64 >> 3) & 7) << 30
            | (b[0] as u64 & 3) << 28
            | (b[1] as u64) << 20
            | (b[2] as u64 >> 3) << 15
            | (b[2] as u64 & 3) << 13
            | (b[3] as u64) << 5
            | (b[4] as u64) >> 3;
        let rate = (b[6] as u32) << 14 | (b[7] as u32) << 6 | (b[8] as u32) >> 2;
        input.skip((b[9] & 7) as u64)?;
        Ok(Some(PackHeader {
            scr: Some(scr as f64 / PTS_CLOCK),
            mux_rate: rate * MUX_RATE_UNIT,
            mpeg2: true,
        }))
    } else if c >> 4 == 2 {
        let b = input.read_vec(8)?;
        let rate = ((b[5] & 0x7F) as u32) << 15 | (b[6] as u32) << 7 | (b[7] as u32) >> 1;
        Ok(Some(PackHeader {
            scr: read_timestamp(&b),
            mux_rate: rate * MUX_RATE_UNIT,
            mpeg2: false,
        }))
    } else {
        Ok(None)
    }
}

// ============================================================================
// PES Header
// ============================================================================

/// Skip stuffing and the optional header fields of a PES body. Returns the
/// payload offset and timestamp, or `None` if the header is malformed.
fn parse_pes_header(body: &[u8]) -> Option<(usize, Option<f64>)> {
    let mut i = 0;
    while *body.get(i)? == 0xFF {
        i += 1;
    }

    let mut c = *body.get(i)?;
    if c >> 6 == 1 {
        // STD buffer scale and size
        i += 2;
        c = *body.get(i)?;
    }

    if c >> 6 == 2 {
        let flags = *body.get(i + 1)?;
        let header_len = *body.get(i + 2)? as usize;
        let payload = i + 3 + header_len;
        if payload > body.len() {
            return None;
        }
        let pts = if flags >> 6 >= 2 && header_len >= 5 {
            read_timestamp(&body[i + 3..])
        } else {
            None
        };
        Some((payload, pts))
    } else if c >> 4 == 2 {
        Some((i + 5, read_timestamp(body.get(i..)?)))
    } else if c >> 4 == 3 {
        // PTS followed by DTS
        Some((i + 10, read_timestamp(body.get(i..)?)))
    } else if c == 0x0F {
        Some((i + 1, None))
    } else {
        None
    }
}

/// Where a PES packet goes: channel, stream id, codec and payload offset.
struct Route {
    kind: StreamKind,
    id: u32,
    codec: &'static str,
    skip: usize,
}

fn route_private_stream(sub_id: u8) -> Option<Route> {
    let (codec, skip) = match sub_id {
        0x80..=0x87 => ("ac3", 4),
        0x88..=0x8F => ("dts", 4),
        0xA0..=0xA7 => ("lpcm", 7),
        // Subpictures and anything unrecognised
        _ => return None,
    };
    Some(Route {
        kind: StreamKind::Audio,
        id: sub_id as u32,
        codec,
        skip,
    })
}

// ============================================================================
// Program Stream Demuxer
// ============================================================================

pub struct MpegPsDemuxer {
    /// Start-code shift register
    head: u32,
    mpeg2: bool,
    /// Latest mux rate in bytes per second
    mux_rate: u32,
    last_scr: Option<f64>,
    /// Offset of the first pack header
    data_start: Option<u64>,
    ever_synced: bool,
    /// Bytes consumed without sync, for the elementary-stream check
    unsynced_bytes: u64,
    picture_codes: u32,
    slice_codes: u32,
    unsynced_pes: u32,
}

impl MpegPsDemuxer {
    /// Discover streams by demuxing until both channels are fed or the probe
    /// budget runs out. Packets read here stay queued.
    pub fn open(ctx: &mut DemuxContext) -> Result<Self> {
        let mut demuxer = Self {
            head: 0xFFFF_FFFF,
            mpeg2: false,
            mux_rate: 0,
            last_scr: None,
            data_start: None,
            ever_synced: false,
            unsynced_bytes: 0,
            picture_codes: 0,
            slice_codes: 0,
            unsynced_pes: 0,
        };

        let probe = ctx.config.mpeg.probe_packets;
        let mut packets = 0;
        while packets < probe && !(ctx.audio.is_selected() && ctx.video.is_selected()) {
            match demuxer.fill_buffer(ctx) {
                Ok(true) => packets += 1,
                Ok(false) => break,
                Err(DemuxError::DemuxDesync { skipped, .. }) if !demuxer.ever_synced => {
                    tracing::info!("Not a program stream ({} bytes without sync)", skipped);
                    return Err(DemuxError::UnknownFormat);
                }
                Err(e) => return Err(e),
            }
        }
        if !demuxer.ever_synced {
            return Err(DemuxError::UnknownFormat);
        }

        tracing::info!(
            "MPEG-{} program stream: {} packets probed, mux rate {} B/s",
            if demuxer.mpeg2 { 2 } else { 1 },
            packets,
            demuxer.mux_rate
        );
        Ok(demuxer)
    }

    /// Demux until one packet reaches a selected stream. Returns false at
    /// end of input.
    pub fn fill_buffer(&mut self, ctx: &mut DemuxContext) -> Result<bool> {
        let budget = ctx.config.mpeg.resync_budget;
        let mut skipped = 0u64;

        loop {
            let start = ctx.input.tell();
            let Some(code) = self.next_start_code(&mut ctx.input, budget.saturating_sub(skipped))? else {
                return Ok(false);
            };
            let pos = ctx.input.tell() - 4;
            let gap = pos - start;
            if gap > 0 {
                skipped += gap;
                ctx.stats.skipped_bytes += gap;
                tracing::trace!("Skipped {} bytes before start code {:#x} at {:#x}", gap, code, pos);
            }
            if skipped > budget {
                return Err(self.desync(skipped));
            }

            if ctx.sync == SyncState::Unsynced {
                self.unsynced_bytes += gap + 4;
                if code != PACK_START_CODE {
                    self.count_unsynced(code);
                    self.check_elementary(ctx)?;
                    continue;
                }
            }

            match code {
                PACK_START_CODE => {
                    if ctx.sync == SyncState::Unsynced {
                        ctx.sync = SyncState::Probing;
                        tracing::debug!("Pack header at {:#x}, probing", pos);
                    }
                    self.read_pack(ctx, pos)?;
                }
                SYSTEM_HEADER_START_CODE | PROGRAM_STREAM_MAP | PADDING_STREAM | PRIVATE_STREAM_2 => {
                    if code == SYSTEM_HEADER_START_CODE {
                        self.mark_synced(ctx);
                    }
                    let Some(len) = or_eof(ctx.input.read_u16_be())? else {
                        return Ok(false);
                    };
                    ctx.input.skip(len as u64)?;
                }
                PROGRAM_END_CODE => {}
                PRIVATE_STREAM_1 | 0x1C0..=0x1EF => {
                    self.mark_synced(ctx);
                    match self.read_pes(ctx, code, pos)? {
                        Some(true) => return Ok(true),
                        Some(false) => {}
                        None => return Ok(false),
                    }
                }
                _ => {
                    if ctx.sync == SyncState::Probing {
                        tracing::debug!("Unexpected start code {:#x} at {:#x}, lost sync", code, pos);
                        ctx.sync = SyncState::Unsynced;
                        ctx.stats.resyncs += 1;
                    }
                }
            }
        }
    }

    fn desync(&self, skipped: u64) -> DemuxError {
        DemuxError::DemuxDesync {
            format: ContainerFormat::Mpeg,
            skipped,
        }
    }

    /// Next start code, or `None` at end of input. Gives up after `limit`
    /// bytes that are not part of the code.
    fn next_start_code(&mut self, input: &mut MediaStream, limit: u64) -> Result<Option<u32>> {
        self.head = 0xFFFF_FFFF;
        let mut consumed = 0u64;
        loop {
            let Some(b) = input.next_byte()? else {
                return Ok(None);
            };
            consumed += 1;
            self.head = (self.head << 8) | b as u32;
            if self.head & 0xFFFF_FF00 == 0x100 {
                return Ok(Some(self.head));
            }
            if consumed > limit + 4 {
                return Err(self.desync(consumed));
            }
        }
    }

    fn mark_synced(&mut self, ctx: &mut DemuxContext) {
        if ctx.sync != SyncState::Synced {
            tracing::debug!("Program stream synced at {:#x}", ctx.input.tell());
        }
        ctx.sync = SyncState::Synced;
        self.ever_synced = true;
    }

    fn count_unsynced(&mut self, code: u32) {
        match code {
            PICTURE_START_CODE => self.picture_codes += 1,
            FIRST_SLICE_CODE => self.slice_codes += 1,
            PRIVATE_STREAM_1 | 0x1C0..=0x1EF => self.unsynced_pes += 1,
            _ => {}
        }
    }

    /// Give up on input that looks like a bare elementary stream.
    fn check_elementary(&self, ctx: &DemuxContext) -> Result<()> {
        if self.ever_synced {
            return Ok(());
        }
        let config = &ctx.config.mpeg;
        let n = config.es_failover_count;
        let elementary = self.picture_codes > n && self.slice_codes > n;
        if self.unsynced_bytes > config.es_failover_skip && (elementary || self.unsynced_pes > n) {
            tracing::warn!(
                "Elementary stream codes without pack structure ({} picture, {} slice, {} PES)",
                self.picture_codes,
                self.slice_codes,
                self.unsynced_pes
            );
            return Err(self.desync(self.unsynced_bytes));
        }
        Ok(())
    }

    fn read_pack(&mut self, ctx: &mut DemuxContext, pos: u64) -> Result<()> {
        match read_pack_header(&mut ctx.input) {
            Ok(Some(pack)) => {
                self.mpeg2 = pack.mpeg2;
                if pack.mux_rate > 0 {
                    self.mux_rate = pack.mux_rate;
                }
                if pack.scr.is_some() {
                    self.last_scr = pack.scr;
                }
                self.data_start.get_or_insert(pos);
                Ok(())
            }
            Ok(None) => {
                tracing::debug!("Malformed pack header at {:#x}", pos);
                ctx.sync = SyncState::Unsynced;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// One PES packet. `Some(true)` if it reached a selected stream,
    /// `Some(false)` if it was dropped, `None` at end of input.
    fn read_pes(&mut self, ctx: &mut DemuxContext, code: u32, pos: u64) -> Result<Option<bool>> {
        let Some(len) = or_eof(ctx.input.read_u16_be())? else {
            return Ok(None);
        };
        let len = len as usize;
        if len == 0 || len > ctx.config.mpeg.max_packet_size {
            tracing::debug!("Discarding PES {:#x} at {:#x} with length {}", code, pos, len);
            ctx.stats.discarded_packets += 1;
            return Ok(Some(false));
        }
        let Some(body) = or_eof(ctx.input.read_vec(len))? else {
            return Ok(None);
        };

        let Some((mut payload, pts)) = parse_pes_header(&body) else {
            tracing::debug!("Malformed PES header {:#x} at {:#x}", code, pos);
            ctx.stats.discarded_packets += 1;
            return Ok(Some(false));
        };

        let route = match code {
            PRIVATE_STREAM_1 => body.get(payload).copied().and_then(route_private_stream),
            0x1C0..=0x1DF => Some(Route {
                kind: StreamKind::Audio,
                id: code - 0x1C0,
                codec: "mpa",
                skip: 0,
            }),
            _ => Some(Route {
                kind: StreamKind::Video,
                id: code - 0x1E0,
                codec: if self.mpeg2 { "mpeg2video" } else { "mpeg1video" },
                skip: 0,
            }),
        };
        let Some(route) = route else {
            ctx.stats.discarded_packets += 1;
            return Ok(Some(false));
        };
        payload += route.skip;
        if payload > body.len() {
            ctx.stats.discarded_packets += 1;
            return Ok(Some(false));
        }

        let info = StreamInfo {
            id: route.id,
            codec: route.codec.to_string(),
            ..Default::default()
        };
        if ctx.discover(route.kind, info) {
            ctx.auto_select(route.kind);
        }
        if !ctx.stream(route.kind).accepts(route.id) {
            return Ok(Some(false));
        }

        let data = &body[payload..];
        let keyframe = route.kind == StreamKind::Audio || has_random_access_point(data);
        let packet = Packet::new(route.id, data.to_vec(), pts, pos).with_keyframe(keyframe);
        ctx.emit(route.kind, packet);
        Ok(Some(true))
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    /// Jump through the lazily built index when the target lies inside it,
    /// otherwise extrapolate with the mux rate. The scanner resynchronizes
    /// from wherever it lands.
    pub fn seek(&mut self, ctx: &mut DemuxContext, target: f64) -> Result<()> {
        let indexed = ctx
            .index
            .last()
            .filter(|last| target <= last.pts)
            .and_then(|_| ctx.index.lookup(target))
            .and_then(|h| ctx.index.get(h))
            .map(|e| e.offset);

        let pos = match indexed {
            Some(offset) => offset,
            None => {
                let (base, base_pts) = match ctx.index.last() {
                    Some(last) => (last.offset, last.pts),
                    None => (self.data_start.unwrap_or(0), 0.0),
                };
                let rate = if self.mux_rate > 0 { self.mux_rate } else { FALLBACK_BYTE_RATE };
                let guess = base + ((target - base_pts).max(0.0) * rate as f64) as u64;
                match ctx.input.len() {
                    Some(len) => guess.min(len),
                    None => guess,
                }
            }
        };

        tracing::debug!(
            "MPEG-PS seek to {:.3}s from SCR {:?}: byte {:#x} ({})",
            target,
            self.last_scr,
            pos,
            if indexed.is_some() { "index" } else { "estimate" }
        );
        self.head = 0xFFFF_FFFF;
        ctx.input.seek(pos)?;
        Ok(())
    }
}
