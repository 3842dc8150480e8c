//! # SLAIN Demux
//!
//! Container demultiplexing for the player: AVI, MPEG program streams and
//! ASF split into per-stream packet queues, fed by a read-ahead byte cache.

// ============================================================================
// Foundation
// ============================================================================
pub mod error;
pub mod config;

// ============================================================================
// Byte Input
// ============================================================================
pub mod source;
pub mod cache;
pub mod stream;

// ============================================================================
// Packets / Queues / Index
// ============================================================================
pub mod packet;
pub mod packet_queue;
pub mod index;

// ============================================================================
// Container Demuxers
// ============================================================================
pub mod detect;
pub mod demuxer;
pub mod avi_demux;
pub mod mpeg_ps;
pub mod asf_demux;

#[cfg(test)]
mod fixtures;

pub use config::{AsfConfig, AviConfig, CacheConfig, DemuxConfig, MpegConfig};
pub use demuxer::{probe, DemuxStats, Demuxer, MediaInfo, SyncState};
pub use detect::ContainerFormat;
pub use error::{DemuxError, Result};
pub use packet::Packet;
pub use packet_queue::{PacketQueue, StreamInfo, StreamKind};
pub use source::ByteSource;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
