//! # Demux Configuration
//!
//! Tunables for the read-ahead cache, the format detector and the three
//! container parsers. Every field has a serde default so partial configs
//! deserialize cleanly.

use serde::{Deserialize, Serialize};

// ============================================================================
// Read-Ahead Cache
// ============================================================================

/// Read-ahead cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Ring buffer size in bytes.
    ///
    /// Default: 1 MiB.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Bytes always retained behind the read cursor for cheap backward seeks.
    ///
    /// Default: 256 KiB.
    #[serde(default = "default_back_size")]
    pub back_size: usize,

    /// Fill is skipped while less than this much space is free.
    ///
    /// Default: 32 KiB.
    #[serde(default = "default_fill_threshold")]
    pub fill_threshold: usize,

    /// Largest single read issued against the source.
    ///
    /// Default: 32 KiB.
    #[serde(default = "default_max_chunk")]
    pub max_chunk: usize,

    /// Run the filler on its own thread instead of inline with reads.
    ///
    /// Default: true.
    #[serde(default = "default_threaded")]
    pub threaded: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            back_size: default_back_size(),
            fill_threshold: default_fill_threshold(),
            max_chunk: default_max_chunk(),
            threaded: default_threaded(),
        }
    }
}

impl CacheConfig {
    /// Larger buffer for bursty network sources.
    pub fn network() -> Self {
        Self {
            capacity: 8 * 1024 * 1024,
            back_size: 1024 * 1024,
            fill_threshold: 64 * 1024,
            max_chunk: 64 * 1024,
            ..Default::default()
        }
    }

    /// Sector-aligned reads for optical media.
    pub fn disc() -> Self {
        Self {
            capacity: 4 * 1024 * 1024,
            back_size: 512 * 1024,
            fill_threshold: 4 * 2048,
            max_chunk: 16 * 2048,
            ..Default::default()
        }
    }

    /// Clamp values into a usable shape.
    pub(crate) fn normalized(&self) -> Self {
        let capacity = self.capacity.max(4096);
        let back_size = self.back_size.min(capacity / 2);
        Self {
            capacity,
            back_size,
            // With nothing unread there must always be room for a fill.
            fill_threshold: self.fill_threshold.clamp(1, capacity - back_size),
            max_chunk: self.max_chunk.clamp(1, capacity),
            threaded: self.threaded,
        }
    }
}

fn default_cache_capacity() -> usize {
    1024 * 1024
}

fn default_back_size() -> usize {
    256 * 1024
}

fn default_fill_threshold() -> usize {
    32 * 1024
}

fn default_max_chunk() -> usize {
    32 * 1024
}

fn default_threaded() -> bool {
    true
}

// ============================================================================
// Container Parsers
// ============================================================================

/// AVI parser configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AviConfig {
    /// Index entries that may fail validation in a row before giving up.
    #[serde(default = "default_max_index_mismatches")]
    pub max_index_mismatches: u32,

    /// Distance between first audio and first video chunk that marks a file
    /// as non-interleaved.
    #[serde(default = "default_non_interleaved_threshold")]
    pub non_interleaved_threshold: u64,

    /// Treat every indexed file as non-interleaved.
    #[serde(default)]
    pub force_non_interleaved: bool,

    /// Bytes the sequential reader may scan while hunting for a chunk id.
    #[serde(default = "default_avi_resync_budget")]
    pub resync_budget: u64,
}

impl Default for AviConfig {
    fn default() -> Self {
        Self {
            max_index_mismatches: default_max_index_mismatches(),
            non_interleaved_threshold: default_non_interleaved_threshold(),
            force_non_interleaved: false,
            resync_budget: default_avi_resync_budget(),
        }
    }
}

fn default_max_index_mismatches() -> u32 {
    32
}

fn default_non_interleaved_threshold() -> u64 {
    1024 * 1024
}

fn default_avi_resync_budget() -> u64 {
    1024 * 1024
}

/// MPEG program stream parser configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpegConfig {
    /// Packets longer than this are discarded as corrupt.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Bytes scanned in one fill without reaching sync before giving up.
    #[serde(default = "default_mpeg_resync_budget")]
    pub resync_budget: u64,

    /// Skipped bytes after which an elementary-looking stream is rejected.
    #[serde(default = "default_es_failover_skip")]
    pub es_failover_skip: u64,

    /// Elementary start codes (0x100 and 0x101 each) needed to reject.
    #[serde(default = "default_es_failover_count")]
    pub es_failover_count: u32,

    /// Packets read at open time while discovering streams.
    #[serde(default = "default_probe_packets")]
    pub probe_packets: u32,
}

impl Default for MpegConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
            resync_budget: default_mpeg_resync_budget(),
            es_failover_skip: default_es_failover_skip(),
            es_failover_count: default_es_failover_count(),
            probe_packets: default_probe_packets(),
        }
    }
}

fn default_max_packet_size() -> usize {
    224 * 1024
}

fn default_mpeg_resync_budget() -> u64 {
    16 * 1024 * 1024
}

fn default_es_failover_skip() -> u64 {
    4_000_000
}

fn default_es_failover_count() -> u32 {
    50
}

fn default_probe_packets() -> u32 {
    256
}

/// ASF parser configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsfConfig {
    /// Shift timestamps so the first sample plays at zero.
    #[serde(default = "default_subtract_preroll")]
    pub subtract_preroll: bool,
}

impl Default for AsfConfig {
    fn default() -> Self {
        Self {
            subtract_preroll: default_subtract_preroll(),
        }
    }
}

fn default_subtract_preroll() -> bool {
    true
}

// ============================================================================
// Demuxer
// ============================================================================

/// Top-level configuration for an open session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemuxConfig {
    /// Read-ahead cache. With `None`, seekable sources are read directly and
    /// the rest get `CacheConfig::network()`.
    #[serde(default)]
    pub cache: Option<CacheConfig>,

    /// Bytes the format detector may inspect.
    #[serde(default = "default_detect_prefix")]
    pub detect_prefix: usize,

    #[serde(default)]
    pub avi: AviConfig,

    #[serde(default)]
    pub mpeg: MpegConfig,

    #[serde(default)]
    pub asf: AsfConfig,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            cache: None,
            detect_prefix: default_detect_prefix(),
            avi: AviConfig::default(),
            mpeg: MpegConfig::default(),
            asf: AsfConfig::default(),
        }
    }
}

impl DemuxConfig {
    /// Defaults plus a read-ahead cache.
    pub fn cached(cache: CacheConfig) -> Self {
        Self {
            cache: Some(cache),
            ..Default::default()
        }
    }
}

fn default_detect_prefix() -> usize {
    32 * 1024
}
