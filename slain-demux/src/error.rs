//! # Demux Error Types
//!
//! Everything that can go wrong between the byte source and the packet queues.
//! Fatal errors end the session; recoverable ones are logged, counted and the
//! offending chunk or segment is skipped.

use thiserror::Error;

use crate::detect::ContainerFormat;

#[derive(Debug, Error)]
pub enum DemuxError {
    // ========================================================================
    // Source Errors
    // ========================================================================
    /// Read or seek on the underlying source failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The URI names a scheme or device we cannot open.
    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    // ========================================================================
    // Format Errors
    // ========================================================================
    /// No container signature matched within the probe window.
    #[error("Unknown container format")]
    UnknownFormat,

    /// Container header is malformed beyond repair.
    #[error("Invalid {format} header: {reason}")]
    InvalidHeader {
        format: ContainerFormat,
        reason: String,
    },

    /// Synchronization was lost and the retry budget ran out.
    #[error("{format} demuxer lost sync ({skipped} bytes skipped)")]
    DemuxDesync {
        format: ContainerFormat,
        skipped: u64,
    },

    // ========================================================================
    // Per-entry Inconsistencies (non-fatal)
    // ========================================================================
    /// On-disk chunk disagrees with the index entry that points at it.
    #[error("Corrupt chunk at offset {offset:#x}: {reason}")]
    ChunkCorrupt { offset: u64, reason: String },

    /// Fragment offset does not continue the partial packet.
    #[error("Segment mismatch on stream {stream}: expected offset {expected}, got {got}")]
    SegmentMismatch { stream: u32, expected: usize, got: usize },

    /// Stream metadata could not be rendered as JSON.
    #[error("Metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),

    // ========================================================================
    // Caller Errors
    // ========================================================================
    /// The requested stream id is not selected or does not exist.
    #[error("No such stream: {0}")]
    NoSuchStream(u32),
}

impl DemuxError {
    /// Returns `true` if the demuxer cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Returns `true` for per-entry inconsistencies that only cost one packet.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DemuxError::ChunkCorrupt { .. }
                | DemuxError::SegmentMismatch { .. }
                | DemuxError::NoSuchStream(_)
        )
    }

    pub(crate) fn invalid(format: ContainerFormat, reason: impl Into<String>) -> Self {
        DemuxError::InvalidHeader {
            format,
            reason: reason.into(),
        }
    }
}

/// Result type for demux operations.
pub type Result<T> = std::result::Result<T, DemuxError>;
