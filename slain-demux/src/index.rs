//! Seek table: presentation time → byte offset.
//!
//! Either read in one pass from a container index or grown lazily as packets
//! are demuxed. Entries are addressed by position in the table.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Entry flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct IndexFlags: u32 {
        /// Decoding can start here
        const SYNC = 0x1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Presentation time in seconds
    pub pts: f64,
    /// Container sequence number (frame number, packet number, ...)
    pub seq: u64,
    /// Byte offset of the chunk or packet
    pub offset: u64,
    pub flags: IndexFlags,
}

impl IndexEntry {
    pub fn is_sync(&self) -> bool {
        self.flags.contains(IndexFlags::SYNC)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeekIndex {
    entries: Vec<IndexEntry>,
    embedded: bool,
}

impl SeekIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table read verbatim from the container.
    pub fn from_embedded(entries: Vec<IndexEntry>) -> Self {
        tracing::debug!("Seek index: {} embedded entries", entries.len());
        Self {
            entries,
            embedded: true,
        }
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, handle: usize) -> Option<&IndexEntry> {
        self.entries.get(handle)
    }

    pub fn last(&self) -> Option<&IndexEntry> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Append unless a chunk at or past this offset is already indexed.
    pub fn push_if_new(&mut self, entry: IndexEntry) -> bool {
        if self.entries.last().is_some_and(|last| entry.offset <= last.offset) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Nearest entry not after `pts`, walking back to a sync point when one
    /// exists. Targets before the first entry resolve to the first entry.
    pub fn lookup(&self, pts: f64) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let after = self.entries.partition_point(|e| e.pts <= pts);
        if after == 0 {
            return Some(0);
        }
        let nearest = after - 1;
        let sync = self.entries[..=nearest].iter().rposition(IndexEntry::is_sync);
        Some(sync.unwrap_or(nearest))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.embedded = false;
    }
}
