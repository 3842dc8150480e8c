//! # Container Format Detection
//!
//! Signatures are tried in a fixed order on a peeked prefix:
//! 1. RIFF/AVI tag
//! 2. ASF header object GUID
//! 3. MPEG program stream (pack header, or a start-code census where pack
//!    and PES codes outvote elementary-stream codes)

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DemuxError, Result};
use crate::stream::MediaStream;

/// Supported container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Avi,
    Mpeg,
    Asf,
}

impl ContainerFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ContainerFormat::Avi => "AVI",
            ContainerFormat::Mpeg => "MPEG-PS",
            ContainerFormat::Asf => "ASF",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// ASF Header Object GUID as stored on disk.
pub const ASF_HEADER_GUID: [u8; 16] = [
    0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C,
];

pub const PACK_START_CODE: u32 = 0x1BA;
pub const SYSTEM_HEADER_START_CODE: u32 = 0x1BB;

/// Start codes counted by kind over a byte window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartCodeCensus {
    pub pack: u32,
    pub system: u32,
    pub pes: u32,
    /// Picture, slice and sequence codes of a bare elementary stream.
    pub elementary: u32,
}

impl StartCodeCensus {
    pub fn scan(data: &[u8]) -> Self {
        let mut census = Self::default();
        let mut head: u32 = 0xFF_FFFF;
        for &b in data {
            head = ((head << 8) | b as u32) & 0xFFFF_FFFF;
            if head >> 8 != 0x00_0001 {
                continue;
            }
            match b {
                0xBA => census.pack += 1,
                0xBB => census.system += 1,
                0xBD | 0xC0..=0xEF => census.pes += 1,
                0x00..=0xB9 => census.elementary += 1,
                _ => {}
            }
        }
        census
    }

    pub fn looks_like_program_stream(&self) -> bool {
        self.pack > 0 && self.pack + self.system + self.pes > self.elementary
    }
}

/// Identify the container from the first bytes of `data`.
pub fn detect_bytes(data: &[u8]) -> Result<ContainerFormat> {
    if data.len() >= 12 && &data[0..4] == b"RIFF" && matches!(&data[8..12], b"AVI " | b"AVIX") {
        return Ok(ContainerFormat::Avi);
    }

    if data.starts_with(&ASF_HEADER_GUID) {
        return Ok(ContainerFormat::Asf);
    }

    if data.starts_with(&[0x00, 0x00, 0x01, 0xBA]) {
        return Ok(ContainerFormat::Mpeg);
    }
    let census = StartCodeCensus::scan(data);
    tracing::trace!("Start code census: {:?}", census);
    if census.looks_like_program_stream() {
        return Ok(ContainerFormat::Mpeg);
    }

    Err(DemuxError::UnknownFormat)
}

/// Peek at most `prefix` bytes of `input` and identify the container.
pub fn detect(input: &mut MediaStream, prefix: usize) -> Result<ContainerFormat> {
    let head = input.peek(prefix)?;
    let format = detect_bytes(head)?;
    tracing::info!("Detected {} container", format);
    Ok(format)
}
