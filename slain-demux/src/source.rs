//! # Byte Sources
//!
//! Raw byte providers feeding the cache or the demuxer directly:
//! - Local files and disc devices/images (`FileSource`)
//! - In-memory buffers (`MemorySource`)
//! - Raw TCP streams, forward-only (`TcpSource`)
//!
//! A source is exclusively owned by whoever opened it and closed on drop.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::error::{DemuxError, Result};

// ============================================================================
// Byte Source Trait
// ============================================================================

/// Sequential / random-access provider of raw bytes.
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes. Returns 0 only at end of data.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Move to an absolute byte position.
    fn seek(&mut self, pos: u64) -> io::Result<()>;

    /// Current absolute byte position.
    fn tell(&self) -> u64;

    /// True once a read has hit end of data.
    fn eof(&self) -> bool;

    /// Total length, if known.
    fn len(&self) -> Option<u64> {
        None
    }

    /// Whether `seek` can move backwards.
    fn is_seekable(&self) -> bool {
        true
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        (**self).seek(pos)
    }

    fn tell(&self) -> u64 {
        (**self).tell()
    }

    fn eof(&self) -> bool {
        (**self).eof()
    }

    fn len(&self) -> Option<u64> {
        (**self).len()
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }
}

// ============================================================================
// File / Disc Source
// ============================================================================

/// Local file, disc image or block device.
pub struct FileSource {
    file: File,
    path: PathBuf,
    pos: u64,
    len: Option<u64>,
    eof: bool,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // Block devices report zero; treat that as unknown.
        let len = file.metadata().ok().map(|m| m.len()).filter(|&l| l > 0);
        tracing::debug!("Opened {} ({:?} bytes)", path.display(), len);
        Ok(Self {
            file,
            path,
            pos: 0,
            len,
            eof: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = loop {
            match self.file.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.pos += n as u64;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        self.eof = self.len.is_some_and(|len| pos >= len);
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn len(&self) -> Option<u64> {
        self.len
    }
}

// ============================================================================
// Memory Source
// ============================================================================

/// Bytes already in memory.
pub struct MemorySource {
    data: Bytes,
    pos: u64,
    eof: bool,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            eof: false,
        }
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.pos = pos;
        self.eof = pos >= self.data.len() as u64;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

// ============================================================================
// TCP Source
// ============================================================================

const TCP_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw TCP stream. Forward seeks discard bytes; backward seeks fail.
pub struct TcpSource {
    socket: TcpStream,
    pos: u64,
    eof: bool,
}

impl TcpSource {
    pub fn connect(addr: &str) -> io::Result<Self> {
        let socket = TcpStream::connect(addr)?;
        socket.set_read_timeout(Some(TCP_READ_TIMEOUT))?;
        socket.set_nodelay(true).ok();
        tracing::info!("Connected to {}", addr);
        Ok(Self {
            socket,
            pos: 0,
            eof: false,
        })
    }
}

impl ByteSource for TcpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = loop {
            match self.socket.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.pos += n as u64;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        if pos < self.pos {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot seek back from {} to {} on a network stream", self.pos, pos),
            ));
        }
        let mut scratch = [0u8; 4096];
        while self.pos < pos {
            let want = ((pos - self.pos) as usize).min(scratch.len());
            if self.read(&mut scratch[..want])? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

// ============================================================================
// Opening by URI
// ============================================================================

/// Open a source by URI: bare path, `file://`, `dvd://`/`disc://`/`cdrom://`
/// (device or image path), or `tcp://host:port`.
pub fn open(uri: &str) -> Result<Box<dyn ByteSource>> {
    // Single-letter schemes are Windows drive letters, not URLs.
    let url = Url::parse(uri).ok().filter(|u| u.scheme().len() > 1);

    let Some(url) = url else {
        return Ok(Box::new(FileSource::open(uri)?));
    };

    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| DemuxError::UnsupportedSource(uri.to_string()))?;
            Ok(Box::new(FileSource::open(path)?))
        }
        "dvd" | "disc" | "cdrom" => {
            let device = device_path(&url)
                .ok_or_else(|| DemuxError::UnsupportedSource(format!("{uri}: no device path")))?;
            Ok(Box::new(FileSource::open(device)?))
        }
        "tcp" => {
            let host = url
                .host_str()
                .ok_or_else(|| DemuxError::UnsupportedSource(format!("{uri}: missing host")))?;
            let port = url
                .port()
                .ok_or_else(|| DemuxError::UnsupportedSource(format!("{uri}: missing port")))?;
            Ok(Box::new(TcpSource::connect(&format!("{host}:{port}"))?))
        }
        other => Err(DemuxError::UnsupportedSource(format!("scheme '{other}'"))),
    }
}

fn device_path(url: &Url) -> Option<String> {
    let path = url.path();
    if !path.is_empty() && path != "/" {
        return Some(path.to_string());
    }
    // dvd://sr0 puts the device in the host slot
    url.host_str().map(|host| format!("/dev/{host}"))
}
