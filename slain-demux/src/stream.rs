//! Buffered, position-tracking reader over a [`ByteSource`].
//!
//! Container parsers pull small big/little-endian fields and whole chunks
//! through this; it keeps a short lookahead so format detection can peek
//! without consuming.

use std::io;

use crate::source::ByteSource;

const BUFFER_SIZE: usize = 64 * 1024;

pub struct MediaStream {
    source: Box<dyn ByteSource>,
    buf: Vec<u8>,
    buf_pos: usize,
    /// File position of `buf[0]`.
    buf_start: u64,
    hit_eof: bool,
}

fn unexpected_eof(pos: u64) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("end of stream at {pos}"))
}

impl MediaStream {
    pub fn new(source: Box<dyn ByteSource>) -> Self {
        let buf_start = source.tell();
        Self {
            source,
            buf: Vec::with_capacity(BUFFER_SIZE),
            buf_pos: 0,
            buf_start,
            hit_eof: false,
        }
    }

    pub fn tell(&self) -> u64 {
        self.buf_start + self.buf_pos as u64
    }

    pub fn len(&self) -> Option<u64> {
        self.source.len()
    }

    pub fn is_seekable(&self) -> bool {
        self.source.is_seekable()
    }

    pub fn eof(&self) -> bool {
        self.buf_pos == self.buf.len() && (self.hit_eof || self.source.eof())
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.buf_pos
    }

    /// Make sure at least `want` bytes are buffered unless the source runs out.
    fn fill(&mut self, want: usize) -> io::Result<()> {
        if self.buffered() >= want || self.hit_eof {
            return Ok(());
        }
        if self.buf_pos > 0 {
            self.buf_start += self.buf_pos as u64;
            self.buf.drain(..self.buf_pos);
            self.buf_pos = 0;
        }
        let target = want.max(BUFFER_SIZE);
        while self.buf.len() < want {
            let old = self.buf.len();
            self.buf.resize(target, 0);
            let n = match self.source.read(&mut self.buf[old..]) {
                Ok(n) => n,
                Err(e) => {
                    self.buf.truncate(old);
                    return Err(e);
                }
            };
            self.buf.truncate(old + n);
            if n == 0 {
                self.hit_eof = true;
                break;
            }
        }
        Ok(())
    }

    /// Look at up to `n` upcoming bytes without consuming them.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        self.fill(n)?;
        let end = self.buf_pos + n.min(self.buffered());
        Ok(&self.buf[self.buf_pos..end])
    }

    /// Next byte, or `None` at end of stream.
    pub fn next_byte(&mut self) -> io::Result<Option<u8>> {
        self.fill(1)?;
        if self.buf_pos == self.buf.len() {
            return Ok(None);
        }
        let b = self.buf[self.buf_pos];
        self.buf_pos += 1;
        Ok(Some(b))
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let pos = self.tell();
        self.next_byte()?.ok_or_else(|| unexpected_eof(pos))
    }

    fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut out = [0u8; N];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    pub fn read_u16_le(&mut self) -> io::Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16_be(&mut self) -> io::Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32_be(&mut self) -> io::Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Read as much of `out` as the stream still has.
    pub fn read_partial(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < out.len() {
            if self.buffered() == 0 {
                // Large reads bypass the lookahead.
                if out.len() - done >= BUFFER_SIZE && !self.hit_eof {
                    self.buf_start = self.tell();
                    self.buf.clear();
                    self.buf_pos = 0;
                    let n = self.source.read(&mut out[done..])?;
                    if n == 0 {
                        self.hit_eof = true;
                        break;
                    }
                    self.buf_start += n as u64;
                    done += n;
                    continue;
                }
                self.fill(1)?;
                if self.buffered() == 0 {
                    break;
                }
            }
            let n = self.buffered().min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
            self.buf_pos += n;
            done += n;
        }
        Ok(done)
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        let pos = self.tell();
        if self.read_partial(out)? < out.len() {
            return Err(unexpected_eof(pos));
        }
        Ok(())
    }

    /// Read `n` bytes into a fresh vector.
    pub fn read_vec(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Advance `n` bytes. Stops early at end of stream.
    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        let buffered = self.buffered() as u64;
        if n <= buffered {
            self.buf_pos += n as usize;
            return Ok(());
        }
        let target = self.tell() + n;
        self.seek(target)
    }

    pub fn seek(&mut self, pos: u64) -> io::Result<()> {
        let end = self.buf_start + self.buf.len() as u64;
        if pos >= self.buf_start && pos <= end {
            self.buf_pos = (pos - self.buf_start) as usize;
            return Ok(());
        }
        self.source.seek(pos)?;
        self.buf.clear();
        self.buf_pos = 0;
        self.buf_start = pos;
        self.hit_eof = self.source.eof();
        Ok(())
    }
}
