//! # Read-Ahead Cache
//!
//! Fixed-size ring buffer between a byte source and the demuxer. A filler
//! pulls bulk chunks from the source ahead of consumption while the reader
//! drains them, and a window of already-consumed bytes is kept so short
//! backward seeks never touch the source.
//!
//! ## Architecture
//!
//! ```text
//!              fill()                         read()/seek()
//! ┌────────┐ ────────► ┌──────────────────┐ ◄──────────── ┌─────────┐
//! │ Source │           │   CacheBuffer    │               │ Demuxer │
//! └────────┘           │ min ≤ read ≤ max │               └─────────┘
//!                      └──────────────────┘
//! ```
//!
//! `CachedSource` runs both roles on the caller's thread; `ThreadedCache`
//! moves the filler onto its own thread and blocks readers on a condvar.
//! Both implement [`ByteSource`], so the demuxer never knows which it got.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::source::ByteSource;

// ============================================================================
// Cursor State
// ============================================================================

/// Snapshot of the four logical cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursors {
    /// Oldest retained byte.
    pub min_pos: u64,
    /// Next byte handed to the reader.
    pub read_pos: u64,
    /// One past the newest filled byte.
    pub max_pos: u64,
    /// File position that maps to slot 0 of the current lap.
    pub offset: u64,
}

/// Cache counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub bytes_filled: u64,
    pub fills: u64,
    pub seeks_in_window: u64,
    pub resets: u64,
}

/// A region of the ring the filler is allowed to write next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillPlan {
    pub slot: usize,
    pub len: usize,
    pub file_pos: u64,
}

/// Ring arena plus cursors. No I/O of its own.
pub struct CacheBuffer {
    buffer: Vec<u8>,
    min_pos: u64,
    read_pos: u64,
    max_pos: u64,
    offset: u64,
    back_size: u64,
    fill_threshold: u64,
    max_chunk: u64,
    eof: bool,
    error: Option<(io::ErrorKind, String)>,
    stats: CacheStats,
}

impl CacheBuffer {
    pub fn new(config: &CacheConfig, start: u64) -> Self {
        let config = config.normalized();
        Self {
            buffer: vec![0u8; config.capacity],
            min_pos: start,
            read_pos: start,
            max_pos: start,
            offset: start,
            back_size: config.back_size as u64,
            fill_threshold: config.fill_threshold as u64,
            max_chunk: config.max_chunk as u64,
            eof: false,
            error: None,
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn cursors(&self) -> Cursors {
        Cursors {
            min_pos: self.min_pos,
            read_pos: self.read_pos,
            max_pos: self.max_pos,
            offset: self.offset,
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Unread bytes available without touching the source.
    pub fn available(&self) -> u64 {
        self.max_pos - self.read_pos
    }

    /// Unread fraction of the ring (0.0 - 1.0).
    pub fn fill_level(&self) -> f32 {
        self.available() as f32 / self.buffer.len() as f32
    }

    /// Source exhausted and every byte handed out.
    pub fn is_drained(&self) -> bool {
        self.eof && self.read_pos == self.max_pos
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    pub fn error(&self) -> Option<io::Error> {
        self.error
            .as_ref()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }

    pub fn set_error(&mut self, err: &io::Error) {
        tracing::warn!("Cache fill failed at {}: {}", self.max_pos, err);
        self.error = Some((err.kind(), err.to_string()));
    }

    /// `min ≤ read ≤ max` and `max - min ≤ capacity`.
    pub fn check_invariants(&self) -> bool {
        self.min_pos <= self.read_pos
            && self.read_pos <= self.max_pos
            && self.max_pos - self.min_pos <= self.buffer.len() as u64
    }

    fn slot_of(&self, pos: u64) -> usize {
        let cap = self.buffer.len() as i128;
        (pos as i128 - self.offset as i128).rem_euclid(cap) as usize
    }

    // ========================================================================
    // Filler Side
    // ========================================================================

    /// Decide where the next fill goes, or `None` if the cache is full,
    /// exhausted or failed. Retires history beyond the back window.
    pub fn plan_fill(&mut self) -> Option<FillPlan> {
        if self.eof || self.error.is_some() {
            return None;
        }
        let cap = self.buffer.len() as u64;
        let new_bytes = self.max_pos - self.read_pos;
        let back_bytes = (self.read_pos - self.min_pos).min(self.back_size);
        let space = cap - (new_bytes + back_bytes);
        if space < self.fill_threshold {
            return None;
        }

        let slot = self.slot_of(self.max_pos);
        let len = space.min(cap - slot as u64).min(self.max_chunk);
        self.min_pos = self.read_pos - back_bytes;

        Some(FillPlan {
            slot,
            len: len as usize,
            file_pos: self.max_pos,
        })
    }

    /// Record `n` bytes written into the planned region.
    pub fn commit_fill(&mut self, plan: FillPlan, n: usize) {
        if n == 0 {
            self.eof = true;
            return;
        }
        debug_assert_eq!(plan.file_pos, self.max_pos);
        let n = n.min(plan.len);
        self.max_pos += n as u64;
        if plan.slot + n >= self.buffer.len() {
            self.offset += self.buffer.len() as u64;
        }
        self.stats.bytes_filled += n as u64;
        self.stats.fills += 1;
    }

    /// Copy `data` into the planned region and commit it.
    pub fn commit_bytes(&mut self, plan: FillPlan, data: &[u8]) {
        let n = data.len().min(plan.len);
        self.buffer[plan.slot..plan.slot + n].copy_from_slice(&data[..n]);
        self.commit_fill(plan, n);
    }

    /// One fill step straight from `source` into the ring.
    pub fn fill_from<S: ByteSource + ?Sized>(&mut self, source: &mut S) -> io::Result<usize> {
        let Some(plan) = self.plan_fill() else {
            return Ok(0);
        };
        let slot = plan.slot;
        match source.read(&mut self.buffer[slot..slot + plan.len]) {
            Ok(n) => {
                self.commit_fill(plan, n);
                Ok(n)
            }
            Err(e) => {
                self.set_error(&e);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Reader Side
    // ========================================================================

    /// Copy out whatever is already buffered, never waiting.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let cap = self.buffer.len();
        let mut total = 0;
        while total < out.len() {
            let available = (self.max_pos - self.read_pos) as usize;
            if available == 0 {
                break;
            }
            let slot = self.slot_of(self.read_pos);
            let n = (out.len() - total).min(available).min(cap - slot);
            out[total..total + n].copy_from_slice(&self.buffer[slot..slot + n]);
            self.read_pos += n as u64;
            total += n;
        }
        total
    }

    /// Move the read cursor. Returns `true` when the target was inside the
    /// retained window; otherwise the cache is emptied at `pos` and the
    /// caller must reposition the source.
    pub fn seek(&mut self, pos: u64) -> bool {
        if pos >= self.min_pos && pos <= self.max_pos {
            self.read_pos = pos;
            self.stats.seeks_in_window += 1;
            return true;
        }
        self.reset(pos);
        false
    }

    fn reset(&mut self, pos: u64) {
        tracing::debug!(
            "Cache reset: {} outside [{}, {}]",
            pos,
            self.min_pos,
            self.max_pos
        );
        self.min_pos = pos;
        self.read_pos = pos;
        self.max_pos = pos;
        self.offset = pos;
        self.eof = false;
        self.stats.resets += 1;
    }
}

// ============================================================================
// Cooperative Front-end
// ============================================================================

/// Single-threaded cache: reads run the filler inline whenever they run dry.
pub struct CachedSource<S: ByteSource> {
    source: S,
    cache: CacheBuffer,
}

impl<S: ByteSource> CachedSource<S> {
    pub fn new(source: S, config: &CacheConfig) -> Self {
        let start = source.tell();
        Self {
            source,
            cache: CacheBuffer::new(config, start),
        }
    }

    /// Top up the ring once, if there is room.
    pub fn fill(&mut self) -> io::Result<usize> {
        self.cache.fill_from(&mut self.source)
    }

    pub fn cache(&self) -> &CacheBuffer {
        &self.cache
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: ByteSource> ByteSource for CachedSource<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            if let Some(err) = self.cache.error() {
                if total > 0 {
                    break;
                }
                return Err(err);
            }
            let n = self.cache.read_into(&mut buf[total..]);
            if n > 0 {
                total += n;
                continue;
            }
            if self.cache.is_eof() {
                break;
            }
            match self.fill() {
                // No room and nothing unread cannot both hold; bail out.
                Ok(0) if !self.cache.is_eof() => break,
                Ok(_) => {}
                // Sticky; reported at the top of the loop.
                Err(_) => continue,
            }
        }
        Ok(total)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        if let Some(err) = self.cache.error() {
            return Err(err);
        }
        if self.cache.seek(pos) {
            return Ok(());
        }
        if let Err(e) = self.source.seek(pos) {
            self.cache.set_error(&e);
            return Err(e);
        }
        if self.source.len().is_some_and(|len| pos >= len) {
            self.cache.mark_eof();
        }
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.cache.read_pos
    }

    fn eof(&self) -> bool {
        self.cache.is_drained()
    }

    fn len(&self) -> Option<u64> {
        self.source.len()
    }

    fn is_seekable(&self) -> bool {
        self.source.is_seekable()
    }
}

// ============================================================================
// Threaded Front-end
// ============================================================================

struct CacheState {
    buf: CacheBuffer,
    pending_seek: Option<u64>,
    generation: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<CacheState>,
    /// Reader waits here for fill progress.
    filled: Condvar,
    /// Filler waits here for free space or a seek request.
    wake: Condvar,
}

/// Cache with a dedicated filler thread owning the source.
pub struct ThreadedCache {
    shared: Arc<Shared>,
    filler: Option<JoinHandle<()>>,
    len: Option<u64>,
    seekable: bool,
}

impl ThreadedCache {
    pub fn spawn(source: Box<dyn ByteSource>, config: &CacheConfig) -> io::Result<Self> {
        let config = config.normalized();
        let len = source.len();
        let seekable = source.is_seekable();
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState {
                buf: CacheBuffer::new(&config, source.tell()),
                pending_seek: None,
                generation: 0,
                closed: false,
            }),
            filled: Condvar::new(),
            wake: Condvar::new(),
        });

        let worker = shared.clone();
        let max_chunk = config.max_chunk;
        let filler = thread::Builder::new()
            .name("slain-cache-fill".into())
            .spawn(move || fill_loop(worker, source, max_chunk))?;

        tracing::info!(
            "Cache filler started ({} KiB ring, {} KiB back window)",
            config.capacity / 1024,
            config.back_size / 1024
        );

        Ok(Self {
            shared,
            filler: Some(filler),
            len,
            seekable,
        })
    }

    pub fn cursors(&self) -> Cursors {
        self.shared.state.lock().buf.cursors()
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().buf.stats().clone()
    }

    pub fn fill_level(&self) -> f32 {
        self.shared.state.lock().buf.fill_level()
    }
}

fn fill_loop(shared: Arc<Shared>, mut source: Box<dyn ByteSource>, max_chunk: usize) {
    let mut scratch = vec![0u8; max_chunk];

    loop {
        enum Job {
            Seek(u64, u64),
            Fill(FillPlan, u64),
        }

        let job = {
            let mut st = shared.state.lock();
            loop {
                if st.closed {
                    return;
                }
                if let Some(pos) = st.pending_seek.take() {
                    break Job::Seek(pos, st.generation);
                }
                if let Some(plan) = st.buf.plan_fill() {
                    break Job::Fill(plan, st.generation);
                }
                shared.wake.wait(&mut st);
            }
        };

        match job {
            Job::Seek(pos, generation) => {
                let result = source.seek(pos);
                let mut st = shared.state.lock();
                if st.generation != generation {
                    continue;
                }
                match result {
                    Ok(()) => {
                        if source.len().is_some_and(|len| pos >= len) {
                            st.buf.mark_eof();
                        }
                    }
                    Err(e) => st.buf.set_error(&e),
                }
                shared.filled.notify_all();
            }
            Job::Fill(plan, generation) => {
                let result = source.read(&mut scratch[..plan.len]);
                let mut st = shared.state.lock();
                if st.generation != generation {
                    // A reset seek landed while we were reading.
                    continue;
                }
                match result {
                    Ok(n) => st.buf.commit_bytes(plan, &scratch[..n]),
                    Err(e) => st.buf.set_error(&e),
                }
                shared.filled.notify_all();
            }
        }
    }
}

impl ByteSource for ThreadedCache {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.shared.state.lock();
        let mut total = 0;
        while total < buf.len() {
            if let Some(err) = st.buf.error() {
                if total > 0 {
                    break;
                }
                return Err(err);
            }
            let n = st.buf.read_into(&mut buf[total..]);
            if n > 0 {
                total += n;
                self.shared.wake.notify_one();
                continue;
            }
            if st.buf.is_eof() {
                break;
            }
            self.shared.wake.notify_one();
            self.shared.filled.wait(&mut st);
        }
        Ok(total)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        let mut st = self.shared.state.lock();
        if let Some(err) = st.buf.error() {
            return Err(err);
        }
        if st.buf.seek(pos) {
            return Ok(());
        }
        if !self.seekable && pos < st.buf.cursors().min_pos {
            tracing::debug!("Backward seek to {} outside cache on unseekable source", pos);
        }
        st.generation += 1;
        st.pending_seek = Some(pos);
        if self.len.is_some_and(|len| pos >= len) {
            st.buf.mark_eof();
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.shared.state.lock().buf.read_pos
    }

    fn eof(&self) -> bool {
        self.shared.state.lock().buf.is_drained()
    }

    fn len(&self) -> Option<u64> {
        self.len
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }
}

impl Drop for ThreadedCache {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.filler.take() {
            if handle.join().is_err() {
                tracing::error!("Cache filler thread panicked");
            }
        }
    }
}

/// Put a cache in front of `source` according to `config`.
pub fn wrap(source: Box<dyn ByteSource>, config: &CacheConfig) -> io::Result<Box<dyn ByteSource>> {
    if config.threaded {
        Ok(Box::new(ThreadedCache::spawn(source, config)?))
    } else {
        Ok(Box::new(CachedSource::new(source, config)))
    }
}
