//! Disk-backed node→location table optimized for many parallel writers
//! followed by random-access reads.
//!
//! The backing file is a dense array of little-endian u64 values indexed by
//! key, split into fixed-size segments. Each writer moves through key space
//! monotonically, filling shared in-memory segment buffers; once every writer
//! has moved past a segment it is flushed to disk and dropped. Sealing the
//! table flushes whatever is left, memory-maps the file read-only, and from
//! then on [`MmapNodeMap::get`] is a lock-free mapped read.
//!
//! Value 0 is reserved: [`MISSING`] is what `get` returns for keys never
//! written, and callers must not store it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use memmap2::{Mmap, MmapOptions};
use parking_lot::{Condvar, Mutex};

/// Sentinel returned by [`MmapNodeMap::get`] for keys that were never
/// written. Writers must not store this value.
pub const MISSING: u64 = 0;

/// Default segment size: 2^27 bytes (128 MiB).
pub const DEFAULT_SEGMENT_BITS: u32 = 27;

/// Upper bound on in-flight segment buffers across all writers (about 2.5 GiB
/// at the default segment size).
const MAX_PENDING_SEGMENTS: usize = 20;

/// A parallel-write, read-after-seal key→value store backed by a single
/// file that is deleted when the map is dropped.
pub struct MmapNodeMap {
    path: PathBuf,
    segment_bits: u32,
    write_file: File,
    state: Mutex<WriteState>,
    permits: Permits,
    sealed: OnceLock<Sealed>,
    seal_lock: Mutex<()>,
}

#[derive(Default)]
struct WriteState {
    pending: HashMap<i64, Arc<SegmentBuffer>>,
    writer_positions: Vec<Arc<AtomicI64>>,
}

struct Sealed {
    segments: Vec<Mmap>,
}

impl MmapNodeMap {
    /// Create a map backed by `path` with the default 128 MiB segments.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_segment_bits(path, DEFAULT_SEGMENT_BITS)
    }

    /// Create a map with `2^segment_bits`-byte segments. Small segments keep
    /// tests fast; production uses [`DEFAULT_SEGMENT_BITS`].
    pub fn with_segment_bits(path: impl Into<PathBuf>, segment_bits: u32) -> io::Result<Self> {
        assert!(
            (3..=30).contains(&segment_bits),
            "segment_bits out of range: {segment_bits}"
        );
        let path = path.into();
        let write_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            segment_bits,
            write_file,
            state: Mutex::new(WriteState::default()),
            permits: Permits::new(MAX_PENDING_SEGMENTS),
            sealed: OnceLock::new(),
            seal_lock: Mutex::new(()),
        })
    }

    fn segment_bytes(&self) -> u64 {
        1 << self.segment_bits
    }

    fn segment_mask(&self) -> u64 {
        self.segment_bytes() - 1
    }

    /// Create an independent writer handle. Writers may run concurrently on
    /// different threads; each must issue keys in non-decreasing order, and
    /// no two writers may write the same key.
    ///
    /// Panics if the map is already sealed.
    pub fn new_writer(&self) -> NodeMapWriter<'_> {
        assert!(self.sealed.get().is_none(), "new_writer after seal");
        let position = Arc::new(AtomicI64::new(-1));
        self.state.lock().writer_positions.push(Arc::clone(&position));
        NodeMapWriter {
            map: self,
            position,
            last_segment: -1,
            last_key: None,
            buffer: None,
        }
    }

    /// Flush pending buffers, stop accepting writes, and memory-map the file
    /// for reading. Idempotent; [`Self::get`] calls it automatically.
    ///
    /// All writers must have finished before sealing.
    pub fn seal(&self) -> io::Result<()> {
        self.sealed_segments().map(|_| ())
    }

    fn sealed_segments(&self) -> io::Result<&Sealed> {
        if let Some(sealed) = self.sealed.get() {
            return Ok(sealed);
        }
        let _guard = self.seal_lock.lock();
        if let Some(sealed) = self.sealed.get() {
            return Ok(sealed);
        }

        // no writer needs these segments anymore, flush them all
        let pending: Vec<(i64, Arc<SegmentBuffer>)> = {
            let mut state = self.state.lock();
            state.pending.drain().collect()
        };
        for (segment, buffer) in pending {
            buffer.write_to(&self.write_file, (segment as u64) << self.segment_bits)?;
            self.permits.release();
        }

        let read_file = File::open(&self.path)?;
        let len = read_file.metadata()?.len();
        let seg_bytes = self.segment_bytes();
        let mut segments = Vec::with_capacity((len / seg_bytes + 1) as usize);
        let mut start = 0u64;
        while start < len {
            let seg_len = (len - start).min(seg_bytes);
            // SAFETY: the file is opened read-only and never truncated while
            // mapped; the map owns the file for its whole lifetime.
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(start)
                    .len(seg_len as usize)
                    .map(&read_file)?
            };
            segments.push(mmap);
            start += seg_bytes;
        }

        let _ = self.sealed.set(Sealed { segments });
        Ok(self.sealed.get().expect("sealed flag just set"))
    }

    /// Look up the value stored for `key`, sealing the map first if needed.
    /// Returns [`MISSING`] for keys never written.
    pub fn get(&self, key: u64) -> io::Result<u64> {
        let sealed = self.sealed_segments()?;
        let byte_offset = key << 3;
        let segment = (byte_offset >> self.segment_bits) as usize;
        let local = (byte_offset & self.segment_mask()) as usize;
        let Some(mapped) = sealed.segments.get(segment) else {
            return Ok(MISSING);
        };
        if local + 8 > mapped.len() {
            return Ok(MISSING);
        }
        let bytes: [u8; 8] = mapped[local..local + 8].try_into().expect("8-byte read");
        Ok(u64::from_le_bytes(bytes))
    }

    /// Size of the backing file on disk.
    pub fn disk_usage_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// The backing storage is mapped, not resident, so the table reports no
    /// memory of its own.
    pub fn estimate_memory_usage_bytes(&self) -> u64 {
        0
    }

    /// Unmap, drop the read state, and delete the backing file. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        self.sealed.take();
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for MmapNodeMap {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A per-producer write handle. See [`MmapNodeMap::new_writer`] for the
/// ordering contract.
pub struct NodeMapWriter<'a> {
    map: &'a MmapNodeMap,
    position: Arc<AtomicI64>,
    last_segment: i64,
    last_key: Option<u64>,
    buffer: Option<Arc<SegmentBuffer>>,
}

impl NodeMapWriter<'_> {
    /// Store `value` for `key`. Within one segment this is a lock-free
    /// buffer write; crossing into a new segment takes the table lock and
    /// may block flushing evicted segments to disk.
    pub fn put(&mut self, key: u64, value: u64) -> io::Result<()> {
        debug_assert!(value != MISSING, "value 0 is reserved for MISSING");
        debug_assert!(
            self.last_key.map_or(true, |last| key >= last),
            "keys must be non-decreasing per writer: {key} after {:?}",
            self.last_key
        );
        self.last_key = Some(key);

        let offset = key << 3;
        let segment = (offset >> self.map.segment_bits) as i64;
        let local = (offset & self.map.segment_mask()) as usize;
        if segment > self.last_segment {
            self.advance_to(segment)?;
        }
        self.buffer
            .as_ref()
            .expect("segment buffer present after advance")
            .put(local, value);
        Ok(())
    }

    fn advance_to(&mut self, segment: i64) -> io::Result<()> {
        assert!(self.map.sealed.get().is_none(), "put after seal");
        self.position.store(segment, Ordering::SeqCst);

        let mut to_flush: Vec<(i64, Arc<SegmentBuffer>)> = Vec::new();
        {
            let mut state = self.map.state.lock();
            let min_segment = state
                .writer_positions
                .iter()
                .map(|p| p.load(Ordering::SeqCst))
                .min()
                .unwrap_or(segment);
            // once every writer has passed a segment it can never be written
            // again, so evict it
            let evictable: Vec<i64> = state
                .pending
                .keys()
                .copied()
                .filter(|&s| s < min_segment)
                .collect();
            for old in evictable {
                if let Some(buffer) = state.pending.remove(&old) {
                    to_flush.push((old, buffer));
                    self.map.permits.release();
                }
            }
            self.buffer = state.pending.get(&segment).cloned();
        }

        if self.buffer.is_none() {
            // acquire outside the table lock: while this writer waits for a
            // permit, laggards must still be able to advance and evict
            self.map.permits.acquire();
            let mut state = self.map.state.lock();
            if let Some(buffer) = state.pending.get(&segment) {
                self.buffer = Some(Arc::clone(buffer));
                drop(state);
                self.map.permits.release();
            } else {
                let buffer = Arc::new(SegmentBuffer::new(self.map.segment_bytes() as usize));
                state.pending.insert(segment, Arc::clone(&buffer));
                self.buffer = Some(buffer);
            }
        }
        self.last_segment = segment;

        for (old, buffer) in to_flush {
            buffer.write_to(&self.map.write_file, (old as u64) << self.map.segment_bits)?;
        }
        Ok(())
    }
}

/// One segment's worth of values, shared by every writer currently inside
/// the segment. Cells are relaxed atomics: writers touch disjoint offsets,
/// and the table lock orders writes against the eventual flush.
struct SegmentBuffer {
    cells: Box<[AtomicU64]>,
}

impl SegmentBuffer {
    fn new(len_bytes: usize) -> Self {
        let cells = (0..len_bytes / 8)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { cells }
    }

    fn put(&self, local_byte_offset: usize, value: u64) {
        self.cells[local_byte_offset >> 3].store(value, Ordering::Relaxed);
    }

    /// Write the whole segment to `file` at `file_offset`, little-endian.
    fn write_to(&self, file: &File, file_offset: u64) -> io::Result<()> {
        // stage through a bounded scratch buffer instead of materializing
        // the whole segment twice
        const CHUNK_CELLS: usize = 1 << 16;
        let mut scratch = Vec::with_capacity(CHUNK_CELLS * 8);
        let mut offset = file_offset;
        for chunk in self.cells.chunks(CHUNK_CELLS) {
            scratch.clear();
            for cell in chunk {
                scratch.extend_from_slice(&cell.load(Ordering::Relaxed).to_le_bytes());
            }
            file.write_all_at(&scratch, offset)?;
            offset += scratch.len() as u64;
        }
        Ok(())
    }
}

/// Counting semaphore bounding allocated segment buffers.
struct Permits {
    available: Mutex<usize>,
    ready: Condvar,
}

impl Permits {
    fn new(count: usize) -> Self {
        Self {
            available: Mutex::new(count),
            ready: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut available = self.available.lock();
        while *available == 0 {
            self.ready.wait(&mut available);
        }
        *available -= 1;
    }

    fn release(&self) {
        *self.available.lock() += 1;
        self.ready.notify_one();
    }
}
