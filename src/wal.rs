//! Segmented write-ahead log.
//!
//! The WAL is the ground truth of the store: an append-only sequence of
//! CRC-framed chunks partitioned into segment files of at most
//! `segment_size` bytes, named `NNNNNNNNNN.seg` with 10-digit zero-padded
//! ids.
//!
//! Each segment is divided into 32 KiB blocks. A chunk is a 7-byte header
//! followed by a payload fragment:
//!
//! ```text
//!   [0..4]  checksum:    u32 LE - CRC32C of the payload fragment
//!   [4..6]  payload_len: u16 LE
//!   [6]     chunk_type:  u8    - Full=1 First=2 Middle=3 Last=4
//! ```
//!
//! A record that does not fit in the remainder of a block is split across
//! chunks (`First`/`Middle`.../`Last`); when fewer than 7 bytes remain in a
//! block the gap is zero-filled and the chunk starts in the next block, so a
//! reader that sees an all-zero header simply advances to the next block.
//!
//! The full multi-chunk frame is assembled in memory and written with a
//! single `write_all`, so an append is never partially published by this
//! process; a torn tail left by a crash is trimmed on open. Every segment
//! keeps a pooled read-only descriptor for positional reads, which also
//! keeps unlinked segments readable to iterators that outlive a merge.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{CellarError, CellarResult};
use crate::fsutil::{durable_sync, read_exact_at};

/// Block size inside a segment.
pub const BLOCK_SIZE: u64 = 32 * 1024;

/// Chunk header size in bytes.
pub const CHUNK_HEADER_SIZE: u64 = 7;

const CHUNK_FULL: u8 = 1;
const CHUNK_FIRST: u8 = 2;
const CHUNK_MIDDLE: u8 = 3;
const CHUNK_LAST: u8 = 4;

/// Physical location of a record's first chunk. Stable for the life of a WAL
/// generation: the log is strictly append-only between merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPosition {
    pub segment_id: u32,
    pub block_number: u32,
    /// Offset of the chunk header within the block.
    pub chunk_offset: u64,
    /// Total framed size in bytes across all chunks of the record.
    pub chunk_size: u32,
}

impl ChunkPosition {
    fn start_offset(&self) -> u64 {
        u64::from(self.block_number) * BLOCK_SIZE + self.chunk_offset
    }
}

pub(crate) fn segment_file_name(id: u32) -> String {
    format!("{:010}.seg", id)
}

pub(crate) fn parse_segment_id(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".seg")?;
    if stem.len() != 10 {
        return None;
    }
    stem.parse::<u32>().ok()
}

/// Segment ids present in a directory, ascending.
pub(crate) fn list_segment_ids(dir: &Path) -> CellarResult<Vec<u32>> {
    let mut ids = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| CellarError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CellarError::io(dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(id) = parse_segment_id(name) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Read-only handle to one segment, shared by concurrent readers.
struct SegmentHandle {
    id: u32,
    path: PathBuf,
    file: File,
}

/// Outcome of decoding one record's chunks at an offset.
enum ChunkRead {
    /// A complete record: payload plus the offset just past its last chunk.
    Record { payload: Vec<u8>, end: u64 },
    /// An all-zero header: block padding, data continues in the next block.
    Padding,
    /// No data at this offset.
    Eof,
}

impl SegmentHandle {
    fn open(dir: &Path, id: u32) -> CellarResult<Self> {
        let path = dir.join(segment_file_name(id));
        let file = File::open(&path).map_err(|e| CellarError::io(&path, e))?;
        Ok(Self { id, path, file })
    }

    fn len(&self) -> CellarResult<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| CellarError::io(&self.path, e))?
            .len())
    }

    /// Walk the chunks of one record starting at `offset`.
    fn read_record_at(&self, offset: u64) -> CellarResult<ChunkRead> {
        let corrupt = |offset: u64, reason: String| CellarError::CorruptRecord {
            path: Some(self.path.clone()),
            offset,
            reason,
        };

        let start = offset;
        let mut cursor = offset;
        let mut payload = Vec::new();
        let mut first = true;

        loop {
            let mut header = [0u8; CHUNK_HEADER_SIZE as usize];
            match read_exact_at(&self.file, &mut header, cursor) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    if first {
                        return Ok(ChunkRead::Eof);
                    }
                    return Err(corrupt(cursor, "record truncated mid-chunk".into()));
                }
                Err(e) => return Err(CellarError::io(&self.path, e)),
            }

            if header == [0u8; CHUNK_HEADER_SIZE as usize] {
                if first {
                    return Ok(ChunkRead::Padding);
                }
                return Err(corrupt(cursor, "zero header inside a record".into()));
            }

            let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let frag_len = u64::from(u16::from_le_bytes([header[4], header[5]]));
            let chunk_type = header[6];

            let space_after_header = BLOCK_SIZE - cursor % BLOCK_SIZE - CHUNK_HEADER_SIZE;
            if frag_len > space_after_header {
                return Err(corrupt(
                    cursor,
                    format!("chunk length {} overflows its block", frag_len),
                ));
            }
            let expected_first = chunk_type == CHUNK_FULL || chunk_type == CHUNK_FIRST;
            if first != expected_first || chunk_type > CHUNK_LAST || chunk_type == 0 {
                return Err(corrupt(
                    cursor,
                    format!("unexpected chunk type: {}", chunk_type),
                ));
            }

            let mut frag = vec![0u8; frag_len as usize];
            match read_exact_at(&self.file, &mut frag, cursor + CHUNK_HEADER_SIZE) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(corrupt(cursor, "chunk payload truncated".into()));
                }
                Err(e) => return Err(CellarError::io(&self.path, e)),
            }

            let actual_crc = crc32c::crc32c(&frag);
            if actual_crc != stored_crc {
                return Err(CellarError::ChecksumMismatch {
                    expected: stored_crc,
                    actual: actual_crc,
                    offset: cursor,
                });
            }

            payload.extend_from_slice(&frag);
            cursor += CHUNK_HEADER_SIZE + frag_len;

            if chunk_type == CHUNK_FULL || chunk_type == CHUNK_LAST {
                debug_assert!(cursor > start);
                return Ok(ChunkRead::Record {
                    payload,
                    end: cursor,
                });
            }

            // Continuation chunks start at the next block boundary.
            if BLOCK_SIZE - cursor % BLOCK_SIZE < CHUNK_HEADER_SIZE {
                cursor = (cursor / BLOCK_SIZE + 1) * BLOCK_SIZE;
            }
            first = false;
        }
    }
}

/// The append side of the highest-id segment.
struct ActiveSegment {
    id: u32,
    path: PathBuf,
    file: File,
    size: u64,
}

/// Segmented write-ahead log over one directory.
///
/// Appends are serialized by the caller (the database writer lock) on top of
/// the internal mutex; positional reads run concurrently through the pooled
/// read-only descriptors.
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    bytes_per_sync: u32,
    active: Mutex<ActiveSegment>,
    readers: RwLock<HashMap<u32, Arc<SegmentHandle>>>,
    bytes_since_sync: AtomicU64,
}

impl Wal {
    /// Open the log in `dir`, creating the first segment if none exists and
    /// trimming a torn tail left by a crash.
    pub fn open(dir: &Path, segment_size: u64, bytes_per_sync: u32) -> CellarResult<Self> {
        let ids = list_segment_ids(dir)?;
        let active_id = ids.last().copied().unwrap_or(1);

        let active_path = dir.join(segment_file_name(active_id));
        let active_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)
            .map_err(|e| CellarError::io(&active_path, e))?;
        let size = active_file
            .metadata()
            .map_err(|e| CellarError::io(&active_path, e))?
            .len();

        let mut readers = HashMap::new();
        for id in &ids {
            readers.insert(*id, Arc::new(SegmentHandle::open(dir, *id)?));
        }
        if !readers.contains_key(&active_id) {
            readers.insert(active_id, Arc::new(SegmentHandle::open(dir, active_id)?));
        }

        let wal = Self {
            dir: dir.to_path_buf(),
            segment_size,
            bytes_per_sync,
            active: Mutex::new(ActiveSegment {
                id: active_id,
                path: active_path,
                file: active_file,
                size,
            }),
            readers: RwLock::new(readers),
            bytes_since_sync: AtomicU64::new(0),
        };
        wal.repair_tail()?;
        Ok(wal)
    }

    /// Trim the active segment back to the end of its last complete record.
    /// Anything after that point is a crash-torn append.
    fn repair_tail(&self) -> CellarResult<()> {
        let handle = {
            let active = self.active.lock();
            self.readers.read().get(&active.id).cloned()
        };
        let handle = match handle {
            Some(h) => h,
            None => return Ok(()),
        };

        let mut cursor = 0u64;
        let mut last_good_end = 0u64;
        loop {
            match handle.read_record_at(cursor) {
                Ok(ChunkRead::Record { end, .. }) => {
                    last_good_end = end;
                    cursor = end;
                    if BLOCK_SIZE - cursor % BLOCK_SIZE < CHUNK_HEADER_SIZE {
                        cursor = (cursor / BLOCK_SIZE + 1) * BLOCK_SIZE;
                    }
                }
                Ok(ChunkRead::Padding) => {
                    cursor = (cursor / BLOCK_SIZE + 1) * BLOCK_SIZE;
                }
                Ok(ChunkRead::Eof) => break,
                Err(_) => break,
            }
        }

        let mut active = self.active.lock();
        if last_good_end < active.size {
            debug!(
                segment = active.id,
                from = active.size,
                to = last_good_end,
                "trimming torn tail"
            );
            active
                .file
                .set_len(last_good_end)
                .map_err(|e| CellarError::io(&active.path, e))?;
            active.size = last_good_end;
        }
        Ok(())
    }

    /// Append one record, returning the position of its first chunk. The
    /// frame is assembled in memory and written with one `write_all`, so a
    /// failed append publishes nothing.
    pub fn append(&self, data: &[u8]) -> CellarResult<ChunkPosition> {
        let mut active = self.active.lock();

        let framed = estimated_framed_len(data.len() as u64);
        if framed > self.segment_size {
            return Err(CellarError::OversizedValue {
                size: data.len(),
                max: self.segment_size as usize,
            });
        }
        if active.size > 0 && active.size + framed > self.segment_size {
            self.rotate(&mut active)?;
        }

        let (buf, padding) = frame_chunks(data, active.size);
        let start = active.size + padding;

        use std::io::Write;
        active
            .file
            .write_all(&buf)
            .map_err(|e| CellarError::io(&active.path, e))?;
        active.size += buf.len() as u64;

        let position = ChunkPosition {
            segment_id: active.id,
            block_number: (start / BLOCK_SIZE) as u32,
            chunk_offset: start % BLOCK_SIZE,
            chunk_size: (buf.len() as u64 - padding) as u32,
        };

        if self.bytes_per_sync > 0 {
            let total = self
                .bytes_since_sync
                .fetch_add(buf.len() as u64, Ordering::Relaxed)
                + buf.len() as u64;
            if total >= u64::from(self.bytes_per_sync) {
                durable_sync(&active.file).map_err(|e| CellarError::io(&active.path, e))?;
                self.bytes_since_sync.store(0, Ordering::Relaxed);
            }
        }

        Ok(position)
    }

    /// Close the active segment and start the next one.
    fn rotate(&self, active: &mut ActiveSegment) -> CellarResult<()> {
        durable_sync(&active.file).map_err(|e| CellarError::io(&active.path, e))?;

        let next_id = active.id + 1;
        let path = self.dir.join(segment_file_name(next_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CellarError::io(&path, e))?;

        let handle = Arc::new(SegmentHandle::open(&self.dir, next_id)?);
        self.readers.write().insert(next_id, handle);

        active.id = next_id;
        active.path = path;
        active.file = file;
        active.size = 0;
        Ok(())
    }

    /// Read the record at `position`.
    pub fn read(&self, position: ChunkPosition) -> CellarResult<Vec<u8>> {
        let handle = self
            .readers
            .read()
            .get(&position.segment_id)
            .cloned()
            .ok_or(CellarError::ReadOutOfRange {
                segment_id: position.segment_id,
                offset: position.start_offset(),
            })?;

        match handle.read_record_at(position.start_offset())? {
            ChunkRead::Record { payload, .. } => Ok(payload),
            ChunkRead::Padding | ChunkRead::Eof => Err(CellarError::ReadOutOfRange {
                segment_id: position.segment_id,
                offset: position.start_offset(),
            }),
        }
    }

    /// Force durability up to the last completed append.
    pub fn sync(&self) -> CellarResult<()> {
        let active = self.active.lock();
        durable_sync(&active.file).map_err(|e| CellarError::io(&active.path, e))?;
        self.bytes_since_sync.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Sequential reader over every record, in append order.
    pub fn iter(&self) -> WalIter {
        self.iter_from(0, 0)
    }

    /// Sequential reader starting at a byte offset inside a segment. The
    /// offset must be a record boundary, e.g. a previously observed
    /// [`Wal::append_position`].
    pub fn iter_from(&self, segment_id: u32, offset: u64) -> WalIter {
        let mut segments: Vec<Arc<SegmentHandle>> =
            self.readers.read().values().cloned().collect();
        segments.sort_by_key(|handle| handle.id);

        let seg_idx = segments
            .iter()
            .position(|handle| handle.id >= segment_id)
            .unwrap_or(segments.len());
        let mut offset = match segments.get(seg_idx) {
            Some(handle) if handle.id == segment_id => offset,
            _ => 0,
        };
        // A boundary this close to the block edge was zero-padded by the
        // writer; the next record starts in the following block.
        if BLOCK_SIZE - offset % BLOCK_SIZE < CHUNK_HEADER_SIZE {
            offset = (offset / BLOCK_SIZE + 1) * BLOCK_SIZE;
        }

        WalIter {
            segments,
            seg_idx,
            offset,
        }
    }

    /// Where the next append will land: (active segment id, byte offset).
    pub fn append_position(&self) -> (u32, u64) {
        let active = self.active.lock();
        (active.id, active.size)
    }

    /// Id of the segment currently accepting appends.
    pub fn active_segment_id(&self) -> u32 {
        self.active.lock().id
    }

    /// Number of segment files.
    pub fn segment_count(&self) -> usize {
        self.readers.read().len()
    }

    /// Total bytes across all segment files.
    pub fn total_size(&self) -> CellarResult<u64> {
        let readers = self.readers.read();
        let mut total = 0u64;
        for handle in readers.values() {
            total += handle.len()?;
        }
        Ok(total)
    }
}

/// Worst-case framed size of a payload: leading block padding plus one
/// header per fragment.
fn estimated_framed_len(data_len: u64) -> u64 {
    let fragments = data_len / (BLOCK_SIZE - CHUNK_HEADER_SIZE) + 2;
    (CHUNK_HEADER_SIZE - 1) + fragments * CHUNK_HEADER_SIZE + data_len
}

/// Frame `data` into chunks as written at segment offset `seg_offset`.
/// Returns the bytes to append and the length of any leading padding.
fn frame_chunks(data: &[u8], seg_offset: u64) -> (Vec<u8>, u64) {
    let mut buf = Vec::with_capacity(data.len() + 4 * CHUNK_HEADER_SIZE as usize);
    let mut cursor = seg_offset;

    let leftover = BLOCK_SIZE - cursor % BLOCK_SIZE;
    let padding = if leftover < CHUNK_HEADER_SIZE {
        buf.resize(leftover as usize, 0);
        cursor += leftover;
        leftover
    } else {
        0
    };

    let mut remaining = data;
    let mut first = true;
    loop {
        let avail = BLOCK_SIZE - cursor % BLOCK_SIZE - CHUNK_HEADER_SIZE;
        let frag_len = (remaining.len() as u64).min(avail) as usize;
        let (frag, rest) = remaining.split_at(frag_len);

        let chunk_type = match (first, rest.is_empty()) {
            (true, true) => CHUNK_FULL,
            (true, false) => CHUNK_FIRST,
            (false, true) => CHUNK_LAST,
            (false, false) => CHUNK_MIDDLE,
        };

        buf.extend_from_slice(&crc32c::crc32c(frag).to_le_bytes());
        buf.extend_from_slice(&(frag_len as u16).to_le_bytes());
        buf.push(chunk_type);
        buf.extend_from_slice(frag);
        cursor += CHUNK_HEADER_SIZE + frag_len as u64;

        if rest.is_empty() {
            return (buf, padding);
        }
        remaining = rest;
        first = false;
        // A continuation always lands at a block boundary: the previous
        // fragment consumed the rest of its block.
        debug_assert_eq!(cursor % BLOCK_SIZE, 0);
    }
}

/// Sequential record reader used by recovery and merge.
///
/// Stops cleanly at the first corrupt or truncated record in the final
/// segment (a crash-torn tail); the same damage in an earlier segment is
/// interior corruption and is reported.
pub struct WalIter {
    segments: Vec<Arc<SegmentHandle>>,
    seg_idx: usize,
    offset: u64,
}

impl WalIter {
    /// Next record and its position, or `None` at the end of the log.
    pub fn next_record(&mut self) -> CellarResult<Option<(ChunkPosition, Vec<u8>)>> {
        loop {
            let handle = match self.segments.get(self.seg_idx) {
                Some(h) => h.clone(),
                None => return Ok(None),
            };

            match handle.read_record_at(self.offset) {
                Ok(ChunkRead::Record { payload, end }) => {
                    let position = ChunkPosition {
                        segment_id: handle.id,
                        block_number: (self.offset / BLOCK_SIZE) as u32,
                        chunk_offset: self.offset % BLOCK_SIZE,
                        chunk_size: (end - self.offset) as u32,
                    };
                    self.offset = end;
                    if BLOCK_SIZE - self.offset % BLOCK_SIZE < CHUNK_HEADER_SIZE {
                        self.offset = (self.offset / BLOCK_SIZE + 1) * BLOCK_SIZE;
                    }
                    return Ok(Some((position, payload)));
                }
                Ok(ChunkRead::Padding) => {
                    self.offset = (self.offset / BLOCK_SIZE + 1) * BLOCK_SIZE;
                }
                Ok(ChunkRead::Eof) => {
                    self.seg_idx += 1;
                    self.offset = 0;
                }
                Err(err) => {
                    if self.seg_idx + 1 == self.segments.len() {
                        // Torn tail: the open path truncates it; recovery
                        // just stops here.
                        debug!(segment = handle.id, offset = self.offset, %err, "stopping at torn tail");
                        return Ok(None);
                    }
                    return Err(err);
                }
            }
        }
    }
}
