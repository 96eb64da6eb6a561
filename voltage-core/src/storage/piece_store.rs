//! Memory-bounded write-back cache of pieces with hash verification

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use rand::seq::IteratorRandom;
use sha1::{Digest, Sha1};

use super::{FileHandleCache, StorageError, piece_capacity};
use crate::config::StorageConfig;
use crate::events::{DownloadEvent, EventSink};
use crate::torrent::{PieceIndex, TorrentDescriptor};

#[derive(Debug)]
struct PieceBuffer {
    data: Vec<u8>,
    dirty: bool,
}

/// Piece storage for a single torrent.
///
/// Incoming blocks are spliced into full-size in-memory piece buffers which
/// are written back to the backing files in ascending index order. Every write
/// re-hashes the piece, so the verified set always reflects what is on disk.
/// The number of buffered pieces never exceeds the capacity.
pub struct PieceStore {
    descriptor: Arc<TorrentDescriptor>,
    files: FileHandleCache,
    buffers: BTreeMap<PieceIndex, PieceBuffer>,
    verified: HashSet<PieceIndex>,
    sequences: Vec<u32>,
    capacity: usize,
}

impl PieceStore {
    /// Creates a store below `root`, sizing the buffer from the memory budget.
    ///
    /// # Errors
    /// - `StorageError::InsufficientMemory` - Budget cannot hold a single piece
    pub fn new(
        descriptor: Arc<TorrentDescriptor>,
        root: PathBuf,
        config: &StorageConfig,
    ) -> Result<Self, StorageError> {
        let capacity = piece_capacity(config.memory_budget, descriptor.piece_length())?;
        Ok(Self::with_capacity(
            descriptor,
            root,
            capacity,
            config.max_open_files,
        ))
    }

    /// Creates a store with a fixed buffer capacity (at least one piece).
    pub fn with_capacity(
        descriptor: Arc<TorrentDescriptor>,
        root: PathBuf,
        capacity: usize,
        max_open_files: usize,
    ) -> Self {
        let piece_count = descriptor.piece_count() as usize;
        Self {
            descriptor,
            files: FileHandleCache::new(root, max_open_files),
            buffers: BTreeMap::new(),
            verified: HashSet::new(),
            sequences: vec![0; piece_count],
            capacity: capacity.max(1),
        }
    }

    /// Extends every backing file to its full length, creating missing files.
    ///
    /// Returns the pieces touching any freshly extended region; their bytes
    /// are zeros and need no hashing.
    ///
    /// # Errors
    /// - `StorageError::Io` - File creation or extension failed
    pub fn allocate(
        &mut self,
        events: &mut dyn EventSink,
    ) -> Result<BTreeSet<PieceIndex>, StorageError> {
        events.on_event(&DownloadEvent::AllocateStart);

        let total_bytes = self.descriptor.total_length();
        let mut allocated_bytes = 0;
        let mut fresh = BTreeSet::new();

        for (file_index, file) in self.descriptor.files().iter().enumerate() {
            let handle = self.files.handle(file_index, file)?;
            let existing = handle.metadata()?.len();

            if existing < file.length {
                handle.set_len(file.length)?;
                let pieces = self
                    .descriptor
                    .pieces_in_range(file.offset + existing, file.offset + file.length);
                fresh.extend(pieces.map(PieceIndex::new));
                tracing::debug!(
                    "Allocated {} from {} to {} bytes",
                    file.relative_path().display(),
                    existing,
                    file.length
                );
            }

            allocated_bytes += file.length;
            events.on_event(&DownloadEvent::Allocate {
                allocated_bytes,
                total_bytes,
            });
        }

        events.on_event(&DownloadEvent::AllocateEnd);
        Ok(fresh)
    }

    /// Rebuilds the verified set by hashing every piece not in `skip`.
    ///
    /// # Errors
    /// - `StorageError::Io` - Reading piece data failed
    pub fn check(
        &mut self,
        skip: &BTreeSet<PieceIndex>,
        events: &mut dyn EventSink,
    ) -> Result<(), StorageError> {
        self.verified.clear();
        events.on_event(&DownloadEvent::CheckStart);

        let total = self.descriptor.piece_count();
        for raw_index in 0..total {
            let index = PieceIndex::new(raw_index);
            if skip.contains(&index) {
                continue;
            }

            let data = self.read_piece(index)?;
            if self.matches_hash(index, &data) {
                self.verified.insert(index);
            }

            events.on_event(&DownloadEvent::Check {
                checked: raw_index + 1,
                total,
            });
        }

        events.on_event(&DownloadEvent::CheckEnd);
        tracing::info!(
            "Check complete: {}/{} pieces verified",
            self.verified.len(),
            total
        );
        Ok(())
    }

    /// Returns the buffered copy of a piece, or reads it from disk.
    ///
    /// # Errors
    /// - `StorageError::InvalidPiece` - Index out of range
    /// - `StorageError::Io` - Reading failed
    pub fn read_piece(&mut self, index: PieceIndex) -> Result<Vec<u8>, StorageError> {
        self.ensure_piece(index)?;

        if let Some(buffer) = self.buffers.get(&index) {
            return Ok(buffer.data.clone());
        }
        self.read_from_disk(index)
    }

    /// Splices `bytes` into piece `index` at `offset` and marks it dirty.
    ///
    /// Force-flushes everything first when the buffer is full.
    ///
    /// # Errors
    /// - `StorageError::InvalidPiece` - Index out of range
    /// - `StorageError::OutOfBounds` - Write starts or ends outside the piece
    /// - `StorageError::Io` - Read-through or forced flush failed
    pub fn commit(
        &mut self,
        index: PieceIndex,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.ensure_piece(index)?;

        let piece_size = self.descriptor.piece_size(index);
        let start = offset as usize;
        if start >= piece_size || bytes.len() > piece_size - start {
            return Err(StorageError::OutOfBounds {
                index,
                offset: offset as u64,
                length: bytes.len(),
            });
        }

        if self.buffers.len() >= self.capacity {
            tracing::debug!(
                "Piece buffer full ({} pieces), forcing flush",
                self.buffers.len()
            );
            self.flush(true)?;
        }

        let mut buffer = match self.buffers.remove(&index) {
            Some(buffer) => buffer,
            None => PieceBuffer {
                data: self.read_from_disk(index)?,
                dirty: false,
            },
        };
        buffer.data[start..start + bytes.len()].copy_from_slice(bytes);
        buffer.dirty = true;
        self.buffers.insert(index, buffer);

        Ok(())
    }

    /// Writes buffered pieces back to disk in ascending index order.
    ///
    /// Without `force` only dirty pieces are considered and a piece whose
    /// hash does not match yet stays buffered (no longer dirty). With `force`
    /// every buffered piece is written and evicted, matching or not.
    ///
    /// # Errors
    /// - `StorageError::Io` - Writing failed
    pub fn flush(&mut self, force: bool) -> Result<(), StorageError> {
        let pending: Vec<PieceIndex> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| force || buffer.dirty)
            .map(|(index, _)| *index)
            .collect();

        if pending.is_empty() {
            return Ok(());
        }
        tracing::trace!("Flushing {} piece(s), force={}", pending.len(), force);

        for index in pending {
            if let Some(buffer) = self.buffers.get_mut(&index) {
                buffer.dirty = false;
            }
            self.write_piece(index, force)?;
        }
        Ok(())
    }

    /// Force-flushes, then releases all file handles and buffers.
    ///
    /// # Errors
    /// - `StorageError::Io` - Final flush failed
    pub fn close(&mut self) -> Result<(), StorageError> {
        self.flush(true)?;
        self.files.clear();
        self.buffers.clear();
        Ok(())
    }

    pub fn descriptor(&self) -> &Arc<TorrentDescriptor> {
        &self.descriptor
    }

    pub fn is_complete(&self) -> bool {
        self.verified.len() == self.descriptor.piece_count() as usize
    }

    pub fn verified_count(&self) -> u32 {
        self.verified.len() as u32
    }

    /// Share of verified pieces, 0.0 to 100.0.
    pub fn progress_percent(&self) -> f64 {
        self.verified.len() as f64 / self.descriptor.piece_count() as f64 * 100.0
    }

    /// Bytes not yet covered by verified pieces.
    pub fn remaining_bytes(&self) -> u64 {
        let verified_bytes: u64 = self
            .verified
            .iter()
            .map(|&index| self.descriptor.piece_size(index) as u64)
            .sum();
        self.descriptor.total_length() - verified_bytes
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.verified.contains(&index)
    }

    /// Uniformly random piece that is not verified yet.
    pub fn random_unfinished_piece(&self) -> Option<PieceIndex> {
        (0..self.descriptor.piece_count())
            .map(PieceIndex::new)
            .filter(|index| !self.verified.contains(index))
            .choose(&mut rand::rng())
    }

    /// Returns the piece's request counter and advances it.
    pub fn next_chunk_sequence(&mut self, index: PieceIndex) -> Option<u32> {
        let counter = self.sequences.get_mut(index.as_usize())?;
        let current = *counter;
        *counter = counter.wrapping_add(1);
        Some(current)
    }

    pub fn is_buffered(&self, index: PieceIndex) -> bool {
        self.buffers.contains_key(&index)
    }

    pub fn buffered_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn ensure_piece(&self, index: PieceIndex) -> Result<(), StorageError> {
        if self.descriptor.contains_piece(index) {
            Ok(())
        } else {
            Err(StorageError::InvalidPiece { index })
        }
    }

    fn matches_hash(&self, index: PieceIndex, data: &[u8]) -> bool {
        self.descriptor
            .piece_hash(index)
            .is_some_and(|expected| Sha1::digest(data).as_slice() == expected.as_slice())
    }

    fn write_piece(&mut self, index: PieceIndex, force: bool) -> Result<bool, StorageError> {
        let Some(buffer) = self.buffers.remove(&index) else {
            return Ok(false);
        };

        let verified = self.matches_hash(index, &buffer.data);
        if !verified && !force {
            tracing::trace!("Piece {} incomplete, keeping it buffered", index);
            self.buffers.insert(index, buffer);
            return Ok(false);
        }

        self.write_to_disk(index, &buffer.data)?;

        if verified {
            self.verified.insert(index);
            tracing::debug!("Piece {} verified and written", index);
        } else {
            self.verified.remove(&index);
            tracing::debug!("Piece {} written unverified", index);
        }
        Ok(verified)
    }

    fn read_from_disk(&mut self, index: PieceIndex) -> Result<Vec<u8>, StorageError> {
        let mut data = vec![0u8; self.descriptor.piece_size(index)];

        for segment in self.descriptor.piece_segments(index) {
            let file = &self.descriptor.files()[segment.file_index];
            let handle = self.files.handle(segment.file_index, file)?;
            handle.seek(SeekFrom::Start(segment.file_offset))?;
            read_available(
                handle,
                &mut data[segment.piece_offset..segment.piece_offset + segment.length],
            )?;
        }

        Ok(data)
    }

    fn write_to_disk(&mut self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        for segment in self.descriptor.piece_segments(index) {
            let file = &self.descriptor.files()[segment.file_index];
            let handle = self.files.handle(segment.file_index, file)?;
            handle.seek(SeekFrom::Start(segment.file_offset))?;
            handle.write_all(&data[segment.piece_offset..segment.piece_offset + segment.length])?;
        }
        Ok(())
    }
}

/// Fills `buf` from the reader, leaving the tail zeroed if the file ends early.
fn read_available(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
