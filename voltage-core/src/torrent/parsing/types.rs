//! Immutable torrent descriptor and its derived file layout

use std::path::PathBuf;

use super::super::{InfoHash, PieceIndex, TorrentError};

/// Smallest accepted piece size (1 KiB).
pub const MIN_PIECE_LENGTH: u32 = 1 << 10;
/// Largest accepted piece size (32 MiB).
pub const MAX_PIECE_LENGTH: u32 = 1 << 25;

/// Individual file within a torrent.
///
/// Carries the relative path components, byte length and the file's
/// global byte offset within the concatenated torrent data.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
    pub offset: u64,
}

impl TorrentFile {
    /// Returns the relative on-disk path of this file.
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

/// Portion of a piece that lives inside one backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSegment {
    /// Index into [`TorrentDescriptor::files`]
    pub file_index: usize,
    /// Byte offset within the file
    pub file_offset: u64,
    /// Byte offset within the piece
    pub piece_offset: usize,
    /// Number of bytes in this segment
    pub length: usize,
}

/// Complete, validated metadata of a torrent.
///
/// Shared read-only by every component of a download. Construction through
/// [`TorrentDescriptor::new`] guarantees a valid piece size, a non-empty data
/// set and that every piece is backed by at least one file.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentDescriptor {
    info_hash: InfoHash,
    name: String,
    piece_length: u32,
    piece_hashes: Vec<[u8; 20]>,
    total_length: u64,
    files: Vec<TorrentFile>,
    piece_files: Vec<Vec<usize>>,
    announce_urls: Vec<String>,
}

impl TorrentDescriptor {
    /// Builds a descriptor from decoded metadata fields.
    ///
    /// `files` holds `(path components, length)` pairs in torrent order.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the piece size is not a power of two
    ///   within range, there are no pieces, a path is unsafe, the data set is empty,
    ///   or the piece count does not match the total size
    pub fn new(
        info_hash: InfoHash,
        name: String,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        files: Vec<(Vec<String>, u64)>,
        announce_urls: Vec<String>,
    ) -> Result<Self, TorrentError> {
        if !piece_length.is_power_of_two() {
            return Err(invalid("Piece size should be a power of two"));
        }
        if piece_length < MIN_PIECE_LENGTH {
            return Err(invalid("Piece size too small"));
        }
        if piece_length > MAX_PIECE_LENGTH {
            return Err(invalid("Piece size too big"));
        }
        if piece_hashes.is_empty() {
            return Err(invalid("Torrent contains no pieces"));
        }

        let mut layout = Vec::with_capacity(files.len());
        let mut piece_files = vec![Vec::new(); piece_hashes.len()];
        let mut position = 0u64;

        for (file_index, (path, length)) in files.into_iter().enumerate() {
            validate_path(&path)?;

            let start_piece = position / piece_length as u64;
            let end_piece = (position + length).div_ceil(piece_length as u64);
            for piece in start_piece..end_piece {
                let spans = piece_files.get_mut(piece as usize).ok_or_else(|| {
                    invalid("File data extends beyond the last piece")
                })?;
                spans.push(file_index);
            }

            layout.push(TorrentFile {
                path,
                length,
                offset: position,
            });
            position += length;
        }

        if position == 0 {
            return Err(invalid("Torrent contains no data"));
        }

        let expected_pieces = position.div_ceil(piece_length as u64);
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(invalid(&format!(
                "Expected {expected_pieces} pieces for {position} bytes, found {}",
                piece_hashes.len()
            )));
        }

        if announce_urls.is_empty() {
            return Err(invalid("No announce URLs found"));
        }

        Ok(Self {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length: position,
            files: layout,
            piece_files,
            announce_urls,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nominal piece size in bytes.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    pub fn announce_urls(&self) -> &[String] {
        &self.announce_urls
    }

    /// Returns true if the index addresses a piece of this torrent.
    pub fn contains_piece(&self, index: PieceIndex) -> bool {
        index.as_usize() < self.piece_hashes.len()
    }

    /// Expected SHA-1 digest of a piece, if the index is in range.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index.as_usize())
    }

    /// Actual byte length of a piece; only the last piece may be shorter.
    pub fn piece_size(&self, index: PieceIndex) -> usize {
        let start = index.as_u32() as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_length);
        end.saturating_sub(start) as usize
    }

    /// Indices of the files a piece spans.
    pub fn piece_files(&self, index: PieceIndex) -> &[usize] {
        self.piece_files
            .get(index.as_usize())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Maps a piece onto the file regions backing it, in piece order.
    pub fn piece_segments(&self, index: PieceIndex) -> Vec<FileSegment> {
        let piece_start = index.as_u32() as u64 * self.piece_length as u64;
        let piece_end = piece_start + self.piece_size(index) as u64;

        self.piece_files(index)
            .iter()
            .filter_map(|&file_index| {
                let file = &self.files[file_index];
                let start = piece_start.max(file.offset);
                let end = piece_end.min(file.offset + file.length);
                (end > start).then(|| FileSegment {
                    file_index,
                    file_offset: start - file.offset,
                    piece_offset: (start - piece_start) as usize,
                    length: (end - start) as usize,
                })
            })
            .collect()
    }

    /// Piece indices touched by the global byte range `[start, end)`.
    pub fn pieces_in_range(&self, start: u64, end: u64) -> std::ops::Range<u32> {
        let first = (start / self.piece_length as u64) as u32;
        let last = end.div_ceil(self.piece_length as u64) as u32;
        first..last.min(self.piece_count())
    }
}

fn invalid(reason: &str) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.to_string(),
    }
}

fn validate_path(path: &[String]) -> Result<(), TorrentError> {
    if path.is_empty() {
        return Err(invalid("Empty file path"));
    }

    for component in path {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
        {
            return Err(invalid(&format!("Unsafe path component: {component:?}")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_file_descriptor() -> TorrentDescriptor {
        // 1024-byte pieces over a 1500 + 1000 byte layout
        TorrentDescriptor::new(
            InfoHash::new([7u8; 20]),
            "pack".to_string(),
            1024,
            vec![[0u8; 20]; 3],
            vec![
                (vec!["a.bin".to_string()], 1500),
                (vec!["sub".to_string(), "b.bin".to_string()], 1000),
            ],
            vec!["udp://tracker.example.com:80".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_piece_file_mapping() {
        let descriptor = two_file_descriptor();

        assert_eq!(descriptor.total_length(), 2500);
        assert_eq!(descriptor.piece_files(PieceIndex::new(0)), &[0]);
        assert_eq!(descriptor.piece_files(PieceIndex::new(1)), &[0, 1]);
        assert_eq!(descriptor.piece_files(PieceIndex::new(2)), &[1]);
        assert_eq!(descriptor.files()[1].offset, 1500);
        assert_eq!(
            descriptor.files()[1].relative_path(),
            PathBuf::from("sub").join("b.bin")
        );
    }

    #[test]
    fn test_last_piece_is_short() {
        let descriptor = two_file_descriptor();

        assert_eq!(descriptor.piece_size(PieceIndex::new(0)), 1024);
        assert_eq!(descriptor.piece_size(PieceIndex::new(2)), 2500 - 2048);
    }

    #[test]
    fn test_piece_segments_split_across_files() {
        let descriptor = two_file_descriptor();
        let segments = descriptor.piece_segments(PieceIndex::new(1));

        assert_eq!(
            segments,
            vec![
                FileSegment {
                    file_index: 0,
                    file_offset: 1024,
                    piece_offset: 0,
                    length: 476,
                },
                FileSegment {
                    file_index: 1,
                    file_offset: 0,
                    piece_offset: 476,
                    length: 548,
                },
            ]
        );
    }

    #[test]
    fn test_rejects_non_power_of_two_piece_length() {
        let result = TorrentDescriptor::new(
            InfoHash::new([0u8; 20]),
            "x".to_string(),
            3000,
            vec![[0u8; 20]],
            vec![(vec!["x".to_string()], 100)],
            vec!["http://t/announce".to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_piece_length_out_of_range() {
        for piece_length in [512, 1 << 26] {
            let result = TorrentDescriptor::new(
                InfoHash::new([0u8; 20]),
                "x".to_string(),
                piece_length,
                vec![[0u8; 20]],
                vec![(vec!["x".to_string()], 100)],
                vec!["http://t/announce".to_string()],
            );
            assert!(result.is_err(), "piece length {piece_length} accepted");
        }
    }

    #[test]
    fn test_rejects_empty_data() {
        let result = TorrentDescriptor::new(
            InfoHash::new([0u8; 20]),
            "x".to_string(),
            1024,
            vec![[0u8; 20]],
            vec![(vec!["x".to_string()], 0)],
            vec!["http://t/announce".to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_piece_count_mismatch() {
        let result = TorrentDescriptor::new(
            InfoHash::new([0u8; 20]),
            "x".to_string(),
            1024,
            vec![[0u8; 20]; 2],
            vec![(vec!["x".to_string()], 100)],
            vec!["http://t/announce".to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_parent_directory_components() {
        let result = TorrentDescriptor::new(
            InfoHash::new([0u8; 20]),
            "x".to_string(),
            1024,
            vec![[0u8; 20]],
            vec![(vec!["..".to_string(), "etc".to_string()], 100)],
            vec!["http://t/announce".to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_pieces_in_range() {
        let descriptor = two_file_descriptor();

        assert_eq!(descriptor.pieces_in_range(0, 1500), 0..2);
        assert_eq!(descriptor.pieces_in_range(1500, 2500), 1..3);
        assert_eq!(descriptor.pieces_in_range(2048, 2048), 2..2);
    }
}
