//! Torrent metadata decoding.
//!
//! Turns bencoded `.torrent` bytes into an immutable [`TorrentDescriptor`]
//! using bencode-rs, computing the info hash over the verbatim `info` bytes.

pub mod bencode;
pub mod types;

use std::path::Path;

pub use bencode::BencodeParser;
pub use types::{FileSegment, MAX_PIECE_LENGTH, MIN_PIECE_LENGTH, TorrentDescriptor, TorrentFile};

use super::TorrentError;

/// Abstract torrent metadata decoder.
///
/// The download engine only depends on the produced descriptor; the decoder
/// behind it is replaceable.
pub trait TorrentParser {
    /// Parses a descriptor from raw bencoded bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode, missing fields or invalid layout
    fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentDescriptor, TorrentError>;

    /// Reads a `.torrent` file from disk and parses it.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Parsing failed
    fn parse_torrent_file(&self, path: &Path) -> Result<TorrentDescriptor, TorrentError> {
        let file_contents = std::fs::read(path)?;
        self.parse_torrent_data(&file_contents)
    }
}

/// Reference implementation backed by bencode-rs.
#[derive(Debug, Default)]
pub struct BencodeTorrentParser;

impl BencodeTorrentParser {
    /// Creates new bencode parser instance.
    pub fn new() -> Self {
        Self
    }
}

impl TorrentParser for BencodeTorrentParser {
    fn parse_torrent_data(&self, torrent_bytes: &[u8]) -> Result<TorrentDescriptor, TorrentError> {
        BencodeParser::parse_bencode_data(torrent_bytes)
    }
}
