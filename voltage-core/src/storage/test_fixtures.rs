//! Test fixtures for storage testing.
//!
//! Builds descriptors whose piece hashes match known content, so stores can
//! be exercised against real verification.

use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::torrent::{InfoHash, TorrentDescriptor};

/// Torrent content together with the descriptor that describes it.
pub struct TestTorrent {
    pub descriptor: Arc<TorrentDescriptor>,
    pub content: Vec<u8>,
}

impl TestTorrent {
    /// Expected bytes of one piece.
    pub fn piece(&self, index: u32) -> &[u8] {
        let piece_length = self.descriptor.piece_length() as usize;
        let start = index as usize * piece_length;
        let end = (start + piece_length).min(self.content.len());
        &self.content[start..end]
    }
}

/// Creates a torrent over `files` (name, length) filled with `content`.
///
/// # Panics
///
/// Panics if the layout is invalid. Acceptable in test fixtures where a
/// failure indicates a broken test.
pub fn create_test_torrent(
    files: &[(&str, u64)],
    piece_length: u32,
    content: impl Fn(usize) -> u8,
) -> TestTorrent {
    let total: u64 = files.iter().map(|(_, length)| length).sum();
    let content: Vec<u8> = (0..total as usize).map(content).collect();

    let piece_hashes = content
        .chunks(piece_length as usize)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(Sha1::digest(chunk).as_slice());
            hash
        })
        .collect();

    let descriptor = TorrentDescriptor::new(
        InfoHash::new([0xAB; 20]),
        "fixture".to_string(),
        piece_length,
        piece_hashes,
        files
            .iter()
            .map(|(name, length)| (vec![name.to_string()], *length))
            .collect(),
        vec!["udp://127.0.0.1:6969".to_string()],
    )
    .unwrap();

    TestTorrent {
        descriptor: Arc::new(descriptor),
        content,
    }
}

/// Two 16 KiB pieces, the first all 0x41 and the second all 0x42.
pub fn create_two_piece_torrent() -> TestTorrent {
    create_test_torrent(&[("data.bin", 32768)], 16384, |position| {
        if position < 16384 { 0x41 } else { 0x42 }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_hashes_match_content() {
        let torrent = create_two_piece_torrent();

        assert_eq!(torrent.descriptor.piece_count(), 2);
        assert!(torrent.piece(0).iter().all(|&b| b == 0x41));
        assert!(torrent.piece(1).iter().all(|&b| b == 0x42));
        let expected = Sha1::digest(torrent.piece(1));
        let stored = torrent
            .descriptor
            .piece_hash(crate::torrent::PieceIndex::new(1))
            .unwrap();
        assert_eq!(stored.as_slice(), expected.as_slice());
    }
}
