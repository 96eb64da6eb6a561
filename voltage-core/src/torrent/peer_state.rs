//! Remote peer status flags and piece availability bitfield

use crate::torrent::PieceIndex;

/// Stance of the remote peer towards us, as a small bitmask.
///
/// A fresh connection starts choked and not interested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus(u8);

impl PeerStatus {
    /// Remote refuses to send us data
    pub const CHOKED: u8 = 0b01;
    /// Remote wants data from us
    pub const INTERESTED: u8 = 0b10;

    pub fn new() -> Self {
        Self(Self::CHOKED)
    }

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn remove(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    pub fn is_choked(self) -> bool {
        self.contains(Self::CHOKED)
    }

    pub fn is_interested(self) -> bool {
        self.contains(Self::INTERESTED)
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Bitfield representing which pieces a peer has.
///
/// Bit `i` (most significant bit first) is set when the peer owns piece `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl Bitfield {
    /// Create empty bitfield for given number of pieces
    pub fn new(piece_count: u32) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8) as usize],
            piece_count,
        }
    }

    /// Builds a bitfield from a BITFIELD payload, sized to the piece count.
    ///
    /// Short payloads are zero-padded and long ones truncated; spare bits in
    /// the final byte are cleared.
    pub fn from_payload(payload: &[u8], piece_count: u32) -> Self {
        let mut bitfield = Self::new(piece_count);
        let copied = payload.len().min(bitfield.bits.len());
        bitfield.bits[..copied].copy_from_slice(&payload[..copied]);

        let spare = (8 - piece_count % 8) % 8;
        if let Some(last) = bitfield.bits.last_mut() {
            *last &= 0xffu8 << spare;
        }
        bitfield
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] & (1 << bit_index) != 0
    }

    /// Number of pieces the peer advertises.
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
