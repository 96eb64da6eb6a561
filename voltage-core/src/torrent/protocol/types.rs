//! Core types and enumerations for BitTorrent wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol name carried in the handshake.
pub const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a peer ID starting with `prefix` followed by random bytes.
    ///
    /// Prefixes longer than 20 bytes are truncated.
    pub fn with_prefix(prefix: &[u8]) -> Self {
        let mut id = [0u8; 20];
        let fixed = prefix.len().min(id.len());
        id[..fixed].copy_from_slice(&prefix[..fixed]);
        for byte in &mut id[fixed..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// BitTorrent wire protocol messages.
///
/// Message set defined in BEP 3 for peer communication. Keep-alives never
/// surface here; the framing layer swallows them.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Remote stops sending data to us
    Choke,
    /// Remote is willing to send data to us
    Unchoke,
    /// Remote wants pieces from us
    Interested,
    /// Remote no longer wants pieces from us
    NotInterested,
    /// Remote acquired a piece
    Have {
        /// Index of the acquired piece
        piece_index: PieceIndex,
    },
    /// Complete piece availability bitmap
    Bitfield {
        /// Bitmap indicating which pieces the sender has
        bitfield: Bytes,
    },
    /// Request a block of data from a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// A block of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// The block bytes
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        /// Index of the piece to cancel
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
    /// Control byte this client does not understand
    Unknown {
        /// Raw control byte
        id: u8,
    },
}

impl PeerMessage {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Choke => "CHOKE",
            PeerMessage::Unchoke => "UNCHOKE",
            PeerMessage::Interested => "INTERESTED",
            PeerMessage::NotInterested => "NOTINTERESTED",
            PeerMessage::Have { .. } => "HAVE",
            PeerMessage::Bitfield { .. } => "BITFIELD",
            PeerMessage::Request { .. } => "REQUEST",
            PeerMessage::Piece { .. } => "PIECE",
            PeerMessage::Cancel { .. } => "CANCEL",
            PeerMessage::Unknown { .. } => "UNKNOWN",
        }
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Peer connection state.
///
/// Lifecycle of a single connection. `kill` and `disconnect` return any
/// state to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No connection established
    #[default]
    Disconnected,
    /// TCP connection in progress
    Connecting,
    /// Transport is up, waiting for the remote handshake
    Handshaking,
    /// Handshake verified, exchanging messages
    Established,
}
