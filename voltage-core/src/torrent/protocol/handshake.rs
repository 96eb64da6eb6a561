//! BitTorrent handshake serialization and deserialization

use bytes::BufMut;

use super::types::{PROTOCOL_NAME, PeerHandshake, PeerId};
use crate::torrent::InfoHash;

/// Exact size of a BEP 3 handshake on the wire.
pub const HANDSHAKE_LEN: usize = 68;

/// Reason a received handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRejection {
    /// Byte 0 was not 19
    BadProtocolLength,
    /// Bytes 1..20 were not the protocol name
    BadSignature,
    /// Embedded info hash differs from ours
    InfoHashMismatch,
}

impl HandshakeRejection {
    /// Kill reason recorded on the connection.
    pub fn reason(self) -> &'static str {
        match self {
            HandshakeRejection::BadProtocolLength => "Protocol should start with character 19",
            HandshakeRejection::BadSignature => "Invalid protocol signature",
            HandshakeRejection::InfoHashMismatch => "Invalid torrent hash",
        }
    }
}

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_NAME.len() as u8);
        buf.put_slice(PROTOCOL_NAME);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(handshake.info_hash.as_bytes());
        buf.put_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Parses a complete 68-byte handshake and checks it against our info hash.
    ///
    /// Reserved bytes are carried through but never interpreted.
    ///
    /// # Errors
    /// - `HandshakeRejection` - Wrong protocol length byte, signature or info hash
    pub fn verify_handshake(
        data: &[u8; HANDSHAKE_LEN],
        expected: &InfoHash,
    ) -> Result<PeerHandshake, HandshakeRejection> {
        if data[0] as usize != PROTOCOL_NAME.len() {
            return Err(HandshakeRejection::BadProtocolLength);
        }
        if &data[1..20] != PROTOCOL_NAME {
            return Err(HandshakeRejection::BadSignature);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash_bytes = [0u8; 20];
        info_hash_bytes.copy_from_slice(&data[28..48]);
        let info_hash = InfoHash::new(info_hash_bytes);
        if &info_hash != expected {
            return Err(HandshakeRejection::InfoHashMismatch);
        }

        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            reserved,
            info_hash,
            peer_id: PeerId::new(peer_id_bytes),
        })
    }
}
