//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Message control bytes from BEP 3.
pub mod message_id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
}

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3, including the length prefix.
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::Choke => put_control(&mut buf, message_id::CHOKE),
            PeerMessage::Unchoke => put_control(&mut buf, message_id::UNCHOKE),
            PeerMessage::Interested => put_control(&mut buf, message_id::INTERESTED),
            PeerMessage::NotInterested => put_control(&mut buf, message_id::NOT_INTERESTED),
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // 1 + 4
                buf.put_u8(message_id::HAVE);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(message_id::BITFIELD);
                buf.put_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => put_block_ref(&mut buf, message_id::REQUEST, *piece_index, *offset, *length),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32); // 1 + 4 + 4 + data
                buf.put_u8(message_id::PIECE);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => put_block_ref(&mut buf, message_id::CANCEL, *piece_index, *offset, *length),
            PeerMessage::Unknown { id } => put_control(&mut buf, *id),
        }

        buf
    }

    /// Decodes one framed payload: control byte followed by its body.
    ///
    /// Unknown control bytes decode to [`PeerMessage::Unknown`] so the caller
    /// can log and discard them.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Empty payload or body size invalid for the type
    pub fn decode_payload(payload: &[u8]) -> Result<PeerMessage, TorrentError> {
        let Some((&id, body)) = payload.split_first() else {
            return Err(TorrentError::ProtocolError {
                message: "Empty message payload".to_string(),
            });
        };
        let mut buf = body;

        match id {
            message_id::CHOKE => Ok(PeerMessage::Choke),
            message_id::UNCHOKE => Ok(PeerMessage::Unchoke),
            message_id::INTERESTED => Ok(PeerMessage::Interested),
            message_id::NOT_INTERESTED => Ok(PeerMessage::NotInterested),
            message_id::HAVE => {
                expect_body(body, 4, "Have")?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(buf.get_u32()),
                })
            }
            message_id::BITFIELD => Ok(PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(body),
            }),
            message_id::REQUEST => {
                expect_body(body, 12, "Request")?;
                Ok(PeerMessage::Request {
                    piece_index: PieceIndex::new(buf.get_u32()),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            message_id::PIECE => {
                if body.len() < 8 {
                    return Err(TorrentError::ProtocolError {
                        message: format!("Invalid Piece message length: {}", payload.len()),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            message_id::CANCEL => {
                expect_body(body, 12, "Cancel")?;
                Ok(PeerMessage::Cancel {
                    piece_index: PieceIndex::new(buf.get_u32()),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            id => Ok(PeerMessage::Unknown { id }),
        }
    }
}

fn put_control(buf: &mut Vec<u8>, id: u8) {
    buf.put_u32(1);
    buf.put_u8(id);
}

fn put_block_ref(buf: &mut Vec<u8>, id: u8, piece_index: PieceIndex, offset: u32, length: u32) {
    buf.put_u32(13); // 1 + 4 + 4 + 4
    buf.put_u8(id);
    buf.put_u32(piece_index.as_u32());
    buf.put_u32(offset);
    buf.put_u32(length);
}

fn expect_body(body: &[u8], expected: usize, name: &str) -> Result<(), TorrentError> {
    if body.len() != expected {
        return Err(TorrentError::ProtocolError {
            message: format!("Invalid {name} message length: {}", body.len() + 1),
        });
    }
    Ok(())
}
