//! Incremental reassembly of inbound peer wire frames.
//!
//! A non-blocking socket hands over bytes in arbitrary pieces: the handshake,
//! a length prefix or a payload may each be split across many reads. The
//! assembler keeps its phase between calls and only emits complete frames.

use bytes::{Buf, Bytes, BytesMut};

use super::handshake::HANDSHAKE_LEN;
use crate::torrent::TorrentError;

/// Largest frame accepted from a peer. Generous enough for a 16 KiB block or
/// the bitfield of any torrent within the piece size limits.
pub const MAX_FRAME_LEN: usize = 1 << 21;

/// Complete unit extracted from the inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Raw 68-byte handshake, not yet verified
    Handshake([u8; HANDSHAKE_LEN]),
    /// Message payload: control byte followed by its body
    Payload(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Length,
    Payload { expected: usize },
}

/// Stateful frame assembler for one connection.
#[derive(Debug)]
pub struct FrameAssembler {
    phase: Phase,
    buffer: BytesMut,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    /// Creates an assembler that waits for the remote handshake first.
    pub fn new() -> Self {
        Self {
            phase: Phase::Handshake,
            buffer: BytesMut::new(),
        }
    }

    /// Appends received bytes and returns every frame they complete, in order.
    ///
    /// Keep-alive frames (zero length) are consumed without being emitted.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Declared frame length exceeds [`MAX_FRAME_LEN`]
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Inbound>, TorrentError> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            match self.phase {
                Phase::Handshake => {
                    if self.buffer.len() < HANDSHAKE_LEN {
                        break;
                    }
                    let mut handshake = [0u8; HANDSHAKE_LEN];
                    self.buffer.copy_to_slice(&mut handshake);
                    frames.push(Inbound::Handshake(handshake));
                    self.phase = Phase::Length;
                }
                Phase::Length => {
                    if self.buffer.len() < 4 {
                        break;
                    }
                    let expected = self.buffer.get_u32() as usize;
                    if expected == 0 {
                        continue;
                    }
                    if expected > MAX_FRAME_LEN {
                        return Err(TorrentError::ProtocolError {
                            message: format!("Message of {expected} bytes exceeds frame limit"),
                        });
                    }
                    self.phase = Phase::Payload { expected };
                }
                Phase::Payload { expected } => {
                    if self.buffer.len() < expected {
                        break;
                    }
                    frames.push(Inbound::Payload(self.buffer.split_to(expected).freeze()));
                    self.phase = Phase::Length;
                }
            }
        }

        Ok(frames)
    }

    /// Bytes still missing before the pending frame completes.
    #[cfg(test)]
    fn pending_bytes(&self) -> usize {
        let needed = match self.phase {
            Phase::Handshake => HANDSHAKE_LEN,
            Phase::Length => 4,
            Phase::Payload { expected } => expected,
        };
        needed.saturating_sub(self.buffer.len())
    }

    /// Returns true once the handshake has been consumed.
    #[cfg(test)]
    fn handshake_complete(&self) -> bool {
        self.phase != Phase::Handshake
    }

    /// Drops buffered bytes and starts over at the handshake.
    pub fn reset(&mut self) {
        self.phase = Phase::Handshake;
        self.buffer.clear();
    }
}
