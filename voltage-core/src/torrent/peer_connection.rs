//! Per-peer wire protocol state machine over a non-blocking byte stream.
//!
//! The connection owns its transport, reassembles frames across partial
//! reads, queues outbound bytes until the transport accepts them and keeps a
//! small pipeline of block requests outstanding. Everything it needs from the
//! rest of the download goes through [`PeerContext`].

use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;

use super::peer_state::{Bitfield, PeerStatus};
use super::protocol::{
    FrameAssembler, HandshakeCodec, Inbound, MessageCodec, PeerHandshake, PeerId, PeerMessage,
    PeerState,
};
use super::{InfoHash, PieceIndex, TorrentError};
use crate::storage::StorageError;

const READ_CHUNK: usize = 16 * 1024;

/// What a connection may see of and do to the download it belongs to.
pub trait PeerContext {
    /// Info hash every handshake must carry.
    fn info_hash(&self) -> InfoHash;

    /// Our own peer id.
    fn local_peer_id(&self) -> PeerId;

    fn piece_count(&self) -> u32;

    /// Actual length of a piece in bytes.
    fn piece_size(&self, index: PieceIndex) -> usize;

    fn is_piece_verified(&self, index: PieceIndex) -> bool;

    /// A piece still worth requesting, if any.
    fn random_unfinished_piece(&self) -> Option<PieceIndex>;

    /// Returns and advances the request counter of a piece.
    fn next_chunk_sequence(&mut self, index: PieceIndex) -> Option<u32>;

    /// Stores a received block.
    ///
    /// # Errors
    /// - `StorageError::InvalidPiece` / `StorageError::OutOfBounds` - Block does not fit the torrent
    /// - `StorageError::Io` - Persisting failed
    fn commit(&mut self, index: PieceIndex, offset: u32, data: &[u8]) -> Result<(), StorageError>;
}

/// Protocol state machine for one remote peer.
///
/// Lifecycle: `Disconnected` → `Connecting` → `Handshaking` → `Established`.
/// [`kill`](Self::kill) and [`disconnect`](Self::disconnect) return to
/// `Disconnected` from any state; a killed connection keeps its reason and is
/// never reused.
#[derive(Debug)]
pub struct PeerConnection<S = TcpStream> {
    address: SocketAddrV4,
    remote_id: Option<PeerId>,
    state: PeerState,
    status: PeerStatus,
    bitfield: Option<Bitfield>,
    frames: FrameAssembler,
    outbound: BytesMut,
    handshake_sent: bool,
    in_flight: usize,
    error: Option<String>,
    stream: Option<S>,
    bytes_received: u64,
    bytes_sent: u64,
    chunk_size: u32,
    max_in_flight: usize,
}

impl<S> PeerConnection<S> {
    /// Registers a peer without opening any transport.
    pub fn new(address: SocketAddrV4, chunk_size: u32, max_in_flight: usize) -> Self {
        Self {
            address,
            remote_id: None,
            state: PeerState::Disconnected,
            status: PeerStatus::new(),
            bitfield: None,
            frames: FrameAssembler::new(),
            outbound: BytesMut::new(),
            handshake_sent: false,
            in_flight: 0,
            error: None,
            stream: None,
            bytes_received: 0,
            bytes_sent: 0,
            chunk_size: chunk_size.max(1),
            max_in_flight,
        }
    }

    /// Takes ownership of a transport whose connection is in progress.
    pub fn attach(&mut self, stream: S) {
        self.reset_buffers();
        self.status = PeerStatus::new();
        self.stream = Some(stream);
        self.state = PeerState::Connecting;
    }

    /// Records that the transport finished connecting.
    pub fn mark_connected(&mut self) {
        if self.state == PeerState::Connecting {
            tracing::debug!("Connected to {}", self.address);
            self.state = PeerState::Handshaking;
        }
    }

    /// Records `reason`, closes the transport and drops all buffered bytes.
    ///
    /// Idempotent; the first reason is kept.
    pub fn kill(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.error.is_none() {
            tracing::debug!("Kill {} because {}", self.address, reason);
            self.error = Some(reason);
        }
        self.close();
    }

    /// Closes the transport without marking the peer as failed.
    pub fn disconnect(&mut self) {
        if self.stream.is_some() {
            tracing::debug!("Disconnect {}", self.address);
        }
        self.close();
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// Remote peer id, known once the handshake was accepted.
    pub fn remote_id(&self) -> Option<PeerId> {
        self.remote_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn bitfield(&self) -> Option<&Bitfield> {
        self.bitfield.as_ref()
    }

    /// True if the last BITFIELD advertised the piece.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.bitfield
            .as_ref()
            .is_some_and(|bitfield| bitfield.has_piece(index))
    }

    /// Kill reason, `None` while healthy.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }

    /// True once the transport is up, before or after the handshake.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, PeerState::Handshaking | PeerState::Established)
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// True while bytes are queued or the handshake is still due.
    #[cfg(test)]
    fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty() || (self.is_connected() && !self.handshake_sent)
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    pub fn requests_in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn close(&mut self) {
        self.stream = None;
        self.state = PeerState::Disconnected;
        self.reset_buffers();
    }

    fn reset_buffers(&mut self) {
        self.frames.reset();
        self.outbound.clear();
        self.handshake_sent = false;
        self.in_flight = 0;
    }

    fn queue_message(&mut self, message: &PeerMessage) {
        self.outbound
            .extend_from_slice(&MessageCodec::serialize_message(message));
    }

    /// Queues the handshake, UNCHOKE, INTERESTED and a first REQUEST, once.
    fn send_handshake(&mut self, ctx: &mut impl PeerContext) {
        if self.handshake_sent {
            return;
        }
        self.handshake_sent = true;

        let handshake = PeerHandshake::new(ctx.info_hash(), ctx.local_peer_id());
        self.outbound
            .extend_from_slice(&HandshakeCodec::serialize_handshake(&handshake));
        self.queue_message(&PeerMessage::Unchoke);
        self.queue_message(&PeerMessage::Interested);
        self.send_request(ctx, None);
    }

    /// Queues one block request and returns the piece it targets.
    ///
    /// Without a preferred piece a random unfinished one is picked. Successive
    /// calls for the same piece rotate through its chunks.
    fn send_request(
        &mut self,
        ctx: &mut impl PeerContext,
        preferred: Option<PieceIndex>,
    ) -> Option<PieceIndex> {
        let piece_index = preferred.or_else(|| ctx.random_unfinished_piece())?;
        let piece_size = ctx.piece_size(piece_index);
        if piece_size == 0 {
            return None;
        }

        let chunk_size = self.chunk_size as usize;
        let chunk_count = piece_size.div_ceil(chunk_size);
        let sequence = ctx.next_chunk_sequence(piece_index)? as usize;
        let offset = (sequence % chunk_count) * chunk_size;
        let length = chunk_size.min(piece_size - offset);

        self.queue_message(&PeerMessage::Request {
            piece_index,
            offset: offset as u32,
            length: length as u32,
        });
        self.in_flight += 1;
        Some(piece_index)
    }

    /// Issues a follow-up request, then tops the pipeline up to its depth.
    ///
    /// Stops early when a request attempt does not add to the pipeline.
    fn refill_pipeline(&mut self, ctx: &mut impl PeerContext, preferred: Option<PieceIndex>) {
        let preferred = preferred.filter(|&index| !ctx.is_piece_verified(index));
        let mut target = self.send_request(ctx, preferred);

        while self.in_flight < self.max_in_flight {
            let before = self.in_flight;
            let preferred = target.filter(|&index| !ctx.is_piece_verified(index));
            target = self.send_request(ctx, preferred);
            if self.in_flight == before {
                break;
            }
        }
    }

    fn handle_frame(
        &mut self,
        frame: Inbound,
        ctx: &mut impl PeerContext,
    ) -> Result<(), StorageError> {
        match frame {
            Inbound::Handshake(raw) => {
                match HandshakeCodec::verify_handshake(&raw, &ctx.info_hash()) {
                    Ok(handshake) => {
                        tracing::debug!(
                            "Handshake from {} ({})",
                            self.address,
                            handshake.peer_id
                        );
                        self.remote_id = Some(handshake.peer_id);
                        self.state = PeerState::Established;
                    }
                    Err(rejection) => self.kill(rejection.reason()),
                }
                Ok(())
            }
            Inbound::Payload(payload) => match MessageCodec::decode_payload(&payload) {
                Ok(message) => self.dispatch(message, ctx),
                Err(e) => {
                    self.kill(format!("Malformed message: {e}"));
                    Ok(())
                }
            },
        }
    }

    fn dispatch(
        &mut self,
        message: PeerMessage,
        ctx: &mut impl PeerContext,
    ) -> Result<(), StorageError> {
        if !matches!(message, PeerMessage::Piece { .. }) {
            tracing::trace!("{} from {}", message.name(), self.address);
        }

        match message {
            PeerMessage::Choke => self.status.insert(PeerStatus::CHOKED),
            PeerMessage::Unchoke => {
                self.status.remove(PeerStatus::CHOKED);
                self.refill_pipeline(ctx, None);
            }
            PeerMessage::Interested => self.status.insert(PeerStatus::INTERESTED),
            PeerMessage::NotInterested => self.status.remove(PeerStatus::INTERESTED),
            PeerMessage::Have { piece_index } => {
                tracing::trace!("{} has piece {}", self.address, piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                self.bitfield = Some(Bitfield::from_payload(&bitfield, ctx.piece_count()));
            }
            PeerMessage::Request { piece_index, .. } => {
                tracing::trace!(
                    "Ignoring request for piece {} from {}",
                    piece_index,
                    self.address
                );
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                match ctx.commit(piece_index, offset, &data) {
                    Ok(()) => self.refill_pipeline(ctx, Some(piece_index)),
                    Err(e) if e.is_recoverable() => self.kill(format!("Invalid piece data: {e}")),
                    Err(e) => return Err(e),
                }
            }
            PeerMessage::Cancel { .. } => {}
            PeerMessage::Unknown { id } => {
                tracing::debug!("Unknown message type {} from {}", id, self.address);
            }
        }
        Ok(())
    }
}

impl<S: Read + Write> PeerConnection<S> {
    /// Reads until the transport would block and dispatches complete frames.
    ///
    /// Protocol violations and transport failures kill this peer only.
    ///
    /// # Errors
    /// - `StorageError::Io` - A received block could not be persisted
    pub fn on_readable(&mut self, ctx: &mut impl PeerContext) -> Result<(), StorageError> {
        let mut buf = [0u8; READ_CHUNK];

        while self.is_connected() && !self.is_errored() {
            let Some(stream) = self.stream.as_mut() else {
                break;
            };

            let received = match stream.read(&mut buf) {
                Ok(0) => {
                    self.kill("Connection closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.kill(format!("Socket read error: {e}"));
                    break;
                }
            };
            self.bytes_received += received as u64;

            let frames = match self.frames.feed(&buf[..received]) {
                Ok(frames) => frames,
                Err(e) => {
                    self.kill(e.to_string());
                    break;
                }
            };

            for frame in frames {
                self.handle_frame(frame, ctx)?;
                if self.is_errored() || !self.is_connected() {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Sends the handshake if due, then writes queued bytes until the
    /// transport would block.
    pub fn drain(&mut self, ctx: &mut impl PeerContext) {
        if !self.is_connected() || self.is_errored() {
            return;
        }
        self.send_handshake(ctx);

        while !self.outbound.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                break;
            };

            match stream.write(&self.outbound) {
                Ok(0) => {
                    self.kill("Connection closed by peer during write");
                    break;
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    self.bytes_sent += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.kill(format!("Socket write error: {e}"));
                    break;
                }
            }
        }
    }
}

impl PeerConnection<TcpStream> {
    /// Starts a non-blocking TCP connect. An in-progress connection is not
    /// an error; completion is observed through [`is_done_connecting`](Self::is_done_connecting).
    ///
    /// Does nothing if a transport already exists or the peer was killed.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Socket could not be created
    pub fn connect(&mut self) -> Result<(), TorrentError> {
        if self.stream.is_some() || self.is_errored() {
            return Ok(());
        }

        let stream = TcpStream::connect(SocketAddr::V4(self.address)).map_err(|e| {
            TorrentError::PeerConnectionError {
                reason: format!("Unable to connect to {}: {e}", self.address),
            }
        })?;
        tracing::trace!("Connecting to {}", self.address);
        self.attach(stream);
        Ok(())
    }

    /// Checks whether the pending connect finished, killing the peer if it
    /// failed.
    pub fn is_done_connecting(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }
        if self.state != PeerState::Connecting {
            return false;
        }
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                self.kill(format!("Connection failed: {e}"));
                return false;
            }
        }

        match stream.peer_addr() {
            Ok(_) => {
                self.mark_connected();
                true
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                false
            }
            Err(e) => {
                self.kill(format!("Connection failed: {e}"));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::torrent::protocol::HANDSHAKE_LEN;

    const INFO_HASH: [u8; 20] = [0x11; 20];
    const PIECE_SIZE: usize = 32768;

    #[derive(Default)]
    struct StreamState {
        inbound: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        write_limit: Option<usize>,
        closed: bool,
        fail_writes: bool,
    }

    #[derive(Clone, Default)]
    struct MockStream(Rc<RefCell<StreamState>>);

    impl MockStream {
        fn push(&self, bytes: &[u8]) {
            self.0.borrow_mut().inbound.push_back(bytes.to_vec());
        }

        fn take_written(&self) -> Vec<u8> {
            std::mem::take(&mut self.0.borrow_mut().written)
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.0.borrow_mut();
            let Some(mut chunk) = state.inbound.pop_front() else {
                return if state.closed {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                state.inbound.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.0.borrow_mut();
            if state.fail_writes {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let n = state.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
            if n == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            state.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockContext {
        verified: HashSet<PieceIndex>,
        sequences: HashMap<PieceIndex, u32>,
        commits: Vec<(PieceIndex, u32, Vec<u8>)>,
        next_piece: Option<PieceIndex>,
        commit_error: Option<fn() -> StorageError>,
    }

    impl MockContext {
        fn new() -> Self {
            Self {
                next_piece: Some(PieceIndex::new(1)),
                ..Default::default()
            }
        }
    }

    impl PeerContext for MockContext {
        fn info_hash(&self) -> InfoHash {
            InfoHash::new(INFO_HASH)
        }

        fn local_peer_id(&self) -> PeerId {
            PeerId::new(*b"-VT0001-abcdefghijkl")
        }

        fn piece_count(&self) -> u32 {
            4
        }

        fn piece_size(&self, _index: PieceIndex) -> usize {
            PIECE_SIZE
        }

        fn is_piece_verified(&self, index: PieceIndex) -> bool {
            self.verified.contains(&index)
        }

        fn random_unfinished_piece(&self) -> Option<PieceIndex> {
            self.next_piece
        }

        fn next_chunk_sequence(&mut self, index: PieceIndex) -> Option<u32> {
            let counter = self.sequences.entry(index).or_default();
            let current = *counter;
            *counter += 1;
            Some(current)
        }

        fn commit(
            &mut self,
            index: PieceIndex,
            offset: u32,
            data: &[u8],
        ) -> Result<(), StorageError> {
            if let Some(error) = self.commit_error {
                return Err(error());
            }
            self.commits.push((index, offset, data.to_vec()));
            Ok(())
        }
    }

    fn remote_handshake(info_hash: [u8; 20]) -> Vec<u8> {
        HandshakeCodec::serialize_handshake(&PeerHandshake::new(
            InfoHash::new(info_hash),
            PeerId::new([0x22; 20]),
        ))
    }

    fn connected_peer() -> (PeerConnection<MockStream>, MockStream) {
        let stream = MockStream::default();
        let mut peer = PeerConnection::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881), 16384, 5);
        peer.attach(stream.clone());
        peer.mark_connected();
        (peer, stream)
    }

    fn requests_in(bytes: &[u8]) -> Vec<(u32, u32, u32)> {
        let mut assembler = FrameAssembler::new();
        let mut with_handshake = vec![0u8; HANDSHAKE_LEN];
        with_handshake.extend_from_slice(bytes);
        assembler
            .feed(&with_handshake)
            .unwrap()
            .into_iter()
            .filter_map(|frame| match frame {
                Inbound::Payload(payload) => match MessageCodec::decode_payload(&payload) {
                    Ok(PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }) => Some((piece_index.as_u32(), offset, length)),
                    _ => None,
                },
                Inbound::Handshake(_) => None,
            })
            .collect()
    }

    fn piece_message(index: u32, offset: u32, len: usize) -> Vec<u8> {
        MessageCodec::serialize_message(&PeerMessage::Piece {
            piece_index: PieceIndex::new(index),
            offset,
            data: Bytes::from(vec![0x5A; len]),
        })
    }

    #[test]
    fn test_handshake_sent_once() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();

        peer.drain(&mut ctx);
        let written = stream.take_written();

        assert_eq!(written.len(), 68 + 5 + 5 + 17);
        assert_eq!(written[0], 19);
        assert_eq!(&written[28..48], &INFO_HASH);
        assert_eq!(&written[48..68], b"-VT0001-abcdefghijkl");
        assert_eq!(&written[68..73], &[0, 0, 0, 1, 1]);
        assert_eq!(&written[73..78], &[0, 0, 0, 1, 2]);
        assert_eq!(requests_in(&written[68..]), vec![(1, 0, 16384)]);
        assert_eq!(peer.requests_in_flight(), 1);

        peer.drain(&mut ctx);
        assert!(stream.take_written().is_empty());
    }

    #[test]
    fn test_accepts_valid_handshake() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();

        stream.push(&remote_handshake(INFO_HASH));
        peer.on_readable(&mut ctx).unwrap();

        assert_eq!(peer.state(), PeerState::Established);
        assert_eq!(peer.remote_id(), Some(PeerId::new([0x22; 20])));
        assert!(!peer.is_errored());
    }

    #[test]
    fn test_rejects_bad_handshakes() {
        let mut wrong_length = remote_handshake(INFO_HASH);
        wrong_length[0] = 20;
        let mut wrong_signature = remote_handshake(INFO_HASH);
        wrong_signature[1] = b'b';
        let wrong_hash = remote_handshake([0x99; 20]);

        let cases = [
            (wrong_length, "Protocol should start with character 19"),
            (wrong_signature, "Invalid protocol signature"),
            (wrong_hash, "Invalid torrent hash"),
        ];

        for (bytes, reason) in cases {
            let (mut peer, stream) = connected_peer();
            stream.push(&bytes);
            peer.on_readable(&mut MockContext::new()).unwrap();

            assert_eq!(peer.error(), Some(reason));
            assert_eq!(peer.state(), PeerState::Disconnected);
            assert!(!peer.has_stream());
            assert_eq!(peer.remote_id(), None);
        }
    }

    #[test]
    fn test_status_messages() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();

        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&MessageCodec::serialize_message(&PeerMessage::Interested));
        peer.on_readable(&mut ctx).unwrap();
        assert!(peer.status().is_choked());
        assert!(peer.status().is_interested());

        stream.push(&MessageCodec::serialize_message(&PeerMessage::NotInterested));
        stream.push(&MessageCodec::serialize_message(&PeerMessage::Unchoke));
        peer.on_readable(&mut ctx).unwrap();
        assert!(!peer.status().is_choked());
        assert!(!peer.status().is_interested());

        stream.push(&MessageCodec::serialize_message(&PeerMessage::Choke));
        peer.on_readable(&mut ctx).unwrap();
        assert!(peer.status().is_choked());
    }

    #[test]
    fn test_unchoke_fills_pipeline() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();

        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&MessageCodec::serialize_message(&PeerMessage::Unchoke));
        peer.on_readable(&mut ctx).unwrap();

        assert_eq!(peer.requests_in_flight(), 5);
    }

    #[test]
    fn test_have_is_not_recorded_and_bitfield_replaces() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();

        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(2),
        }));
        peer.on_readable(&mut ctx).unwrap();
        assert!(peer.bitfield().is_none());
        assert!(!peer.has_piece(PieceIndex::new(2)));

        stream.push(&MessageCodec::serialize_message(&PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0b1100_0000]),
        }));
        peer.on_readable(&mut ctx).unwrap();
        assert!(peer.has_piece(PieceIndex::new(1)));

        stream.push(&MessageCodec::serialize_message(&PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0b0001_0000]),
        }));
        peer.on_readable(&mut ctx).unwrap();
        assert!(!peer.has_piece(PieceIndex::new(1)));
        assert!(peer.has_piece(PieceIndex::new(3)));
    }

    #[test]
    fn test_requests_and_unknown_messages_are_ignored() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();

        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&MessageCodec::serialize_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(0),
            offset: 0,
            length: 16384,
        }));
        stream.push(&[0, 0, 0, 2, 42, 0]);
        peer.on_readable(&mut ctx).unwrap();

        assert!(!peer.is_errored());
        assert!(stream.take_written().is_empty());
    }

    #[test]
    fn test_piece_commits_and_refills() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();

        peer.drain(&mut ctx);
        stream.take_written();
        assert_eq!(peer.requests_in_flight(), 1);

        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&piece_message(1, 0, 16384));
        peer.on_readable(&mut ctx).unwrap();
        peer.drain(&mut ctx);

        assert_eq!(ctx.commits.len(), 1);
        assert_eq!(ctx.commits[0].0, PieceIndex::new(1));
        assert_eq!(ctx.commits[0].2.len(), 16384);
        assert_eq!(peer.requests_in_flight(), 5);

        // Chunks rotate through the 2-chunk piece
        let requests = requests_in(&stream.take_written());
        assert_eq!(
            requests,
            vec![
                (1, 16384, 16384),
                (1, 0, 16384),
                (1, 16384, 16384),
                (1, 0, 16384),
                (1, 16384, 16384),
            ]
        );
    }

    #[test]
    fn test_verified_piece_is_not_requested_again() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();
        ctx.verified.insert(PieceIndex::new(1));
        ctx.next_piece = Some(PieceIndex::new(3));

        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&piece_message(1, 0, 16384));
        peer.on_readable(&mut ctx).unwrap();
        peer.drain(&mut ctx);

        let requests = requests_in(&stream.take_written());
        assert!(requests.iter().all(|&(index, _, _)| index == 3));
    }

    #[test]
    fn test_pipeline_stops_without_unfinished_pieces() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();
        ctx.next_piece = None;

        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&MessageCodec::serialize_message(&PeerMessage::Unchoke));
        peer.on_readable(&mut ctx).unwrap();

        assert_eq!(peer.requests_in_flight(), 0);
        assert!(!peer.is_errored());
    }

    #[test]
    fn test_out_of_bounds_block_kills_peer() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();
        ctx.commit_error = Some(|| StorageError::OutOfBounds {
            index: PieceIndex::new(1),
            offset: 40000,
            length: 10,
        });

        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&piece_message(1, 40000, 10));
        peer.on_readable(&mut ctx).unwrap();

        assert!(peer.error().unwrap().starts_with("Invalid piece data"));
    }

    #[test]
    fn test_storage_io_error_is_fatal() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();
        ctx.commit_error = Some(|| StorageError::Io(io::Error::other("disk gone")));

        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&piece_message(1, 0, 10));

        assert!(matches!(
            peer.on_readable(&mut ctx),
            Err(StorageError::Io(_))
        ));
    }

    #[test]
    fn test_remote_close_kills() {
        let (mut peer, stream) = connected_peer();
        stream.0.borrow_mut().closed = true;

        peer.on_readable(&mut MockContext::new()).unwrap();
        assert_eq!(peer.error(), Some("Connection closed by peer"));
    }

    #[test]
    fn test_partial_writes_keep_remainder_queued() {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();
        stream.0.borrow_mut().write_limit = Some(10);

        peer.drain(&mut ctx);
        assert_eq!(peer.bytes_sent(), 95);
        assert!(!peer.has_pending_output());

        stream.0.borrow_mut().write_limit = Some(0);
        stream.push(&remote_handshake(INFO_HASH));
        stream.push(&MessageCodec::serialize_message(&PeerMessage::Unchoke));
        peer.on_readable(&mut ctx).unwrap();
        peer.drain(&mut ctx);
        assert!(peer.has_pending_output());
    }

    #[test]
    fn test_write_error_kills() {
        let (mut peer, stream) = connected_peer();
        stream.0.borrow_mut().fail_writes = true;

        peer.drain(&mut MockContext::new());
        assert!(peer.error().unwrap().starts_with("Socket write error"));
        assert!(!peer.has_pending_output());
    }

    #[test]
    fn test_kill_is_idempotent_and_disconnect_is_clean() {
        let (mut peer, _stream) = connected_peer();
        peer.kill("first");
        peer.kill("second");
        assert_eq!(peer.error(), Some("first"));
        assert_eq!(peer.state(), PeerState::Disconnected);

        let (mut clean, _stream) = connected_peer();
        clean.disconnect();
        clean.disconnect();
        assert!(!clean.is_errored());
        assert!(!clean.has_stream());
    }

    type Transcript = (Vec<(PieceIndex, u32, Vec<u8>)>, u8, Option<Bitfield>, Vec<u8>);

    fn transcript(deliveries: &[Vec<u8>]) -> Transcript {
        let (mut peer, stream) = connected_peer();
        let mut ctx = MockContext::new();
        for delivery in deliveries {
            stream.push(delivery);
            peer.on_readable(&mut ctx).unwrap();
        }
        peer.drain(&mut ctx);
        (
            ctx.commits,
            peer.status().bits(),
            peer.bitfield().cloned(),
            stream.take_written(),
        )
    }

    proptest! {
        #[test]
        fn test_split_delivery_dispatches_identically(
            cuts in proptest::collection::vec(1usize..50, 1..40),
        ) {
            let mut bytes = remote_handshake(INFO_HASH);
            bytes.extend(MessageCodec::serialize_message(&PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000]),
            }));
            bytes.extend_from_slice(&[0, 0, 0, 0]);
            bytes.extend(MessageCodec::serialize_message(&PeerMessage::Unchoke));
            bytes.extend(piece_message(1, 16384, 300));
            bytes.extend(MessageCodec::serialize_message(&PeerMessage::Interested));

            let whole = transcript(&[bytes.clone()]);

            let mut deliveries = Vec::new();
            let mut position = 0;
            for cut in cuts {
                if position >= bytes.len() {
                    break;
                }
                let end = (position + cut).min(bytes.len());
                deliveries.push(bytes[position..end].to_vec());
                position = end;
            }
            deliveries.push(bytes[position..].to_vec());
            let split = transcript(&deliveries);

            prop_assert_eq!(whole.0.len(), 1);
            prop_assert_eq!(split, whole);
        }
    }
}
