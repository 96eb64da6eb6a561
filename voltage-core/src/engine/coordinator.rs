//! Single-threaded download coordinator.
//!
//! Every `tick()` drains one tracker datagram, lets tracker sessions announce,
//! opens peer connections up to the configured cap, waits once for readiness
//! and then services error, read and write events in that order before
//! flushing the piece store.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use super::DownloadStats;
use crate::VoltageError;
use crate::config::VoltageConfig;
use crate::events::{DownloadEvent, EventSink};
use crate::storage::{PieceStore, StorageError};
use crate::torrent::{
    AnnounceContext, InfoHash, PeerAddress, PeerConnection, PeerContext, PeerId, PieceIndex,
    TorrentDescriptor, TrackerKey, TrackerSession,
};

const UDP_TOKEN: Token = Token(0);
const FIRST_PEER_TOKEN: usize = 1;

/// View of the download handed to a peer connection while it is serviced.
struct SwarmContext<'a> {
    store: &'a mut PieceStore,
    local_id: PeerId,
    downloaded: &'a mut u64,
}

impl PeerContext for SwarmContext<'_> {
    fn info_hash(&self) -> InfoHash {
        self.store.descriptor().info_hash()
    }

    fn local_peer_id(&self) -> PeerId {
        self.local_id
    }

    fn piece_count(&self) -> u32 {
        self.store.descriptor().piece_count()
    }

    fn piece_size(&self, index: PieceIndex) -> usize {
        self.store.descriptor().piece_size(index)
    }

    fn is_piece_verified(&self, index: PieceIndex) -> bool {
        self.store.has_piece(index)
    }

    fn random_unfinished_piece(&self) -> Option<PieceIndex> {
        self.store.random_unfinished_piece()
    }

    fn next_chunk_sequence(&mut self, index: PieceIndex) -> Option<u32> {
        self.store.next_chunk_sequence(index)
    }

    fn commit(&mut self, index: PieceIndex, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        *self.downloaded += data.len() as u64;
        self.store.commit(index, offset, data)
    }
}

/// Readiness of one transport as reported by a single wait.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    error: bool,
    readable: bool,
    writable: bool,
}

/// Owns every peer connection, tracker session and the piece store of one
/// download and drives them from a single thread.
pub struct DownloadCoordinator {
    config: VoltageConfig,
    descriptor: Arc<TorrentDescriptor>,
    store: PieceStore,
    local_id: PeerId,
    poll: Poll,
    events: Events,
    peers: HashMap<SocketAddrV4, PeerConnection>,
    transports: HashMap<Token, SocketAddrV4>,
    next_token: usize,
    trackers: HashMap<TrackerKey, TrackerSession>,
    udp: Option<UdpSocket>,
    receive_buffer: Vec<u8>,
    sink: Box<dyn EventSink>,
    downloaded: u64,
    uploaded: u64,
    last_force_flush: Instant,
}

impl DownloadCoordinator {
    /// Prepares a download of `descriptor` into the existing directory `root`.
    ///
    /// Creates the piece store, the readiness poller, the shared UDP endpoint
    /// and one tracker session per distinct announce endpoint.
    ///
    /// # Errors
    ///
    /// - `VoltageError::Configuration` - `root` is not an existing directory
    /// - `VoltageError::Storage` - Memory budget cannot hold a single piece
    /// - `VoltageError::Io` - Poller or UDP endpoint could not be created
    pub fn new(
        descriptor: Arc<TorrentDescriptor>,
        root: PathBuf,
        config: VoltageConfig,
        sink: Box<dyn EventSink>,
    ) -> Result<Self, VoltageError> {
        if !root.is_dir() {
            return Err(VoltageError::Configuration {
                reason: format!("Cannot find download directory '{}'", root.display()),
            });
        }

        let store = PieceStore::new(Arc::clone(&descriptor), root, &config.storage)?;
        let poll = Poll::new()?;

        let mut udp = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        poll.registry()
            .register(&mut udp, UDP_TOKEN, Interest::READABLE)?;

        let mut trackers = HashMap::new();
        for url in descriptor.announce_urls() {
            if let Some(session) = TrackerSession::from_url(url, &config.network) {
                trackers.entry(session.key()).or_insert(session);
            }
        }
        tracing::info!(
            "Prepared download of {} ({} pieces, {} trackers)",
            descriptor.name(),
            descriptor.piece_count(),
            trackers.len()
        );

        let receive_buffer = vec![0u8; config.network.udp_receive_buffer.max(1)];
        let events = Events::with_capacity(config.network.max_peer_connections.max(1) * 2 + 1);
        let local_id = PeerId::with_prefix(config.torrent.client_id.as_bytes());

        Ok(Self {
            config,
            descriptor,
            store,
            local_id,
            poll,
            events,
            peers: HashMap::new(),
            transports: HashMap::new(),
            next_token: FIRST_PEER_TOKEN,
            trackers,
            udp: Some(udp),
            receive_buffer,
            sink,
            downloaded: 0,
            uploaded: 0,
            last_force_flush: Instant::now(),
        })
    }

    /// Allocates backing files, then verifies existing data. Freshly
    /// allocated regions are known to be empty and are not hashed.
    ///
    /// # Errors
    /// - `VoltageError::Storage` - Allocation or verification I/O failed
    pub fn start(&mut self) -> Result<(), VoltageError> {
        let fresh = self.store.allocate(self.sink.as_mut())?;
        self.store.check(&fresh, self.sink.as_mut())?;
        tracing::info!(
            "Resuming with {}/{} verified pieces",
            self.store.verified_count(),
            self.descriptor.piece_count()
        );
        Ok(())
    }

    /// Runs one iteration of the event loop.
    ///
    /// Peer and tracker faults are contained; only storage failures end the
    /// run.
    ///
    /// # Errors
    /// - `VoltageError::Storage` - Persisting piece data failed
    /// - `VoltageError::Io` - The readiness wait failed
    pub fn tick(&mut self) -> Result<(), VoltageError> {
        let now = Instant::now();

        self.receive_datagram(now);
        self.update_trackers(now);
        self.connect_peers();

        let ready = self.wait_for_readiness()?;
        self.handle_readiness(&ready)?;

        self.store.flush(false)?;

        let now = Instant::now();
        if now.duration_since(self.last_force_flush) >= self.config.storage.force_flush_interval {
            self.last_force_flush = now;
            tracing::debug!("Periodic forced flush");
            self.store.flush(true)?;
        }

        Ok(())
    }

    /// Closes the tracker endpoint and every peer, then flushes and closes
    /// the piece store.
    ///
    /// # Errors
    /// - `VoltageError::Storage` - Final flush failed
    pub fn finish(&mut self) -> Result<(), VoltageError> {
        if let Some(mut udp) = self.udp.take() {
            let _ = self.poll.registry().deregister(&mut udp);
        }

        for peer in self.peers.values_mut() {
            if let Some(stream) = peer.stream_mut() {
                let _ = self.poll.registry().deregister(stream);
            }
            peer.disconnect();
        }
        self.transports.clear();

        self.store.close()?;
        tracing::info!(
            "Finished with {}/{} verified pieces",
            self.store.verified_count(),
            self.descriptor.piece_count()
        );
        Ok(())
    }

    /// Registers a peer reported by a tracker without connecting to it.
    ///
    /// `ip` may be a dotted quad or a decimal 32-bit integer. Ports outside
    /// `1..=65535` and unparseable addresses are rejected. Adding a known
    /// address returns the existing entry.
    pub fn add_peer(&mut self, ip: &str, port: i64) -> Option<SocketAddrV4> {
        let Some(port) = u16::try_from(port).ok().filter(|&port| port > 0) else {
            tracing::trace!("Rejecting peer {}:{} with invalid port", ip, port);
            return None;
        };
        let Some(ip) = parse_peer_ip(ip) else {
            tracing::trace!("Rejecting peer with invalid address {}", ip);
            return None;
        };

        let address = SocketAddrV4::new(ip, port);
        self.peers.entry(address).or_insert_with(|| {
            tracing::debug!("Added peer {}", address);
            PeerConnection::new(
                address,
                self.config.torrent.request_chunk_size,
                self.config.torrent.max_requests_in_flight,
            )
        });

        Some(address)
    }

    /// Tears down the peer owning `token`.
    ///
    /// With a reason the peer is killed and kept as errored so it is never
    /// reconnected; without one it is closed and forgotten.
    pub fn disconnect_peer(&mut self, token: Token, reason: Option<String>) {
        let Some(address) = self.transports.remove(&token) else {
            return;
        };
        self.transports.retain(|_, owner| *owner != address);

        let Some(peer) = self.peers.get_mut(&address) else {
            return;
        };

        self.sink.on_event(&DownloadEvent::PeerDisconnected {
            address,
            reason: reason.clone(),
        });

        if let Some(stream) = peer.stream_mut() {
            let _ = self.poll.registry().deregister(stream);
        }

        match reason {
            Some(reason) => peer.kill(reason),
            None => {
                peer.disconnect();
                self.peers.remove(&address);
            }
        }
    }

    /// Accounts for a received block and hands it to the piece store.
    ///
    /// # Errors
    /// - `StorageError::InvalidPiece` / `StorageError::OutOfBounds` - Block does not fit the torrent
    /// - `StorageError::Io` - Flushing to disk failed
    pub fn commit(
        &mut self,
        index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        SwarmContext {
            store: &mut self.store,
            local_id: self.local_id,
            downloaded: &mut self.downloaded,
        }
        .commit(index, offset, data)
    }

    pub fn stats(&self) -> DownloadStats {
        DownloadStats {
            verified_pieces: self.store.verified_count(),
            total_pieces: self.descriptor.piece_count(),
            progress_percent: self.store.progress_percent(),
            connected_peers: self.transports.len(),
            known_peers: self.peers.len(),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            remaining: self.store.remaining_bytes(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    pub fn peer(&self, address: SocketAddrV4) -> Option<&PeerConnection> {
        self.peers.get(&address)
    }

    pub fn trackers(&self) -> impl Iterator<Item = &TrackerSession> {
        self.trackers.values()
    }

    pub fn descriptor(&self) -> &Arc<TorrentDescriptor> {
        &self.descriptor
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_id
    }

    fn announce_context(&self) -> AnnounceContext {
        AnnounceContext {
            info_hash: self.descriptor.info_hash(),
            peer_id: self.local_id,
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            left: self.store.remaining_bytes(),
        }
    }

    fn add_discovered(&mut self, discovered: Vec<PeerAddress>) {
        for peer in discovered {
            self.add_peer(&peer.ip, peer.port);
        }
    }

    /// Receives at most one pending datagram and routes it by source address.
    /// A receive failure closes the shared endpoint for the rest of the run.
    fn receive_datagram(&mut self, now: Instant) {
        let Some(socket) = self.udp.as_ref() else {
            return;
        };

        let (received, source) = match socket.recv_from(&mut self.receive_buffer) {
            Ok((received, SocketAddr::V4(source))) if received > 0 => (received, source),
            Ok(_) => return,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::warn!("UDP read error, closing tracker endpoint: {}", e);
                if let Some(mut udp) = self.udp.take() {
                    let _ = self.poll.registry().deregister(&mut udp);
                }
                return;
            }
        };
        tracing::trace!("Received {} UDP bytes from {}", received, source);

        let ctx = self.announce_context();
        let Some(tracker) = self.trackers.get_mut(&TrackerKey::Endpoint(source)) else {
            tracing::debug!("Missing tracker for {}", source);
            return;
        };

        let discovered =
            tracker.receive_datagram(&self.receive_buffer[..received], now, &ctx, &mut self.udp);
        self.add_discovered(discovered);
    }

    fn update_trackers(&mut self, now: Instant) {
        let ctx = self.announce_context();
        let mut discovered = Vec::new();

        for tracker in self.trackers.values_mut() {
            discovered.extend(tracker.update(now, &ctx, &mut self.udp));
        }

        self.add_discovered(discovered);
    }

    /// Starts connects to healthy idle peers until the connection cap is
    /// reached. A failed attempt ends the pass for this tick.
    fn connect_peers(&mut self) {
        let limit = self.config.network.max_peer_connections;
        if self.transports.len() >= limit {
            return;
        }

        let candidates: Vec<SocketAddrV4> = self
            .peers
            .iter()
            .filter(|(_, peer)| !peer.is_errored() && !peer.has_stream())
            .map(|(address, _)| *address)
            .collect();

        for address in candidates {
            if self.transports.len() >= limit {
                break;
            }
            let Some(peer) = self.peers.get_mut(&address) else {
                continue;
            };

            if let Err(e) = peer.connect() {
                tracing::debug!("{}", e);
                peer.kill("Unable to connect");
                break;
            }

            let token = Token(self.next_token);
            self.next_token += 1;

            let registered = match peer.stream_mut() {
                Some(stream) => self.poll.registry().register(
                    stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ),
                None => continue,
            };

            match registered {
                Ok(()) => {
                    self.transports.insert(token, address);
                }
                Err(e) => peer.kill(format!("Unable to register transport: {e}")),
            }
        }
    }

    /// One bounded wait across all registered transports.
    fn wait_for_readiness(&mut self) -> Result<Vec<Readiness>, VoltageError> {
        if self.transports.is_empty() && self.udp.is_none() {
            return Ok(Vec::new());
        }

        match self
            .poll
            .poll(&mut self.events, Some(self.config.network.poll_timeout))
        {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        Ok(self
            .events
            .iter()
            .filter(|event| event.token() != UDP_TOKEN)
            .map(|event| Readiness {
                token: event.token(),
                error: event.is_error(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            })
            .collect())
    }

    /// Disconnects errored transports, then runs the read and write steps
    /// of the rest.
    fn handle_readiness(&mut self, ready: &[Readiness]) -> Result<(), VoltageError> {
        for readiness in ready.iter().filter(|r| r.error) {
            self.disconnect_peer(readiness.token, Some("Socket error".to_string()));
        }
        for readiness in ready.iter().filter(|r| r.readable && !r.error) {
            self.service_peer(readiness.token, true)?;
        }
        for readiness in ready.iter().filter(|r| r.writable && !r.error) {
            self.service_peer(readiness.token, false)?;
        }
        Ok(())
    }

    /// Runs the read or write step of one peer and reaps it if that step
    /// ended the connection.
    fn service_peer(&mut self, token: Token, readable: bool) -> Result<(), VoltageError> {
        let Some(&address) = self.transports.get(&token) else {
            return Ok(());
        };
        let Some(peer) = self.peers.get_mut(&address) else {
            self.transports.remove(&token);
            return Ok(());
        };

        if peer.is_done_connecting() {
            let mut ctx = SwarmContext {
                store: &mut self.store,
                local_id: self.local_id,
                downloaded: &mut self.downloaded,
            };
            if readable {
                peer.on_readable(&mut ctx)?;
            }
            peer.drain(&mut ctx);
        }

        if !peer.has_stream() {
            let reason = peer.error().map(str::to_string);
            self.transports.remove(&token);
            self.sink
                .on_event(&DownloadEvent::PeerDisconnected { address, reason });
        }

        Ok(())
    }
}

/// Parses a tracker-reported IPv4 address in dotted or 32-bit integer form.
fn parse_peer_ip(ip: &str) -> Option<Ipv4Addr> {
    if ip.contains('.') {
        ip.parse().ok()
    } else {
        ip.parse::<u32>().ok().map(Ipv4Addr::from)
    }
}
