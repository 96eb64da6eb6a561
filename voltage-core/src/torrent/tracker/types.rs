//! Announce inputs, session keys, peer records and scheduling shared by both
//! tracker variants.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use crate::torrent::{InfoHash, PeerId};

/// Bytes per peer in a compact peer list: 4-byte IPv4 address, 2-byte port.
pub const COMPACT_PEER_SIZE: usize = 6;

/// Download state reported with every announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceContext {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes still missing from verified pieces
    pub left: u64,
}

/// Identity of a tracker session.
///
/// HTTP trackers are keyed by announce URL. UDP trackers are keyed by their
/// resolved endpoint so inbound datagrams can be routed by source address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackerKey {
    Url(String),
    Endpoint(SocketAddrV4),
}

impl fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Endpoint(address) => write!(f, "{address}"),
        }
    }
}

/// A peer as reported by a tracker, before any validation.
///
/// Dictionary-form HTTP responses may carry the address as a dotted quad or
/// as a decimal 32-bit integer, and ports are whatever the tracker sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub ip: String,
    pub port: i64,
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(address: SocketAddrV4) -> Self {
        Self {
            ip: address.ip().to_string(),
            port: i64::from(address.port()),
        }
    }
}

/// Decodes a compact peer list. A trailing partial record is ignored.
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddrV4> {
    bytes
        .chunks_exact(COMPACT_PEER_SIZE)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect()
}

/// Outbound half of the shared UDP endpoint.
pub trait DatagramSender {
    /// Sends one datagram.
    ///
    /// # Errors
    /// - `std::io::Error` - Endpoint unavailable or the send failed
    fn send_datagram(&mut self, packet: &[u8], target: SocketAddrV4) -> io::Result<usize>;
}

impl DatagramSender for mio::net::UdpSocket {
    fn send_datagram(&mut self, packet: &[u8], target: SocketAddrV4) -> io::Result<usize> {
        self.send_to(packet, SocketAddr::V4(target))
    }
}

impl<T: DatagramSender> DatagramSender for Option<T> {
    fn send_datagram(&mut self, packet: &[u8], target: SocketAddrV4) -> io::Result<usize> {
        match self {
            Some(sender) => sender.send_datagram(packet, target),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "UDP endpoint is closed",
            )),
        }
    }
}

/// Earliest time the next announce may go out.
#[derive(Debug, Clone)]
pub(super) struct AnnounceSchedule {
    next: Option<Instant>,
    retry_interval: Duration,
}

impl AnnounceSchedule {
    pub(super) fn new(retry_interval: Duration) -> Self {
        Self {
            next: None,
            retry_interval,
        }
    }

    pub(super) fn is_due(&self, now: Instant) -> bool {
        self.next.is_none_or(|next| now >= next)
    }

    /// Pessimistically pushes the next announce a full retry interval out.
    pub(super) fn defer(&mut self, now: Instant) {
        self.next = Some(now + self.retry_interval);
    }

    /// Applies a tracker-supplied interval in seconds. Values that are not
    /// positive or exceed the retry interval fall back to the retry interval.
    pub(super) fn set_interval(&mut self, now: Instant, interval: i64) {
        let interval = u64::try_from(interval)
            .ok()
            .filter(|&secs| secs > 0 && secs <= self.retry_interval.as_secs())
            .map_or(self.retry_interval, Duration::from_secs);
        self.next = Some(now + interval);
    }

    pub(super) fn next(&self) -> Option<Instant> {
        self.next
    }
}
