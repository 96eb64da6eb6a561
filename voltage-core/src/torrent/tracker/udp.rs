//! UDP tracker protocol: CONNECT handshake followed by ANNOUNCE, all fields
//! big-endian.

use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};
use url::Url;

use super::types::{
    AnnounceContext, AnnounceSchedule, DatagramSender, PeerAddress, TrackerKey,
    parse_compact_peers,
};
use crate::config::NetworkConfig;

/// Protocol identifier sent with every CONNECT.
pub const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_HEADER_LEN: usize = 20;

/// Announce session with one UDP tracker.
///
/// Outbound packets go through a [`DatagramSender`]; responses arrive via
/// [`receive`](Self::receive) after the caller routed them by source address.
#[derive(Debug)]
pub struct UdpTracker {
    url: String,
    endpoint: Option<SocketAddrV4>,
    transaction_id: u32,
    connection: Option<(u64, Instant)>,
    connection_lifetime: Duration,
    schedule: AnnounceSchedule,
    error: Option<String>,
}

impl UdpTracker {
    /// Resolves the tracker endpoint. A URL that cannot be parsed or resolved
    /// to IPv4 leaves the session permanently errored.
    pub fn new(url: String, config: &NetworkConfig) -> Self {
        let (endpoint, error) = match resolve_endpoint(&url) {
            Ok(endpoint) => (Some(endpoint), None),
            Err(reason) => {
                tracing::warn!("UDP tracker {} disabled: {}", url, reason);
                (None, Some(reason))
            }
        };

        Self {
            url,
            endpoint,
            transaction_id: rand::random::<u32>(),
            connection: None,
            connection_lifetime: config.udp_connection_lifetime,
            schedule: AnnounceSchedule::new(config.tracker_retry_interval),
            error,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn endpoint(&self) -> Option<SocketAddrV4> {
        self.endpoint
    }

    /// Resolved endpoint, or the URL for a session that never resolved.
    pub fn key(&self) -> TrackerKey {
        match self.endpoint {
            Some(endpoint) => TrackerKey::Endpoint(endpoint),
            None => TrackerKey::Url(self.url.clone()),
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn next_announce(&self) -> Option<Instant> {
        self.schedule.next()
    }

    /// Sends an ANNOUNCE if a live connection id exists, a CONNECT otherwise.
    pub fn update(
        &mut self,
        now: Instant,
        ctx: &AnnounceContext,
        sender: &mut dyn DatagramSender,
    ) {
        if self.error.is_some() || !self.schedule.is_due(now) {
            return;
        }
        self.schedule.defer(now);

        match self.live_connection(now) {
            Some(connection_id) => self.send_announce(connection_id, ctx, sender),
            None => self.send_connect(sender),
        }
    }

    /// Handles one datagram from this tracker's endpoint and returns the
    /// peers it announced.
    ///
    /// Short or unrecognised datagrams are dropped.
    pub fn receive(
        &mut self,
        data: &[u8],
        now: Instant,
        ctx: &AnnounceContext,
        sender: &mut dyn DatagramSender,
    ) -> Vec<PeerAddress> {
        if self.error.is_some() || data.len() < 8 {
            return Vec::new();
        }

        let mut header = data;
        let action = header.get_u32();
        tracing::trace!("UDP tracker {} sent action {}", self.url, action);

        match action {
            ACTION_CONNECT => {
                self.receive_connect(data, now, ctx, sender);
                Vec::new()
            }
            ACTION_ANNOUNCE => self.receive_announce(data, now),
            ACTION_ERROR => {
                if header.get_u32() != self.transaction_id {
                    tracing::debug!("Transaction ID doesn't match for {}", self.url);
                    return Vec::new();
                }
                let message = String::from_utf8_lossy(&data[8..]).into_owned();
                tracing::warn!("UDP tracker {} returned error: {}", self.url, message);
                self.error = Some(message);
                Vec::new()
            }
            other => {
                tracing::debug!("Dropping UDP tracker action {} from {}", other, self.url);
                Vec::new()
            }
        }
    }

    fn live_connection(&self, now: Instant) -> Option<u64> {
        self.connection
            .filter(|(_, established)| now.duration_since(*established) < self.connection_lifetime)
            .map(|(connection_id, _)| connection_id)
    }

    fn send_connect(&mut self, sender: &mut dyn DatagramSender) {
        let mut packet = Vec::with_capacity(16);
        packet.put_u64(PROTOCOL_MAGIC);
        packet.put_u32(ACTION_CONNECT);
        packet.put_u32(self.transaction_id);

        tracing::debug!("Sending connect to {}", self.url);
        self.send(&packet, sender);
    }

    fn send_announce(
        &mut self,
        connection_id: u64,
        ctx: &AnnounceContext,
        sender: &mut dyn DatagramSender,
    ) {
        let mut packet = Vec::with_capacity(98);
        packet.put_u64(connection_id);
        packet.put_u32(ACTION_ANNOUNCE);
        packet.put_u32(self.transaction_id);
        packet.put_slice(ctx.info_hash.as_bytes());
        packet.put_slice(ctx.peer_id.as_bytes());
        packet.put_u64(ctx.downloaded);
        packet.put_u64(ctx.left);
        packet.put_u64(ctx.uploaded);
        packet.put_u32(0); // event: none
        packet.put_u32(0); // ip: sender address
        packet.put_u32(rand::random::<u32>());
        packet.put_i32(-1); // numwant: tracker default
        packet.put_u16(0);

        tracing::debug!("Sending announce to {}", self.url);
        self.send(&packet, sender);
    }

    fn send(&self, packet: &[u8], sender: &mut dyn DatagramSender) {
        let Some(endpoint) = self.endpoint else {
            return;
        };
        if let Err(e) = sender.send_datagram(packet, endpoint) {
            tracing::warn!("UDP send to {} failed: {}", self.url, e);
        }
    }

    fn receive_connect(
        &mut self,
        data: &[u8],
        now: Instant,
        ctx: &AnnounceContext,
        sender: &mut dyn DatagramSender,
    ) {
        if data.len() < CONNECT_RESPONSE_LEN {
            tracing::debug!("Short connect response from {}", self.url);
            return;
        }

        let mut body = &data[4..];
        let transaction_id = body.get_u32();
        let connection_id = body.get_u64();

        if transaction_id != self.transaction_id {
            tracing::debug!("Transaction ID doesn't match for {}", self.url);
            return;
        }

        self.connection = Some((connection_id, now));
        self.send_announce(connection_id, ctx, sender);
    }

    fn receive_announce(&mut self, data: &[u8], now: Instant) -> Vec<PeerAddress> {
        if data.len() < ANNOUNCE_HEADER_LEN {
            tracing::debug!("Short announce response from {}", self.url);
            return Vec::new();
        }

        let mut header = &data[4..ANNOUNCE_HEADER_LEN];
        let transaction_id = header.get_u32();
        let interval = header.get_i32();
        let leechers = header.get_u32();
        let seeders = header.get_u32();

        if transaction_id != self.transaction_id {
            tracing::debug!("Transaction ID doesn't match for {}", self.url);
            return Vec::new();
        }

        self.schedule.set_interval(now, i64::from(interval));
        let peers = parse_compact_peers(&data[ANNOUNCE_HEADER_LEN..]);
        tracing::debug!(
            "Tracker {} returned {} peers ({} seeders, {} leechers), interval {}s",
            self.url,
            peers.len(),
            seeders,
            leechers,
            interval
        );

        peers.into_iter().map(PeerAddress::from).collect()
    }
}

fn resolve_endpoint(url: &str) -> Result<SocketAddrV4, String> {
    let parsed = Url::parse(url).map_err(|e| format!("Cannot parse URL: {e}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| "Cannot parse URL".to_string())?;
    let port = parsed
        .port()
        .filter(|&port| port > 0)
        .ok_or_else(|| "Unable to parse UDP port".to_string())?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("Unable to resolve IP for '{url}': {e}"))?
        .find_map(|address| match address {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| format!("Unable to resolve IP for '{url}'"))
}
