//! Tracker sessions: peer discovery over HTTP and UDP announce protocols.
//!
//! Each announce URL becomes one [`TrackerSession`]. Sessions gate
//! themselves on the tracker's interval and go permanently quiet once
//! errored; a failing tracker never affects the rest of the download.

pub mod http;
pub mod types;
pub mod udp;

use std::time::Instant;

pub use http::{AnnounceResponse, HttpTracker};
pub use types::{
    AnnounceContext, COMPACT_PEER_SIZE, DatagramSender, PeerAddress, TrackerKey,
    parse_compact_peers,
};
pub use udp::UdpTracker;

use crate::config::NetworkConfig;

/// Announce session with one tracker, HTTP or UDP by URL scheme.
#[derive(Debug)]
pub enum TrackerSession {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl TrackerSession {
    /// Creates the session matching the URL scheme, or `None` for schemes
    /// other than `http`, `https` and `udp`.
    pub fn from_url(url: &str, config: &NetworkConfig) -> Option<Self> {
        let scheme = url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase());
        match scheme.as_deref() {
            Some("http" | "https") => Some(Self::Http(HttpTracker::new(url.to_string(), config))),
            Some("udp") => Some(Self::Udp(UdpTracker::new(url.to_string(), config))),
            _ => {
                tracing::warn!("Ignoring tracker with unsupported scheme: {}", url);
                None
            }
        }
    }

    pub fn key(&self) -> TrackerKey {
        match self {
            Self::Http(tracker) => TrackerKey::Url(tracker.url().to_string()),
            Self::Udp(tracker) => tracker.key(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Http(tracker) => tracker.url(),
            Self::Udp(tracker) => tracker.url(),
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Http(tracker) => tracker.error(),
            Self::Udp(tracker) => tracker.error(),
        }
    }

    pub fn has_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn next_announce(&self) -> Option<Instant> {
        match self {
            Self::Http(tracker) => tracker.next_announce(),
            Self::Udp(tracker) => tracker.next_announce(),
        }
    }

    /// Announces if the session is due.
    ///
    /// HTTP sessions return discovered peers directly; UDP sessions only send
    /// and report peers later through [`receive_datagram`](Self::receive_datagram).
    pub fn update(
        &mut self,
        now: Instant,
        ctx: &AnnounceContext,
        sender: &mut dyn DatagramSender,
    ) -> Vec<PeerAddress> {
        match self {
            Self::Http(tracker) => tracker.update(now, ctx),
            Self::Udp(tracker) => {
                tracker.update(now, ctx, sender);
                Vec::new()
            }
        }
    }

    /// Feeds a datagram routed to this session. HTTP sessions drop it.
    pub fn receive_datagram(
        &mut self,
        data: &[u8],
        now: Instant,
        ctx: &AnnounceContext,
        sender: &mut dyn DatagramSender,
    ) -> Vec<PeerAddress> {
        match self {
            Self::Http(tracker) => {
                tracing::debug!("Dropping datagram routed to HTTP tracker {}", tracker.url());
                Vec::new()
            }
            Self::Udp(tracker) => tracker.receive(data, now, ctx, sender),
        }
    }
}
