//! HTTP tracker announces over a blocking `reqwest` client.

use std::time::Instant;

use super::types::{AnnounceContext, AnnounceSchedule, PeerAddress, parse_compact_peers};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// Decoded announce response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds until the next announce; 0 when absent
    pub interval: i64,
    pub peers: Vec<PeerAddress>,
}

/// Announce session with one HTTP(S) tracker.
///
/// The announce is a synchronous request on the calling thread and stalls it
/// for up to the configured tracker timeout.
#[derive(Debug)]
pub struct HttpTracker {
    url: String,
    client: Option<reqwest::blocking::Client>,
    schedule: AnnounceSchedule,
    error: Option<String>,
}

impl HttpTracker {
    pub fn new(url: String, config: &NetworkConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build();

        let (client, error) = match client {
            Ok(client) => (Some(client), None),
            Err(e) => (None, Some(format!("Unable to build HTTP client: {e}"))),
        };

        Self {
            url,
            client,
            schedule: AnnounceSchedule::new(config.tracker_retry_interval),
            error,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn next_announce(&self) -> Option<Instant> {
        self.schedule.next()
    }

    /// Announces if due and returns the peers the tracker reported.
    ///
    /// Any failure puts the session into its error state; it never
    /// announces again.
    pub fn update(&mut self, now: Instant, ctx: &AnnounceContext) -> Vec<PeerAddress> {
        if self.error.is_some() || !self.schedule.is_due(now) {
            return Vec::new();
        }
        self.schedule.defer(now);

        match self.announce(ctx) {
            Ok(response) => {
                tracing::debug!(
                    "Tracker {} returned {} peers, interval {}s",
                    self.url,
                    response.peers.len(),
                    response.interval
                );
                self.schedule.set_interval(now, response.interval);
                response.peers
            }
            Err(e) => {
                tracing::warn!("Tracker {} failed: {}", self.url, e);
                self.error = Some(e.to_string());
                Vec::new()
            }
        }
    }

    fn announce(&self, ctx: &AnnounceContext) -> Result<AnnounceResponse, TorrentError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TorrentError::TrackerConnectionFailed {
                url: self.url.clone(),
            })?;

        let url = self.build_announce_url(ctx);
        tracing::debug!("Announcing to tracker: {}", self.url);

        let response = client.get(&url).send().map_err(|e| {
            tracing::debug!("HTTP request to {} failed: {}", self.url, e);
            TorrentError::TrackerConnectionFailed {
                url: self.url.clone(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::TrackerFailure {
                url: self.url.clone(),
                reason: format!("HTTP status {status}"),
            });
        }

        let body = response.bytes()?;
        if body.is_empty() {
            return Err(TorrentError::TrackerFailure {
                url: self.url.clone(),
                reason: "No HTTP response".to_string(),
            });
        }

        Self::parse_announce_response(&body).map_err(|e| match e {
            TorrentError::ProtocolError { message } => TorrentError::TrackerFailure {
                url: self.url.clone(),
                reason: message,
            },
            other => other,
        })
    }

    /// Builds the announce URL. Binary fields are percent-encoded byte-wise.
    pub(crate) fn build_announce_url(&self, ctx: &AnnounceContext) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}info_hash={}&peer_id={}&downloaded={}&uploaded={}&left={}&port=0&compact=1",
            self.url,
            separator,
            urlencoding::encode_binary(ctx.info_hash.as_bytes()),
            urlencoding::encode_binary(ctx.peer_id.as_bytes()),
            ctx.downloaded,
            ctx.uploaded,
            ctx.left
        )
    }

    /// Decodes a bencoded announce response.
    ///
    /// `peers` may be a compact byte string or a list of `{ip, port}`
    /// dictionaries.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Undecodable body or `failure reason` present
    pub fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse, TorrentError> {
        let parsed = bencode_rs::Value::parse(bytes).map_err(|e| TorrentError::ProtocolError {
            message: format!("Bencoding error: {e:?}"),
        })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::ProtocolError {
                message: "Invalid tracker response format".to_string(),
            });
        };

        if let Some(bencode_rs::Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
            return Err(TorrentError::ProtocolError {
                message: String::from_utf8_lossy(reason).into_owned(),
            });
        }

        let interval = match dict.get(b"interval".as_slice()) {
            Some(bencode_rs::Value::Integer(value)) => *value,
            _ => 0,
        };

        let peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(compact)) => parse_compact_peers(compact)
                .into_iter()
                .map(PeerAddress::from)
                .collect(),
            Some(bencode_rs::Value::List(entries)) => {
                entries.iter().filter_map(Self::dictionary_peer).collect()
            }
            _ => Vec::new(),
        };

        Ok(AnnounceResponse { interval, peers })
    }

    fn dictionary_peer(entry: &bencode_rs::Value<'_>) -> Option<PeerAddress> {
        let bencode_rs::Value::Dictionary(peer) = entry else {
            return None;
        };

        let ip = match peer.get(b"ip".as_slice())? {
            bencode_rs::Value::Bytes(ip) => String::from_utf8_lossy(ip).into_owned(),
            bencode_rs::Value::Integer(ip) => ip.to_string(),
            _ => return None,
        };
        let port = match peer.get(b"port".as_slice())? {
            bencode_rs::Value::Integer(port) => *port,
            _ => return None,
        };

        Some(PeerAddress { ip, port })
    }
}
