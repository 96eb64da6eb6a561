//! Download event loop: one coordinator multiplexing trackers, peers and the
//! piece store from a single thread.

pub mod coordinator;

pub use coordinator::DownloadCoordinator;

/// Snapshot of a running download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadStats {
    pub verified_pieces: u32,
    pub total_pieces: u32,
    /// Share of verified pieces, 0.0 to 100.0
    pub progress_percent: f64,
    /// Peers with an open transport
    pub connected_peers: usize,
    /// Every peer ever added and not cleanly disconnected
    pub known_peers: usize,
    /// Block payload bytes received
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes not yet covered by verified pieces
    pub remaining: u64,
}
