//! Voltage Core - single-threaded BitTorrent download engine
//!
//! Discovers peers through HTTP and UDP trackers, speaks the peer wire
//! protocol over many non-blocking connections from one event loop, and
//! verifies and persists pieces through a memory-bounded write-back store.

pub mod config;
pub mod engine;
pub mod events;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

pub use config::VoltageConfig;
pub use engine::{DownloadCoordinator, DownloadStats};
pub use events::{DownloadEvent, EventSink, NullSink};
pub use storage::{PieceStore, StorageError};
pub use torrent::{TorrentDescriptor, TorrentError};

/// Errors that end a download run.
#[derive(Debug, thiserror::Error)]
pub enum VoltageError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoltageError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            VoltageError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TrackerConnectionFailed { url } => {
                    format!("Could not connect to tracker: {url}")
                }
                TorrentError::Io(e) => format!("Unable to read input: {e}"),
                _ => "Download error occurred".to_string(),
            },
            VoltageError::Storage(StorageError::InsufficientMemory {
                available,
                piece_size,
            }) => format!(
                "Not enough memory: {available} bytes available, pieces are {piece_size} bytes"
            ),
            VoltageError::Storage(_) => "Storage error occurred".to_string(),
            VoltageError::Configuration { reason } => format!("Configuration error: {reason}"),
            VoltageError::Io(e) => format!("File system error: {e}"),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            VoltageError::Configuration { .. }
                | VoltageError::Torrent(TorrentError::InvalidTorrentFile { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, VoltageError>;
