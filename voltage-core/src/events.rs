//! Progress and lifecycle notifications emitted by the download core.
//!
//! The core never renders anything itself; it hands typed events to an
//! [`EventSink`] supplied by the caller.

use std::net::SocketAddrV4;
use std::sync::mpsc::Sender;

/// Milestones reported while preparing and running a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// File allocation begins
    AllocateStart,
    /// One more file has been allocated
    Allocate {
        allocated_bytes: u64,
        total_bytes: u64,
    },
    /// Every file is allocated
    AllocateEnd,
    /// Verification of on-disk data begins
    CheckStart,
    /// One piece has been hashed; `checked` counts from 1
    Check { checked: u32, total: u32 },
    /// Verification finished
    CheckEnd,
    /// A peer connection went away
    PeerDisconnected {
        address: SocketAddrV4,
        /// Kill reason, absent for a clean disconnect
        reason: Option<String>,
    },
}

/// Receiver of [`DownloadEvent`]s.
pub trait EventSink {
    fn on_event(&mut self, event: &DownloadEvent);
}

impl<F> EventSink for F
where
    F: FnMut(&DownloadEvent),
{
    fn on_event(&mut self, event: &DownloadEvent) {
        self(event)
    }
}

impl EventSink for Sender<DownloadEvent> {
    fn on_event(&mut self, event: &DownloadEvent) {
        // A hung-up receiver only means nobody is listening anymore.
        let _ = self.send(event.clone());
    }
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&mut self, _event: &DownloadEvent) {}
}
