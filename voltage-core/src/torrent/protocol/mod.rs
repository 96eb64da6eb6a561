//! BitTorrent wire protocol types and codecs.
//!
//! Peer-to-peer protocol pieces following BEP 3: the 68-byte handshake,
//! length-prefixed messages and the incremental framing that reassembles
//! them from partial non-blocking reads.

pub mod framing;
pub mod handshake;
pub mod messages;
pub mod types;

pub use framing::{FrameAssembler, Inbound};
pub use handshake::{HANDSHAKE_LEN, HandshakeCodec, HandshakeRejection};
pub use messages::MessageCodec;
pub use types::{PeerHandshake, PeerId, PeerMessage, PeerState};
