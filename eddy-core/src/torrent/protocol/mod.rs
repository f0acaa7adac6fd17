//! BitTorrent peer wire protocol: handshake, message framing, bitfields and
//! the extension protocol used for magnet metadata exchange.

pub mod bitfield;
pub mod extension;
pub mod handshake;
pub mod messages;
pub mod types;

pub use bitfield::Bitfield;
pub use extension::{ExtensionHandshake, MetadataMessage};
pub use handshake::HandshakeCodec;
pub use messages::MessageCodec;
pub use types::{PeerHandshake, PeerId, PeerMessage};
