//! Wire codec for the idmesh gossip protocol.
//!
//! Everything a node needs to talk to its local peer-routing daemon lives
//! here: the fixed-header frame format, the bind handshake message, the
//! deterministic identity-payload codec, Ed25519 key handling, and daemon
//! endpoint addresses. The crate is deliberately transport-agnostic - the
//! only async surface is [`frame::read_message`], which works on any
//! `AsyncRead`.
//!
//! ## Byte stability
//!
//! Two properties the rest of the system leans on:
//!
//! - [`payload::IdentityPayload`] encoding is deterministic, and two payloads
//!   that differ only in their timestamp become byte-identical once the
//!   timestamp is normalized. The announce layer's signature-reuse check
//!   depends on this.
//! - A frame signature covers the payload only, never the header, so a
//!   stored signature can be re-framed with a fresh send-time header via
//!   [`frame::RawMessage::re_encode`].

pub mod endpoint;
pub mod error;
pub mod frame;
pub mod keys;
pub mod payload;

pub use endpoint::Endpoint;
pub use error::{WireError, WireResult};
pub use frame::{
    read_message, BindMessage, Message, RawMessage, Tag, BIND_MESSAGE_SIZE, CHAN_IDENTITY,
    HEADER_SIZE, MAX_PAYLOAD_SIZE, TAG_IDENTITY,
};
pub use keys::KeyPair;
pub use payload::IdentityPayload;
