//! Frame format and bind handshake for the daemon socket.
//!
//! Every frame is a fixed 112-byte header followed by the payload:
//!
//! ```text
//! chan      [4]        logical channel tag
//! tag       [4]        message tag within the channel
//! length    u32 LE     payload length
//! send time u32 LE     unix seconds when this frame was written
//! pubkey    [32]       signer's Ed25519 public key
//! sig       [64]       Ed25519 signature over the payload bytes
//! payload   [length]
//! ```
//!
//! The signature covers the payload only. Routing metadata and the send time
//! live in the header and may be rewritten when a stored message is
//! re-framed for gossip ([`RawMessage::re_encode`]).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{WireError, WireResult};
use crate::keys::KeyPair;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 32 + 64;

/// Hard cap on payload length; anything larger is a protocol violation.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Size of an encoded [`BindMessage`].
pub const BIND_MESSAGE_SIZE: usize = 4 + 4 + 4 + 32;

const BIND_MAGIC: [u8; 4] = *b"BIND";

/// Channel carrying identity announcements.
pub const CHAN_IDENTITY: Tag = Tag::new("Iden");

/// Message tag for a signed identity payload.
pub const TAG_IDENTITY: Tag = Tag::new("Id");

/// A four-byte channel or message tag, space-padded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    /// Build a tag from up to four ASCII characters, padding with spaces.
    pub const fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut tag = [b' '; 4];
        let mut i = 0;
        while i < bytes.len() && i < 4 {
            tag[i] = bytes[i];
            i += 1;
        }
        Tag(tag)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0.iter() {
            if b != b' ' {
                write!(f, "{}", b as char)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({})", self)
    }
}

/// An encoded frame ready to be written to the socket.
///
/// Header and payload are kept separate so the payload bytes and signature
/// can be persisted without re-parsing.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// The fixed-size frame header
    pub header: Vec<u8>,
    /// The signed payload bytes
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Encode and sign a fresh frame.
    pub fn encode(chan: Tag, tag: Tag, key: &KeyPair, payload: Vec<u8>) -> Self {
        let sig = key.sign(&payload);
        Self::assemble(chan, tag, &key.public_bytes(), &sig, payload)
    }

    /// Re-frame an already-signed payload with a fresh send-time header.
    ///
    /// Used when gossiping stored identities and when re-using a cached
    /// self-announcement: the original signature stays valid because it
    /// covers the payload only.
    pub fn re_encode(
        chan: Tag,
        tag: Tag,
        pubkey: &[u8; 32],
        sig: &[u8],
        payload: Vec<u8>,
    ) -> WireResult<Self> {
        let sig: [u8; 64] = sig
            .try_into()
            .map_err(|_| WireError::SignatureLength(sig.len()))?;
        Ok(Self::assemble(chan, tag, pubkey, &sig, payload))
    }

    fn assemble(chan: Tag, tag: Tag, pubkey: &[u8; 32], sig: &[u8; 64], payload: Vec<u8>) -> Self {
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&chan.0);
        header.extend_from_slice(&tag.0);
        header.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        header.extend_from_slice(&unix_time_u32().to_le_bytes());
        header.extend_from_slice(pubkey);
        header.extend_from_slice(sig);
        Self { header, payload }
    }

    /// The signer's public key from the header.
    pub fn pubkey(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.header[16..48]);
        key
    }

    /// The detached signature from the header.
    pub fn signature(&self) -> &[u8] {
        &self.header[48..112]
    }

    /// Write the frame to a socket.
    pub async fn send<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> WireResult<()> {
        writer.write_all(&self.header).await?;
        writer.write_all(&self.payload).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Message {
    /// Logical channel the frame was addressed to
    pub chan: Tag,
    /// Message tag within the channel
    pub tag: Tag,
    /// Unix seconds when the sender framed the message
    pub send_time: u32,
    /// Signer's public key
    pub pubkey: [u8; 32],
    /// Signature over the payload
    pub sig: [u8; 64],
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Message {
    /// Check the payload signature against the header's public key.
    pub fn verify(&self) -> bool {
        crate::keys::verify(&self.pubkey, &self.payload, &self.sig)
    }
}

/// Read one complete frame from the socket.
///
/// Blocks until a full header and payload have arrived. An oversized length
/// field fails fast without attempting the read.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> WireResult<Message> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let chan = Tag([header[0], header[1], header[2], header[3]]);
    let tag = Tag([header[4], header[5], header[6], header[7]]);
    let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let send_time = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
    if len > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(len));
    }

    let mut pubkey = [0u8; 32];
    pubkey.copy_from_slice(&header[16..48]);
    let mut sig = [0u8; 64];
    sig.copy_from_slice(&header[48..112]);

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Message {
        chan,
        tag,
        send_time,
        pubkey,
        sig,
        payload,
    })
}

/// Channel-bind handshake message.
///
/// Sent once by each side when a connection is established: the client names
/// the channel it wants and its identity public key, and the daemon replies
/// with its own node public key in the same shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMessage {
    /// Protocol version, currently 1
    pub version: u32,
    /// The channel this connection will carry
    pub chan: Tag,
    /// Sender's public key (identity key client-side, node key daemon-side)
    pub pubkey: [u8; 32],
}

impl BindMessage {
    /// Encode to the fixed 44-byte handshake form.
    pub fn encode(&self) -> [u8; BIND_MESSAGE_SIZE] {
        let mut buf = [0u8; BIND_MESSAGE_SIZE];
        buf[0..4].copy_from_slice(&BIND_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.chan.0);
        buf[12..44].copy_from_slice(&self.pubkey);
        buf
    }

    /// Decode a handshake message, checking magic and length.
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        if bytes.len() < BIND_MESSAGE_SIZE {
            return Err(WireError::Truncated("bind message"));
        }
        if bytes[0..4] != BIND_MAGIC {
            return Err(WireError::BadMagic);
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let chan = Tag([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&bytes[12..44]);
        Ok(Self {
            version,
            chan,
            pubkey,
        })
    }
}

fn unix_time_u32() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let key = KeyPair::generate();
        let msg = RawMessage::encode(CHAN_IDENTITY, TAG_IDENTITY, &key, b"payload".to_vec());

        let mut wire = Vec::new();
        msg.send(&mut wire).await.unwrap();

        let decoded = read_message(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded.chan, CHAN_IDENTITY);
        assert_eq!(decoded.tag, TAG_IDENTITY);
        assert_eq!(decoded.pubkey, key.public_bytes());
        assert_eq!(decoded.payload, b"payload");
        assert!(decoded.verify());
    }

    #[tokio::test]
    async fn test_re_encode_preserves_signature() {
        let key = KeyPair::generate();
        let original = RawMessage::encode(CHAN_IDENTITY, TAG_IDENTITY, &key, b"stable".to_vec());

        let reframed = RawMessage::re_encode(
            CHAN_IDENTITY,
            TAG_IDENTITY,
            &original.pubkey(),
            original.signature(),
            original.payload.clone(),
        )
        .unwrap();

        let mut wire = Vec::new();
        reframed.send(&mut wire).await.unwrap();
        let decoded = read_message(&mut wire.as_slice()).await.unwrap();
        assert!(decoded.verify(), "signature must survive re-framing");
    }

    #[test]
    fn test_re_encode_rejects_short_signature() {
        let result = RawMessage::re_encode(
            CHAN_IDENTITY,
            TAG_IDENTITY,
            &[0u8; 32],
            &[0u8; 10],
            vec![],
        );
        assert!(matches!(result, Err(WireError::SignatureLength(10))));
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_length() {
        let key = KeyPair::generate();
        let mut msg = RawMessage::encode(CHAN_IDENTITY, TAG_IDENTITY, &key, vec![]);
        msg.header[8..12].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes());

        let mut wire = Vec::new();
        wire.extend_from_slice(&msg.header);
        let result = read_message(&mut wire.as_slice()).await;
        assert!(matches!(result, Err(WireError::PayloadTooLarge(_))));
    }

    #[test]
    fn test_bind_message_roundtrip() {
        let bind = BindMessage {
            version: 1,
            chan: CHAN_IDENTITY,
            pubkey: [42u8; 32],
        };
        let decoded = BindMessage::decode(&bind.encode()).unwrap();
        assert_eq!(decoded, bind);
    }

    #[test]
    fn test_bind_message_rejects_bad_magic() {
        let bind = BindMessage {
            version: 1,
            chan: CHAN_IDENTITY,
            pubkey: [0u8; 32],
        };
        let mut bytes = bind.encode();
        bytes[0] = b'X';
        assert!(matches!(
            BindMessage::decode(&bytes),
            Err(WireError::BadMagic)
        ));
    }

    #[test]
    fn test_tag_display_trims_padding() {
        assert_eq!(Tag::new("Id").to_string(), "Id");
        assert_eq!(Tag::new("Iden").to_string(), "Iden");
    }
}
