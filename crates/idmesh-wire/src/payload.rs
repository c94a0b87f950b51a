//! Deterministic codec for the signable identity payload.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! time    u64
//! lat     i16        0.1-degree quantized WGS84 latitude
//! long    i16        0.1-degree quantized WGS84 longitude
//! name    u8 len + bytes
//! bio     u8 len + bytes
//! country u8 len + bytes
//! city    u8 len + bytes
//! nodes   u8 count + count * 32 bytes
//! icon    u16 len + bytes
//! ```
//!
//! The same fields always produce the same bytes, and the timestamp sits in
//! a fixed leading position, so "equal modulo time" is a byte comparison
//! after rewriting the first eight bytes.

use crate::error::{WireError, WireResult};

/// The signable unit: profile fields plus claimed node keys and a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityPayload {
    /// Unix seconds when this payload was signed
    pub time: u64,
    /// Quantized latitude, tenths of a degree
    pub lat: i16,
    /// Quantized longitude, tenths of a degree
    pub long: i16,
    /// Display name
    pub name: String,
    /// Short biography
    pub bio: String,
    /// ISO 3166-1 alpha-2 country code, empty or two characters
    pub country: String,
    /// City name
    pub city: String,
    /// Node public keys this identity claims
    pub nodes: Vec<[u8; 32]>,
    /// Avatar bytes, empty or a fixed-size compressed icon
    pub icon: Vec<u8>,
}

impl IdentityPayload {
    /// Smallest possible encoding: all strings empty, no nodes, no icon.
    pub const MIN_SIZE: usize = 8 + 2 + 2 + 4 + 1 + 2;

    /// Encode to the deterministic wire form.
    ///
    /// Callers are expected to pass validated fields; string lengths above
    /// 255 bytes and node lists above 255 entries are not representable.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.name.len() <= u8::MAX as usize);
        debug_assert!(self.bio.len() <= u8::MAX as usize);
        debug_assert!(self.nodes.len() <= u8::MAX as usize);
        debug_assert!(self.icon.len() <= u16::MAX as usize);

        let mut buf = Vec::with_capacity(
            Self::MIN_SIZE
                + self.name.len()
                + self.bio.len()
                + self.country.len()
                + self.city.len()
                + self.nodes.len() * 32
                + self.icon.len(),
        );
        buf.extend_from_slice(&self.time.to_le_bytes());
        buf.extend_from_slice(&self.lat.to_le_bytes());
        buf.extend_from_slice(&self.long.to_le_bytes());
        put_str(&mut buf, &self.name);
        put_str(&mut buf, &self.bio);
        put_str(&mut buf, &self.country);
        put_str(&mut buf, &self.city);
        buf.push(self.nodes.len() as u8);
        for node in &self.nodes {
            buf.extend_from_slice(node);
        }
        buf.extend_from_slice(&(self.icon.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.icon);
        buf
    }

    /// Decode from wire bytes.
    ///
    /// Untrusted input: every length is checked before it is read.
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        if bytes.len() < Self::MIN_SIZE {
            return Err(WireError::Truncated("identity payload"));
        }
        let mut r = Reader { bytes, pos: 0 };

        let time = u64::from_le_bytes(r.take(8, "time")?.try_into().expect("fixed slice"));
        let lat = i16::from_le_bytes(r.take(2, "lat")?.try_into().expect("fixed slice"));
        let long = i16::from_le_bytes(r.take(2, "long")?.try_into().expect("fixed slice"));
        let name = r.take_str("name")?;
        let bio = r.take_str("bio")?;
        let country = r.take_str("country")?;
        let city = r.take_str("city")?;

        let count = r.take(1, "node count")?[0] as usize;
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let key: [u8; 32] = r
                .take(32, "node key")?
                .try_into()
                .expect("fixed slice");
            nodes.push(key);
        }

        let icon_len =
            u16::from_le_bytes(r.take(2, "icon length")?.try_into().expect("fixed slice")) as usize;
        let icon = r.take(icon_len, "icon")?.to_vec();
        if r.pos != bytes.len() {
            return Err(WireError::Invalid("trailing bytes"));
        }

        Ok(Self {
            time,
            lat,
            long,
            name,
            bio,
            country,
            city,
            nodes,
            icon,
        })
    }

    /// Whether this identity claims the given node public key.
    pub fn claims_node(&self, pubkey: &[u8; 32]) -> bool {
        self.nodes.iter().any(|n| n == pubkey)
    }

    /// A copy of this payload with a different timestamp.
    ///
    /// Normalizing the timestamp lets callers byte-compare payloads for
    /// semantic equality.
    pub fn with_time(&self, time: u64) -> Self {
        Self {
            time,
            ..self.clone()
        }
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> WireResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(WireError::Truncated(what));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_str(&mut self, what: &'static str) -> WireResult<String> {
        let len = self.take(1, what)?[0] as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Invalid(what))
    }
}
