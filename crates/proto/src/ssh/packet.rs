//! SSH binary packet layout (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or AEAD tag
//! ```
//!
//! This module only deals with the plaintext layout. Encryption, MACs and
//! sequence numbers live in [`codec`](super::codec).
//!
//! # Constraints
//!
//! - `packet_length` does not include the MAC or the length field itself
//! - padding is 4..=255 random bytes
//! - the padded packet is a multiple of the cipher block size (at least 8).
//!   For AEAD ciphers the length field is authenticated but not encrypted and
//!   is left out of the alignment
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"SSH_MSG_IGNORE payload".to_vec()).unwrap();
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH_MSG_IGNORE payload");
//! ```

use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};
use rand::{Rng, RngCore};

/// Largest `packet_length` accepted or produced.
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Smallest alignment the protocol allows.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Extra random padding blocks added on top of the minimum, at most.
const MAX_EXTRA_PADDING_BLOCKS: usize = 3;

/// SSH binary packet before encryption.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet aligned to the default 8-byte block.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] if the payload does not fit in a packet.
    pub fn new(payload: Vec<u8>) -> KeelResult<Self> {
        Self::aligned(payload, MIN_BLOCK_SIZE, false)
    }

    /// Creates a packet padded for a cipher with the given block size.
    ///
    /// `length_excluded` is set for AEAD ciphers, whose length field sits
    /// outside the encrypted region. A random number of extra padding blocks
    /// is added so that packet sizes do not mirror payload sizes exactly.
    pub fn aligned(payload: Vec<u8>, block_size: usize, length_excluded: bool) -> KeelResult<Self> {
        let block_size = block_size.max(MIN_BLOCK_SIZE);
        let header_len = if length_excluded { 1 } else { 5 };
        let unpadded_len = header_len + payload.len();

        let mut padding_len = block_size - (unpadded_len % block_size);
        if padding_len < MIN_PADDING_LEN {
            padding_len += block_size;
        }

        let mut rng = rand::thread_rng();
        let extra_blocks = rng.gen_range(0..=MAX_EXTRA_PADDING_BLOCKS);
        for _ in 0..extra_blocks {
            if padding_len + block_size > MAX_PADDING_LEN {
                break;
            }
            padding_len += block_size;
        }

        let packet_length = 1 + payload.len() + padding_len;
        if packet_length > MAX_PACKET_LEN {
            return Err(KeelError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                packet_length, MAX_PACKET_LEN
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rng.fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes the plaintext packet (no MAC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = self.packet_length();
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses a complete plaintext packet, length field included.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] if the length field disagrees with the
    /// data or the padding is invalid.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        if data.len() < 5 {
            return Err(KeelError::Protocol(format!(
                "Packet too short: {} bytes",
                data.len()
            )));
        }

        let packet_length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        check_packet_length(packet_length)?;

        if data.len() != 4 + packet_length {
            return Err(KeelError::Protocol(format!(
                "Packet length mismatch: header says {}, got {}",
                packet_length,
                data.len() - 4
            )));
        }

        Self::from_body(&data[4..])
    }

    /// Parses the part after the length field: `padding_length || payload || padding`.
    pub fn from_body(body: &[u8]) -> KeelResult<Self> {
        let (&padding_len, rest) = body
            .split_first()
            .ok_or_else(|| KeelError::Protocol("Empty packet body".to_string()))?;
        let padding_len = padding_len as usize;

        if padding_len < MIN_PADDING_LEN {
            return Err(KeelError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_len, MIN_PADDING_LEN
            )));
        }
        if padding_len > rest.len() {
            return Err(KeelError::Protocol(format!(
                "Padding length {} exceeds packet body {}",
                padding_len,
                rest.len()
            )));
        }

        let payload_len = rest.len() - padding_len;
        Ok(Self {
            payload: rest[..payload_len].to_vec(),
            padding: rest[payload_len..].to_vec(),
        })
    }
}

/// Validates a `packet_length` field value before buffering that many bytes.
pub fn check_packet_length(packet_length: usize) -> KeelResult<()> {
    if packet_length < 1 + MIN_PADDING_LEN {
        return Err(KeelError::Protocol(format!(
            "Packet length {} below minimum",
            packet_length
        )));
    }
    if packet_length > MAX_PACKET_LEN {
        return Err(KeelError::Protocol(format!(
            "Packet length {} exceeds maximum {}",
            packet_length, MAX_PACKET_LEN
        )));
    }
    Ok(())
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("payload_len", &self.payload.len())
            .field("padding_len", &self.padding.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_alignment() {
        for len in 0..64 {
            let packet = Packet::new(vec![0xAB; len]).unwrap();
            let bytes = packet.to_bytes();
            assert_eq!(bytes.len() % 8, 0, "payload {len}");
            assert!(packet.padding().len() >= MIN_PADDING_LEN);
        }
    }

    #[test]
    fn test_aead_alignment_excludes_length() {
        for len in 0..64 {
            let packet = Packet::aligned(vec![1; len], 16, true).unwrap();
            assert_eq!(packet.packet_length() % 16, 0, "payload {len}");
            assert!(packet.padding().len() >= MIN_PADDING_LEN);
        }
    }

    #[test]
    fn test_padding_is_randomized() {
        let a = Packet::new(vec![0; 32]).unwrap();
        let b = Packet::new(vec![0; 32]).unwrap();
        // 4+ random bytes colliding is vanishingly unlikely
        assert_ne!(a.padding(), b.padding());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let result = Packet::new(vec![0; MAX_PACKET_LEN]);
        assert!(matches!(result, Err(KeelError::Protocol(_))));
    }

    #[test]
    fn test_parse_rejects_short_padding() {
        let mut data = vec![0, 0, 0, 12, 3];
        data.extend_from_slice(&[0u8; 11]);
        let err = Packet::from_bytes(&data).unwrap_err();
        assert!(err.to_string().contains("Padding too short"));
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let packet = Packet::new(b"hello".to_vec()).unwrap();
        let mut bytes = packet.to_bytes();
        bytes.push(0);
        assert!(Packet::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_padding_overrun() {
        let data = [0, 0, 0, 8, 200, 1, 2, 3, 4, 5, 6, 7];
        assert!(Packet::from_bytes(&data).is_err());
    }

    #[test]
    fn test_check_packet_length_bounds() {
        assert!(check_packet_length(4).is_err());
        assert!(check_packet_length(12).is_ok());
        assert!(check_packet_length(MAX_PACKET_LEN + 1).is_err());
    }
}
