//! Streaming frame codec.
//!
//! [`SealingKeys`] turns payloads into wire frames and [`OpeningKeys`] turns
//! buffered wire bytes back into payloads. Each direction owns its cipher,
//! MAC, compression state and sequence number. Sequence numbers start at zero
//! and keep counting across rekeys; installing new keys only swaps the
//! algorithms.
//!
//! ```rust
//! use bytes::BytesMut;
//! use keel_proto::ssh::codec::{OpeningKeys, SealingKeys};
//!
//! let mut sealing = SealingKeys::plaintext();
//! let mut opening = OpeningKeys::plaintext();
//!
//! let frame = sealing.encode_frame(&[2, 0, 0, 0, 0]).unwrap();
//! let mut buf = BytesMut::from(&frame[..3]);
//! assert!(opening.decode_frame(&mut buf).unwrap().is_none());
//!
//! buf.extend_from_slice(&frame[3..]);
//! assert_eq!(opening.decode_frame(&mut buf).unwrap().unwrap(), vec![2, 0, 0, 0, 0]);
//! ```

use super::crypto::{
    chacha_opening_key, chacha_sealing_key, AesCtr, AesGcm, CipherAlgorithm, MacAlgorithm, MacKey,
    TAG_LEN,
};
use super::packet::{check_packet_length, Packet, MAX_PACKET_LEN, MIN_BLOCK_SIZE};
use bytes::{Buf, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use keel_platform::{KeelError, KeelResult};
use ring::aead::chacha20_poly1305_openssh;
use zeroize::Zeroizing;

/// Compression algorithm for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// zlib (RFC 1950), active right after NEWKEYS
    Zlib,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
        }
    }

    /// Parses compression algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            _ => None,
        }
    }
}

/// Algorithms and derived key material for one direction.
///
/// Produced by key exchange and handed to [`SealingKeys::install`] or
/// [`OpeningKeys::install`].
#[derive(Clone)]
pub struct DirectionKeys {
    /// Cipher
    pub cipher: CipherAlgorithm,
    /// MAC, `None` for AEAD ciphers
    pub mac: Option<MacAlgorithm>,
    /// Compression
    pub compression: CompressionAlgorithm,
    /// Initial IV
    pub iv: Zeroizing<Vec<u8>>,
    /// Encryption key
    pub key: Zeroizing<Vec<u8>>,
    /// Integrity key
    pub mac_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher.name())
            .field("mac", &self.mac.map(|m| m.name()))
            .field("compression", &self.compression.name())
            .field("keys", &"<redacted>")
            .finish()
    }
}

enum SealingCipher {
    Plain,
    ChaCha(chacha20_poly1305_openssh::SealingKey),
    Gcm(AesGcm),
    Ctr(AesCtr),
}

enum OpeningCipher {
    Plain,
    ChaCha(chacha20_poly1305_openssh::OpeningKey),
    Gcm(AesGcm),
    Ctr(AesCtr),
}

/// Outbound half of the codec.
pub struct SealingKeys {
    algorithm: CipherAlgorithm,
    cipher: SealingCipher,
    mac: Option<MacKey>,
    compressor: Option<Compress>,
    sequence: u32,
}

impl SealingKeys {
    /// Keys in force before the first NEWKEYS: no cipher, no MAC.
    pub fn plaintext() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            cipher: SealingCipher::Plain,
            mac: None,
            compressor: None,
            sequence: 0,
        }
    }

    /// Switches to freshly derived keys. The sequence number carries on.
    pub fn install(&mut self, keys: &DirectionKeys) -> KeelResult<()> {
        self.cipher = match keys.cipher {
            CipherAlgorithm::None => SealingCipher::Plain,
            CipherAlgorithm::ChaCha20Poly1305 => SealingCipher::ChaCha(chacha_sealing_key(&keys.key)?),
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                SealingCipher::Gcm(AesGcm::new(keys.cipher, &keys.key, &keys.iv)?)
            }
            _ => SealingCipher::Ctr(AesCtr::new(keys.cipher, &keys.key, &keys.iv)?),
        };
        self.algorithm = keys.cipher;
        self.mac = integrity_key(keys)?;
        self.compressor = match keys.compression {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Zlib => Some(Compress::new(Compression::default(), true)),
        };
        Ok(())
    }

    /// Sequence number of the next frame.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Cipher currently in force.
    pub fn cipher(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Builds one complete wire frame from a payload.
    pub fn encode_frame(&mut self, payload: &[u8]) -> KeelResult<Vec<u8>> {
        let payload = match self.compressor.as_mut() {
            Some(z) => compress(z, payload)?,
            None => payload.to_vec(),
        };

        let packet = Packet::aligned(payload, self.algorithm.block_size(), self.algorithm.is_aead())?;
        let mut frame = packet.to_bytes();
        let sequence = self.sequence;

        match &mut self.cipher {
            SealingCipher::Plain => {
                if let Some(mac) = &self.mac {
                    let tag = mac.compute(sequence, &frame)?;
                    frame.extend_from_slice(&tag);
                }
            }
            SealingCipher::Ctr(ctr) => {
                let tag = match &self.mac {
                    Some(mac) => mac.compute(sequence, &frame)?,
                    None => Vec::new(),
                };
                ctr.apply_keystream(&mut frame);
                frame.extend_from_slice(&tag);
            }
            SealingCipher::Gcm(gcm) => {
                let aad = length_field(&frame);
                let tag = gcm.seal(aad, &mut frame[4..])?;
                frame.extend_from_slice(&tag);
            }
            SealingCipher::ChaCha(key) => {
                let mut tag = [0u8; TAG_LEN];
                key.seal_in_place(sequence, &mut frame, &mut tag);
                frame.extend_from_slice(&tag);
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}

impl std::fmt::Debug for SealingKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingKeys")
            .field("cipher", &self.algorithm.name())
            .field("mac", &self.mac.as_ref().map(|m| m.algorithm().name()))
            .field("compressed", &self.compressor.is_some())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Inbound half of the codec.
pub struct OpeningKeys {
    algorithm: CipherAlgorithm,
    cipher: OpeningCipher,
    mac: Option<MacKey>,
    decompressor: Option<Decompress>,
    sequence: u32,
    /// First decrypted CTR block, kept between calls while the rest arrives.
    first_block: Option<Zeroizing<Vec<u8>>>,
}

impl OpeningKeys {
    /// Keys in force before the first NEWKEYS: no cipher, no MAC.
    pub fn plaintext() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            cipher: OpeningCipher::Plain,
            mac: None,
            decompressor: None,
            sequence: 0,
            first_block: None,
        }
    }

    /// Switches to freshly derived keys. The sequence number carries on.
    pub fn install(&mut self, keys: &DirectionKeys) -> KeelResult<()> {
        self.cipher = match keys.cipher {
            CipherAlgorithm::None => OpeningCipher::Plain,
            CipherAlgorithm::ChaCha20Poly1305 => OpeningCipher::ChaCha(chacha_opening_key(&keys.key)?),
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                OpeningCipher::Gcm(AesGcm::new(keys.cipher, &keys.key, &keys.iv)?)
            }
            _ => OpeningCipher::Ctr(AesCtr::new(keys.cipher, &keys.key, &keys.iv)?),
        };
        self.algorithm = keys.cipher;
        self.mac = integrity_key(keys)?;
        self.decompressor = match keys.compression {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Zlib => Some(Decompress::new(true)),
        };
        self.first_block = None;
        Ok(())
    }

    /// Sequence number of the next frame.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Cipher currently in force.
    pub fn cipher(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete. Bytes are only
    /// consumed once they can be processed, so the call may be retried after
    /// more data is appended.
    ///
    /// # Errors
    ///
    /// [`KeelError::Protocol`] for a bad length, bad padding, MAC or tag
    /// failure, or undecompressible payload.
    pub fn decode_frame(&mut self, buf: &mut BytesMut) -> KeelResult<Option<Vec<u8>>> {
        let sequence = self.sequence;
        let mac_len = self.mac.as_ref().map_or(0, |m| m.algorithm().mac_size());

        let body: Zeroizing<Vec<u8>> = match &mut self.cipher {
            OpeningCipher::Plain => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let packet_length = read_length(&buf[..4])?;
                check_alignment(4 + packet_length, MIN_BLOCK_SIZE)?;
                if buf.len() < 4 + packet_length + mac_len {
                    return Ok(None);
                }

                let frame = buf.split_to(4 + packet_length);
                if let Some(mac) = &self.mac {
                    mac.verify(sequence, &frame, &buf[..mac_len])?;
                    buf.advance(mac_len);
                }
                Zeroizing::new(frame[4..].to_vec())
            }
            OpeningCipher::Ctr(ctr) => {
                let block_size = self.algorithm.block_size();
                if self.first_block.is_none() {
                    if buf.len() < block_size {
                        return Ok(None);
                    }
                    let mut first = Zeroizing::new(buf.split_to(block_size).to_vec());
                    ctr.apply_keystream(&mut first);
                    let packet_length = read_length(&first[..4])?;
                    check_alignment(4 + packet_length, block_size)?;
                    self.first_block = Some(first);
                }

                let packet_length = match &self.first_block {
                    Some(first) => read_length(&first[..4])?,
                    None => return Ok(None),
                };
                let remaining = 4 + packet_length - block_size;
                if buf.len() < remaining + mac_len {
                    return Ok(None);
                }

                let mut plain = match self.first_block.take() {
                    Some(first) => first,
                    None => return Ok(None),
                };
                let tail_start = plain.len();
                plain.extend_from_slice(&buf[..remaining]);
                buf.advance(remaining);
                ctr.apply_keystream(&mut plain[tail_start..]);

                if let Some(mac) = &self.mac {
                    mac.verify(sequence, &plain, &buf[..mac_len])?;
                    buf.advance(mac_len);
                }
                Zeroizing::new(plain[4..].to_vec())
            }
            OpeningCipher::Gcm(gcm) => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let packet_length = read_length(&buf[..4])?;
                check_alignment(packet_length, self.algorithm.block_size())?;
                if buf.len() < 4 + packet_length + TAG_LEN {
                    return Ok(None);
                }

                let mut frame = buf.split_to(4 + packet_length + TAG_LEN);
                let aad = length_field(&frame);
                let plain = gcm.open(aad, &mut frame[4..])?;
                Zeroizing::new(plain.to_vec())
            }
            OpeningCipher::ChaCha(key) => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let length = key.decrypt_packet_length(sequence, length_field(&buf[..4]));
                let packet_length = read_length(&length)?;
                check_alignment(packet_length, MIN_BLOCK_SIZE)?;
                if buf.len() < 4 + packet_length + TAG_LEN {
                    return Ok(None);
                }

                let mut frame = buf.split_to(4 + packet_length + TAG_LEN);
                let (packet, tag_bytes) = frame.split_at_mut(4 + packet_length);
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(tag_bytes);
                let plain = key.open_in_place(sequence, packet, &tag).map_err(|_| {
                    KeelError::Protocol(format!(
                        "chacha20-poly1305 authentication failed for packet {}",
                        sequence
                    ))
                })?;
                Zeroizing::new(plain.to_vec())
            }
        };

        self.sequence = self.sequence.wrapping_add(1);

        let payload = Packet::from_body(&body)?.into_payload();
        let payload = match self.decompressor.as_mut() {
            Some(z) => decompress(z, &payload)?,
            None => payload,
        };

        Ok(Some(payload))
    }
}

impl std::fmt::Debug for OpeningKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpeningKeys")
            .field("cipher", &self.algorithm.name())
            .field("mac", &self.mac.as_ref().map(|m| m.algorithm().name()))
            .field("compressed", &self.decompressor.is_some())
            .field("sequence", &self.sequence)
            .finish()
    }
}

fn integrity_key(keys: &DirectionKeys) -> KeelResult<Option<MacKey>> {
    if keys.cipher.is_aead() {
        return Ok(None);
    }
    keys.mac
        .map(|alg| MacKey::new(alg, &keys.mac_key))
        .transpose()
}

fn length_field(data: &[u8]) -> [u8; 4] {
    [data[0], data[1], data[2], data[3]]
}

fn read_length(data: &[u8]) -> KeelResult<usize> {
    let packet_length = u32::from_be_bytes(length_field(data)) as usize;
    check_packet_length(packet_length)?;
    Ok(packet_length)
}

fn check_alignment(len: usize, block_size: usize) -> KeelResult<()> {
    if len % block_size != 0 {
        return Err(KeelError::Protocol(format!(
            "Packet length {} is not a multiple of block size {}",
            len, block_size
        )));
    }
    Ok(())
}

fn compress(z: &mut Compress, input: &[u8]) -> KeelResult<Vec<u8>> {
    let start_in = z.total_in();
    let start_out = z.total_out();
    let mut out = vec![0u8; input.len() + 64];

    loop {
        let consumed = (z.total_in() - start_in) as usize;
        let produced = (z.total_out() - start_out) as usize;
        if produced == out.len() {
            out.resize(out.len() * 2, 0);
        }

        z.compress(&input[consumed..], &mut out[produced..], FlushCompress::Sync)
            .map_err(|e| KeelError::Protocol(format!("Compression failed: {}", e)))?;

        let consumed = (z.total_in() - start_in) as usize;
        let produced = (z.total_out() - start_out) as usize;
        if consumed == input.len() && produced < out.len() {
            out.truncate(produced);
            return Ok(out);
        }
    }
}

fn decompress(z: &mut Decompress, input: &[u8]) -> KeelResult<Vec<u8>> {
    let start_in = z.total_in();
    let start_out = z.total_out();
    let mut out = vec![0u8; input.len() * 4 + 64];

    loop {
        let consumed = (z.total_in() - start_in) as usize;
        let produced = (z.total_out() - start_out) as usize;
        if produced == out.len() {
            if out.len() >= MAX_PACKET_LEN {
                return Err(KeelError::Protocol(
                    "Decompressed payload exceeds maximum packet size".to_string(),
                ));
            }
            out.resize((out.len() * 2).min(MAX_PACKET_LEN), 0);
        }

        z.decompress(&input[consumed..], &mut out[produced..], FlushDecompress::Sync)
            .map_err(|e| KeelError::Protocol(format!("Decompression failed: {}", e)))?;

        let now_consumed = (z.total_in() - start_in) as usize;
        let now_produced = (z.total_out() - start_out) as usize;
        if now_consumed == input.len() && now_produced < out.len() {
            out.truncate(now_produced);
            return Ok(out);
        }
        if now_consumed == consumed && now_produced == produced {
            return Err(KeelError::Protocol(
                "Decompression made no progress".to_string(),
            ));
        }
    }
}
