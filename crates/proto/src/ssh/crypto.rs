//! SSH cipher and MAC primitives.
//!
//! This module implements the per-packet cryptography used by the codec:
//! - `chacha20-poly1305@openssh.com` (AEAD, sequence number as nonce)
//! - `aes128-gcm@openssh.com`, `aes256-gcm@openssh.com` (AEAD, RFC 5647)
//! - `aes128-ctr`, `aes192-ctr`, `aes256-ctr` (stream ciphers with separate MAC, RFC 4344)
//! - `hmac-sha2-256`, `hmac-sha2-512`, `hmac-sha1` (MAC algorithms, RFC 6668 / RFC 4253)
//!
//! # Security
//!
//! - **AEAD nonces** - GCM nonces use the RFC 5647 invocation counter, ChaCha20
//!   nonces are the packet sequence number, so a nonce never repeats under one key
//! - **MAC verification** - constant-time comparison via `subtle`
//! - **Key hygiene** - key material is zeroized on drop and redacted in `Debug`

use aes::{Aes128, Aes192, Aes256};
use cipher::{BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use keel_platform::{KeelError, KeelResult};
use ring::aead::chacha20_poly1305_openssh;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

/// Length of AEAD authentication tags.
pub const TAG_LEN: usize = 16;

/// Cipher algorithm for SSH packet encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption; only valid before the first key exchange completes
    None,
    /// ChaCha20-Poly1305 AEAD cipher (OpenSSH construction)
    ChaCha20Poly1305,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-192-CTR stream cipher (requires separate MAC)
    Aes192Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Parses a negotiable cipher name. `none` is never negotiated.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes192-ctr" => Some(CipherAlgorithm::Aes192Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            // K_2 (payload) || K_1 (length)
            CipherAlgorithm::ChaCha20Poly1305 => 64,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes192Ctr => 24,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None | CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes192Ctr | CipherAlgorithm::Aes256Ctr => {
                16
            }
        }
    }

    /// Returns the block size used for padding alignment.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None | CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Returns the authentication tag size in bytes (for AEAD ciphers).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            TAG_LEN
        } else {
            0
        }
    }

    /// Returns true if this is an AEAD cipher.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }
}

/// MAC key for one direction.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a MAC key, truncating the key material to the algorithm's key size.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> KeelResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(KeelError::Protocol(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: Zeroizing::new(key_material[..algorithm.key_size()].to_vec()),
        })
    }

    /// Computes `MAC(key, sequence_number || unencrypted_packet)`.
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> KeelResult<Vec<u8>> {
        fn run<M: Mac + KeyInit>(key: &[u8], sequence: u32, packet: &[u8]) -> KeelResult<Vec<u8>> {
            let mut mac = <M as Mac>::new_from_slice(key)
                .map_err(|e| KeelError::Protocol(format!("HMAC creation failed: {}", e)))?;
            mac.update(&sequence.to_be_bytes());
            mac.update(packet);
            Ok(mac.finalize().into_bytes().to_vec())
        }

        match self.algorithm {
            MacAlgorithm::HmacSha1 => run::<Hmac<Sha1>>(&self.key, sequence, packet),
            MacAlgorithm::HmacSha256 => run::<Hmac<Sha256>>(&self.key, sequence, packet),
            MacAlgorithm::HmacSha512 => run::<Hmac<Sha512>>(&self.key, sequence, packet),
        }
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> KeelResult<()> {
        let computed = self.compute(sequence, packet)?;
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(KeelError::Protocol(format!(
                "MAC verification failed for packet {}",
                sequence
            )))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

enum AesBlockCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesBlockCipher {
    fn encrypt_block(&self, block: &mut aes::Block) {
        match self {
            AesBlockCipher::Aes128(c) => c.encrypt_block(block),
            AesBlockCipher::Aes192(c) => c.encrypt_block(block),
            AesBlockCipher::Aes256(c) => c.encrypt_block(block),
        }
    }
}

/// AES in counter mode with a 128-bit big-endian counter (RFC 4344).
pub struct AesCtr {
    cipher: AesBlockCipher,
    counter: [u8; 16],
    keystream: [u8; 16],
    used: usize,
}

impl AesCtr {
    /// Creates the cipher from key and initial counter block.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KeelResult<Self> {
        check_material(algorithm, key, iv)?;
        let key = &key[..algorithm.key_size()];
        let invalid = |_| KeelError::Protocol("Invalid AES key length".to_string());

        let cipher = match algorithm {
            CipherAlgorithm::Aes128Ctr => {
                AesBlockCipher::Aes128(Aes128::new_from_slice(key).map_err(invalid)?)
            }
            CipherAlgorithm::Aes192Ctr => {
                AesBlockCipher::Aes192(Aes192::new_from_slice(key).map_err(invalid)?)
            }
            CipherAlgorithm::Aes256Ctr => {
                AesBlockCipher::Aes256(Aes256::new_from_slice(key).map_err(invalid)?)
            }
            other => {
                return Err(KeelError::Protocol(format!(
                    "{} is not a CTR cipher",
                    other.name()
                )))
            }
        };

        let mut counter = [0u8; 16];
        counter.copy_from_slice(&iv[..16]);

        Ok(Self {
            cipher,
            counter,
            keystream: [0u8; 16],
            used: 16,
        })
    }

    /// XORs the keystream into `data`, continuing where the last call stopped.
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.used == self.keystream.len() {
                self.refill();
            }
            *byte ^= self.keystream[self.used];
            self.used += 1;
        }
    }

    fn refill(&mut self) {
        let mut block = aes::Block::clone_from_slice(&self.counter);
        self.cipher.encrypt_block(&mut block);
        self.keystream.copy_from_slice(&block);
        self.used = 0;

        let next = u128::from_be_bytes(self.counter).wrapping_add(1);
        self.counter = next.to_be_bytes();
    }
}

impl Drop for AesCtr {
    fn drop(&mut self) {
        self.counter.zeroize();
        self.keystream.zeroize();
    }
}

/// AES-GCM with the RFC 5647 nonce: 4-byte fixed field plus a 64-bit
/// invocation counter incremented after every packet.
pub struct AesGcm {
    key: LessSafeKey,
    nonce: [u8; 12],
}

impl AesGcm {
    /// Creates the cipher from key and initial IV.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KeelResult<Self> {
        check_material(algorithm, key, iv)?;
        let ring_alg = match algorithm {
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
            other => {
                return Err(KeelError::Protocol(format!(
                    "{} is not a GCM cipher",
                    other.name()
                )))
            }
        };

        let unbound = UnboundKey::new(ring_alg, &key[..algorithm.key_size()])
            .map_err(|_| KeelError::Protocol("Failed to create AES-GCM key".to_string()))?;

        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&iv[..12]);

        Ok(Self {
            key: LessSafeKey::new(unbound),
            nonce,
        })
    }

    /// Encrypts `data` in place and returns the tag; `aad` is the length field.
    pub fn seal(&mut self, aad: [u8; 4], data: &mut [u8]) -> KeelResult<[u8; TAG_LEN]> {
        let nonce = Nonce::assume_unique_for_key(self.nonce);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(aad), data)
            .map_err(|_| KeelError::Protocol("AES-GCM encryption failed".to_string()))?;
        self.advance();

        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Decrypts `ciphertext || tag` in place and returns the plaintext.
    pub fn open<'a>(&mut self, aad: [u8; 4], data: &'a mut [u8]) -> KeelResult<&'a mut [u8]> {
        let nonce = Nonce::assume_unique_for_key(self.nonce);
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), data)
            .map_err(|_| {
                KeelError::Protocol("AES-GCM authentication tag mismatch".to_string())
            })?;
        self.advance();
        Ok(plaintext)
    }

    fn advance(&mut self) {
        let mut invocation = [0u8; 8];
        invocation.copy_from_slice(&self.nonce[4..]);
        let next = u64::from_be_bytes(invocation).wrapping_add(1);
        self.nonce[4..].copy_from_slice(&next.to_be_bytes());
    }
}

/// Builds the OpenSSH ChaCha20-Poly1305 sealing key.
pub fn chacha_sealing_key(key: &[u8]) -> KeelResult<chacha20_poly1305_openssh::SealingKey> {
    let material = chacha_key_material(key)?;
    Ok(chacha20_poly1305_openssh::SealingKey::new(&material))
}

/// Builds the OpenSSH ChaCha20-Poly1305 opening key.
pub fn chacha_opening_key(key: &[u8]) -> KeelResult<chacha20_poly1305_openssh::OpeningKey> {
    let material = chacha_key_material(key)?;
    Ok(chacha20_poly1305_openssh::OpeningKey::new(&material))
}

fn chacha_key_material(key: &[u8]) -> KeelResult<Zeroizing<[u8; 64]>> {
    check_material(CipherAlgorithm::ChaCha20Poly1305, key, &[])?;
    let mut material = Zeroizing::new([0u8; chacha20_poly1305_openssh::KEY_LEN]);
    material.copy_from_slice(&key[..chacha20_poly1305_openssh::KEY_LEN]);
    Ok(material)
}

fn check_material(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KeelResult<()> {
    if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
        return Err(KeelError::Protocol(format!(
            "Insufficient key material for {}: key {} / {}, iv {} / {}",
            algorithm.name(),
            key.len(),
            algorithm.key_size(),
            iv.len(),
            algorithm.iv_size()
        )));
    }
    Ok(())
}
