//! Key exchange methods and key derivation (RFC 4253, RFC 8268, RFC 8731).
//!
//! Supported methods:
//! - `curve25519-sha256` and `curve25519-sha256@libssh.org` (ring X25519)
//! - `diffie-hellman-group14-sha256` (2048-bit MODP group)
//!
//! Both sides of an exchange use the same [`KeyExchange`] type, so a peer
//! generates its ephemeral key, publishes it, and combines it with the
//! other side's public value:
//!
//! ```rust
//! use keel_proto::ssh::kex_dh::{KexMethod, KeyExchange};
//!
//! let client = KeyExchange::new(KexMethod::Curve25519Sha256).unwrap();
//! let server = KeyExchange::new(KexMethod::Curve25519Sha256).unwrap();
//! let client_public = client.public_key().to_vec();
//! let server_public = server.public_key().to_vec();
//!
//! let k1 = client.compute_shared_secret(&server_public).unwrap();
//! let k2 = server.compute_shared_secret(&client_public).unwrap();
//! assert_eq!(k1, k2);
//! ```

use super::codec::DirectionKeys;
use super::kex::NegotiatedAlgorithms;
use super::message::MessageType;
use super::wire::{expect_message, read_bytes, read_mpint, write_bytes, write_mpint};
use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};
use num_bigint::{BigUint, RandBigInt};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

/// Diffie-Hellman Group 14 parameters (RFC 3526).
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    const P_BYTES: [u8; 256] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
        0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
        0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
        0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
        0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
        0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
        0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
        0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
        0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
        0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
        0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36,
        0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
        0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56,
        0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d,
        0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
        0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
        0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2,
        0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9,
        0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7c,
        0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
        0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff,
    ];

    /// 2048-bit prime
    pub static P: Lazy<BigUint> = Lazy::new(|| BigUint::from_bytes_be(&P_BYTES));

    /// Generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexMethod {
    /// curve25519-sha256
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org
    Curve25519Sha256Libssh,
    /// diffie-hellman-group14-sha256
    DhGroup14Sha256,
}

impl KexMethod {
    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            KexMethod::Curve25519Sha256 => "curve25519-sha256",
            KexMethod::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexMethod::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
        }
    }

    /// Looks up a method by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "curve25519-sha256" => Some(KexMethod::Curve25519Sha256),
            "curve25519-sha256@libssh.org" => Some(KexMethod::Curve25519Sha256Libssh),
            "diffie-hellman-group14-sha256" => Some(KexMethod::DhGroup14Sha256),
            _ => None,
        }
    }

    /// Returns true when public values travel as `mpint` rather than `string`.
    pub fn uses_mpint(&self) -> bool {
        matches!(self, KexMethod::DhGroup14Sha256)
    }
}

/// Diffie-Hellman Group 14 key exchange.
pub struct DhGroup14Exchange {
    /// Private exponent x
    private_key: Vec<u8>,
    /// g^x mod p
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a fresh exponent in `[2, p-2]`.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();

        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns e (or f on the server side) as a big-endian magnitude.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes K from the peer's public value.
    ///
    /// The peer value must satisfy `1 < y < p-1`.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> KeelResult<Vec<u8>> {
        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = dh_group14::P.clone() - 1u32;

        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(KeelError::Protocol(
                "Invalid DH public value: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, &dh_group14::P);

        Ok(k.to_bytes_be())
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 key exchange (RFC 8731).
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates an ephemeral X25519 key.
    pub fn new() -> KeelResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| KeelError::Protocol("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            KeelError::Protocol("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns Q_C (or Q_S on the server side).
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes K. Consumes the ephemeral key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> KeelResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(KeelError::Protocol(format!(
                "Invalid Curve25519 public key length: {}",
                peer_public.len()
            )));
        }

        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| KeelError::Protocol("Curve25519 key agreement failed".to_string()))
    }
}

/// One side of an in-progress exchange.
pub enum KeyExchange {
    /// Curve25519 (either name)
    Curve25519 {
        /// Method name used in negotiation
        method: KexMethod,
        /// Ephemeral key
        exchange: Curve25519Exchange,
    },
    /// diffie-hellman-group14-sha256
    DhGroup14(DhGroup14Exchange),
}

impl KeyExchange {
    /// Starts an exchange for `method`.
    pub fn new(method: KexMethod) -> KeelResult<Self> {
        Ok(match method {
            KexMethod::Curve25519Sha256 | KexMethod::Curve25519Sha256Libssh => {
                KeyExchange::Curve25519 {
                    method,
                    exchange: Curve25519Exchange::new()?,
                }
            }
            KexMethod::DhGroup14Sha256 => KeyExchange::DhGroup14(DhGroup14Exchange::new()),
        })
    }

    /// The method this exchange runs.
    pub fn method(&self) -> KexMethod {
        match self {
            KeyExchange::Curve25519 { method, .. } => *method,
            KeyExchange::DhGroup14(_) => KexMethod::DhGroup14Sha256,
        }
    }

    /// Our public value (raw bytes, or mpint magnitude for DH).
    pub fn public_key(&self) -> &[u8] {
        match self {
            KeyExchange::Curve25519 { exchange, .. } => exchange.public_key(),
            KeyExchange::DhGroup14(exchange) => exchange.public_key(),
        }
    }

    /// Builds `SSH_MSG_KEX_ECDH_INIT` / `SSH_MSG_KEXDH_INIT`.
    pub fn init_message(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhInit as u8);
        write_public(&mut buf, self.method(), self.public_key());
        buf.to_vec()
    }

    /// Computes K from the peer's public value.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> KeelResult<Vec<u8>> {
        match self {
            KeyExchange::Curve25519 { exchange, .. } => exchange.compute_shared_secret(peer_public),
            KeyExchange::DhGroup14(exchange) => exchange.compute_shared_secret(peer_public),
        }
    }
}

fn write_public(buf: &mut BytesMut, method: KexMethod, value: &[u8]) {
    if method.uses_mpint() {
        write_mpint(buf, value);
    } else {
        write_bytes(buf, value);
    }
}

fn read_public(data: &[u8], offset: &mut usize, method: KexMethod) -> KeelResult<Vec<u8>> {
    if method.uses_mpint() {
        read_mpint(data, offset)
    } else {
        read_bytes(data, offset)
    }
}

/// Parses the client's `KEXDH_INIT`, returning its public value.
pub fn parse_init_message(data: &[u8], method: KexMethod) -> KeelResult<Vec<u8>> {
    expect_message(data, MessageType::KexdhInit as u8, "SSH_MSG_KEXDH_INIT")?;
    let mut offset = 1;
    read_public(data, &mut offset, method)
}

/// `SSH_MSG_KEX_ECDH_REPLY` / `SSH_MSG_KEXDH_REPLY`.
///
/// ```text
/// byte      SSH_MSG_KEXDH_REPLY (31)
/// string    K_S, server host key blob
/// string    Q_S (curve25519) / mpint f (group14)
/// string    signature of H
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhReply {
    /// K_S
    pub host_key_blob: Vec<u8>,
    /// Q_S or f
    pub server_public: Vec<u8>,
    /// Signature blob over H
    pub signature: Vec<u8>,
}

impl KexDhReply {
    /// Serializes the reply for `method`.
    pub fn to_bytes(&self, method: KexMethod) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhReply as u8);
        write_bytes(&mut buf, &self.host_key_blob);
        write_public(&mut buf, method, &self.server_public);
        write_bytes(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses a reply for `method`.
    pub fn from_bytes(data: &[u8], method: KexMethod) -> KeelResult<Self> {
        expect_message(data, MessageType::KexdhReply as u8, "SSH_MSG_KEXDH_REPLY")?;
        let mut offset = 1;
        let host_key_blob = read_bytes(data, &mut offset)?;
        let server_public = read_public(data, &mut offset, method)?;
        let signature = read_bytes(data, &mut offset)?;

        Ok(Self {
            host_key_blob,
            server_public,
            signature,
        })
    }
}

/// Inputs to the exchange hash H.
pub struct ExchangeHashInput<'a> {
    /// Method, which selects `string` or `mpint` for the public values
    pub method: KexMethod,
    /// V_C without CR LF
    pub client_id: &'a str,
    /// V_S without CR LF
    pub server_id: &'a str,
    /// I_C, the client's KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// K_S
    pub host_key_blob: &'a [u8],
    /// Q_C or e
    pub client_public: &'a [u8],
    /// Q_S or f
    pub server_public: &'a [u8],
    /// K
    pub shared_secret: &'a [u8],
}

impl ExchangeHashInput<'_> {
    /// H = SHA-256 over the length-prefixed fields.
    pub fn compute(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_bytes(&mut buf, self.client_id.as_bytes());
        write_bytes(&mut buf, self.server_id.as_bytes());
        write_bytes(&mut buf, self.client_kexinit);
        write_bytes(&mut buf, self.server_kexinit);
        write_bytes(&mut buf, self.host_key_blob);
        write_public(&mut buf, self.method, self.client_public);
        write_public(&mut buf, self.method, self.server_public);
        write_mpint(&mut buf, self.shared_secret);

        let hash = Sha256::digest(&buf).to_vec();
        buf[..].zeroize();
        hash
    }
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || X || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...
/// ```
///
/// K is hashed in its `mpint` encoding.
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut buf = BytesMut::new();
    write_mpint(&mut buf, shared_secret);
    let k_mpint = Zeroizing::new(buf.to_vec());
    buf[..].zeroize();

    let mut key = Zeroizing::new(Vec::with_capacity(key_length + 32));
    if key_length == 0 {
        return key;
    }

    let mut hasher = Sha256::new();
    hasher.update(&k_mpint[..]);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    key.extend_from_slice(&hasher.finalize_reset());

    while key.len() < key_length {
        hasher.update(&k_mpint[..]);
        hasher.update(exchange_hash);
        hasher.update(&key[..]);
        key.extend_from_slice(&hasher.finalize_reset());
    }

    key.truncate(key_length);
    key
}

/// Traffic direction, which selects the derivation letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Letters A (IV), C (key), E (MAC)
    ClientToServer,
    /// Letters B (IV), D (key), F (MAC)
    ServerToClient,
}

impl Direction {
    fn letters(&self) -> (u8, u8, u8) {
        match self {
            Direction::ClientToServer => (b'A', b'C', b'E'),
            Direction::ServerToClient => (b'B', b'D', b'F'),
        }
    }
}

/// Derives the full key set for one direction from K, H and the session id.
pub fn derive_direction_keys(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    negotiated: &NegotiatedAlgorithms,
    direction: Direction,
) -> DirectionKeys {
    let (cipher, mac, compression) = match direction {
        Direction::ClientToServer => (
            negotiated.cipher_c2s,
            negotiated.mac_c2s,
            negotiated.compression_c2s,
        ),
        Direction::ServerToClient => (
            negotiated.cipher_s2c,
            negotiated.mac_s2c,
            negotiated.compression_s2c,
        ),
    };
    let (iv_letter, key_letter, mac_letter) = direction.letters();
    let derive = |letter, len| derive_key(shared_secret, exchange_hash, session_id, letter, len);

    DirectionKeys {
        cipher,
        mac,
        compression,
        iv: derive(iv_letter, cipher.iv_size()),
        key: derive(key_letter, cipher.key_size()),
        mac_key: derive(mac_letter, mac.map(|m| m.key_size()).unwrap_or(0)),
    }
}
