//! SSH key exchange (KEX) implementation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS messages
//! - Algorithm negotiation
//! - [`KexController`], the IO-free key exchange state machine
//!
//! # Key Exchange Flow
//!
//! ```text
//! Init ──start()──> AlgorithmNegotiation ──KEXINIT──> Exchange
//!   ──KEXDH_REPLY──> NewKeys ──NEWKEYS both ways──> Established
//! ```
//!
//! A rekey re-enters `AlgorithmNegotiation` from `Established`, either by
//! calling `start()` or when the server's KEXINIT arrives first. The session
//! id stays the exchange hash of the first exchange.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::kex::{KexInit, NewKeys};
//! use keel_proto::ssh::Preferred;
//!
//! let kexinit = KexInit::from_preferred(&Preferred::default());
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! let bytes = NewKeys::new().to_bytes();
//! assert_eq!(bytes, vec![21]);
//! ```

use super::codec::{CompressionAlgorithm, DirectionKeys};
use super::config::Preferred;
use super::crypto::{CipherAlgorithm, MacAlgorithm};
use super::hostkey::{HostKeyAlgorithm, PublicKey};
use super::kex_dh::{
    derive_direction_keys, Direction, ExchangeHashInput, KexDhReply, KexMethod, KeyExchange,
};
use super::message::MessageType;
use super::wire::{expect_message, read_bool, read_name_list, read_u32, write_bool, write_name_list};
use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

fn supported(category: &str, list: &[String], known: impl Fn(&str) -> bool) -> Vec<String> {
    list.iter()
        .filter(|name| {
            let ok = known(name);
            if !ok {
                warn!("Dropping unsupported {} algorithm {}", category, name);
            }
            ok
        })
        .cloned()
        .collect()
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie from preference lists.
    ///
    /// Names this crate does not implement are dropped with a warning, so
    /// whatever gets negotiated can be instantiated.
    pub fn from_preferred(preferred: &Preferred) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let ciphers = supported("cipher", &preferred.cipher, |n| {
            CipherAlgorithm::from_name(n).is_some()
        });
        let macs = supported("mac", &preferred.mac, |n| MacAlgorithm::from_name(n).is_some());
        let compression = supported("compression", &preferred.compression, |n| {
            CompressionAlgorithm::from_name(n).is_some()
        });

        Self {
            cookie,
            kex_algorithms: supported("kex", &preferred.kex, |n| KexMethod::from_name(n).is_some()),
            server_host_key_algorithms: supported("host key", &preferred.key, |n| {
                HostKeyAlgorithm::from_name(n).is_some()
            }),
            encryption_algorithms_client_to_server: ciphers.clone(),
            encryption_algorithms_server_to_client: ciphers,
            mac_algorithms_client_to_server: macs.clone(),
            mac_algorithms_server_to_client: macs,
            compression_algorithms_client_to_server: compression.clone(),
            compression_algorithms_server_to_client: compression,
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Sets the `first_kex_packet_follows` flag.
    pub fn with_first_kex_packet_follows(mut self, follows: bool) -> Self {
        self.first_kex_packet_follows = follows;
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the compression algorithms (client to server).
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the compression algorithms (server to client).
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether a guessed first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT payload.
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        write_name_list(&mut buf, &self.kex_algorithms);
        write_name_list(&mut buf, &self.server_host_key_algorithms);
        write_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        write_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        write_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        write_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        write_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        write_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        write_name_list(&mut buf, &self.languages_client_to_server);
        write_name_list(&mut buf, &self.languages_server_to_client);

        write_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT payload.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(data, MessageType::KexInit as u8, "SSH_MSG_KEXINIT")?;

        if data.len() < 17 {
            return Err(KeelError::Protocol(format!(
                "KEXINIT message too short: {} bytes (minimum 17)",
                data.len()
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[1..17]);

        let mut offset = 17;
        let kex_algorithms = read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = read_name_list(data, &mut offset)?;
        let encryption_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let encryption_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let mac_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let mac_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let compression_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let compression_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let languages_client_to_server = read_name_list(data, &mut offset)?;
        let languages_server_to_client = read_name_list(data, &mut offset)?;
        let first_kex_packet_follows = read_bool(data, &mut offset)?;
        read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// After sending NEWKEYS every outgoing packet uses the new keys; after
/// receiving it every incoming packet does. Sequence numbers are not reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the message (a single byte, 21).
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(data, MessageType::NewKeys as u8, "SSH_MSG_NEWKEYS")?;
        Ok(Self)
    }
}

impl Default for NewKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Picks the first client algorithm the server also offers.
///
/// ```rust
/// use keel_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// let result = negotiate_algorithm("cipher", &client, &server).unwrap();
/// assert_eq!(result, "aes256-ctr");
/// ```
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> KeelResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| KeelError::Negotiation {
            category: category.to_string(),
            client: client_list.join(","),
            server: server_list.join(","),
        })
}

/// The outcome of algorithm negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: KexMethod,
    /// Host key algorithm
    pub host_key: HostKeyAlgorithm,
    /// Cipher client to server
    pub cipher_c2s: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_s2c: CipherAlgorithm,
    /// MAC client to server, `None` with an AEAD cipher
    pub mac_c2s: Option<MacAlgorithm>,
    /// MAC server to client, `None` with an AEAD cipher
    pub mac_s2c: Option<MacAlgorithm>,
    /// Compression client to server
    pub compression_c2s: CompressionAlgorithm,
    /// Compression server to client
    pub compression_s2c: CompressionAlgorithm,
}

fn unknown(category: &str, name: &str) -> KeelError {
    KeelError::Protocol(format!("Negotiated unknown {} algorithm {}", category, name))
}

fn negotiate_mac(
    category: &str,
    cipher: CipherAlgorithm,
    client: &[String],
    server: &[String],
) -> KeelResult<Option<MacAlgorithm>> {
    if cipher.is_aead() {
        return Ok(None);
    }
    let name = negotiate_algorithm(category, client, server)?;
    MacAlgorithm::from_name(&name)
        .map(Some)
        .ok_or_else(|| unknown("mac", &name))
}

/// Negotiates every category between a client and a server KEXINIT.
///
/// Both peers run the same function with the same arguments, so the client
/// list always drives the choice.
pub fn negotiate(client: &KexInit, server: &KexInit) -> KeelResult<NegotiatedAlgorithms> {
    let kex_name = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
    let kex = KexMethod::from_name(&kex_name).ok_or_else(|| unknown("kex", &kex_name))?;

    let host_key_name = negotiate_algorithm(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;
    let host_key =
        HostKeyAlgorithm::from_name(&host_key_name).ok_or_else(|| unknown("host key", &host_key_name))?;

    let cipher = |category, c: &[String], s: &[String]| -> KeelResult<CipherAlgorithm> {
        let name = negotiate_algorithm(category, c, s)?;
        CipherAlgorithm::from_name(&name).ok_or_else(|| unknown("cipher", &name))
    };
    let cipher_c2s = cipher(
        "cipher client->server",
        &client.encryption_algorithms_client_to_server,
        &server.encryption_algorithms_client_to_server,
    )?;
    let cipher_s2c = cipher(
        "cipher server->client",
        &client.encryption_algorithms_server_to_client,
        &server.encryption_algorithms_server_to_client,
    )?;

    let mac_c2s = negotiate_mac(
        "mac client->server",
        cipher_c2s,
        &client.mac_algorithms_client_to_server,
        &server.mac_algorithms_client_to_server,
    )?;
    let mac_s2c = negotiate_mac(
        "mac server->client",
        cipher_s2c,
        &client.mac_algorithms_server_to_client,
        &server.mac_algorithms_server_to_client,
    )?;

    let compression = |category, c: &[String], s: &[String]| -> KeelResult<CompressionAlgorithm> {
        let name = negotiate_algorithm(category, c, s)?;
        CompressionAlgorithm::from_name(&name).ok_or_else(|| unknown("compression", &name))
    };
    let compression_c2s = compression(
        "compression client->server",
        &client.compression_algorithms_client_to_server,
        &server.compression_algorithms_client_to_server,
    )?;
    let compression_s2c = compression(
        "compression server->client",
        &client.compression_algorithms_server_to_client,
        &server.compression_algorithms_server_to_client,
    )?;

    Ok(NegotiatedAlgorithms {
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        compression_c2s,
        compression_s2c,
    })
}

/// Key exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexState {
    /// Nothing sent yet
    Init,
    /// Our KEXINIT is out, waiting for the server's
    AlgorithmNegotiation,
    /// Our KEXDH_INIT is out, waiting for the reply
    Exchange,
    /// Reply verified, NEWKEYS pending in one or both directions
    NewKeys,
    /// Keys in force in both directions
    Established,
}

/// IO-free client side of key exchange.
///
/// The caller moves payloads between the controller and the packet stream,
/// installs the returned [`DirectionKeys`] and consults the host key
/// verifier between [`handle_reply`](Self::handle_reply) and
/// [`send_newkeys`](Self::send_newkeys).
pub struct KexController {
    preferred: Preferred,
    client_id: String,
    server_id: String,
    state: KexState,
    session_id: Option<Vec<u8>>,
    client_kexinit: Option<(KexInit, Vec<u8>)>,
    server_kexinit: Option<Vec<u8>>,
    negotiated: Option<NegotiatedAlgorithms>,
    exchange: Option<KeyExchange>,
    keys_c2s: Option<DirectionKeys>,
    keys_s2c: Option<DirectionKeys>,
    skip_guessed_packet: bool,
}

impl KexController {
    /// Creates a controller for one connection.
    ///
    /// `client_id` and `server_id` are the identification strings without
    /// line terminators.
    pub fn new(preferred: Preferred, client_id: &str, server_id: &str) -> Self {
        Self {
            preferred,
            client_id: client_id.to_string(),
            server_id: server_id.to_string(),
            state: KexState::Init,
            session_id: None,
            client_kexinit: None,
            server_kexinit: None,
            negotiated: None,
            exchange: None,
            keys_c2s: None,
            keys_s2c: None,
            skip_guessed_packet: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> KexState {
        self.state
    }

    /// Returns true between sending KEXINIT and receiving NEWKEYS.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, KexState::Init | KexState::Established)
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Algorithms from the most recent negotiation.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Starts a key exchange and returns our KEXINIT payload.
    pub fn start(&mut self) -> KeelResult<Vec<u8>> {
        if self.in_progress() {
            return Err(KeelError::InvalidState(
                "Key exchange already in progress".to_string(),
            ));
        }

        let kexinit = KexInit::from_preferred(&self.preferred);
        let payload = kexinit.to_bytes();
        self.client_kexinit = Some((kexinit, payload.clone()));
        self.state = KexState::AlgorithmNegotiation;
        debug!("Sent SSH_MSG_KEXINIT");
        Ok(payload)
    }

    /// Handles the server's KEXINIT and returns the payloads to send.
    ///
    /// When the server initiated the exchange, our own KEXINIT comes first in
    /// the returned list.
    pub fn handle_kexinit(&mut self, payload: &[u8]) -> KeelResult<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        match self.state {
            KexState::Init | KexState::Established => {
                debug!("Server initiated key exchange");
                out.push(self.start()?);
            }
            KexState::AlgorithmNegotiation => {}
            KexState::Exchange | KexState::NewKeys => {
                return Err(KeelError::Protocol(
                    "Unexpected SSH_MSG_KEXINIT during key exchange".to_string(),
                ));
            }
        }

        let server = KexInit::from_bytes(payload)?;
        let (client, _) = self
            .client_kexinit
            .as_ref()
            .ok_or_else(|| KeelError::InvalidState("KEXINIT not sent".to_string()))?;
        let negotiated = negotiate(client, &server)?;

        if server.first_kex_packet_follows() {
            let kex_guess = server.kex_algorithms().first().map(String::as_str);
            let key_guess = server.server_host_key_algorithms().first().map(String::as_str);
            self.skip_guessed_packet = kex_guess != Some(negotiated.kex.name())
                || key_guess != Some(negotiated.host_key.name());
        }

        debug!(
            kex = negotiated.kex.name(),
            host_key = negotiated.host_key.name(),
            cipher_c2s = negotiated.cipher_c2s.name(),
            cipher_s2c = negotiated.cipher_s2c.name(),
            mac_c2s = negotiated.mac_c2s.map(|m| m.name()).unwrap_or("<implicit>"),
            mac_s2c = negotiated.mac_s2c.map(|m| m.name()).unwrap_or("<implicit>"),
            compression_c2s = negotiated.compression_c2s.name(),
            compression_s2c = negotiated.compression_s2c.name(),
            "Negotiated algorithms"
        );

        let exchange = KeyExchange::new(negotiated.kex)?;
        out.push(exchange.init_message());

        self.server_kexinit = Some(payload.to_vec());
        self.negotiated = Some(negotiated);
        self.exchange = Some(exchange);
        self.state = KexState::Exchange;
        Ok(out)
    }

    /// Handles the server's KEXDH_REPLY.
    ///
    /// Verifies the host key signature over H and derives both key sets.
    /// Returns the server host key, or `None` when the packet was a wrongly
    /// guessed one that had to be ignored.
    pub fn handle_reply(&mut self, payload: &[u8]) -> KeelResult<Option<PublicKey>> {
        if self.state != KexState::Exchange {
            return Err(KeelError::Protocol(
                "Unexpected SSH_MSG_KEXDH_REPLY".to_string(),
            ));
        }
        if self.skip_guessed_packet {
            self.skip_guessed_packet = false;
            debug!("Ignoring wrongly guessed key exchange packet");
            return Ok(None);
        }

        let negotiated = self
            .negotiated
            .ok_or_else(|| KeelError::InvalidState("Algorithms not negotiated".to_string()))?;
        let reply = KexDhReply::from_bytes(payload, negotiated.kex)?;

        let mut host_key = PublicKey::from_blob(&reply.host_key_blob)
            .map_err(|e| KeelError::Protocol(format!("Invalid server host key: {}", e)))?;
        let expected_type = match negotiated.host_key {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            _ => "ssh-rsa",
        };
        if host_key.key_type() != expected_type {
            return Err(KeelError::Protocol(format!(
                "Server host key is {}, negotiated {}",
                host_key.key_type(),
                negotiated.host_key.name()
            )));
        }
        if let Some(hash) = negotiated.host_key.signature_hash() {
            host_key.set_algorithm(hash);
        }

        let exchange = self
            .exchange
            .take()
            .ok_or_else(|| KeelError::InvalidState("No exchange in progress".to_string()))?;
        let client_public = exchange.public_key().to_vec();
        let shared_secret = Zeroizing::new(exchange.compute_shared_secret(&reply.server_public)?);

        let (_, client_kexinit) = self
            .client_kexinit
            .as_ref()
            .ok_or_else(|| KeelError::InvalidState("KEXINIT not sent".to_string()))?;
        let server_kexinit = self
            .server_kexinit
            .as_deref()
            .ok_or_else(|| KeelError::InvalidState("KEXINIT not received".to_string()))?;

        let exchange_hash = ExchangeHashInput {
            method: negotiated.kex,
            client_id: &self.client_id,
            server_id: &self.server_id,
            client_kexinit,
            server_kexinit,
            host_key_blob: &reply.host_key_blob,
            client_public: &client_public,
            server_public: &reply.server_public,
            shared_secret: &shared_secret,
        }
        .compute();

        host_key.verify_signature_blob(&exchange_hash, &reply.signature, Some(negotiated.host_key))?;

        let session_id = self
            .session_id
            .get_or_insert_with(|| exchange_hash.clone())
            .clone();

        self.keys_c2s = Some(derive_direction_keys(
            &shared_secret,
            &exchange_hash,
            &session_id,
            &negotiated,
            Direction::ClientToServer,
        ));
        self.keys_s2c = Some(derive_direction_keys(
            &shared_secret,
            &exchange_hash,
            &session_id,
            &negotiated,
            Direction::ServerToClient,
        ));
        self.state = KexState::NewKeys;

        debug!(fingerprint = %host_key.fingerprint(), "Verified server host key signature");
        Ok(Some(host_key))
    }

    /// Returns our NEWKEYS payload and the keys that take effect right after it.
    pub fn send_newkeys(&mut self) -> KeelResult<(Vec<u8>, DirectionKeys)> {
        if self.state != KexState::NewKeys {
            return Err(KeelError::InvalidState(
                "NEWKEYS before key exchange reply".to_string(),
            ));
        }
        let keys = self
            .keys_c2s
            .take()
            .ok_or_else(|| KeelError::InvalidState("NEWKEYS already sent".to_string()))?;
        Ok((NewKeys::new().to_bytes(), keys))
    }

    /// Handles the server's NEWKEYS and returns the keys for inbound traffic.
    pub fn handle_newkeys(&mut self, payload: &[u8]) -> KeelResult<DirectionKeys> {
        NewKeys::from_bytes(payload)?;

        if self.state != KexState::NewKeys {
            return Err(KeelError::Protocol(
                "Unexpected SSH_MSG_NEWKEYS".to_string(),
            ));
        }
        if self.keys_c2s.is_some() {
            return Err(KeelError::InvalidState(
                "Server NEWKEYS handled before ours was sent".to_string(),
            ));
        }

        let keys = self
            .keys_s2c
            .take()
            .ok_or_else(|| KeelError::InvalidState("No pending inbound keys".to_string()))?;

        self.client_kexinit = None;
        self.server_kexinit = None;
        self.state = KexState::Established;
        debug!("Key exchange complete");
        Ok(keys)
    }
}

impl std::fmt::Debug for KexController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexController")
            .field("state", &self.state)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}
