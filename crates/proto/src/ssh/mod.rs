//! SSH2 client protocol implementation (RFC 4251-4254).
//!
//! # Architecture
//!
//! The client is layered, leaves first:
//!
//! 1. **Wire codec** ([`wire`], [`packet`], [`crypto`], [`codec`]) - binary
//!    packets, ciphers, MACs and compression (RFC 4253 Section 6)
//! 2. **Keys** ([`hostkey`], [`privatekey`]) - Ed25519 and RSA keys,
//!    fingerprints, detached signatures
//! 3. **Trust** ([`known_hosts`]) - OpenSSH known_hosts lookup and learning
//! 4. **Key exchange** ([`kex`], [`kex_dh`], [`transport`], [`version`]) -
//!    negotiation, curve25519 and group14 exchanges, rekeying
//! 5. **Authentication** ([`auth`]) - password and public key (RFC 4252)
//! 6. **Channels** ([`connection`], [`channel`]) - exec sessions with flow
//!    control (RFC 4254)
//! 7. **Session** ([`client`]) - the public [`SshClient`] handle
//!
//! Layers 1-6 do no IO of their own except [`transport`], which drives a
//! byte stream. [`client`] runs everything in one task per session.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::Packet;
//!
//! let packet = Packet::new(vec![20, 0, 1, 2]).unwrap();
//! let bytes = packet.to_bytes();
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), &[20, 0, 1, 2]);
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod privatekey;
pub mod transport;
pub mod version;
pub mod wire;

pub use auth::{AuthState, KeyAuth};
pub use channel::{ChannelState, ExecOutput};
pub use client::SshClient;
pub use config::{
    AuthBannerHandler, ClientConfig, ClientId, Config, Limits, Preferred, ServerKeyVerifier,
};
pub use hostkey::{HostKeyAlgorithm, PublicKey, Signature, SignatureHash};
pub use kex::{KexState, NegotiatedAlgorithms};
pub use known_hosts::{
    check_known_hosts, learn_known_hosts, KnownHostsVerifier, StrictHostKeyChecking,
};
pub use message::{DisconnectReason, MessageType};
pub use packet::Packet;
pub use privatekey::KeyPair;
pub use version::Version;
