//! Protocol engine for the keel SSH client.
//!
//! This crate provides an SSH2 client engine:
//!
//! - **Transport** - version exchange, binary packet codec, key exchange, rekey
//! - **Authentication** - password and public-key user authentication
//! - **Connection** - multiplexed session channels for remote command execution
//! - **Trust** - OpenSSH known_hosts lookup and learning
//!
//! # Features
//!
//! - `ssh` (default) - SSH client support
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::{Config, SshClient};
//!
//! # async fn example() -> keel_platform::KeelResult<()> {
//! let client = SshClient::connect("example.com:22", Config::default()).await?;
//! client.authenticate_password("admin", "secret").await?;
//!
//! let output = client.exec("uname -a").await?;
//! println!("{} -> {}", output.status, String::from_utf8_lossy(&output.output));
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Cryptography comes from vetted libraries (`ring`, `ed25519-dalek`, `rsa`, RustCrypto)
//! - Constant-time MAC verification
//! - Secret material is zeroized on drop with `zeroize`
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
