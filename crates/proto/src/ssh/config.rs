//! Client configuration and injected callbacks.
//!
//! Everything here has a working default, so the common case is
//! `Config::default()`. Builders follow the `with_*` pattern:
//!
//! ```rust
//! use std::time::Duration;
//! use keel_proto::ssh::{ClientConfig, Config, Limits, PublicKey};
//!
//! let client = ClientConfig::default()
//!     .with_limits(Limits::default().with_rekey_write_limit(512 * 1024 * 1024))
//!     .with_inactivity_timeout(Some(Duration::from_secs(30)));
//!
//! let config = Config::new(client)
//!     .with_server_key_verifier(|key: &PublicKey| key.name() == "ssh-ed25519")
//!     .with_auth_banner(|banner: &str| println!("{banner}"));
//! assert!(config.check_server_key.is_some());
//! ```

use super::hostkey::PublicKey;
use async_trait::async_trait;
use keel_platform::{KeelError, KeelResult};
use std::sync::Arc;
use std::time::Duration;

/// Smallest `maximum_packet_size` a channel may advertise.
pub const MIN_CHANNEL_PACKET_SIZE: u32 = 1024;

/// Decides whether a server host key is trusted.
///
/// Called on every key exchange, rekeys included. Closures of the form
/// `Fn(&PublicKey) -> bool` implement this trait.
#[async_trait]
pub trait ServerKeyVerifier: Send + Sync {
    /// Returns `true` to accept `server_public_key`.
    async fn check_server_key(&self, server_public_key: &PublicKey) -> bool;
}

#[async_trait]
impl<F> ServerKeyVerifier for F
where
    F: Fn(&PublicKey) -> bool + Send + Sync,
{
    async fn check_server_key(&self, server_public_key: &PublicKey) -> bool {
        self(server_public_key)
    }
}

/// Receives `SSH_MSG_USERAUTH_BANNER` text.
#[async_trait]
pub trait AuthBannerHandler: Send + Sync {
    /// Called once per banner message.
    async fn auth_banner(&self, banner: &str);
}

#[async_trait]
impl<F> AuthBannerHandler for F
where
    F: Fn(&str) + Send + Sync,
{
    async fn auth_banner(&self, banner: &str) {
        self(banner)
    }
}

/// Identification string sent during version exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientId {
    /// Sent with `\r\n` appended
    Standard(String),
    /// Sent verbatim
    Raw(String),
}

impl ClientId {
    /// Bytes written to the socket.
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            ClientId::Standard(id) => format!("{}\r\n", id).into_bytes(),
            ClientId::Raw(id) => id.as_bytes().to_vec(),
        }
    }

    /// Identification string without line terminator, as hashed during KEX.
    pub fn as_hashed(&self) -> &str {
        match self {
            ClientId::Standard(id) => id,
            ClientId::Raw(id) => id.trim_end_matches(['\r', '\n']),
        }
    }
}

impl Default for ClientId {
    fn default() -> Self {
        ClientId::Standard(format!("SSH-2.0-keel_{}", env!("CARGO_PKG_VERSION")))
    }
}

/// Rekey thresholds. Whichever is crossed first starts a new key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Bytes written under one set of keys
    pub rekey_write_limit: u64,
    /// Bytes read under one set of keys
    pub rekey_read_limit: u64,
    /// Time spent under one set of keys
    pub rekey_time_limit: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            rekey_write_limit: 1 << 30,
            rekey_read_limit: 1 << 30,
            rekey_time_limit: Duration::from_secs(3600),
        }
    }
}

impl Limits {
    /// Sets the write limit in bytes.
    pub fn with_rekey_write_limit(mut self, bytes: u64) -> Self {
        self.rekey_write_limit = bytes;
        self
    }

    /// Sets the read limit in bytes.
    pub fn with_rekey_read_limit(mut self, bytes: u64) -> Self {
        self.rekey_read_limit = bytes;
        self
    }

    /// Sets the time limit.
    pub fn with_rekey_time_limit(mut self, limit: Duration) -> Self {
        self.rekey_time_limit = limit;
        self
    }
}

/// Algorithm preference lists, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferred {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Host key algorithms
    pub key: Vec<String>,
    /// Ciphers (both directions)
    pub cipher: Vec<String>,
    /// MACs (both directions, unused with AEAD ciphers)
    pub mac: Vec<String>,
    /// Compression (both directions)
    pub compression: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for Preferred {
    fn default() -> Self {
        Self {
            kex: names(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "diffie-hellman-group14-sha256",
            ]),
            key: names(&["ssh-ed25519", "rsa-sha2-512", "rsa-sha2-256", "ssh-rsa"]),
            cipher: names(&[
                "chacha20-poly1305@openssh.com",
                "aes256-gcm@openssh.com",
                "aes128-gcm@openssh.com",
                "aes256-ctr",
                "aes192-ctr",
                "aes128-ctr",
            ]),
            mac: names(&["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1"]),
            compression: names(&["none", "zlib"]),
        }
    }
}

impl Preferred {
    /// Replaces the key exchange list.
    pub fn with_kex(mut self, list: &[&str]) -> Self {
        self.kex = names(list);
        self
    }

    /// Replaces the host key list.
    pub fn with_key(mut self, list: &[&str]) -> Self {
        self.key = names(list);
        self
    }

    /// Replaces the cipher list.
    pub fn with_cipher(mut self, list: &[&str]) -> Self {
        self.cipher = names(list);
        self
    }

    /// Replaces the MAC list.
    pub fn with_mac(mut self, list: &[&str]) -> Self {
        self.mac = names(list);
        self
    }

    /// Replaces the compression list.
    pub fn with_compression(mut self, list: &[&str]) -> Self {
        self.compression = names(list);
        self
    }
}

/// Per-connection client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identification string
    pub client_id: ClientId,
    /// Rekey thresholds
    pub limits: Limits,
    /// Initial and refill target for channel receive windows
    pub window_size: u32,
    /// Largest channel data packet we accept
    pub maximum_packet_size: u32,
    /// End the session when nothing is read or written for this long
    pub inactivity_timeout: Option<Duration>,
    /// TCP connect timeout for [`SshClient::connect`](super::SshClient::connect)
    pub connect_timeout: Duration,
    /// Skip user authentication entirely
    pub anonymous: bool,
    /// Algorithm preferences
    pub preferred: Preferred,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: ClientId::default(),
            limits: Limits::default(),
            window_size: 2_097_152,
            maximum_packet_size: 32_768,
            inactivity_timeout: None,
            connect_timeout: Duration::from_secs(10),
            anonymous: false,
            preferred: Preferred::default(),
        }
    }
}

impl ClientConfig {
    /// Sets the identification string.
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = client_id;
        self
    }

    /// Sets the rekey limits.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the channel window size.
    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    /// Sets the channel maximum packet size.
    pub fn with_maximum_packet_size(mut self, maximum_packet_size: u32) -> Self {
        self.maximum_packet_size = maximum_packet_size;
        self
    }

    /// Sets or disables the inactivity timeout.
    pub fn with_inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Sets the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables or disables anonymous mode.
    pub fn with_anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Sets the algorithm preferences.
    pub fn with_preferred(mut self, preferred: Preferred) -> Self {
        self.preferred = preferred;
        self
    }

    /// Checks the settings before a connection is attempted.
    pub fn validate(&self) -> KeelResult<()> {
        if self.window_size == 0 {
            return Err(KeelError::Config("window_size must be non-zero".to_string()));
        }
        if self.maximum_packet_size < MIN_CHANNEL_PACKET_SIZE {
            return Err(KeelError::Config(format!(
                "maximum_packet_size must be at least {}",
                MIN_CHANNEL_PACKET_SIZE
            )));
        }
        if self.limits.rekey_write_limit == 0 || self.limits.rekey_read_limit == 0 {
            return Err(KeelError::Config("rekey byte limits must be non-zero".to_string()));
        }
        if self.limits.rekey_time_limit.is_zero() {
            return Err(KeelError::Config("rekey_time_limit must be non-zero".to_string()));
        }
        if self.inactivity_timeout.is_some_and(|t| t.is_zero()) {
            return Err(KeelError::Config(
                "inactivity_timeout must be non-zero when set".to_string(),
            ));
        }

        let id = self.client_id.as_hashed();
        if !id.starts_with("SSH-2.0-") || id.len() > super::version::MAX_VERSION_LENGTH {
            return Err(KeelError::Config(format!(
                "client_id must start with SSH-2.0- and fit in {} bytes",
                super::version::MAX_VERSION_LENGTH
            )));
        }

        let preferred = &self.preferred;
        for (category, list) in [
            ("kex", &preferred.kex),
            ("host key", &preferred.key),
            ("cipher", &preferred.cipher),
            ("compression", &preferred.compression),
        ] {
            if list.is_empty() {
                return Err(KeelError::Config(format!(
                    "{} preference list is empty",
                    category
                )));
            }
        }
        Ok(())
    }
}

/// Everything needed to open a session.
#[derive(Clone, Default)]
pub struct Config {
    /// Client settings
    pub client: ClientConfig,
    /// Host key trust decision; without one every host key is accepted
    pub check_server_key: Option<Arc<dyn ServerKeyVerifier>>,
    /// Banner sink
    pub auth_banner: Option<Arc<dyn AuthBannerHandler>>,
}

impl Config {
    /// Config with the given client settings and no callbacks.
    pub fn new(client: ClientConfig) -> Self {
        Self {
            client,
            check_server_key: None,
            auth_banner: None,
        }
    }

    /// Installs a host key verifier.
    pub fn with_server_key_verifier<V: ServerKeyVerifier + 'static>(mut self, verifier: V) -> Self {
        self.check_server_key = Some(Arc::new(verifier));
        self
    }

    /// Installs a banner handler.
    pub fn with_auth_banner<H: AuthBannerHandler + 'static>(mut self, handler: H) -> Self {
        self.auth_banner = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("client", &self.client)
            .field("check_server_key", &self.check_server_key.is_some())
            .field("auth_banner", &self.auth_banner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::KeyPair;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.window_size, 2_097_152);
        assert_eq!(config.maximum_packet_size, 32_768);
        assert_eq!(config.limits.rekey_write_limit, 1 << 30);
        assert_eq!(config.limits.rekey_time_limit, Duration::from_secs(3600));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.inactivity_timeout.is_none());
        assert!(!config.anonymous);
        assert!(config.validate().is_ok());
        assert_eq!(config.preferred.compression[0], "none");
    }

    #[test]
    fn test_client_id_wire_forms() {
        let standard = ClientId::Standard("SSH-2.0-test".to_string());
        assert_eq!(standard.to_wire(), b"SSH-2.0-test\r\n");
        assert_eq!(standard.as_hashed(), "SSH-2.0-test");

        let raw = ClientId::Raw("SSH-2.0-raw\r\n".to_string());
        assert_eq!(raw.to_wire(), b"SSH-2.0-raw\r\n");
        assert_eq!(raw.as_hashed(), "SSH-2.0-raw");

        assert!(ClientId::default().as_hashed().starts_with("SSH-2.0-keel_"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ClientConfig::default().with_window_size(0).validate().is_err());
        assert!(ClientConfig::default()
            .with_maximum_packet_size(10)
            .validate()
            .is_err());
        assert!(ClientConfig::default()
            .with_client_id(ClientId::Standard("HTTP/1.1".to_string()))
            .validate()
            .is_err());
        assert!(ClientConfig::default()
            .with_preferred(Preferred::default().with_cipher(&[]))
            .validate()
            .is_err());
        assert!(ClientConfig::default()
            .with_inactivity_timeout(Some(Duration::ZERO))
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_closures_are_callbacks() {
        let config = Config::default()
            .with_server_key_verifier(|key: &PublicKey| key.name() == "ssh-ed25519");
        let verifier = config.check_server_key.clone().unwrap();
        let key = KeyPair::generate_ed25519().clone_public_key();
        assert!(verifier.check_server_key(&key).await);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = config.with_auth_banner(move |banner: &str| {
            sink.lock().unwrap().push(banner.to_string());
        });
        config.auth_banner.unwrap().auth_banner("welcome").await;
        assert_eq!(*seen.lock().unwrap(), vec!["welcome".to_string()]);
    }

    #[test]
    fn test_debug_shows_callback_presence() {
        let rendered = format!("{:?}", Config::default());
        assert!(rendered.contains("check_server_key: false"));
    }
}
