//! Error types for keel

use thiserror::Error;

/// Unified error type for all keel operations
#[derive(Debug, Error)]
pub enum KeelError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or integrity-failed traffic. Always fatal to the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No algorithm in common for a mandatory negotiation category
    #[error("No common {category} algorithm (client: {client}, server: {server})")]
    Negotiation {
        /// Category name, e.g. "kex" or "cipher client->server"
        category: String,
        /// Client name-list as sent
        client: String,
        /// Server name-list as received
        server: String,
    },

    /// The server key verifier declined the host key
    #[error("Host key rejected: {fingerprint}")]
    HostKeyRejected {
        /// SHA-256 fingerprint of the rejected key
        fingerprint: String,
    },

    /// known_hosts holds a different key for this host
    #[error("Host key changed (known_hosts line {line})")]
    HostKeyChanged {
        /// 1-based line number of the conflicting entry
        line: usize,
    },

    /// The server rejected an authentication attempt
    #[error("Authentication failed (remaining methods: {}, partial success: {partial})", .remaining.join(","))]
    AuthenticationFailed {
        /// Methods the server is still willing to accept
        remaining: Vec<String>,
        /// Partial success flag from SSH_MSG_USERAUTH_FAILURE
        partial: bool,
    },

    /// API called out of lifecycle order
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No traffic crossed the wire within the configured interval
    #[error("Session closed after inactivity timeout")]
    InactivityTimeout,

    /// Unsupported or corrupt private key
    #[error("Key format error: {0}")]
    KeyFormat(String),

    /// Missing or wrong passphrase for an encrypted key
    #[error("Key decryption error: {0}")]
    Decryption(String),

    /// The server refused to open a channel
    #[error("Channel open failed (reason {reason}): {description}")]
    ChannelOpenFailed {
        /// SSH_OPEN_* reason code
        reason: u32,
        /// Server supplied description
        description: String,
    },

    /// A channel request was refused or the channel misbehaved
    #[error("Channel error: {0}")]
    Channel(String),

    /// The peer sent SSH_MSG_DISCONNECT
    #[error("Disconnected by peer (reason {reason}): {description}")]
    Disconnected {
        /// SSH_DISCONNECT_* reason code
        reason: u32,
        /// Peer supplied description
        description: String,
    },

    /// The session has ended
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl KeelError {
    /// Returns true if the error ends the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KeelError::Io(_)
                | KeelError::Protocol(_)
                | KeelError::Negotiation { .. }
                | KeelError::HostKeyRejected { .. }
                | KeelError::InactivityTimeout
                | KeelError::Disconnected { .. }
                | KeelError::ConnectionClosed
        )
    }
}

/// Result type for keel operations
pub type KeelResult<T> = Result<T, KeelError>;
