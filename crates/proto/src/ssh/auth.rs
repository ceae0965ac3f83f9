//! SSH user authentication (RFC 4252), client side.
//!
//! Supported methods:
//! - "password"
//! - "publickey" with Ed25519 and RSA keys, sent signed in one step
//!
//! [`Authenticator`] is IO-free. The caller picks a method, hands the
//! encoded request to [`Authenticator::begin`], sends what it returns and
//! feeds server replies to [`Authenticator::handle`].
//!
//! ```text
//! NotAuthenticated ──SERVICE_ACCEPT──> MethodOffered ──request──> MethodAttempt
//!     MethodAttempt ──SUCCESS──> Authenticated
//!     MethodAttempt ──FAILURE──> MethodOffered, or Exhausted when no methods remain
//! ```
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new(
//!     "alice",
//!     "ssh-connection",
//!     AuthMethod::Password("secret".to_string()),
//! );
//! assert_eq!(request.to_bytes()[0], 50);
//! ```

use super::message::{self, MessageType};
use super::privatekey::KeyPair;
use super::wire::{
    expect_message, read_bool, read_bytes, read_name_list, read_string, write_bool, write_bytes,
    write_name_list, write_string,
};
use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};
use std::path::PathBuf;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

/// Service requested before authentication.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service started after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// "none", used to query the server's method list
    None,
    /// Password authentication
    Password(String),
    /// Public key authentication
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519", "rsa-sha2-256")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature blob, if present
        signature: Option<Vec<u8>>,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
///
/// ```text
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    method name
/// ....      method specific fields
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request. The result may hold a password.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::UserauthRequest as u8);
        write_string(&mut buf, &self.user_name);
        write_string(&mut buf, &self.service_name);
        write_string(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                // not changing the password
                write_bool(&mut buf, false);
                write_string(&mut buf, password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                write_bool(&mut buf, signature.is_some());
                write_string(&mut buf, algorithm);
                write_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    write_bytes(&mut buf, sig);
                }
            }
        }

        let bytes = Zeroizing::new(buf.to_vec());
        buf[..].zeroize();
        bytes
    }

    /// Parses a request.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(
            data,
            MessageType::UserauthRequest as u8,
            "SSH_MSG_USERAUTH_REQUEST",
        )?;

        let mut offset = 1;
        let user_name = read_string(data, &mut offset)?;
        let service_name = read_string(data, &mut offset)?;
        let method_name = read_string(data, &mut offset)?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = read_bool(data, &mut offset)?;
                AuthMethod::Password(read_string(data, &mut offset)?)
            }
            "publickey" => {
                let has_signature = read_bool(data, &mut offset)?;
                let algorithm = read_string(data, &mut offset)?;
                let public_key = read_bytes(data, &mut offset)?;
                let signature = if has_signature {
                    Some(read_bytes(data, &mut offset)?)
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            _ => {
                return Err(KeelError::Protocol(format!(
                    "Unsupported authentication method: '{}'",
                    method_name
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Methods the server still accepts.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Whether the attempted method succeeded but more are required.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        write_name_list(&mut buf, &self.methods_can_continue);
        write_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(
            data,
            MessageType::UserauthFailure as u8,
            "SSH_MSG_USERAUTH_FAILURE",
        )?;
        let mut offset = 1;
        let methods_can_continue = read_name_list(data, &mut offset)?;
        let partial_success = read_bool(data, &mut offset)?;

        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language_tag: String,
}

impl AuthBanner {
    /// Creates a banner with an empty language tag.
    pub fn new(message: String) -> Self {
        Self {
            message,
            language_tag: String::new(),
        }
    }

    /// Returns the banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        write_string(&mut buf, &self.message);
        write_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(
            data,
            MessageType::UserauthBanner as u8,
            "SSH_MSG_USERAUTH_BANNER",
        )?;
        let mut offset = 1;
        let message = read_string(data, &mut offset)?;
        let language_tag = read_string(data, &mut offset).unwrap_or_default();

        Ok(Self {
            message,
            language_tag,
        })
    }
}

/// Builds the data signed for publickey authentication (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();

    write_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    write_string(&mut buf, user_name);
    write_string(&mut buf, service_name);
    write_string(&mut buf, "publickey");
    write_bool(&mut buf, true);
    write_string(&mut buf, algorithm);
    write_bytes(&mut buf, public_key_blob);

    buf.to_vec()
}

/// Builds a password request.
pub fn password_request(user: &str, password: &str) -> Zeroizing<Vec<u8>> {
    AuthRequest::new(
        user,
        CONNECTION_SERVICE,
        AuthMethod::Password(password.to_string()),
    )
    .to_bytes()
}

/// Builds a signed publickey request.
///
/// For RSA keys the algorithm follows the key's [`SignatureHash`](super::SignatureHash).
pub fn public_key_request(
    user: &str,
    key: &KeyPair,
    session_id: &[u8],
) -> KeelResult<Zeroizing<Vec<u8>>> {
    let algorithm = key.name();
    let blob = key.clone_public_key().to_blob();
    let data = construct_signature_data(session_id, user, CONNECTION_SERVICE, algorithm, &blob);
    let signature = key.sign_detached(&data)?;

    Ok(AuthRequest::new(
        user,
        CONNECTION_SERVICE,
        AuthMethod::PublicKey {
            algorithm: algorithm.to_string(),
            public_key: blob,
            signature: Some(signature.to_blob()),
        },
    )
    .to_bytes())
}

/// Which key to authenticate with.
#[derive(Debug, Clone)]
pub enum KeyAuth {
    /// `~/.ssh/id_rsa`, unencrypted
    Default,
    /// A key file, unencrypted
    Path(PathBuf),
    /// An already loaded key
    KeyPair(KeyPair),
}

impl KeyAuth {
    /// Loads the key.
    pub fn resolve(self) -> KeelResult<KeyPair> {
        match self {
            KeyAuth::Default => KeyPair::load_default(None),
            KeyAuth::Path(path) => KeyPair::load_from_path(path, None),
            KeyAuth::KeyPair(key) => Ok(key),
        }
    }
}

/// Authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// `ssh-userauth` not yet accepted
    NotAuthenticated,
    /// Ready for an attempt
    MethodOffered,
    /// A request is outstanding
    MethodAttempt,
    /// Done
    Authenticated,
    /// The server has no methods left to offer
    Exhausted,
}

/// What a server message meant for the current attempt.
#[derive(Debug)]
pub enum AuthStep {
    /// Send these payloads
    Send(Vec<Zeroizing<Vec<u8>>>),
    /// Show this banner, keep waiting
    Banner(String),
    /// The attempt finished: `Ok(true)` authenticated, `Ok(false)` partial
    /// success, `Err` rejected
    Done(KeelResult<bool>),
}

/// IO-free client authentication state machine.
#[derive(Debug)]
pub struct Authenticator {
    state: AuthState,
    service_requested: bool,
    pending: Option<Zeroizing<Vec<u8>>>,
    remaining: Vec<String>,
}

impl Authenticator {
    /// Creates the state machine. Anonymous sessions start authenticated.
    pub fn new(anonymous: bool) -> Self {
        Self {
            state: if anonymous {
                AuthState::Authenticated
            } else {
                AuthState::NotAuthenticated
            },
            service_requested: false,
            pending: None,
            remaining: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Returns true once authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Methods the server listed in its last failure.
    pub fn remaining(&self) -> &[String] {
        &self.remaining
    }

    /// Checks that an attempt may start now.
    pub fn ensure_ready(&self) -> KeelResult<()> {
        match self.state {
            AuthState::NotAuthenticated | AuthState::MethodOffered => Ok(()),
            AuthState::MethodAttempt => Err(KeelError::InvalidState(
                "Authentication attempt already in progress".to_string(),
            )),
            AuthState::Authenticated => Err(KeelError::InvalidState(
                "Already authenticated".to_string(),
            )),
            AuthState::Exhausted => Err(KeelError::InvalidState(
                "No authentication methods remain".to_string(),
            )),
        }
    }

    /// Starts an attempt with an encoded USERAUTH_REQUEST.
    ///
    /// Before the service is accepted the request is held back and a
    /// SERVICE_REQUEST goes out instead.
    pub fn begin(&mut self, request: Zeroizing<Vec<u8>>) -> KeelResult<Vec<Zeroizing<Vec<u8>>>> {
        self.ensure_ready()?;

        let out = match self.state {
            AuthState::NotAuthenticated => {
                self.pending = Some(request);
                if self.service_requested {
                    Vec::new()
                } else {
                    self.service_requested = true;
                    vec![Zeroizing::new(message::service_request(USERAUTH_SERVICE))]
                }
            }
            _ => vec![request],
        };
        self.state = AuthState::MethodAttempt;
        Ok(out)
    }

    /// Handles an authentication-layer message.
    pub fn handle(&mut self, payload: &[u8]) -> KeelResult<AuthStep> {
        let msg_type = payload.first().copied().unwrap_or(0);

        match MessageType::from_u8(msg_type) {
            Some(MessageType::ServiceAccept) => {
                let service = message::parse_service_accept(payload)?;
                if service != USERAUTH_SERVICE {
                    return Err(KeelError::Protocol(format!(
                        "Server accepted unexpected service '{}'",
                        service
                    )));
                }
                let request = self.pending.take().ok_or_else(|| {
                    KeelError::Protocol("Unexpected SSH_MSG_SERVICE_ACCEPT".to_string())
                })?;
                debug!("Service ssh-userauth accepted");
                Ok(AuthStep::Send(vec![request]))
            }
            Some(MessageType::UserauthBanner) => {
                let banner = AuthBanner::from_bytes(payload)?;
                Ok(AuthStep::Banner(banner.message().to_string()))
            }
            Some(MessageType::UserauthSuccess) => {
                self.expect_attempt("SSH_MSG_USERAUTH_SUCCESS")?;
                self.state = AuthState::Authenticated;
                self.remaining.clear();
                info!("Authenticated");
                Ok(AuthStep::Done(Ok(true)))
            }
            Some(MessageType::UserauthFailure) => {
                self.expect_attempt("SSH_MSG_USERAUTH_FAILURE")?;
                let failure = AuthFailure::from_bytes(payload)?;
                self.remaining = failure.methods_can_continue().to_vec();

                if failure.partial_success() {
                    self.state = AuthState::MethodOffered;
                    debug!(remaining = ?self.remaining, "Partial authentication success");
                    return Ok(AuthStep::Done(Ok(false)));
                }

                self.state = if self.remaining.is_empty() {
                    AuthState::Exhausted
                } else {
                    AuthState::MethodOffered
                };
                info!(remaining = ?self.remaining, "Authentication failed");
                Ok(AuthStep::Done(Err(KeelError::AuthenticationFailed {
                    remaining: self.remaining.clone(),
                    partial: false,
                })))
            }
            // 60 is PASSWD_CHANGEREQ here; publickey attempts are always signed.
            Some(MessageType::UserauthPkOk) => {
                self.expect_attempt("SSH_MSG_USERAUTH_PASSWD_CHANGEREQ")?;
                let mut offset = 1;
                let prompt = read_string(payload, &mut offset).unwrap_or_default();
                self.state = AuthState::MethodOffered;
                info!(prompt = %prompt, "Server requires a password change");
                Ok(AuthStep::Done(Err(KeelError::AuthenticationFailed {
                    remaining: self.remaining.clone(),
                    partial: false,
                })))
            }
            _ => Err(KeelError::Protocol(format!(
                "Unexpected message {} during authentication",
                msg_type
            ))),
        }
    }

    fn expect_attempt(&self, name: &str) -> KeelResult<()> {
        if self.state == AuthState::MethodAttempt && self.pending.is_none() {
            Ok(())
        } else {
            Err(KeelError::Protocol(format!("Unexpected {}", name)))
        }
    }
}
