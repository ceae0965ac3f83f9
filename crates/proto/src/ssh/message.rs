//! SSH protocol message numbers and transport-level messages (RFC 4253).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Channel management
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::message::{DisconnectReason, MessageType};
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert_eq!(DisconnectReason::ByApplication as u32, 11);
//! ```

use super::wire::{expect_message, read_bool, read_string, read_u32, write_string};
use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};

/// SSH message numbers used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Terminates the connection.
    Disconnect = 1,
    /// Ignored by the receiver.
    Ignore = 2,
    /// Reply to an unrecognized message.
    Unimplemented = 3,
    /// Debugging information.
    Debug = 4,
    /// Requests a service (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service request accepted.
    ServiceAccept = 6,
    /// Algorithm negotiation.
    KexInit = 20,
    /// Switch to the newly derived keys.
    NewKeys = 21,
    /// DH / ECDH init (shared number for DH group and ECDH methods).
    KexdhInit = 30,
    /// DH / ECDH reply.
    KexdhReply = 31,
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Server accepts a public key offer.
    UserauthPkOk = 60,
    /// Global request.
    GlobalRequest = 80,
    /// Global request success.
    RequestSuccess = 81,
    /// Global request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel request success.
    ChannelSuccess = 99,
    /// Channel request failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use keel_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        let msg = match byte {
            1 => MessageType::Disconnect,
            2 => MessageType::Ignore,
            3 => MessageType::Unimplemented,
            4 => MessageType::Debug,
            5 => MessageType::ServiceRequest,
            6 => MessageType::ServiceAccept,
            20 => MessageType::KexInit,
            21 => MessageType::NewKeys,
            30 => MessageType::KexdhInit,
            31 => MessageType::KexdhReply,
            50 => MessageType::UserauthRequest,
            51 => MessageType::UserauthFailure,
            52 => MessageType::UserauthSuccess,
            53 => MessageType::UserauthBanner,
            60 => MessageType::UserauthPkOk,
            80 => MessageType::GlobalRequest,
            81 => MessageType::RequestSuccess,
            82 => MessageType::RequestFailure,
            90 => MessageType::ChannelOpen,
            91 => MessageType::ChannelOpenConfirmation,
            92 => MessageType::ChannelOpenFailure,
            93 => MessageType::ChannelWindowAdjust,
            94 => MessageType::ChannelData,
            95 => MessageType::ChannelExtendedData,
            96 => MessageType::ChannelEof,
            97 => MessageType::ChannelClose,
            98 => MessageType::ChannelRequest,
            99 => MessageType::ChannelSuccess,
            100 => MessageType::ChannelFailure,
            _ => return None,
        };
        Some(msg)
    }

    /// Returns the RFC name of the message.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }

    /// Transport-layer messages (1-49) may be sent during a key
    /// re-exchange; everything else waits for the new keys.
    pub fn is_transport(byte: u8) -> bool {
        (1..=49).contains(&byte)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
///
/// Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts a wire value to a reason code.
    pub fn from_u32(value: u32) -> Option<Self> {
        let reason = match value {
            1 => DisconnectReason::HostNotAllowedToConnect,
            2 => DisconnectReason::ProtocolError,
            3 => DisconnectReason::KeyExchangeFailed,
            4 => DisconnectReason::Reserved,
            5 => DisconnectReason::MacError,
            6 => DisconnectReason::CompressionError,
            7 => DisconnectReason::ServiceNotAvailable,
            8 => DisconnectReason::ProtocolVersionNotSupported,
            9 => DisconnectReason::HostKeyNotVerifiable,
            10 => DisconnectReason::ConnectionLost,
            11 => DisconnectReason::ByApplication,
            12 => DisconnectReason::TooManyConnections,
            13 => DisconnectReason::AuthCancelledByUser,
            14 => DisconnectReason::NoMoreAuthMethodsAvailable,
            15 => DisconnectReason::IllegalUserName,
            _ => return None,
        };
        Some(reason)
    }
}

/// SSH_MSG_DISCONNECT.
///
/// ```text
/// byte      SSH_MSG_DISCONNECT
/// uint32    reason code
/// string    description in ISO-10646 UTF-8 encoding
/// string    language tag
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    reason_code: u32,
    description: String,
    language_tag: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: &str, language_tag: &str) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.to_string(),
            language_tag: language_tag.to_string(),
        }
    }

    /// Raw reason code (may be outside the standard range).
    pub fn reason_code(&self) -> u32 {
        self.reason_code
    }

    /// Reason as a known code.
    pub fn reason(&self) -> Option<DisconnectReason> {
        DisconnectReason::from_u32(self.reason_code)
    }

    /// Human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Language tag.
    pub fn language_tag(&self) -> &str {
        &self.language_tag
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(data, MessageType::Disconnect as u8, "SSH_MSG_DISCONNECT")?;
        let mut offset = 1;
        let reason_code = read_u32(data, &mut offset)?;
        let description = read_string(data, &mut offset)?;
        // Some peers omit the language tag.
        let language_tag = read_string(data, &mut offset).unwrap_or_default();
        Ok(Self {
            reason_code,
            description,
            language_tag,
        })
    }

    /// Converts a received disconnect into the session error it causes.
    pub fn into_error(self) -> KeelError {
        KeelError::Disconnected {
            reason: self.reason_code,
            description: self.description,
        }
    }
}

/// SSH_MSG_SERVICE_REQUEST.
pub fn service_request(service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::ServiceRequest as u8);
    write_string(&mut buf, service);
    buf.to_vec()
}

/// Parses SSH_MSG_SERVICE_ACCEPT and returns the accepted service name.
pub fn parse_service_accept(data: &[u8]) -> KeelResult<String> {
    expect_message(data, MessageType::ServiceAccept as u8, "SSH_MSG_SERVICE_ACCEPT")?;
    let mut offset = 1;
    read_string(data, &mut offset)
}

/// SSH_MSG_UNIMPLEMENTED for the packet with the given sequence number.
pub fn unimplemented(sequence_number: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence_number);
    buf.to_vec()
}

/// Parses SSH_MSG_DEBUG and returns (always_display, message).
pub fn parse_debug(data: &[u8]) -> KeelResult<(bool, String)> {
    expect_message(data, MessageType::Debug as u8, "SSH_MSG_DEBUG")?;
    let mut offset = 1;
    let always_display = read_bool(data, &mut offset)?;
    let message = read_string(data, &mut offset)?;
    Ok((always_display, message))
}

/// Parses SSH_MSG_GLOBAL_REQUEST and returns (request name, want_reply).
pub fn parse_global_request(data: &[u8]) -> KeelResult<(String, bool)> {
    expect_message(data, MessageType::GlobalRequest as u8, "SSH_MSG_GLOBAL_REQUEST")?;
    let mut offset = 1;
    let name = read_string(data, &mut offset)?;
    let want_reply = read_bool(data, &mut offset)?;
    Ok((name, want_reply))
}

/// SSH_MSG_REQUEST_FAILURE.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(60), Some(MessageType::UserauthPkOk));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_transport_range() {
        assert!(MessageType::is_transport(MessageType::KexdhReply as u8));
        assert!(MessageType::is_transport(MessageType::Ignore as u8));
        assert!(!MessageType::is_transport(MessageType::UserauthRequest as u8));
        assert!(!MessageType::is_transport(MessageType::ChannelData as u8));
    }

    #[test]
    fn test_disconnect_reason_wire_values() {
        assert_eq!(DisconnectReason::HostNotAllowedToConnect as u32, 1);
        assert_eq!(DisconnectReason::Reserved as u32, 4);
        assert_eq!(DisconnectReason::ByApplication as u32, 11);
        assert_eq!(DisconnectReason::IllegalUserName as u32, 15);
        for code in 1..=15 {
            assert_eq!(DisconnectReason::from_u32(code).unwrap() as u32, code);
        }
        assert_eq!(DisconnectReason::from_u32(0), None);
        assert_eq!(DisconnectReason::from_u32(16), None);
    }

    #[test]
    fn test_disconnect_message() {
        let msg = Disconnect::new(DisconnectReason::ByApplication, "bye", "en");
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &11u32.to_be_bytes());

        let parsed = Disconnect::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.reason(), Some(DisconnectReason::ByApplication));
        assert_eq!(parsed.description(), "bye");
        assert_eq!(parsed.language_tag(), "en");

        match parsed.into_error() {
            KeelError::Disconnected {
                reason,
                description,
            } => {
                assert_eq!(reason, 11);
                assert_eq!(description, "bye");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_without_language_tag() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u32(2);
        write_string(&mut buf, "bad packet");
        let parsed = Disconnect::from_bytes(&buf).unwrap();
        assert_eq!(parsed.reason(), Some(DisconnectReason::ProtocolError));
        assert_eq!(parsed.language_tag(), "");
    }

    #[test]
    fn test_service_messages() {
        let req = service_request("ssh-userauth");
        assert_eq!(req[0], MessageType::ServiceRequest as u8);

        let mut accept = req.clone();
        accept[0] = MessageType::ServiceAccept as u8;
        assert_eq!(parse_service_accept(&accept).unwrap(), "ssh-userauth");
        assert!(parse_service_accept(&req).is_err());
    }

    #[test]
    fn test_global_request_parse() {
        let mut buf = BytesMut::new();
        buf.put_u8(80);
        write_string(&mut buf, "hostkeys-00@openssh.com");
        buf.put_u8(0);
        let (name, want_reply) = parse_global_request(&buf).unwrap();
        assert_eq!(name, "hostkeys-00@openssh.com");
        assert!(!want_reply);
    }
}
