//! SSH connection protocol messages (RFC 4254).
//!
//! Only what an exec-style client needs is modeled:
//! - session channels
//! - flow control (WINDOW_ADJUST, DATA, EXTENDED_DATA)
//! - the `exec`, `exit-status` and `exit-signal` channel requests
//!
//! Channel requests and channel types the client does not know are still
//! parsed far enough to be refused.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen::new(ChannelType::Session, 0, 2_097_152, 32_768);
//! assert_eq!(open.to_bytes()[0], 90);
//! ```

use super::message::MessageType;
use super::wire::{
    expect_message, read_bool, read_bytes, read_string, read_u32, write_bool, write_bytes,
    write_string,
};
use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};

/// Largest window either side may advertise (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Largest packet size either side may advertise (256 KB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Reads the recipient channel of a message in the 91..=100 range.
pub fn recipient_channel(payload: &[u8]) -> KeelResult<u32> {
    let mut offset = 1;
    read_u32(payload, &mut offset)
}

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (exec)
    Session,
    /// Any other type; its specific data is not parsed
    Other(String),
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
///
/// ```text
/// byte      SSH_MSG_CHANNEL_OPEN (90)
/// string    channel type
/// uint32    sender channel
/// uint32    initial window size
/// uint32    maximum packet size
/// ....      channel type specific data
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        write_string(&mut buf, self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] if the data is invalid.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(data, MessageType::ChannelOpen as u8, "SSH_MSG_CHANNEL_OPEN")?;

        let mut offset = 1;
        let type_name = read_string(data, &mut offset)?;
        let sender_channel = read_u32(data, &mut offset)?;
        let initial_window_size = read_u32(data, &mut offset)?;
        let maximum_packet_size = read_u32(data, &mut offset)?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            _ => ChannelType::Other(type_name),
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new channel open confirmation message.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    ///
    /// A maximum packet size above [`MAX_PACKET_SIZE`] is clamped, not
    /// rejected.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(
            data,
            MessageType::ChannelOpenConfirmation as u8,
            "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
        )?;

        let mut offset = 1;
        let recipient_channel = read_u32(data, &mut offset)?;
        let sender_channel = read_u32(data, &mut offset)?;
        let initial_window_size = read_u32(data, &mut offset)?;
        let maximum_packet_size = read_u32(data, &mut offset)?.min(MAX_PACKET_SIZE);

        if maximum_packet_size == 0 {
            return Err(KeelError::Protocol(
                "CHANNEL_OPEN_CONFIRMATION with zero maximum packet size".to_string(),
            ));
        }

        Ok(Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
///
/// The reason code is kept raw; servers may send private values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: u32,
    description: String,
    language_tag: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the reason's standard description.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self::with_description(recipient_channel, reason, reason.as_str())
    }

    /// Creates a failure with a custom description.
    pub fn with_description(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: &str,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: description.to_string(),
            language_tag: String::new(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the raw reason code.
    pub fn reason_code(&self) -> u32 {
        self.reason_code
    }

    /// Returns the reason, if it is a standard one.
    pub fn reason(&self) -> Option<ChannelOpenFailureReason> {
        ChannelOpenFailureReason::from_u32(self.reason_code)
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Converts into the error surfaced to the caller.
    pub fn into_error(self) -> KeelError {
        KeelError::ChannelOpenFailed {
            reason: self.reason_code,
            description: self.description,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(
            data,
            MessageType::ChannelOpenFailure as u8,
            "SSH_MSG_CHANNEL_OPEN_FAILURE",
        )?;

        let mut offset = 1;
        let recipient_channel = read_u32(data, &mut offset)?;
        let reason_code = read_u32(data, &mut offset)?;
        let description = read_string(data, &mut offset)?;
        let language_tag = read_string(data, &mut offset).unwrap_or_default();

        Ok(Self {
            recipient_channel,
            reason_code,
            description,
            language_tag,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the number of bytes to add.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(
            data,
            MessageType::ChannelWindowAdjust as u8,
            "SSH_MSG_CHANNEL_WINDOW_ADJUST",
        )?;
        let mut offset = 1;
        let recipient_channel = read_u32(data, &mut offset)?;
        let bytes_to_add = read_u32(data, &mut offset)?;
        Ok(Self {
            recipient_channel,
            bytes_to_add,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new channel data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Takes the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(data, MessageType::ChannelData as u8, "SSH_MSG_CHANNEL_DATA")?;
        let mut offset = 1;
        let recipient_channel = read_u32(data, &mut offset)?;
        let data = read_bytes(data, &mut offset)?;
        Ok(Self {
            recipient_channel,
            data,
        })
    }
}

/// Extended data type code (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExtendedDataType {
    /// Stderr data
    Stderr = 1,
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (RFC 4254 Section 5.2).
///
/// The type code is kept raw; only [`ExtendedDataType::Stderr`] is defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: u32,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates a new extended data message.
    pub fn new(recipient_channel: u32, data_type: ExtendedDataType, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code: data_type as u32,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the raw data type code.
    pub fn data_type_code(&self) -> u32 {
        self.data_type_code
    }

    /// Returns true for stderr data.
    pub fn is_stderr(&self) -> bool {
        self.data_type_code == ExtendedDataType::Stderr as u32
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Takes the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(
            data,
            MessageType::ChannelExtendedData as u8,
            "SSH_MSG_CHANNEL_EXTENDED_DATA",
        )?;
        let mut offset = 1;
        let recipient_channel = read_u32(data, &mut offset)?;
        let data_type_code = read_u32(data, &mut offset)?;
        let data = read_bytes(data, &mut offset)?;
        Ok(Self {
            recipient_channel,
            data_type_code,
            data,
        })
    }
}

macro_rules! recipient_only_message {
    ($(#[$doc:meta])* $name:ident, $msg:ident, $wire_name:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            recipient_channel: u32,
        }

        impl $name {
            /// Creates the message.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Returns the recipient channel number.
            pub fn recipient_channel(&self) -> u32 {
                self.recipient_channel
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8(MessageType::$msg as u8);
                buf.put_u32(self.recipient_channel);
                buf.to_vec()
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
                expect_message(data, MessageType::$msg as u8, $wire_name)?;
                Ok(Self {
                    recipient_channel: recipient_channel(data)?,
                })
            }
        }
    };
}

recipient_only_message!(
    /// SSH_MSG_CHANNEL_EOF (RFC 4254 Section 5.3).
    ChannelEof,
    ChannelEof,
    "SSH_MSG_CHANNEL_EOF"
);

recipient_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE (RFC 4254 Section 5.3).
    ChannelClose,
    ChannelClose,
    "SSH_MSG_CHANNEL_CLOSE"
);

recipient_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS (RFC 4254 Section 5.4).
    ChannelSuccess,
    ChannelSuccess,
    "SSH_MSG_CHANNEL_SUCCESS"
);

recipient_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE (RFC 4254 Section 5.4).
    ChannelFailure,
    ChannelFailure,
    "SSH_MSG_CHANNEL_FAILURE"
);

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Exit status of the remote command
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// The remote command was killed by a signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// Any other request; its specific data is not parsed
    Other(String),
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 6).
///
/// ```text
/// byte      SSH_MSG_CHANNEL_REQUEST (98)
/// uint32    recipient channel
/// string    request type
/// boolean   want reply
/// ....      type-specific data
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        write_string(&mut buf, self.request_type.name());
        write_bool(&mut buf, self.want_reply);

        match &self.request_type {
            ChannelRequestType::Exec { command } => {
                write_string(&mut buf, command);
            }
            ChannelRequestType::ExitStatus { exit_status } => {
                buf.put_u32(*exit_status);
            }
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                write_string(&mut buf, signal_name);
                write_bool(&mut buf, *core_dumped);
                write_string(&mut buf, error_message);
                write_string(&mut buf, language_tag);
            }
            ChannelRequestType::Other(_) => {}
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        expect_message(
            data,
            MessageType::ChannelRequest as u8,
            "SSH_MSG_CHANNEL_REQUEST",
        )?;

        let mut offset = 1;
        let recipient_channel = read_u32(data, &mut offset)?;
        let request_name = read_string(data, &mut offset)?;
        let want_reply = read_bool(data, &mut offset)?;

        let request_type = match request_name.as_str() {
            "exec" => ChannelRequestType::Exec {
                command: read_string(data, &mut offset)?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: read_u32(data, &mut offset)?,
            },
            "exit-signal" => {
                let signal_name = read_string(data, &mut offset)?;
                let core_dumped = read_bool(data, &mut offset)?;
                let error_message = read_string(data, &mut offset)?;
                let language_tag = read_string(data, &mut offset).unwrap_or_default();
                ChannelRequestType::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    language_tag,
                }
            }
            _ => ChannelRequestType::Other(request_name),
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_session() {
        let open = ChannelOpen::new(ChannelType::Session, 3, 2_097_152, 32_768);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
        assert_eq!(parsed.channel_type().name(), "session");
    }

    #[test]
    fn test_channel_open_unknown_type_kept() {
        let mut buf = BytesMut::new();
        buf.put_u8(90);
        write_string(&mut buf, "x11");
        buf.put_u32(7);
        buf.put_u32(1024);
        buf.put_u32(1024);
        write_string(&mut buf, "127.0.0.1");
        buf.put_u32(6010);

        let parsed = ChannelOpen::from_bytes(&buf).unwrap();
        assert_eq!(parsed.channel_type(), &ChannelType::Other("x11".to_string()));
        assert_eq!(parsed.sender_channel(), 7);
    }

    #[test]
    fn test_confirmation_clamps_packet_size() {
        let confirm = ChannelOpenConfirmation::new(0, 9, 1_000, 1 << 30);
        let parsed = ChannelOpenConfirmation::from_bytes(&confirm.to_bytes()).unwrap();
        assert_eq!(parsed.sender_channel(), 9);
        assert_eq!(parsed.maximum_packet_size(), MAX_PACKET_SIZE);

        let zero = ChannelOpenConfirmation::new(0, 9, 1_000, 0);
        assert!(ChannelOpenConfirmation::from_bytes(&zero.to_bytes()).is_err());
    }

    #[test]
    fn test_confirmation_wrong_type_names_message() {
        match ChannelOpenConfirmation::from_bytes(&[3, 0, 0, 0, 0]) {
            Err(KeelError::Protocol(msg)) => assert_eq!(
                msg,
                "Invalid message type: expected 91 (SSH_MSG_CHANNEL_OPEN_CONFIRMATION), got 3"
            ),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_open_failure_into_error() {
        let failure = ChannelOpenFailure::new(0, ChannelOpenFailureReason::ResourceShortage);
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.reason(), Some(ChannelOpenFailureReason::ResourceShortage));

        match parsed.into_error() {
            KeelError::ChannelOpenFailed {
                reason,
                description,
            } => {
                assert_eq!(reason, 4);
                assert_eq!(description, "Resource shortage");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_data_messages() {
        let data = ChannelData::new(5, b"hello".to_vec());
        let parsed = ChannelData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 5);
        assert_eq!(parsed.into_data(), b"hello");

        let ext = ChannelExtendedData::new(5, ExtendedDataType::Stderr, b"oops".to_vec());
        let parsed = ChannelExtendedData::from_bytes(&ext.to_bytes()).unwrap();
        assert!(parsed.is_stderr());
        assert_eq!(parsed.data(), b"oops");

        // Truncated length prefix.
        assert!(ChannelData::from_bytes(&[94, 0, 0, 0, 5, 0, 0, 0, 9, b'x']).is_err());
    }

    #[test]
    fn test_recipient_only_messages() {
        assert_eq!(ChannelEof::new(1).to_bytes(), vec![96, 0, 0, 0, 1]);
        assert_eq!(ChannelClose::from_bytes(&[97, 0, 0, 1, 0]).unwrap().recipient_channel(), 256);
        assert_eq!(ChannelSuccess::new(2).to_bytes()[0], 99);
        assert!(ChannelFailure::from_bytes(&[100, 0, 0]).is_err());
        assert_eq!(recipient_channel(&ChannelWindowAdjust::new(4, 10).to_bytes()).unwrap(), 4);
    }

    #[test]
    fn test_channel_request_exec() {
        let request = ChannelRequest::new(
            1,
            ChannelRequestType::Exec {
                command: "echo hi".to_string(),
            },
            true,
        );
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_channel_request_exit_signal() {
        let request = ChannelRequest::new(
            0,
            ChannelRequestType::ExitSignal {
                signal_name: "TERM".to_string(),
                core_dumped: false,
                error_message: "terminated".to_string(),
                language_tag: String::new(),
            },
            false,
        );
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed.request_type().name(), "exit-signal");
        assert!(!parsed.want_reply());
    }

    #[test]
    fn test_channel_request_unknown_kept() {
        let mut buf = BytesMut::new();
        buf.put_u8(98);
        buf.put_u32(0);
        write_string(&mut buf, "keepalive@openssh.com");
        write_bool(&mut buf, true);

        let parsed = ChannelRequest::from_bytes(&buf).unwrap();
        assert_eq!(
            parsed.request_type(),
            &ChannelRequestType::Other("keepalive@openssh.com".to_string())
        );
        assert!(parsed.want_reply());
    }
}
