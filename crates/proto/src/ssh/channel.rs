//! Channel multiplexing and flow control (RFC 4254 Sections 5 and 6).
//!
//! [`ChannelMultiplexer`] is IO-free: every call returns the payloads to
//! send, and inbound messages 90..=100 come back as [`Handled`] with an
//! optional [`ChannelEvent`] for the session task.
//!
//! ```text
//! Opening ──CONFIRMATION──> Open ──close()──> Closing ──CLOSE──> Closed
//!    │                        └─────────peer CLOSE──────────────> Closed
//!    └──OPEN_FAILURE──> removed
//! ```

use super::connection::{
    recipient_channel, ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure,
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
    ChannelRequest, ChannelRequestType, ChannelType, ChannelWindowAdjust,
};
use super::message::MessageType;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, no answer yet
    Opening,
    /// Open and ready
    Open,
    /// We sent CHANNEL_CLOSE
    Closing,
    /// Both sides closed
    Closed,
}

/// Result of a finished exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status; 0 when the server never sent one
    pub status: u32,
    /// Bytes the command wrote to stdout
    pub output: Vec<u8>,
    /// Bytes the command wrote to stderr
    pub stderr: Vec<u8>,
}

/// Something the session task has to act on.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The server confirmed the channel.
    Opened {
        /// Local channel id
        id: u32,
    },
    /// The server refused the channel.
    OpenFailed {
        /// Local channel id
        id: u32,
        /// Reason code
        reason: u32,
        /// Server description
        description: String,
    },
    /// CHANNEL_SUCCESS for a request.
    RequestSucceeded {
        /// Local channel id
        id: u32,
    },
    /// CHANNEL_FAILURE for a request.
    RequestFailed {
        /// Local channel id
        id: u32,
    },
    /// Both sides closed the channel.
    Closed {
        /// Local channel id
        id: u32,
        /// Everything the channel collected
        output: ExecOutput,
    },
}

/// Payloads to send plus an optional event.
#[derive(Debug, Default)]
pub struct Handled {
    /// Payloads for the transport, in order
    pub outbound: Vec<Vec<u8>>,
    /// Event for the session task
    pub event: Option<ChannelEvent>,
}

impl Handled {
    fn send(payload: Vec<u8>) -> Self {
        Self {
            outbound: vec![payload],
            event: None,
        }
    }

    fn event(event: ChannelEvent) -> Self {
        Self {
            outbound: Vec::new(),
            event: Some(event),
        }
    }
}

/// One channel.
#[derive(Debug)]
pub struct Channel {
    local_id: u32,
    remote_id: u32,
    state: ChannelState,
    local_window: u32,
    remote_window: u32,
    remote_max_packet: u32,
    outbound: BytesMut,
    eof_queued: bool,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    pending_requests: usize,
    exit_status: Option<u32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Channel {
    fn new(local_id: u32, window: u32) -> Self {
        Self {
            local_id,
            remote_id: 0,
            state: ChannelState::Opening,
            local_window: window,
            remote_window: 0,
            remote_max_packet: 0,
            outbound: BytesMut::new(),
            eof_queued: false,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            pending_requests: 0,
            exit_status: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Remote channel id; meaningless while opening.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bytes the server may still send before a WINDOW_ADJUST.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// Bytes we may still send.
    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Bytes queued until the server opens its window.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Whether the server sent EOF.
    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    /// Exit status, once received.
    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    fn ensure_open(&self) -> KeelResult<()> {
        if self.state == ChannelState::Open {
            Ok(())
        } else {
            Err(KeelError::InvalidState(format!(
                "Channel {} is {:?}, not open",
                self.local_id, self.state
            )))
        }
    }

    /// Sends as much queued data as the remote window allows.
    fn flush(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while !self.outbound.is_empty() && self.remote_window > 0 {
            let chunk = self
                .outbound
                .len()
                .min(self.remote_window as usize)
                .min(self.remote_max_packet as usize);
            if chunk == 0 {
                break;
            }
            let data = self.outbound.split_to(chunk);
            // chunk <= remote_window, so this cannot underflow
            self.remote_window -= chunk as u32;
            out.push(ChannelData::new(self.remote_id, data.to_vec()).to_bytes());
        }

        if self.outbound.is_empty() && self.eof_queued && !self.eof_sent {
            self.eof_sent = true;
            out.push(ChannelEof::new(self.remote_id).to_bytes());
        }
        out
    }

    fn take_output(&mut self) -> ExecOutput {
        ExecOutput {
            status: self.exit_status.unwrap_or(0),
            output: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
        }
    }
}

/// Routes connection-layer messages to channels.
#[derive(Debug)]
pub struct ChannelMultiplexer {
    channels: HashMap<u32, Channel>,
    next_id: u32,
    window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelMultiplexer {
    /// Creates a multiplexer advertising `window_size` and
    /// `maximum_packet_size` on every channel it opens.
    pub fn new(window_size: u32, maximum_packet_size: u32) -> Self {
        Self {
            channels: HashMap::new(),
            next_id: 0,
            window_size,
            maximum_packet_size,
        }
    }

    /// Looks up a channel by local id.
    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true when no channel is live.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn allocate_id(&mut self) -> u32 {
        while self.channels.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn get_mut(&mut self, id: u32) -> KeelResult<&mut Channel> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| KeelError::Protocol(format!("Unknown channel {}", id)))
    }

    /// Opens a session channel. Returns its local id and the CHANNEL_OPEN.
    pub fn open_session(&mut self) -> (u32, Vec<u8>) {
        let id = self.allocate_id();
        self.channels.insert(id, Channel::new(id, self.window_size));
        debug!(channel = id, "Opening session channel");

        let open = ChannelOpen::new(
            ChannelType::Session,
            id,
            self.window_size,
            self.maximum_packet_size,
        );
        (id, open.to_bytes())
    }

    /// Builds an "exec" request with `want_reply` set.
    pub fn exec(&mut self, id: u32, command: &str) -> KeelResult<Vec<u8>> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or_else(|| KeelError::InvalidState(format!("No channel {}", id)))?;
        channel.ensure_open()?;
        channel.pending_requests += 1;

        debug!(channel = id, command, "Sending exec request");
        let request = ChannelRequest::new(
            channel.remote_id,
            ChannelRequestType::Exec {
                command: command.to_string(),
            },
            true,
        );
        Ok(request.to_bytes())
    }

    /// Queues data and returns what the remote window lets through now.
    pub fn send_data(&mut self, id: u32, data: &[u8]) -> KeelResult<Vec<Vec<u8>>> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or_else(|| KeelError::InvalidState(format!("No channel {}", id)))?;
        channel.ensure_open()?;
        if channel.eof_queued {
            return Err(KeelError::InvalidState(format!(
                "Channel {} already sent EOF",
                id
            )));
        }
        channel.outbound.extend_from_slice(data);
        Ok(channel.flush())
    }

    /// Sends EOF once all queued data is out.
    pub fn send_eof(&mut self, id: u32) -> KeelResult<Vec<Vec<u8>>> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or_else(|| KeelError::InvalidState(format!("No channel {}", id)))?;
        channel.ensure_open()?;
        channel.eof_queued = true;
        Ok(channel.flush())
    }

    /// Sends CHANNEL_CLOSE. Queued data is dropped.
    pub fn close(&mut self, id: u32) -> KeelResult<Option<Vec<u8>>> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or_else(|| KeelError::InvalidState(format!("No channel {}", id)))?;

        match channel.state {
            ChannelState::Open => {
                channel.state = ChannelState::Closing;
                channel.close_sent = true;
                channel.outbound.clear();
                debug!(channel = id, "Closing channel");
                Ok(Some(ChannelClose::new(channel.remote_id).to_bytes()))
            }
            // The confirmation is still due; forget the channel once it
            // arrives.
            ChannelState::Opening => {
                channel.close_sent = true;
                Ok(None)
            }
            ChannelState::Closing | ChannelState::Closed => Ok(None),
        }
    }

    /// Handles a message in the 90..=100 range.
    pub fn handle(&mut self, payload: &[u8]) -> KeelResult<Handled> {
        let msg_type = payload.first().copied().unwrap_or(0);

        match MessageType::from_u8(msg_type) {
            Some(MessageType::ChannelOpen) => self.handle_open(payload),
            Some(MessageType::ChannelOpenConfirmation) => self.handle_confirmation(payload),
            Some(MessageType::ChannelOpenFailure) => self.handle_open_failure(payload),
            Some(MessageType::ChannelWindowAdjust) => self.handle_window_adjust(payload),
            Some(MessageType::ChannelData) => {
                let data = ChannelData::from_bytes(payload)?;
                let id = data.recipient_channel();
                self.handle_data(id, data.into_data(), false)
            }
            Some(MessageType::ChannelExtendedData) => {
                let data = ChannelExtendedData::from_bytes(payload)?;
                let id = data.recipient_channel();
                if !data.is_stderr() {
                    trace!(channel = id, code = data.data_type_code(), "Extended data of unknown type");
                }
                self.handle_data(id, data.into_data(), true)
            }
            Some(MessageType::ChannelEof) => {
                let id = recipient_channel(payload)?;
                let channel = self.get_mut(id)?;
                channel.eof_received = true;
                debug!(channel = id, "Received EOF");
                Ok(Handled::default())
            }
            Some(MessageType::ChannelClose) => self.handle_close(payload),
            Some(MessageType::ChannelRequest) => self.handle_request(payload),
            Some(MessageType::ChannelSuccess) | Some(MessageType::ChannelFailure) => {
                let id = recipient_channel(payload)?;
                let channel = self.get_mut(id)?;
                if channel.pending_requests == 0 {
                    warn!(channel = id, "Reply without an outstanding request");
                    return Ok(Handled::default());
                }
                channel.pending_requests -= 1;

                let event = if msg_type == MessageType::ChannelSuccess as u8 {
                    ChannelEvent::RequestSucceeded { id }
                } else {
                    ChannelEvent::RequestFailed { id }
                };
                Ok(Handled::event(event))
            }
            _ => Err(KeelError::Protocol(format!(
                "Unexpected message {} for the connection layer",
                msg_type
            ))),
        }
    }

    fn handle_open(&mut self, payload: &[u8]) -> KeelResult<Handled> {
        let open = ChannelOpen::from_bytes(payload)?;
        warn!(
            channel_type = open.channel_type().name(),
            "Refusing server-initiated channel"
        );
        let failure = ChannelOpenFailure::new(
            open.sender_channel(),
            ChannelOpenFailureReason::AdministrativelyProhibited,
        );
        Ok(Handled::send(failure.to_bytes()))
    }

    fn handle_confirmation(&mut self, payload: &[u8]) -> KeelResult<Handled> {
        let confirm = ChannelOpenConfirmation::from_bytes(payload)?;
        let id = confirm.recipient_channel();
        let channel = self.get_mut(id)?;

        if channel.state != ChannelState::Opening {
            return Err(KeelError::Protocol(format!(
                "CHANNEL_OPEN_CONFIRMATION for channel {} in state {:?}",
                id, channel.state
            )));
        }

        if confirm.maximum_packet_size() == 0 {
            return Err(KeelError::Protocol(format!(
                "CHANNEL_OPEN_CONFIRMATION for channel {} with a zero maximum packet size",
                id
            )));
        }

        channel.remote_id = confirm.sender_channel();
        channel.remote_window = confirm.initial_window_size();
        channel.remote_max_packet = confirm.maximum_packet_size();
        channel.state = ChannelState::Open;
        debug!(
            channel = id,
            remote = channel.remote_id,
            window = channel.remote_window,
            max_packet = channel.remote_max_packet,
            "Channel open"
        );

        if channel.close_sent {
            channel.state = ChannelState::Closing;
            return Ok(Handled::send(ChannelClose::new(channel.remote_id).to_bytes()));
        }
        Ok(Handled::event(ChannelEvent::Opened { id }))
    }

    fn handle_open_failure(&mut self, payload: &[u8]) -> KeelResult<Handled> {
        let failure = ChannelOpenFailure::from_bytes(payload)?;
        let id = failure.recipient_channel();

        match self.channels.get(&id).map(Channel::state) {
            Some(ChannelState::Opening) => {
                self.channels.remove(&id);
            }
            Some(state) => {
                return Err(KeelError::Protocol(format!(
                    "CHANNEL_OPEN_FAILURE for channel {} in state {:?}",
                    id, state
                )))
            }
            None => return Err(KeelError::Protocol(format!("Unknown channel {}", id))),
        }

        debug!(
            channel = id,
            reason = failure.reason_code(),
            description = failure.description(),
            "Channel open failed"
        );
        Ok(Handled::event(ChannelEvent::OpenFailed {
            id,
            reason: failure.reason_code(),
            description: failure.description().to_string(),
        }))
    }

    fn handle_window_adjust(&mut self, payload: &[u8]) -> KeelResult<Handled> {
        let adjust = ChannelWindowAdjust::from_bytes(payload)?;
        let id = adjust.recipient_channel();
        let channel = self.get_mut(id)?;

        channel.remote_window = channel
            .remote_window
            .checked_add(adjust.bytes_to_add())
            .ok_or_else(|| {
                KeelError::Protocol(format!("Window overflow on channel {}", id))
            })?;
        trace!(channel = id, window = channel.remote_window, "Window adjusted");

        if channel.state != ChannelState::Open {
            return Ok(Handled::default());
        }
        Ok(Handled {
            outbound: channel.flush(),
            event: None,
        })
    }

    fn handle_data(&mut self, id: u32, data: Vec<u8>, extended: bool) -> KeelResult<Handled> {
        let window_size = self.window_size;
        let channel = self.get_mut(id)?;

        if !matches!(channel.state, ChannelState::Open | ChannelState::Closing) {
            return Err(KeelError::Protocol(format!(
                "Data on channel {} in state {:?}",
                id, channel.state
            )));
        }
        if channel.eof_received {
            return Err(KeelError::Protocol(format!(
                "Data on channel {} after EOF",
                id
            )));
        }

        let len = u32::try_from(data.len())
            .ok()
            .filter(|&len| len <= channel.local_window)
            .ok_or_else(|| {
                KeelError::Protocol(format!(
                    "Channel {} sent {} bytes with {} bytes of window left",
                    id,
                    data.len(),
                    channel.local_window
                ))
            })?;
        channel.local_window -= len;

        if extended {
            channel.stderr.extend_from_slice(&data);
        } else {
            channel.stdout.extend_from_slice(&data);
        }
        trace!(channel = id, len, window = channel.local_window, "Channel data");

        if channel.state == ChannelState::Open && channel.local_window < window_size / 2 {
            let add = window_size - channel.local_window;
            channel.local_window = window_size;
            trace!(channel = id, add, "Sending window adjust");
            return Ok(Handled::send(
                ChannelWindowAdjust::new(channel.remote_id, add).to_bytes(),
            ));
        }
        Ok(Handled::default())
    }

    fn handle_close(&mut self, payload: &[u8]) -> KeelResult<Handled> {
        let id = recipient_channel(payload)?;
        let channel = self.get_mut(id)?;

        if channel.state == ChannelState::Opening {
            return Err(KeelError::Protocol(format!(
                "CHANNEL_CLOSE for unconfirmed channel {}",
                id
            )));
        }

        let mut outbound = Vec::new();
        if !channel.close_sent {
            channel.close_sent = true;
            outbound.push(ChannelClose::new(channel.remote_id).to_bytes());
        }
        channel.state = ChannelState::Closed;
        let output = channel.take_output();
        self.channels.remove(&id);
        debug!(channel = id, status = output.status, "Channel closed");

        Ok(Handled {
            outbound,
            event: Some(ChannelEvent::Closed { id, output }),
        })
    }

    fn handle_request(&mut self, payload: &[u8]) -> KeelResult<Handled> {
        let request = ChannelRequest::from_bytes(payload)?;
        let id = request.recipient_channel();
        let channel = self.get_mut(id)?;

        match request.request_type() {
            ChannelRequestType::ExitStatus { exit_status } => {
                debug!(channel = id, exit_status, "Exit status");
                channel.exit_status = Some(*exit_status);
            }
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                ..
            } => {
                warn!(
                    channel = id,
                    signal = %signal_name,
                    core_dumped,
                    message = %error_message,
                    "Remote command killed by signal"
                );
            }
            other => {
                debug!(channel = id, request = other.name(), "Unsupported channel request");
                if request.want_reply() {
                    return Ok(Handled::send(ChannelFailure::new(channel.remote_id).to_bytes()));
                }
            }
        }
        Ok(Handled::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::{ChannelSuccess, ExtendedDataType};
    use bytes::Buf;

    const WINDOW: u32 = 64 * 1024;
    const PACKET: u32 = 32 * 1024;

    fn data_len(payloads: &[Vec<u8>]) -> usize {
        payloads
            .iter()
            .filter(|p| p[0] == MessageType::ChannelData as u8)
            .map(|p| {
                let mut len = &p[5..9];
                len.get_u32() as usize
            })
            .sum()
    }

    fn open(mux: &mut ChannelMultiplexer, remote_window: u32, remote_packet: u32) -> u32 {
        let (id, bytes) = mux.open_session();
        let open = ChannelOpen::from_bytes(&bytes).unwrap();
        assert_eq!(open.initial_window_size(), WINDOW);
        assert_eq!(open.maximum_packet_size(), PACKET);

        let confirm = ChannelOpenConfirmation::new(id, 100 + id, remote_window, remote_packet);
        let handled = mux.handle(&confirm.to_bytes()).unwrap();
        assert!(matches!(handled.event, Some(ChannelEvent::Opened { id: opened }) if opened == id));
        id
    }

    #[test]
    fn test_open_and_exec() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let id = open(&mut mux, WINDOW, PACKET);
        let channel = mux.channel(id).unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.remote_id(), 100);

        let request = ChannelRequest::from_bytes(&mux.exec(id, "echo hi").unwrap()).unwrap();
        assert_eq!(request.recipient_channel(), 100);
        assert!(request.want_reply());

        let handled = mux.handle(&ChannelSuccess::new(id).to_bytes()).unwrap();
        assert!(matches!(handled.event, Some(ChannelEvent::RequestSucceeded { .. })));
    }

    #[test]
    fn test_exec_before_confirmation_rejected() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let (id, _) = mux.open_session();
        assert!(matches!(mux.exec(id, "true"), Err(KeelError::InvalidState(_))));
    }

    #[test]
    fn test_open_failure_removes_channel() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let (id, _) = mux.open_session();
        let failure = ChannelOpenFailure::new(id, ChannelOpenFailureReason::ResourceShortage);

        match mux.handle(&failure.to_bytes()).unwrap().event {
            Some(ChannelEvent::OpenFailed { reason, .. }) => assert_eq!(reason, 4),
            other => panic!("expected OpenFailed, got {:?}", other),
        }
        assert!(mux.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let (a, _) = mux.open_session();
        let (b, _) = mux.open_session();
        assert_ne!(a, b);
        assert_eq!(mux.len(), 2);
    }

    #[test]
    fn test_inbound_data_and_window_adjust() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let id = open(&mut mux, WINDOW, PACKET);

        let first = ChannelData::new(id, vec![b'a'; 20_000]);
        assert!(mux.handle(&first.to_bytes()).unwrap().outbound.is_empty());
        assert_eq!(mux.channel(id).unwrap().local_window(), WINDOW - 20_000);

        // Drops below half: the window is topped back up.
        let second = ChannelExtendedData::new(id, ExtendedDataType::Stderr, vec![b'e'; 20_000]);
        let handled = mux.handle(&second.to_bytes()).unwrap();
        assert_eq!(handled.outbound.len(), 1);
        let adjust = ChannelWindowAdjust::from_bytes(&handled.outbound[0]).unwrap();
        assert_eq!(adjust.recipient_channel(), 100);
        assert_eq!(adjust.bytes_to_add(), 40_000);
        assert_eq!(mux.channel(id).unwrap().local_window(), WINDOW);
    }

    #[test]
    fn test_window_overrun_is_protocol_error() {
        let mut mux = ChannelMultiplexer::new(1024, 1024);
        let (id, _) = mux.open_session();
        mux.handle(&ChannelOpenConfirmation::new(id, 1, 1024, 1024).to_bytes())
            .unwrap();

        let too_much = ChannelData::new(id, vec![0; 1025]);
        assert!(matches!(
            mux.handle(&too_much.to_bytes()),
            Err(KeelError::Protocol(_))
        ));
    }

    #[test]
    fn test_send_data_respects_remote_window() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let id = open(&mut mux, 1_000, 400);

        let out = mux.send_data(id, &[7u8; 2_500]).unwrap();
        assert_eq!(out.len(), 3); // 400 + 400 + 200
        assert_eq!(data_len(&out), 1_000);
        assert_eq!(mux.channel(id).unwrap().remote_window(), 0);
        assert_eq!(mux.channel(id).unwrap().queued(), 1_500);

        // EOF waits for the queue.
        assert!(mux.send_eof(id).unwrap().is_empty());

        let handled = mux
            .handle(&ChannelWindowAdjust::new(id, 10_000).to_bytes())
            .unwrap();
        assert_eq!(data_len(&handled.outbound), 1_500);
        assert_eq!(
            handled.outbound.last().unwrap()[0],
            MessageType::ChannelEof as u8
        );
        assert_eq!(mux.channel(id).unwrap().remote_window(), 8_500);
    }

    #[test]
    fn test_zero_max_packet_is_protocol_error() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let (id, _) = mux.open_session();
        let confirm = ChannelOpenConfirmation::new(id, 100, 1_000, 0);
        assert!(matches!(
            mux.handle(&confirm.to_bytes()),
            Err(KeelError::Protocol(_))
        ));
        assert!(mux.send_data(id, b"never sent").is_err());
    }

    #[test]
    fn test_window_adjust_overflow() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let id = open(&mut mux, u32::MAX - 10, PACKET);
        assert!(mux
            .handle(&ChannelWindowAdjust::new(id, 11).to_bytes())
            .is_err());
    }

    #[test]
    fn test_exit_status_and_close() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let id = open(&mut mux, WINDOW, PACKET);

        mux.handle(&ChannelData::new(id, b"hi\n".to_vec()).to_bytes())
            .unwrap();
        let status = ChannelRequest::new(id, ChannelRequestType::ExitStatus { exit_status: 3 }, false);
        mux.handle(&status.to_bytes()).unwrap();
        mux.handle(&ChannelEof::new(id).to_bytes()).unwrap();
        assert!(mux.channel(id).unwrap().eof_received());

        // Data after EOF is not allowed.
        assert!(mux.handle(&ChannelData::new(id, b"x".to_vec()).to_bytes()).is_err());

        let handled = mux.handle(&ChannelClose::new(id).to_bytes()).unwrap();
        assert_eq!(handled.outbound, vec![ChannelClose::new(100).to_bytes()]);
        match handled.event {
            Some(ChannelEvent::Closed { output, .. }) => {
                assert_eq!(output.status, 3);
                assert_eq!(output.output, b"hi\n");
            }
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(mux.is_empty());
    }

    #[test]
    fn test_local_close_then_peer_close() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let id = open(&mut mux, WINDOW, PACKET);

        assert!(mux.close(id).unwrap().is_some());
        assert_eq!(mux.channel(id).unwrap().state(), ChannelState::Closing);
        assert!(mux.close(id).unwrap().is_none());

        let handled = mux.handle(&ChannelClose::new(id).to_bytes()).unwrap();
        assert!(handled.outbound.is_empty());
        match handled.event {
            Some(ChannelEvent::Closed { output, .. }) => assert_eq!(output.status, 0),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_request_with_reply_refused() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let id = open(&mut mux, WINDOW, PACKET);

        let request = ChannelRequest::new(
            id,
            ChannelRequestType::Other("keepalive@openssh.com".to_string()),
            true,
        );
        let handled = mux.handle(&request.to_bytes()).unwrap();
        assert_eq!(handled.outbound, vec![ChannelFailure::new(100).to_bytes()]);
    }

    #[test]
    fn test_server_channel_open_refused() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        let open = ChannelOpen::new(ChannelType::Other("x11".to_string()), 42, 1024, 1024);
        let handled = mux.handle(&open.to_bytes()).unwrap();
        let failure = ChannelOpenFailure::from_bytes(&handled.outbound[0]).unwrap();
        assert_eq!(failure.recipient_channel(), 42);
        assert_eq!(
            failure.reason(),
            Some(ChannelOpenFailureReason::AdministrativelyProhibited)
        );
    }

    #[test]
    fn test_unknown_channel_is_protocol_error() {
        let mut mux = ChannelMultiplexer::new(WINDOW, PACKET);
        assert!(matches!(
            mux.handle(&ChannelData::new(9, vec![1]).to_bytes()),
            Err(KeelError::Protocol(_))
        ));
    }
}
