//! SSH transport layer (RFC 4253).
//!
//! [`PacketStream`] moves whole payloads over any byte stream through the
//! wire codec. [`Transport`] adds the connection lifecycle on top of it:
//!
//! 1. **Version exchange**: identification strings both ways
//! 2. **Key exchange**: driven by [`KexController`]
//! 3. **Established**: application payloads flow; transport messages
//!    (`IGNORE`, `DEBUG`, `UNIMPLEMENTED`, `DISCONNECT`, `KEXINIT`) are
//!    handled here and never reach the caller
//!
//! # Rekeying
//!
//! [`RekeyTracker`] counts bytes in each direction and the time since the
//! last exchange. Once a [`Limits`] value is crossed our KEXINIT goes out
//! with the next send or receive. A server KEXINIT starts an exchange at
//! any time.
//!
//! Only the first exchange in [`Transport::handshake`] is awaited as a
//! whole. Later ones advance one message at a time through
//! [`Transport::handle`], so the caller's event loop keeps running while
//! the server answers. From our KEXINIT until our NEWKEYS, application
//! payloads passed to [`Transport::send`] are queued and written under the
//! new keys. Payloads the server sent before its own KEXINIT are returned
//! as usual.

use super::codec::{OpeningKeys, SealingKeys};
use super::config::{Config, Limits, ServerKeyVerifier};
use super::hostkey::PublicKey;
use super::kex::{KexController, KexState, NegotiatedAlgorithms};
use super::message::{self, Disconnect, DisconnectReason, MessageType};
use super::version::{exchange_identification, Version};
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Tracks traffic and time under the current keys.
#[derive(Debug, Clone)]
pub struct RekeyTracker {
    limits: Limits,
    bytes_written: u64,
    bytes_read: u64,
    since: Instant,
}

impl RekeyTracker {
    /// Starts counting now.
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            bytes_written: 0,
            bytes_read: 0,
            since: Instant::now(),
        }
    }

    /// Adds written bytes.
    pub fn record_write(&mut self, bytes: usize) {
        self.bytes_written = self.bytes_written.saturating_add(bytes as u64);
    }

    /// Adds read bytes.
    pub fn record_read(&mut self, bytes: usize) {
        self.bytes_read = self.bytes_read.saturating_add(bytes as u64);
    }

    /// Bytes written under the current keys.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes read under the current keys.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// When the time limit expires.
    pub fn deadline(&self) -> Instant {
        self.since + self.limits.rekey_time_limit
    }

    /// Returns true once any limit has been crossed.
    pub fn needs_rekey(&self) -> bool {
        self.bytes_written >= self.limits.rekey_write_limit
            || self.bytes_read >= self.limits.rekey_read_limit
            || Instant::now() >= self.deadline()
    }

    /// Restarts all counters.
    pub fn reset(&mut self) {
        self.bytes_written = 0;
        self.bytes_read = 0;
        self.since = Instant::now();
    }
}

/// Payload-level reads and writes over a byte stream.
pub struct PacketStream<S> {
    stream: S,
    read_buf: BytesMut,
    sealing: SealingKeys,
    opening: OpeningKeys,
    tracker: RekeyTracker,
    last_activity: Instant,
}

impl<S> PacketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream in plaintext mode.
    ///
    /// `read_buf` holds any bytes already read past the identification line.
    pub fn new(stream: S, read_buf: BytesMut, limits: Limits) -> Self {
        Self {
            stream,
            read_buf,
            sealing: SealingKeys::plaintext(),
            opening: OpeningKeys::plaintext(),
            tracker: RekeyTracker::new(limits),
            last_activity: Instant::now(),
        }
    }

    /// Reads the next payload.
    ///
    /// Cancel safe: a partially received frame stays buffered and the next
    /// call picks up where this one stopped.
    pub async fn read_payload(&mut self) -> KeelResult<Vec<u8>> {
        loop {
            let before = self.read_buf.len();
            if let Some(payload) = self.opening.decode_frame(&mut self.read_buf)? {
                let frame_len = before - self.read_buf.len();
                self.tracker.record_read(frame_len);
                self.last_activity = Instant::now();
                trace!(
                    msg_type = payload.first().copied().unwrap_or(0),
                    len = frame_len,
                    "Received frame"
                );
                return Ok(payload);
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(KeelError::ConnectionClosed);
            }
        }
    }

    /// Seals and writes one payload.
    pub async fn write_payload(&mut self, payload: &[u8]) -> KeelResult<()> {
        let frame = self.sealing.encode_frame(payload)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        self.tracker.record_write(frame.len());
        self.last_activity = Instant::now();
        trace!(
            msg_type = payload.first().copied().unwrap_or(0),
            len = frame.len(),
            "Sent frame"
        );
        Ok(())
    }

    /// Outbound keys.
    pub fn sealing_mut(&mut self) -> &mut SealingKeys {
        &mut self.sealing
    }

    /// Inbound keys.
    pub fn opening_mut(&mut self) -> &mut OpeningKeys {
        &mut self.opening
    }

    /// Sequence number of the most recently received frame.
    pub fn last_received_sequence(&self) -> u32 {
        self.opening.sequence().wrapping_sub(1)
    }

    /// Rekey counters.
    pub fn tracker(&self) -> &RekeyTracker {
        &self.tracker
    }

    /// Rekey counters, mutable.
    pub fn tracker_mut(&mut self) -> &mut RekeyTracker {
        &mut self.tracker
    }

    /// Time of the last frame read or written.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Shuts down the write half.
    pub async fn shutdown(&mut self) -> KeelResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Client transport: identification, key exchange, rekey and transport
/// message handling.
pub struct Transport<S> {
    stream: PacketStream<S>,
    kex: KexController,
    verifier: Option<Arc<dyn ServerKeyVerifier>>,
    server_version: Version,
    host_key: Option<PublicKey>,
    queued: VecDeque<Vec<u8>>,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Exchanges identification strings and runs the first key exchange.
    pub async fn handshake(mut stream: S, config: &Config) -> KeelResult<Self> {
        let client = &config.client;
        let mut read_buf = BytesMut::new();
        let server_version =
            exchange_identification(&mut stream, &client.client_id, &mut read_buf).await?;

        let kex = KexController::new(
            client.preferred.clone(),
            client.client_id.as_hashed(),
            server_version.as_str(),
        );
        let mut transport = Self {
            stream: PacketStream::new(stream, read_buf, client.limits),
            kex,
            verifier: config.check_server_key.clone(),
            server_version,
            host_key: None,
            queued: VecDeque::new(),
        };

        transport.start_kex().await?;
        while transport.kex.in_progress() {
            let payload = transport.stream.read_payload().await?;
            if let Some(payload) = transport.handle(payload).await? {
                return Err(KeelError::Protocol(format!(
                    "Unexpected message {} before the first key exchange completed",
                    payload.first().copied().unwrap_or(0)
                )));
            }
        }
        info!(server = %transport.server_version, "SSH transport established");
        Ok(transport)
    }

    /// The server's identification string.
    pub fn server_version(&self) -> &Version {
        &self.server_version
    }

    /// Host key presented in the most recent key exchange.
    pub fn server_host_key(&self) -> Option<&PublicKey> {
        self.host_key.as_ref()
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.kex.session_id()
    }

    /// Algorithms in force.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.kex.negotiated()
    }

    /// Rekey counters.
    pub fn tracker(&self) -> &RekeyTracker {
        self.stream.tracker()
    }

    /// Time of the last frame read or written.
    pub fn last_activity(&self) -> Instant {
        self.stream.last_activity()
    }

    /// True between a KEXINIT and the server's NEWKEYS.
    pub fn kex_in_progress(&self) -> bool {
        self.kex.in_progress()
    }

    /// Application payloads waiting for the running exchange.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Next raw payload from the wire.
    ///
    /// Cancel safe. Pass the result to [`handle`](Self::handle).
    pub async fn next_payload(&mut self) -> KeelResult<Vec<u8>> {
        self.stream.read_payload().await
    }

    /// Handles transport-level messages, key exchange steps included.
    ///
    /// Returns the payload back when it belongs to a higher layer, `None`
    /// when it was consumed here.
    pub async fn handle(&mut self, payload: Vec<u8>) -> KeelResult<Option<Vec<u8>>> {
        let Some(&msg_type) = payload.first() else {
            return Err(KeelError::Protocol("Empty payload".to_string()));
        };

        let result = match MessageType::from_u8(msg_type) {
            Some(MessageType::Disconnect) => {
                let disconnect = Disconnect::from_bytes(&payload)?;
                info!(
                    reason = disconnect.reason_code(),
                    description = disconnect.description(),
                    "Server disconnected"
                );
                return Err(disconnect.into_error());
            }
            Some(MessageType::Ignore) => None,
            Some(MessageType::Unimplemented) => {
                warn!("Server reported an unimplemented message");
                None
            }
            Some(MessageType::Debug) => {
                let (always_display, text) = message::parse_debug(&payload)?;
                debug!(always_display, message = %text, "Server debug message");
                None
            }
            Some(MessageType::KexInit) => {
                for out in self.kex.handle_kexinit(&payload)? {
                    self.stream.write_payload(&out).await?;
                }
                None
            }
            Some(MessageType::KexdhReply) => {
                self.handle_kex_reply(&payload).await?;
                None
            }
            Some(MessageType::NewKeys) => {
                let keys = self.kex.handle_newkeys(&payload)?;
                self.stream.opening_mut().install(&keys)?;
                self.stream.tracker_mut().reset();
                None
            }
            Some(MessageType::KexdhInit) => {
                return Err(KeelError::Protocol(
                    "Unexpected SSH_MSG_KEXDH_INIT from server".to_string(),
                ));
            }
            Some(_) => Some(payload),
            None => {
                warn!(msg_type, "Unrecognized message, replying UNIMPLEMENTED");
                let sequence = self.stream.last_received_sequence();
                self.stream.write_payload(&message::unimplemented(sequence)).await?;
                None
            }
        };

        if !self.kex.in_progress() && self.stream.tracker().needs_rekey() {
            self.start_kex().await?;
        }
        Ok(result)
    }

    /// Sends an application payload.
    ///
    /// Starts a key exchange first when a limit is due. While one is
    /// running the payload is queued instead of written.
    pub async fn send(&mut self, payload: &[u8]) -> KeelResult<()> {
        if !self.kex.in_progress() && self.stream.tracker().needs_rekey() {
            self.start_kex().await?;
        }
        let msg_type = payload.first().copied().unwrap_or(0);
        if self.holding() && !MessageType::is_transport(msg_type) {
            trace!(queued = self.queued.len() + 1, "Queueing payload behind key exchange");
            self.queued.push_back(payload.to_vec());
            return Ok(());
        }
        self.stream.write_payload(payload).await
    }

    /// Sends our KEXINIT unless an exchange is already running.
    ///
    /// The rest of the exchange is driven by [`handle`](Self::handle).
    pub async fn rekey(&mut self) -> KeelResult<()> {
        if self.kex.in_progress() {
            return Ok(());
        }
        self.start_kex().await
    }

    /// Sends DISCONNECT and shuts the stream down.
    pub async fn disconnect(
        &mut self,
        reason: DisconnectReason,
        description: &str,
        language_tag: &str,
    ) -> KeelResult<()> {
        let msg = Disconnect::new(reason, description, language_tag);
        self.stream.write_payload(&msg.to_bytes()).await?;
        // The peer may already be gone.
        let _ = self.stream.shutdown().await;
        info!(reason = reason as u32, description, "Disconnected");
        Ok(())
    }

    async fn start_kex(&mut self) -> KeelResult<()> {
        debug!(
            bytes_written = self.stream.tracker().bytes_written(),
            bytes_read = self.stream.tracker().bytes_read(),
            "Starting key exchange"
        );
        let kexinit = self.kex.start()?;
        self.stream.write_payload(&kexinit).await
    }

    /// Our NEWKEYS is not out yet.
    fn holding(&self) -> bool {
        matches!(
            self.kex.state(),
            KexState::AlgorithmNegotiation | KexState::Exchange
        )
    }

    async fn handle_kex_reply(&mut self, payload: &[u8]) -> KeelResult<()> {
        let Some(host_key) = self.kex.handle_reply(payload)? else {
            return Ok(());
        };
        self.check_host_key(&host_key).await?;
        let (newkeys, keys) = self.kex.send_newkeys()?;
        self.stream.write_payload(&newkeys).await?;
        self.stream.sealing_mut().install(&keys)?;
        self.host_key = Some(host_key);

        if !self.queued.is_empty() {
            debug!(count = self.queued.len(), "Sending payloads queued during key exchange");
        }
        while let Some(payload) = self.queued.pop_front() {
            self.stream.write_payload(&payload).await?;
        }
        Ok(())
    }

    async fn check_host_key(&mut self, host_key: &PublicKey) -> KeelResult<()> {
        let fingerprint = host_key.fingerprint();
        let accepted = match &self.verifier {
            Some(verifier) => verifier.check_server_key(host_key).await,
            None => {
                warn!(%fingerprint, "No host key verifier configured, accepting server key");
                true
            }
        };

        if accepted {
            debug!(%fingerprint, algorithm = host_key.name(), "Server host key accepted");
            return Ok(());
        }

        warn!(%fingerprint, "Server host key rejected");
        let _ = self
            .disconnect(
                DisconnectReason::HostKeyNotVerifiable,
                "Host key verification failed",
                "",
            )
            .await;
        Err(KeelError::HostKeyRejected { fingerprint })
    }
}

#[cfg(test)]
impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Plaintext transport with no key exchange, for exercising `handle`.
    fn plaintext(stream: S) -> Self {
        Self {
            stream: PacketStream::new(stream, BytesMut::new(), Limits::default()),
            kex: KexController::new(Default::default(), "SSH-2.0-client", "SSH-2.0-server"),
            verifier: None,
            server_version: Version::parse("SSH-2.0-server").unwrap(),
            host_key: None,
            queued: VecDeque::new(),
        }
    }
}
