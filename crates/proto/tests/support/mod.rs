//! In-process SSH server used by the integration tests.
//!
//! Built only from the crate's public codec and key exchange primitives and
//! driven over `tokio::io::duplex`. It implements just enough of the server
//! side to exercise the client: key exchange in both directions, password
//! and publickey authentication, and exec channels with flow control.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};
use keel_proto::ssh::auth::{
    construct_signature_data, AuthBanner, AuthFailure, AuthMethod, AuthRequest,
};
use keel_proto::ssh::connection::{
    recipient_channel, ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelSuccess, ChannelFailure, ChannelWindowAdjust, ExtendedDataType,
};
use keel_proto::ssh::config::{Limits, Preferred};
use keel_proto::ssh::kex::{negotiate, KexInit};
use keel_proto::ssh::kex_dh::{
    derive_direction_keys, parse_init_message, Direction, ExchangeHashInput, KexDhReply,
    KeyExchange,
};
use keel_proto::ssh::message::{Disconnect, MessageType};
use keel_proto::ssh::transport::PacketStream;
use keel_proto::ssh::version::read_identification;
use keel_proto::ssh::wire::{read_string, write_string};
use keel_proto::ssh::{KeyPair, PublicKey, Signature};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// Identification string the test server sends.
pub const SERVER_ID: &str = "SSH-2.0-KeelTestServer_1.0";

/// Installs a tracing subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What the server does for one exec.
#[derive(Debug, Clone, Default)]
pub struct ExecReply {
    /// Exit status to report; `None` sends none
    pub status: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Answer the exec request with CHANNEL_FAILURE
    pub refuse: bool,
    /// Never answer
    pub stall: bool,
    /// Wait before answering
    pub delay: Option<Duration>,
    /// Answer with the client's stdin once it sends EOF
    pub echo_stdin: bool,
}

impl ExecReply {
    pub fn output(status: u32, stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Some(status),
            stdout: stdout.into(),
            ..Default::default()
        }
    }
}

type ExecHandler = Arc<dyn Fn(&str) -> ExecReply + Send + Sync>;

/// Server behavior.
#[derive(Clone)]
pub struct ServerSetup {
    pub preferred: Preferred,
    pub host_key: KeyPair,
    pub passwords: HashMap<String, String>,
    pub authorized_keys: Vec<PublicKey>,
    /// Methods listed in USERAUTH_FAILURE
    pub methods: Vec<String>,
    /// A correct password only counts as partial success
    pub password_is_partial: bool,
    /// Answer a correct password with PASSWD_CHANGEREQ
    pub password_expired: bool,
    pub banner: Option<String>,
    pub refuse_channels: bool,
    /// Window and packet size the server advertises for its side
    pub window_size: u32,
    pub max_packet: u32,
    /// Send a GLOBAL_REQUEST with want_reply after authentication
    pub global_request_after_auth: bool,
    /// Start a key exchange right after authentication
    pub rekey_after_auth: bool,
    /// Leave client KEXINITs unanswered once an exec has arrived
    pub ignore_rekey_after_exec: bool,
    /// Send DISCONNECT instead of answering an exec
    pub disconnect_on_exec: Option<(u32, String)>,
    pub exec: ExecHandler,
}

impl Default for ServerSetup {
    fn default() -> Self {
        Self {
            preferred: Preferred::default(),
            host_key: KeyPair::generate_ed25519(),
            passwords: HashMap::from([("alice".to_string(), "secret".to_string())]),
            authorized_keys: Vec::new(),
            methods: vec!["publickey".to_string(), "password".to_string()],
            password_is_partial: false,
            password_expired: false,
            banner: None,
            refuse_channels: false,
            window_size: 2 * 1024 * 1024,
            max_packet: 32 * 1024,
            global_request_after_auth: false,
            rekey_after_auth: false,
            ignore_rekey_after_exec: false,
            disconnect_on_exec: None,
            exec: Arc::new(default_exec),
        }
    }
}

/// `echo` prints its arguments; everything else exits 127.
pub fn default_exec(command: &str) -> ExecReply {
    if let Some(rest) = command.strip_prefix("echo ") {
        return ExecReply::output(0, format!("{}\n", rest));
    }
    if command.starts_with("sleep") {
        return ExecReply {
            stall: true,
            ..Default::default()
        };
    }
    ExecReply {
        status: Some(127),
        stderr: format!("{}: command not found\n", command).into_bytes(),
        ..Default::default()
    }
}

/// What happened on the server side.
#[derive(Debug, Default)]
pub struct ServerLog {
    pub client_id: String,
    pub key_exchanges: usize,
    pub ignored_kexinits: usize,
    pub auth_attempts: Vec<(String, String)>,
    pub commands: Vec<String>,
    pub window_adjusts: usize,
    /// Size of every CHANNEL_DATA the client sent
    pub stdin_packets: Vec<usize>,
    pub global_replies: Vec<u8>,
    pub disconnect: Option<Disconnect>,
    pub error: Option<String>,
}

struct ServerChannel {
    client_id: u32,
    client_window: u32,
    client_max_packet: u32,
    pending: VecDeque<Vec<u8>>,
    finish: Option<ExecReply>,
    echo: Option<ExecReply>,
    stdin: Vec<u8>,
    /// What the client may still send us
    server_window: u32,
    closed: bool,
}

/// Server end of one connection.
pub struct TestServer {
    stream: PacketStream<DuplexStream>,
    setup: ServerSetup,
    client_id: String,
    session_id: Option<Vec<u8>>,
    channels: HashMap<u32, ServerChannel>,
    next_channel: u32,
    /// Messages the client sent before it saw our KEXINIT
    deferred: VecDeque<Vec<u8>>,
    log: ServerLog,
}

/// Starts a server task on one end of a duplex pipe and returns the other
/// end for the client.
pub fn spawn_server(setup: ServerSetup) -> (DuplexStream, JoinHandle<ServerLog>) {
    let (client, server) = duplex(1024 * 1024);
    let handle = tokio::spawn(async move { TestServer::run(server, setup).await });
    (client, handle)
}

impl TestServer {
    /// Runs a whole connection and returns what happened.
    pub async fn run(mut stream: DuplexStream, setup: ServerSetup) -> ServerLog {
        let mut log = ServerLog::default();

        if let Err(e) = stream.write_all(format!("{}\r\n", SERVER_ID).as_bytes()).await {
            log.error = Some(e.to_string());
            return log;
        }
        let mut buf = BytesMut::new();
        let client_version = match read_identification(&mut stream, &mut buf).await {
            Ok(version) => version,
            Err(e) => {
                log.error = Some(e.to_string());
                return log;
            }
        };
        log.client_id = client_version.as_str().to_string();

        let mut server = TestServer {
            stream: PacketStream::new(stream, buf, Limits::default()),
            setup,
            client_id: client_version.as_str().to_string(),
            session_id: None,
            channels: HashMap::new(),
            next_channel: 1000,
            deferred: VecDeque::new(),
            log,
        };

        if let Err(e) = server.serve().await {
            server.log.error = Some(e.to_string());
        }
        server.log
    }

    async fn send(&mut self, payload: &[u8]) -> KeelResult<()> {
        self.stream.write_payload(payload).await
    }

    async fn serve(&mut self) -> KeelResult<()> {
        self.key_exchange(None).await?;

        loop {
            let next = match self.deferred.pop_front() {
                Some(payload) => Ok(payload),
                None => self.stream.read_payload().await,
            };
            let payload = match next {
                Ok(payload) => payload,
                Err(KeelError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let msg_type = payload.first().copied().unwrap_or(0);

            match MessageType::from_u8(msg_type) {
                Some(MessageType::Disconnect) => {
                    self.log.disconnect = Some(Disconnect::from_bytes(&payload)?);
                    return Ok(());
                }
                Some(MessageType::Ignore) | Some(MessageType::Debug) => {}
                Some(MessageType::KexInit)
                    if self.setup.ignore_rekey_after_exec && !self.log.commands.is_empty() =>
                {
                    self.log.ignored_kexinits += 1;
                }
                Some(MessageType::KexInit) => self.key_exchange(Some(payload)).await?,
                Some(MessageType::ServiceRequest) => {
                    let mut offset = 1;
                    let service = read_string(&payload, &mut offset)?;
                    let mut accept = BytesMut::new();
                    accept.put_u8(MessageType::ServiceAccept as u8);
                    write_string(&mut accept, &service);
                    self.send(&accept).await?;
                }
                Some(MessageType::UserauthRequest) => self.userauth(&payload).await?,
                Some(MessageType::RequestSuccess) | Some(MessageType::RequestFailure) => {
                    self.log.global_replies.push(msg_type);
                }
                Some(MessageType::ChannelOpen) => self.channel_open(&payload).await?,
                Some(MessageType::ChannelRequest) => {
                    if self.channel_request(&payload).await? {
                        return Ok(());
                    }
                }
                Some(MessageType::ChannelWindowAdjust) => {
                    let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
                    self.log.window_adjusts += 1;
                    let id = adjust.recipient_channel();
                    if let Some(channel) = self.channels.get_mut(&id) {
                        channel.client_window += adjust.bytes_to_add();
                    }
                    self.flush(id).await?;
                }
                Some(MessageType::ChannelData) => self.channel_data(&payload).await?,
                Some(MessageType::ChannelEof) => {
                    let id = recipient_channel(&payload)?;
                    if let Some(channel) = self.channels.get_mut(&id) {
                        if let Some(reply) = channel.echo.take() {
                            let chunk = channel.client_max_packet.max(1) as usize;
                            channel.pending =
                                channel.stdin.chunks(chunk).map(<[u8]>::to_vec).collect();
                            channel.finish = Some(reply);
                        }
                    }
                    self.flush(id).await?;
                }
                Some(MessageType::ChannelClose) => {
                    let id = recipient_channel(&payload)?;
                    if let Some(channel) = self.channels.remove(&id) {
                        if !channel.closed {
                            self.send(&ChannelClose::new(channel.client_id).to_bytes())
                                .await?;
                        }
                    }
                }
                _ => {
                    return Err(KeelError::Protocol(format!(
                        "Test server got unexpected message {}",
                        msg_type
                    )))
                }
            }
        }
    }

    /// Server side of one key exchange. `client_kexinit` is set when the
    /// client started it.
    pub async fn key_exchange(&mut self, client_kexinit: Option<Vec<u8>>) -> KeelResult<()> {
        let server_kexinit = KexInit::from_preferred(&self.setup.preferred).to_bytes();
        self.send(&server_kexinit).await?;

        let client_kexinit = match client_kexinit {
            Some(payload) => payload,
            None => loop {
                let payload = self.stream.read_payload().await?;
                if payload.first() == Some(&(MessageType::KexInit as u8)) {
                    break payload;
                }
                self.deferred.push_back(payload);
            },
        };
        let client = KexInit::from_bytes(&client_kexinit)?;
        let server = KexInit::from_bytes(&server_kexinit)?;
        let negotiated = negotiate(&client, &server)?;

        let init = self.stream.read_payload().await?;
        let client_public = parse_init_message(&init, negotiated.kex)?;
        let exchange = KeyExchange::new(negotiated.kex)?;
        let server_public = exchange.public_key().to_vec();
        let k = exchange.compute_shared_secret(&client_public)?;

        let host_key_blob = self.setup.host_key.clone_public_key().to_blob();
        let h = ExchangeHashInput {
            method: negotiated.kex,
            client_id: &self.client_id,
            server_id: SERVER_ID,
            client_kexinit: &client_kexinit,
            server_kexinit: &server_kexinit,
            host_key_blob: &host_key_blob,
            client_public: &client_public,
            server_public: &server_public,
            shared_secret: &k,
        }
        .compute();
        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();
        let signature = self.setup.host_key.sign_detached(&h)?;

        let reply = KexDhReply {
            host_key_blob,
            server_public,
            signature: signature.to_blob(),
        }
        .to_bytes(negotiated.kex);
        self.send(&reply).await?;

        let c2s = derive_direction_keys(&k, &h, &session_id, &negotiated, Direction::ClientToServer);
        let s2c = derive_direction_keys(&k, &h, &session_id, &negotiated, Direction::ServerToClient);

        self.send(&[MessageType::NewKeys as u8]).await?;
        self.stream.sealing_mut().install(&s2c)?;

        let newkeys = self.stream.read_payload().await?;
        if newkeys != [MessageType::NewKeys as u8] {
            return match Disconnect::from_bytes(&newkeys) {
                Ok(disconnect) => {
                    self.log.disconnect = Some(disconnect);
                    Err(KeelError::Protocol("Client disconnected during key exchange".to_string()))
                }
                Err(_) => Err(KeelError::Protocol(format!(
                    "Expected NEWKEYS, got {}",
                    newkeys[0]
                ))),
            };
        }
        self.stream.opening_mut().install(&c2s)?;
        self.log.key_exchanges += 1;
        Ok(())
    }

    async fn userauth(&mut self, payload: &[u8]) -> KeelResult<()> {
        let request = AuthRequest::from_bytes(payload)?;
        let user = request.user_name().to_string();

        if let Some(banner) = self.setup.banner.take() {
            self.send(&AuthBanner::new(banner).to_bytes()).await?;
        }

        let (method, accepted, partial) = match request.method() {
            AuthMethod::Password(password) => {
                let ok = self.setup.passwords.get(&user) == Some(password);
                ("password", ok, ok && self.setup.password_is_partial)
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature: Some(signature),
            } => {
                let ok = self.verify_user_key(&user, algorithm, public_key, signature);
                ("publickey", ok, false)
            }
            AuthMethod::PublicKey { .. } => ("publickey", false, false),
            AuthMethod::None => ("none", false, false),
        };
        self.log.auth_attempts.push((user, method.to_string()));

        if accepted && method == "password" && self.setup.password_expired {
            let mut change = BytesMut::new();
            change.put_u8(60);
            write_string(&mut change, "Password expired");
            write_string(&mut change, "");
            return self.send(&change).await;
        }

        if accepted && !partial {
            self.send(&[MessageType::UserauthSuccess as u8]).await?;
            if self.setup.global_request_after_auth {
                let mut request = BytesMut::new();
                request.put_u8(MessageType::GlobalRequest as u8);
                write_string(&mut request, "keepalive@openssh.com");
                request.put_u8(1);
                self.send(&request).await?;
            }
            if self.setup.rekey_after_auth {
                self.key_exchange(None).await?;
            }
            return Ok(());
        }

        let failure = AuthFailure::new(self.setup.methods.clone(), partial);
        self.send(&failure.to_bytes()).await
    }

    fn verify_user_key(&self, user: &str, algorithm: &str, blob: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = PublicKey::from_blob(blob) else {
            return false;
        };
        if !self.setup.authorized_keys.contains(&key) {
            return false;
        }
        let Ok(signature) = Signature::from_blob(signature) else {
            return false;
        };
        let session_id = self.session_id.as_deref().unwrap_or_default();
        let data = construct_signature_data(session_id, user, "ssh-connection", algorithm, blob);
        key.verify_detached(&data, &signature)
    }

    async fn channel_open(&mut self, payload: &[u8]) -> KeelResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        if self.setup.refuse_channels {
            let failure = ChannelOpenFailure::with_description(
                open.sender_channel(),
                ChannelOpenFailureReason::ResourceShortage,
                "no sessions today",
            );
            return self.send(&failure.to_bytes()).await;
        }

        let id = self.next_channel;
        self.next_channel += 1;
        self.channels.insert(
            id,
            ServerChannel {
                client_id: open.sender_channel(),
                client_window: open.initial_window_size(),
                client_max_packet: open.maximum_packet_size(),
                pending: VecDeque::new(),
                finish: None,
                echo: None,
                stdin: Vec::new(),
                server_window: self.setup.window_size,
                closed: false,
            },
        );
        let confirm = ChannelOpenConfirmation::new(
            open.sender_channel(),
            id,
            self.setup.window_size,
            self.setup.max_packet,
        );
        self.send(&confirm.to_bytes()).await
    }

    async fn channel_request(&mut self, payload: &[u8]) -> KeelResult<bool> {
        let request = ChannelRequest::from_bytes(payload)?;
        let id = request.recipient_channel();
        let Some(client_id) = self.channels.get(&id).map(|c| c.client_id) else {
            return Err(KeelError::Protocol(format!("Unknown channel {}", id)));
        };

        let ChannelRequestType::Exec { command } = request.request_type() else {
            if request.want_reply() {
                self.send(&ChannelFailure::new(client_id).to_bytes()).await?;
            }
            return Ok(false);
        };
        self.log.commands.push(command.clone());

        if let Some((reason, description)) = self.setup.disconnect_on_exec.clone() {
            let mut msg = BytesMut::new();
            msg.put_u8(MessageType::Disconnect as u8);
            msg.put_u32(reason);
            write_string(&mut msg, &description);
            write_string(&mut msg, "");
            self.send(&msg).await?;
            return Ok(true);
        }

        let reply = (self.setup.exec)(command);
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        if reply.stall {
            return Ok(false);
        }
        if reply.refuse {
            self.send(&ChannelFailure::new(client_id).to_bytes()).await?;
            return Ok(false);
        }
        if request.want_reply() {
            self.send(&ChannelSuccess::new(client_id).to_bytes()).await?;
        }
        if reply.echo_stdin {
            if let Some(channel) = self.channels.get_mut(&id) {
                channel.echo = Some(reply);
            }
            return Ok(false);
        }

        if !reply.stderr.is_empty() {
            let stderr = ChannelExtendedData::new(
                client_id,
                ExtendedDataType::Stderr,
                reply.stderr.clone(),
            );
            self.send(&stderr.to_bytes()).await?;
        }
        if let Some(channel) = self.channels.get_mut(&id) {
            let chunk = channel.client_max_packet.max(1) as usize;
            channel.pending = reply.stdout.chunks(chunk).map(<[u8]>::to_vec).collect();
            channel.finish = Some(reply);
        }
        self.flush(id).await?;
        Ok(false)
    }

    /// Collects stdin, refilling the window once half of it is used.
    async fn channel_data(&mut self, payload: &[u8]) -> KeelResult<()> {
        let data = ChannelData::from_bytes(payload)?;
        let id = data.recipient_channel();
        let len = data.data().len();
        if len > self.setup.max_packet as usize {
            return Err(KeelError::Protocol(format!(
                "Client sent {} bytes, max packet is {}",
                len, self.setup.max_packet
            )));
        }
        self.log.stdin_packets.push(len);

        let Some(channel) = self.channels.get_mut(&id) else {
            return Err(KeelError::Protocol(format!("Unknown channel {}", id)));
        };
        if len as u32 > channel.server_window {
            return Err(KeelError::Protocol(format!(
                "Client overran the window: {} > {}",
                len, channel.server_window
            )));
        }
        channel.server_window -= len as u32;
        channel.stdin.extend_from_slice(data.data());

        let window = self.setup.window_size;
        if channel.server_window < window / 2 {
            let add = window - channel.server_window;
            channel.server_window = window;
            let adjust = ChannelWindowAdjust::new(channel.client_id, add);
            self.send(&adjust.to_bytes()).await?;
        }
        Ok(())
    }

    /// Sends queued stdout within the client's window, then finishes the
    /// exec once everything is out.
    async fn flush(&mut self, id: u32) -> KeelResult<()> {
        let mut out = Vec::new();
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };

        while let Some(front) = channel.pending.front_mut() {
            if channel.client_window == 0 {
                break;
            }
            let take = front.len().min(channel.client_window as usize);
            let data: Vec<u8> = front.drain(..take).collect();
            channel.client_window -= take as u32;
            if front.is_empty() {
                channel.pending.pop_front();
            }
            out.push(ChannelData::new(channel.client_id, data).to_bytes());
        }

        if channel.pending.is_empty() && !channel.closed {
            if let Some(finish) = channel.finish.take() {
                if let Some(status) = finish.status {
                    let exit = ChannelRequest::new(
                        channel.client_id,
                        ChannelRequestType::ExitStatus {
                            exit_status: status,
                        },
                        false,
                    );
                    out.push(exit.to_bytes());
                }
                out.push(ChannelEof::new(channel.client_id).to_bytes());
                out.push(ChannelClose::new(channel.client_id).to_bytes());
                channel.closed = true;
            }
        }

        for payload in out {
            self.send(&payload).await?;
        }
        Ok(())
    }
}
