//! SSH client session.
//!
//! [`SshClient`] is a handle to a session task. The task owns the
//! connection and every protocol state machine; the handle sends it
//! commands and waits for the answers.
//!
//! Lifecycle: connect once, authenticate, then run any number of execs one
//! at a time.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::client::SshClient;
//! use keel_proto::ssh::config::{ClientConfig, Config};
//! use keel_proto::ssh::message::DisconnectReason;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new(ClientConfig::default())
//!     .with_server_key_verifier(|_key: &keel_proto::ssh::PublicKey| true);
//! let client = SshClient::connect("127.0.0.1:22", config).await?;
//!
//! client.authenticate_password("user", "password").await?;
//! let output = client.exec("ls -la").await?;
//! println!("{} {}", output.status, String::from_utf8_lossy(&output.output));
//!
//! client.disconnect(DisconnectReason::ByApplication, "bye", "en").await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{self, AuthStep, Authenticator, KeyAuth};
use crate::ssh::channel::{ChannelEvent, ChannelMultiplexer, ExecOutput};
use crate::ssh::config::{AuthBannerHandler, Config};
use crate::ssh::hostkey::PublicKey;
use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::message::{self, DisconnectReason, MessageType};
use crate::ssh::privatekey::KeyPair;
use crate::ssh::transport::Transport;
use keel_platform::{KeelError, KeelResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Commands queued to the session task.
const COMMAND_QUEUE: usize = 16;

type Reply<T> = oneshot::Sender<KeelResult<T>>;

enum Command {
    AuthPassword {
        user: String,
        password: Zeroizing<String>,
        reply: Reply<bool>,
    },
    AuthKey {
        user: String,
        key: Box<KeyPair>,
        reply: Reply<bool>,
    },
    Exec {
        command: String,
        input: Vec<u8>,
        reply: Reply<ExecOutput>,
    },
    Disconnect {
        reason: DisconnectReason,
        description: String,
        language_tag: String,
        reply: Reply<()>,
    },
}

/// What the handle can see of the session.
#[derive(Debug, Clone, Default)]
struct SessionInfo {
    server_host_key: Option<PublicKey>,
    session_id: Vec<u8>,
    negotiated: Option<NegotiatedAlgorithms>,
    authenticated: bool,
    closed: bool,
}

/// Handle to an SSH session.
///
/// All methods take `&self`; the session task serializes them. Dropping
/// the handle ends the session.
pub struct SshClient {
    commands: mpsc::Sender<Command>,
    info: watch::Receiver<SessionInfo>,
    server_address: String,
}

impl SshClient {
    /// Dials `address` ("host:port") and sets up the session.
    ///
    /// # Errors
    ///
    /// - [`KeelError::Config`] for an invalid address or configuration
    /// - [`KeelError::Timeout`] when the TCP connect exceeds
    ///   `connect_timeout`
    /// - any handshake error of [`connect_stream`](Self::connect_stream)
    pub async fn connect(address: &str, config: Config) -> KeelResult<Self> {
        config.client.validate()?;
        check_address(address)?;

        let connect_timeout = config.client.connect_timeout;
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                KeelError::Timeout(format!(
                    "Connecting to {} took longer than {:?}",
                    address, connect_timeout
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!(address, "TCP connection established");

        Self::connect_stream(stream, address, config).await
    }

    /// Sets up a session over an already connected stream.
    ///
    /// Runs the identification exchange and the first key exchange, then
    /// hands the stream to the session task.
    pub async fn connect_stream<S>(stream: S, address: &str, config: Config) -> KeelResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.client.validate()?;

        let transport = Transport::handshake(stream, &config).await?;
        let auth = Authenticator::new(config.client.anonymous);

        let info = SessionInfo {
            server_host_key: transport.server_host_key().cloned(),
            session_id: transport.session_id().map(<[u8]>::to_vec).unwrap_or_default(),
            negotiated: transport.negotiated().copied(),
            authenticated: auth.is_authenticated(),
            closed: false,
        };
        let (info_tx, info_rx) = watch::channel(info);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);

        let task = SessionTask {
            transport,
            auth,
            channels: ChannelMultiplexer::new(
                config.client.window_size,
                config.client.maximum_packet_size,
            ),
            commands: command_rx,
            info: info_tx,
            banner: config.auth_banner.clone(),
            inactivity_timeout: config.client.inactivity_timeout,
            pending_auth: None,
            pending_exec: None,
        };
        tokio::spawn(task.run());

        info!(address, "SSH session established");
        Ok(Self {
            commands: command_tx,
            info: info_rx,
            server_address: address.to_string(),
        })
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> KeelResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| KeelError::ConnectionClosed)?;
        response.await.map_err(|_| KeelError::ConnectionClosed)?
    }

    /// Password authentication.
    ///
    /// Returns `Ok(true)` once authenticated and `Ok(false)` when the server
    /// accepted the password but wants another method as well.
    ///
    /// # Errors
    ///
    /// - [`KeelError::AuthenticationFailed`] with the methods the server
    ///   still accepts; another attempt may follow
    /// - [`KeelError::InvalidState`] when already authenticated or no
    ///   methods remain
    pub async fn authenticate_password(&self, user: &str, password: &str) -> KeelResult<bool> {
        self.request(|reply| Command::AuthPassword {
            user: user.to_string(),
            password: Zeroizing::new(password.to_string()),
            reply,
        })
        .await
    }

    /// Public key authentication. The key is loaded before anything is sent.
    pub async fn authenticate_key_pair(&self, user: &str, key: KeyAuth) -> KeelResult<bool> {
        let key = key.resolve()?;
        self.request(|reply| Command::AuthKey {
            user: user.to_string(),
            key: Box::new(key),
            reply,
        })
        .await
    }

    /// Runs `command` on a new session channel and collects its output.
    ///
    /// # Errors
    ///
    /// - [`KeelError::InvalidState`] before authentication or while another
    ///   exec is running
    /// - [`KeelError::ChannelOpenFailed`] / [`KeelError::Channel`] when the
    ///   server refuses; the session stays usable
    pub async fn exec(&self, command: &str) -> KeelResult<ExecOutput> {
        self.exec_with_input(command, &[]).await
    }

    /// Like [`exec`](Self::exec), writing `input` to the command's stdin
    /// before EOF. Input larger than the server's window goes out as the
    /// server adjusts it.
    pub async fn exec_with_input(&self, command: &str, input: &[u8]) -> KeelResult<ExecOutput> {
        self.request(|reply| Command::Exec {
            command: command.to_string(),
            input: input.to_vec(),
            reply,
        })
        .await
    }

    /// Sends DISCONNECT and ends the session. A pending exec fails with
    /// [`KeelError::ConnectionClosed`].
    pub async fn disconnect(
        &self,
        reason: DisconnectReason,
        description: &str,
        language_tag: &str,
    ) -> KeelResult<()> {
        self.request(|reply| Command::Disconnect {
            reason,
            description: description.to_string(),
            language_tag: language_tag.to_string(),
            reply,
        })
        .await
    }

    /// Returns true once the session task has ended.
    pub fn is_closed(&self) -> bool {
        self.info.borrow().closed || self.commands.is_closed()
    }

    /// The address passed to connect.
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    /// Host key from the most recent key exchange.
    pub fn server_host_key(&self) -> Option<PublicKey> {
        self.info.borrow().server_host_key.clone()
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Vec<u8> {
        self.info.borrow().session_id.clone()
    }

    /// Algorithms in force.
    pub fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        self.info.borrow().negotiated
    }

    /// Whether authentication has completed.
    pub fn is_authenticated(&self) -> bool {
        self.info.borrow().authenticated
    }
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("server_address", &self.server_address)
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn check_address(address: &str) -> KeelResult<()> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| KeelError::Config(format!("Address '{}' is not host:port", address)))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(KeelError::Config(format!(
            "Address '{}' is not host:port",
            address
        )));
    }
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct PendingExec {
    id: u32,
    command: String,
    input: Vec<u8>,
    reply: Reply<ExecOutput>,
}

/// Owns the connection; the only writer.
struct SessionTask<S> {
    transport: Transport<S>,
    auth: Authenticator,
    channels: ChannelMultiplexer,
    commands: mpsc::Receiver<Command>,
    info: watch::Sender<SessionInfo>,
    banner: Option<Arc<dyn AuthBannerHandler>>,
    inactivity_timeout: Option<Duration>,
    pending_auth: Option<Reply<bool>>,
    pending_exec: Option<PendingExec>,
}

impl<S> SessionTask<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run(mut self) {
        let result = self.serve().await;

        if let Err(err) = result {
            warn!(error = %err, "SSH session ended");
            // The pending call gets the real cause; at most one can be
            // outstanding since exec requires a finished authentication.
            if let Some(pending) = self.pending_exec.take() {
                let _ = pending.reply.send(Err(err));
            } else if let Some(reply) = self.pending_auth.take() {
                let _ = reply.send(Err(err));
            }
        }
        self.fail_pending();
        self.info.send_modify(|info| info.closed = true);
    }

    fn fail_pending(&mut self) {
        if let Some(pending) = self.pending_exec.take() {
            let _ = pending.reply.send(Err(KeelError::ConnectionClosed));
        }
        if let Some(reply) = self.pending_auth.take() {
            let _ = reply.send(Err(KeelError::ConnectionClosed));
        }
    }

    async fn serve(&mut self) -> KeelResult<()> {
        loop {
            let idle_deadline = self
                .inactivity_timeout
                .map(|timeout| self.transport.last_activity() + timeout);
            // Off while an exchange runs; its KEXINIT is already out.
            let rekey_deadline = (!self.transport.kex_in_progress())
                .then(|| self.transport.tracker().deadline());

            tokio::select! {
                payload = self.transport.next_payload() => {
                    if let Some(payload) = self.transport.handle(payload?).await? {
                        self.dispatch(payload).await?;
                    }
                    self.publish();
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.command(command).await? == Flow::Stop {
                            return Ok(());
                        }
                    }
                    None => {
                        debug!("Client handle dropped, ending session");
                        let _ = self
                            .transport
                            .disconnect(DisconnectReason::ByApplication, "", "")
                            .await;
                        return Ok(());
                    }
                },
                _ = sleep_until(idle_deadline) => {
                    info!("No traffic within the inactivity timeout");
                    let _ = self
                        .transport
                        .disconnect(DisconnectReason::ByApplication, "Inactivity timeout", "")
                        .await;
                    return Err(KeelError::InactivityTimeout);
                }
                _ = sleep_until(rekey_deadline) => {
                    debug!("Rekey time limit reached");
                    self.transport.rekey().await?;
                    self.publish();
                }
            }
        }
    }

    fn publish(&self) {
        let host_key = self.transport.server_host_key();
        let negotiated = self.transport.negotiated().copied();
        let authenticated = self.auth.is_authenticated();

        self.info.send_if_modified(|info| {
            let changed = info.server_host_key.as_ref() != host_key
                || info.negotiated != negotiated
                || info.authenticated != authenticated;
            if changed {
                info.server_host_key = host_key.cloned();
                info.negotiated = negotiated;
                info.authenticated = authenticated;
            }
            changed
        });
    }

    async fn send_all(&mut self, payloads: Vec<Vec<u8>>) -> KeelResult<()> {
        for payload in &payloads {
            self.transport.send(payload).await?;
        }
        Ok(())
    }

    async fn send_secret(&mut self, payloads: Vec<Zeroizing<Vec<u8>>>) -> KeelResult<()> {
        for payload in &payloads {
            self.transport.send(payload).await?;
        }
        Ok(())
    }

    async fn command(&mut self, command: Command) -> KeelResult<Flow> {
        let result = match command {
            Command::AuthPassword {
                user,
                password,
                reply,
            } => {
                let request = auth::password_request(&user, &password);
                self.begin_auth(request, reply).await
            }
            Command::AuthKey { user, key, reply } => {
                let session_id = self.transport.session_id().unwrap_or_default();
                let request = self
                    .auth
                    .ensure_ready()
                    .and_then(|()| auth::public_key_request(&user, &key, session_id));
                match request {
                    Ok(request) => self.begin_auth(request, reply).await,
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        Ok(())
                    }
                }
            }
            Command::Exec {
                command,
                input,
                reply,
            } => {
                if !self.auth.is_authenticated() {
                    let _ = reply.send(Err(KeelError::InvalidState(
                        "Not authenticated".to_string(),
                    )));
                    Ok(())
                } else if self.pending_exec.is_some() {
                    let _ = reply.send(Err(KeelError::InvalidState(
                        "Another exec is in flight".to_string(),
                    )));
                    Ok(())
                } else {
                    let (id, open) = self.channels.open_session();
                    self.pending_exec = Some(PendingExec {
                        id,
                        command,
                        input,
                        reply,
                    });
                    self.transport.send(&open).await
                }
            }
            Command::Disconnect {
                reason,
                description,
                language_tag,
                reply,
            } => {
                self.fail_pending();
                let result = self
                    .transport
                    .disconnect(reason, &description, &language_tag)
                    .await;
                let _ = reply.send(result);
                return Ok(Flow::Stop);
            }
        };
        result.map(|()| Flow::Continue)
    }

    async fn begin_auth(
        &mut self,
        request: Zeroizing<Vec<u8>>,
        reply: Reply<bool>,
    ) -> KeelResult<()> {
        match self.auth.begin(request) {
            Ok(out) => {
                self.pending_auth = Some(reply);
                self.send_secret(out).await
            }
            Err(err) => {
                let _ = reply.send(Err(err));
                Ok(())
            }
        }
    }

    async fn dispatch(&mut self, payload: Vec<u8>) -> KeelResult<()> {
        let Some(&msg_type) = payload.first() else {
            return Err(KeelError::Protocol("Empty payload".to_string()));
        };

        match msg_type {
            6 | 50..=79 => self.dispatch_auth(&payload).await,
            90..=100 => {
                let handled = self.channels.handle(&payload)?;
                self.send_all(handled.outbound).await?;
                match handled.event {
                    Some(event) => self.channel_event(event).await,
                    None => Ok(()),
                }
            }
            80 => {
                let (name, want_reply) = message::parse_global_request(&payload)?;
                debug!(request = %name, want_reply, "Global request");
                if want_reply {
                    self.transport.send(&message::request_failure()).await?;
                }
                Ok(())
            }
            _ => {
                warn!(
                    msg_type,
                    name = MessageType::from_u8(msg_type).map_or("unknown", |t| t.name()),
                    "Ignoring unexpected message"
                );
                Ok(())
            }
        }
    }

    async fn dispatch_auth(&mut self, payload: &[u8]) -> KeelResult<()> {
        match self.auth.handle(payload)? {
            AuthStep::Send(out) => self.send_secret(out).await,
            AuthStep::Banner(text) => {
                match &self.banner {
                    Some(handler) => handler.auth_banner(&text).await,
                    None => debug!(banner = %text, "Authentication banner"),
                }
                Ok(())
            }
            AuthStep::Done(result) => {
                if let Some(reply) = self.pending_auth.take() {
                    let _ = reply.send(result);
                }
                self.publish();
                Ok(())
            }
        }
    }

    async fn channel_event(&mut self, event: ChannelEvent) -> KeelResult<()> {
        let pending_id = self.pending_exec.as_ref().map(|p| p.id);

        match event {
            ChannelEvent::Opened { id } if pending_id == Some(id) => {
                let command = self
                    .pending_exec
                    .as_ref()
                    .map(|p| p.command.clone())
                    .unwrap_or_default();
                let request = self.channels.exec(id, &command)?;
                self.transport.send(&request).await
            }
            ChannelEvent::OpenFailed {
                id,
                reason,
                description,
            } if pending_id == Some(id) => {
                if let Some(pending) = self.pending_exec.take() {
                    let _ = pending
                        .reply
                        .send(Err(KeelError::ChannelOpenFailed { reason, description }));
                }
                Ok(())
            }
            ChannelEvent::RequestSucceeded { id } => {
                let input = match self.pending_exec.as_mut() {
                    Some(pending) if pending.id == id => std::mem::take(&mut pending.input),
                    _ => Vec::new(),
                };
                let mut out = if input.is_empty() {
                    Vec::new()
                } else {
                    self.channels.send_data(id, &input)?
                };
                out.extend(self.channels.send_eof(id)?);
                self.send_all(out).await
            }
            ChannelEvent::RequestFailed { id } => {
                if let Some(pending) = self.pending_exec.take_if_id(id) {
                    let _ = pending.reply.send(Err(KeelError::Channel(format!(
                        "Server refused exec request '{}'",
                        pending.command
                    ))));
                }
                if let Some(close) = self.channels.close(id)? {
                    self.transport.send(&close).await?;
                }
                Ok(())
            }
            ChannelEvent::Closed { id, output } => {
                if let Some(pending) = self.pending_exec.take_if_id(id) {
                    debug!(channel = id, status = output.status, "Exec finished");
                    let _ = pending.reply.send(Ok(output));
                }
                Ok(())
            }
            other => {
                debug!(event = ?other, "Channel event for an abandoned exec");
                Ok(())
            }
        }
    }
}

trait TakeIfId {
    fn take_if_id(&mut self, id: u32) -> Option<PendingExec>;
}

impl TakeIfId for Option<PendingExec> {
    fn take_if_id(&mut self, id: u32) -> Option<PendingExec> {
        if self.as_ref().is_some_and(|p| p.id == id) {
            self.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::config::ClientConfig;

    #[test]
    fn test_check_address() {
        assert!(check_address("example.com:22").is_ok());
        assert!(check_address("[::1]:2222").is_ok());
        assert!(matches!(check_address("example.com"), Err(KeelError::Config(_))));
        assert!(matches!(check_address(":22"), Err(KeelError::Config(_))));
        assert!(matches!(check_address("host:ssh"), Err(KeelError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_address() {
        let result = SshClient::connect("localhost", Config::default()).await;
        assert!(matches!(result, Err(KeelError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let config = Config::new(ClientConfig::default().with_window_size(0));
        let result = SshClient::connect("127.0.0.1:22", config).await;
        assert!(matches!(result, Err(KeelError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_stream_eof_during_handshake() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let result = SshClient::connect_stream(client, "test:22", Config::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        match SshClient::connect(&address, Config::default()).await {
            Err(KeelError::Io(_)) => {}
            other => panic!("expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_take_if_id() {
        let (reply, _rx) = oneshot::channel();
        let mut pending = Some(PendingExec {
            id: 3,
            command: "true".to_string(),
            input: Vec::new(),
            reply,
        });
        assert!(pending.take_if_id(4).is_none());
        assert!(pending.take_if_id(3).is_some());
        assert!(pending.is_none());
    }
}
