//! russh Handler implementation for the honeypot server.
//!
//! This module adapts russh's callback-driven `Handler` trait to the
//! session layer's stream model: channel offers go to the session's
//! dispatch loop, every channel request is re-encoded into its wire payload
//! and queued on the channel's ordered event stream, and dispatcher output
//! is pumped back onto the wire through the session handle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use russh::server::{Auth, Handle, Handler as RusshHandler, Msg, Session as SshSession};
use russh::{Channel, ChannelId, Disconnect};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::dispatcher::{ChannelEvent, ChannelOutput};
use crate::request::{
    ChannelRequest, EnvRequest, PtyRequest, WindowChangeRequest, encode_single_string,
};
use crate::session::{
    ConnectionControl, GlobalRequest, Session, SessionIdentity, SessionLinks, SessionRegistry,
    SessionSettings,
};
use crate::{Error, ServerOptions};

pub(crate) use russh::server::{Config as RusshConfig, run_stream};

type HandlerResult<T> = std::result::Result<T, Error>;

/// State every connection handler of one server shares.
pub struct ServerState {
    /// Options the server was started with.
    pub options: ServerOptions,
    /// Settings handed to every session.
    pub settings: SessionSettings,
    /// Live sessions.
    pub registry: SessionRegistry,
    connection_counter: AtomicU64,
}

impl ServerState {
    /// Derives session settings and the registry from `options`.
    pub fn new(options: ServerOptions) -> Self {
        let settings = options.session_settings();
        let registry = SessionRegistry::new(options.max_sessions);
        Self {
            options,
            settings,
            registry,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Allocates a connection id. Ids start at 1.
    pub fn next_connection_id(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Closes a russh connection through its session handle.
struct RusshConnection {
    handle: Handle,
}

#[async_trait]
impl ConnectionControl for RusshConnection {
    async fn disconnect(&self, reason: &str) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, reason.to_string(), "en".to_string())
            .await;
    }
}

/// Encodes russh's parsed terminal modes back into the opaque mode string.
fn encode_modes(modes: &[(russh::Pty, u32)]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(modes.len() * 5 + 1);
    for (opcode, value) in modes {
        out.put_u8(*opcode as u8);
        out.put_u32(*value);
    }
    // TTY_OP_END
    out.put_u8(0);
    out.to_vec()
}

/// russh callbacks for one TCP connection.
pub struct HoneypotHandler {
    connection_id: u64,
    remote_addr: SocketAddr,
    /// Name the client authenticated as.
    user: Option<String>,
    server_state: Arc<ServerState>,
    /// Session started after authentication.
    session: Option<Session>,
    /// Links into the running session.
    links: Option<SessionLinks>,
    /// Event queues of open channels.
    channels: HashMap<ChannelId, mpsc::UnboundedSender<ChannelEvent>>,
}

impl HoneypotHandler {
    /// Creates the handler for a client at `remote_addr`.
    pub fn new(remote_addr: SocketAddr, server_state: Arc<ServerState>) -> Self {
        let connection_id = server_state.next_connection_id();
        debug!(
            connection_id,
            remote_addr = %remote_addr,
            "Connection handler ready"
        );

        Self {
            connection_id,
            remote_addr,
            user: None,
            server_state,
            session: None,
            links: None,
            channels: HashMap::new(),
        }
    }

    /// Returns the connection ID.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn push(&self, channel: ChannelId, event: ChannelEvent) {
        match self.channels.get(&channel) {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => trace!(
                connection_id = self.connection_id,
                channel = ?channel,
                "Event for unknown channel dropped"
            ),
        }
    }

    fn push_request(&self, channel: ChannelId, name: &str, payload: Bytes) {
        self.push(channel, ChannelEvent::Request(bridged_request(name, payload)));
    }

    async fn offer_channel(
        &mut self,
        channel_type: &str,
        channel: Channel<Msg>,
        session: &mut SshSession,
    ) -> Result<bool, Error> {
        let Some(links) = self.links.clone() else {
            warn!(
                connection_id = self.connection_id,
                channel_type,
                "Channel offered before authentication"
            );
            return Ok(false);
        };

        let channel_id = channel.id();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        if let Err(reason) = links.offer_channel(channel_type, event_rx, output_tx).await {
            debug!(
                connection_id = self.connection_id,
                channel = ?channel_id,
                channel_type,
                code = reason.code(),
                reason = %reason,
                "Channel rejected"
            );
            return Ok(false);
        }

        tokio::spawn(pump_output(
            self.connection_id,
            channel,
            session.handle(),
            output_rx,
        ));
        self.channels.insert(channel_id, event_tx);
        Ok(true)
    }

    fn record_auth(&self, method: &str, user: &str, secret: &str, accepted: bool) {
        info!(
            connection_id = self.connection_id,
            remote_addr = %self.remote_addr,
            method,
            user,
            secret,
            accepted,
            "Authentication attempt"
        );
    }
}

/// Writes dispatcher output onto the wire until the channel closes.
async fn pump_output(
    connection_id: u64,
    channel: Channel<Msg>,
    handle: Handle,
    mut output: mpsc::UnboundedReceiver<ChannelOutput>,
) {
    let channel_id = channel.id();
    debug!(connection_id, channel = ?channel_id, "Starting output pump");
    while let Some(msg) = output.recv().await {
        match msg {
            ChannelOutput::Success => {
                let _ = handle.channel_success(channel_id).await;
            }
            ChannelOutput::Failure => {
                let _ = handle.channel_failure(channel_id).await;
            }
            ChannelOutput::Data(data) => {
                let _ = channel.data(&data[..]).await;
            }
            ChannelOutput::ExitStatus(code) => {
                let _ = handle.exit_status_request(channel_id, code).await;
            }
            ChannelOutput::Close => {
                let _ = channel.close().await;
                break;
            }
        }
    }
    debug!(connection_id, channel = ?channel_id, "Output pump finished");
}

#[async_trait]
impl RusshHandler for HoneypotHandler {
    type Error = Error;

    /// Logs the credentials and answers per the password policy.
    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> HandlerResult<Auth> {
        let accepted = self.server_state.options.auth.check_password(user, password);
        self.record_auth("password", user, password, accepted);

        if accepted {
            self.user = Some(user.to_string());
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh_keys::key::PublicKey,
    ) -> HandlerResult<Auth> {
        let accepted = self.server_state.options.auth.accept_public_keys;
        self.record_auth("publickey", user, public_key.name(), accepted);

        if accepted {
            self.user = Some(user.to_string());
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_none(&mut self, user: &str) -> HandlerResult<Auth> {
        self.record_auth("none", user, "", false);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    /// Starts the session once the client is authenticated.
    async fn auth_succeeded(
        &mut self,
        session: &mut SshSession,
    ) -> HandlerResult<()> {
        let identity = SessionIdentity {
            user: self.user.clone().unwrap_or_default(),
            remote_addr: self.remote_addr,
            client_version: String::from_utf8_lossy(session.remote_sshid()).to_string(),
        };
        let connection = Arc::new(RusshConnection {
            handle: session.handle(),
        });
        let (honeypot_session, links) = Session::start(
            self.connection_id,
            identity.clone(),
            connection,
            self.server_state.settings.clone(),
        );

        // Registration failure drops the session, which ends the connection.
        self.server_state.registry.register(
            self.connection_id,
            &identity.user,
            identity.remote_addr,
            &identity.client_version,
            honeypot_session.cancellation(),
        )?;

        self.session = Some(honeypot_session);
        self.links = Some(links);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut SshSession,
    ) -> HandlerResult<bool> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel.id(),
            "Session channel opened"
        );
        self.offer_channel("session", channel, session).await
    }

    /// Direct TCP/IP forwarding is offered to the session, which rejects it.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut SshSession,
    ) -> HandlerResult<bool> {
        info!(
            connection_id = self.connection_id,
            user = ?self.user,
            target = %format!("{host_to_connect}:{port_to_connect}"),
            originator = %format!("{originator_address}:{originator_port}"),
            "Direct TCP/IP channel requested"
        );
        self.offer_channel("direct-tcpip", channel, session).await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        cols: u32,
        rows: u32,
        px_width: u32,
        px_height: u32,
        modes: &[(russh::Pty, u32)],
        _session: &mut SshSession,
    ) -> HandlerResult<()> {
        let pty = PtyRequest {
            term: term.to_string(),
            width: cols,
            height: rows,
            pixel_width: px_width,
            pixel_height: px_height,
            modes: encode_modes(modes),
        };
        self.push_request(channel, "pty-req", pty.encode());
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        _session: &mut SshSession,
    ) -> HandlerResult<()> {
        self.push_request(channel, "shell", Bytes::new());
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut SshSession,
    ) -> HandlerResult<()> {
        self.push_request(channel, "exec", encode_single_string(data));
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        value: &str,
        _session: &mut SshSession,
    ) -> HandlerResult<()> {
        let env = EnvRequest {
            name: name.to_string(),
            value: value.to_string(),
        };
        self.push_request(channel, "env", env.encode());
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        _session: &mut SshSession,
    ) -> HandlerResult<()> {
        self.push_request(channel, "subsystem", encode_single_string(name.as_bytes()));
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        cols: u32,
        rows: u32,
        px_width: u32,
        px_height: u32,
        _session: &mut SshSession,
    ) -> HandlerResult<()> {
        let change = WindowChangeRequest {
            width: cols,
            height: rows,
        };
        self.push_request(channel, "window-change", change.encode(px_width, px_height));
        Ok(())
    }

    /// Keystrokes and piped input.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut SshSession,
    ) -> HandlerResult<()> {
        self.push(channel, ChannelEvent::Data(Bytes::copy_from_slice(data)));
        Ok(())
    }

    /// Remote port forwarding is always refused.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut SshSession,
    ) -> HandlerResult<bool> {
        debug!(
            connection_id = self.connection_id,
            address,
            port = *port,
            "tcpip-forward requested"
        );
        if let Some(links) = &self.links {
            links.global_request(GlobalRequest {
                name: "tcpip-forward".to_string(),
                want_reply: true,
            });
        }
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut SshSession,
    ) -> HandlerResult<bool> {
        debug!(
            connection_id = self.connection_id,
            address,
            port,
            "cancel-tcpip-forward requested"
        );
        if let Some(links) = &self.links {
            links.global_request(GlobalRequest {
                name: "cancel-tcpip-forward".to_string(),
                want_reply: true,
            });
        }
        Ok(false)
    }

    /// The client will send nothing more; ends the channel's event stream.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut SshSession,
    ) -> HandlerResult<()> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            "Client sent EOF"
        );
        self.channels.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut SshSession,
    ) -> HandlerResult<()> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            "Client closed channel"
        );
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for HoneypotHandler {
    fn drop(&mut self) {
        // Ending the event streams and the session unblocks every task of
        // this connection.
        self.channels.clear();
        self.links = None;
        if self.session.take().is_some() {
            self.server_state.registry.remove(self.connection_id);
        }
    }
}

/// Hands out one [`HoneypotHandler`] per accepted socket.
pub struct HoneypotHandlerFactory {
    server_state: Arc<ServerState>,
}

impl HoneypotHandlerFactory {
    /// Creates the shared state for a server with `options`.
    pub fn new(options: ServerOptions) -> Self {
        Self {
            server_state: Arc::new(ServerState::new(options)),
        }
    }

    /// Creates the handler for a freshly accepted socket.
    pub fn create_handler(&self, remote_addr: SocketAddr) -> HoneypotHandler {
        HoneypotHandler::new(remote_addr, Arc::clone(&self.server_state))
    }

    /// Returns the shared server state.
    pub fn state(&self) -> &Arc<ServerState> {
        &self.server_state
    }

    /// Signals all live sessions to shut down.
    pub fn shutdown(&self) {
        self.server_state.registry.shutdown_all();
    }
}

/// Builds the request queued for a russh callback.
///
/// russh does not pass `want_reply` to request callbacks. `window-change`
/// never asks for a reply (RFC 4254 section 6.7), so it is queued silent;
/// every other request is answered.
fn bridged_request(name: &str, payload: Bytes) -> ChannelRequest {
    ChannelRequest::new(name, payload).with_want_reply(name != "window-change")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_state_connection_ids() {
        let state = ServerState::new(ServerOptions::default());
        assert_eq!(state.next_connection_id(), 1);
        assert_eq!(state.next_connection_id(), 2);
    }

    #[test]
    fn test_encode_modes_terminated() {
        let modes = [(russh::Pty::VINTR, 3), (russh::Pty::ECHO, 1)];
        let encoded = encode_modes(&modes);
        assert_eq!(encoded.len(), 11);
        assert_eq!(encoded[0], russh::Pty::VINTR as u8);
        assert_eq!(&encoded[1..5], &[0, 0, 0, 3]);
        assert_eq!(encoded[10], 0);
    }

    #[test]
    fn test_bridged_window_change_wants_no_reply() {
        let change = WindowChangeRequest {
            width: 132,
            height: 43,
        };
        let request = bridged_request("window-change", change.encode(0, 0));
        assert!(!request.want_reply);
        assert_eq!(WindowChangeRequest::decode(&request.payload).unwrap(), change);

        assert!(bridged_request("pty-req", Bytes::new()).want_reply);
        assert!(bridged_request("shell", Bytes::new()).want_reply);
        assert!(bridged_request("env", Bytes::new()).want_reply);
    }

    #[test]
    fn test_factory_assigns_distinct_ids() {
        let factory = HoneypotHandlerFactory::new(ServerOptions::default());
        let addr: SocketAddr = "192.0.2.1:2222".parse().unwrap();
        let first = factory.create_handler(addr);
        let second = factory.create_handler(addr);
        assert_ne!(first.connection_id(), second.connection_id());
        assert_eq!(factory.state().registry.count(), 0);
    }
}
