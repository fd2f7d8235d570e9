//! Connection-scoped session state.
//!
//! A [`Session`] exists for every authenticated connection. Starting one
//! spawns three tasks bound to the connection's lifetime:
//! - the idle watchdog ([`watchdog::run_watchdog`]),
//! - a sink that refuses connection-level requests,
//! - the channel dispatch loop, which starts one
//!   [`ChannelDispatcher`](crate::dispatcher::ChannelDispatcher) per
//!   accepted `session` channel.
//!
//! The transport side talks to these tasks through [`SessionLinks`].
//! Dropping the session cancels all of them and leaves the transport to its
//! owner. [`Session::shutdown`] also closes the connection.
//!
//! # Example
//!
//! ```rust,ignore
//! let (session, links) = Session::start(1, identity, connection, settings);
//! links.offer_channel("session", events_rx, output_tx).await?;
//! ```

mod registry;
mod watchdog;

pub use registry::{DEFAULT_MAX_SESSIONS, SessionInfo, SessionRegistry};
pub use watchdog::{ConnectionControl, WatchdogExit, run_watchdog};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{ChannelContext, ChannelDispatcher, ChannelEvent, ChannelOutput};
use crate::shell::ShellSettings;

/// Channel type served by the honeypot.
pub const SESSION_CHANNEL_TYPE: &str = "session";

/// Default idle timeout before a silent connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Liveness signal feeding a connection's watchdog.
///
/// Every observed request or read calls [`touch`](Self::touch). Once all
/// clones are dropped, the watchdog treats the connection as gone.
#[derive(Clone, Debug)]
pub struct ActivitySignal {
    tx: mpsc::UnboundedSender<()>,
}

impl ActivitySignal {
    /// Creates a signal and the receiver the watchdog consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Records activity. Never blocks.
    pub fn touch(&self) {
        let _ = self.tx.send(());
    }
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Authenticated principal name.
    pub user: String,
    /// Remote peer address.
    pub remote_addr: SocketAddr,
    /// Client-reported version string.
    pub client_version: String,
}

/// Reasons a channel offer is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenFailure {
    /// The channel type is not served here.
    UnknownChannelType,
    /// The session is shutting down.
    ConnectFailed,
}

impl ChannelOpenFailure {
    /// Protocol reason code for this failure.
    pub fn code(self) -> u32 {
        match self {
            Self::ConnectFailed => 2,
            Self::UnknownChannelType => 3,
        }
    }
}

impl fmt::Display for ChannelOpenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownChannelType => write!(f, "unknown channel type"),
            Self::ConnectFailed => write!(f, "session closed"),
        }
    }
}

/// A logical channel offered by the peer.
pub struct NewChannel {
    /// Declared channel type.
    pub channel_type: String,
    /// Ordered events for the channel.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    /// Where the dispatcher writes replies and data.
    pub output: mpsc::UnboundedSender<ChannelOutput>,
    /// Receives the accept/reject decision.
    pub decision: oneshot::Sender<Result<(), ChannelOpenFailure>>,
}

/// A connection-level (non-channel) request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    pub name: String,
    pub want_reply: bool,
}

/// Settings applied to every session of a server.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Idle deadline enforced by the watchdog.
    pub idle_timeout: Duration,
    /// Shell configuration.
    pub shell: Arc<ShellSettings>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shell: Arc::new(ShellSettings::default()),
        }
    }
}

/// Transport-facing handles into a running session.
#[derive(Clone)]
pub struct SessionLinks {
    channels: mpsc::UnboundedSender<NewChannel>,
    global_requests: mpsc::UnboundedSender<GlobalRequest>,
}

impl SessionLinks {
    /// Offers a channel and waits for the dispatch loop's decision.
    pub async fn offer_channel(
        &self,
        channel_type: &str,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        output: mpsc::UnboundedSender<ChannelOutput>,
    ) -> Result<(), ChannelOpenFailure> {
        let (decision, decision_rx) = oneshot::channel();
        let offer = NewChannel {
            channel_type: channel_type.to_string(),
            events,
            output,
            decision,
        };
        if self.channels.send(offer).is_err() {
            return Err(ChannelOpenFailure::ConnectFailed);
        }
        decision_rx
            .await
            .unwrap_or(Err(ChannelOpenFailure::ConnectFailed))
    }

    /// Hands a connection-level request to the discard task.
    pub fn global_request(&self, request: GlobalRequest) {
        let _ = self.global_requests.send(request);
    }
}

/// State of one authenticated connection.
pub struct Session {
    id: u64,
    identity: SessionIdentity,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    watchdog: Option<JoinHandle<WatchdogExit>>,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.identity.user)
            .field("remote_addr", &self.identity.remote_addr)
            .field("client_version", &self.identity.client_version)
            .finish()
    }
}

impl Session {
    /// Starts a session for an authenticated connection.
    ///
    /// Spawns the watchdog, the connection-request sink and the channel
    /// dispatch loop, and returns the links the transport feeds them with.
    pub fn start(
        id: u64,
        identity: SessionIdentity,
        connection: Arc<dyn ConnectionControl>,
        settings: SessionSettings,
    ) -> (Self, SessionLinks) {
        info!(
            connection_id = id,
            user = %identity.user,
            remote_addr = %identity.remote_addr,
            client_version = %identity.client_version,
            "New SSH connection"
        );

        let shutdown = CancellationToken::new();
        let cancel = shutdown.child_token();
        let (activity, activity_rx) = ActivitySignal::channel();
        let (channels_tx, channels_rx) = mpsc::unbounded_channel();
        let (global_tx, global_rx) = mpsc::unbounded_channel();

        let watchdog = tokio::spawn(run_watchdog(
            activity_rx,
            settings.idle_timeout,
            connection,
            shutdown.clone(),
            cancel.clone(),
        ));

        let discard = tokio::spawn(discard_requests(global_rx, activity.clone(), cancel.clone()));

        let dispatch = tokio::spawn(dispatch_channels(
            channels_rx,
            ChannelContext {
                label: format!("conn-{id}"),
                user: identity.user.clone(),
                activity,
                shell: settings.shell,
                cancel: cancel.clone(),
            },
        ));

        let session = Self {
            id,
            identity,
            shutdown,
            cancel,
            watchdog: Some(watchdog),
            tasks: vec![discard, dispatch],
        };
        let links = SessionLinks {
            channels: channels_tx,
            global_requests: global_tx,
        };
        (session, links)
    }

    /// Returns the connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the authenticated user.
    pub fn user(&self) -> &str {
        &self.identity.user
    }

    /// Returns the remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.identity.remote_addr
    }

    /// Returns the client version banner.
    pub fn client_version(&self) -> &str {
        &self.identity.client_version
    }

    /// Returns the token that shuts this session down when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Waits for the watchdog to stop and reports why.
    ///
    /// Returns `None` if already awaited.
    pub async fn closed(&mut self) -> Option<WatchdogExit> {
        self.watchdog.take()?.await.ok()
    }

    /// Closes the connection with reason `server shutdown` and cancels
    /// every task of this session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
        debug!(connection_id = self.id, "Session dropped");
    }
}

/// Refuses connection-level requests. Exits when the connection goes away.
async fn discard_requests(
    mut requests: mpsc::UnboundedReceiver<GlobalRequest>,
    activity: ActivitySignal,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            () = cancel.cancelled() => break,
            request = requests.recv() => request,
        };
        let Some(request) = request else { break };
        activity.touch();
        debug!(
            request = %request.name,
            want_reply = request.want_reply,
            "Discarding connection request"
        );
    }
}

/// Accepts `session` channels and rejects everything else.
async fn dispatch_channels(
    mut incoming: mpsc::UnboundedReceiver<NewChannel>,
    base: ChannelContext,
) {
    let mut next_channel = 0u64;
    loop {
        let offer = tokio::select! {
            () = base.cancel.cancelled() => break,
            offer = incoming.recv() => offer,
        };
        let Some(offer) = offer else { break };
        base.activity.touch();

        if offer.channel_type != SESSION_CHANNEL_TYPE {
            warn!(
                session = %base.label,
                channel_type = %offer.channel_type,
                "Unknown channel type"
            );
            let _ = offer
                .decision
                .send(Err(ChannelOpenFailure::UnknownChannelType));
            continue;
        }

        if offer.decision.send(Ok(())).is_err() {
            continue;
        }

        let ctx = ChannelContext {
            label: format!("{}/ch-{next_channel}", base.label),
            ..base.clone()
        };
        next_channel += 1;
        let dispatcher = ChannelDispatcher::new(ctx, offer.output);
        tokio::spawn(dispatcher.run(offer.events));
    }
    debug!(session = %base.label, "Channel dispatch loop finished");
}

#[cfg(test)]
mod tests {
    use super::watchdog::tests::RecordingConnection;
    use super::*;
    use crate::request::ChannelRequest;
    use bytes::Bytes;

    fn identity() -> SessionIdentity {
        SessionIdentity {
            user: "root".to_string(),
            remote_addr: "198.51.100.4:40022".parse().unwrap(),
            client_version: "SSH-2.0-libssh_0.9.6".to_string(),
        }
    }

    #[tokio::test]
    async fn test_non_session_channel_rejected() {
        let conn = Arc::new(RecordingConnection::default());
        let (_session, links) = Session::start(1, identity(), conn, SessionSettings::default());

        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let result = links.offer_channel("direct-tcpip", events_rx, out_tx).await;
        assert_eq!(result, Err(ChannelOpenFailure::UnknownChannelType));
        assert_eq!(ChannelOpenFailure::UnknownChannelType.code(), 3);
    }

    #[tokio::test]
    async fn test_session_channel_accepted_and_served() {
        let conn = Arc::new(RecordingConnection::default());
        let (_session, links) = Session::start(2, identity(), conn, SessionSettings::default());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        links
            .offer_channel("session", events_rx, out_tx)
            .await
            .unwrap();

        events_tx
            .send(ChannelEvent::Request(ChannelRequest::new(
                "window-change",
                Bytes::from_static(&[0; 16]),
            )))
            .unwrap();
        drop(events_tx);

        assert_eq!(out_rx.recv().await, Some(ChannelOutput::Failure));
        assert_eq!(out_rx.recv().await, Some(ChannelOutput::ExitStatus(0)));
        assert_eq!(out_rx.recv().await, Some(ChannelOutput::Close));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_session_refuses_offers() {
        let conn = Arc::new(RecordingConnection::default());
        let (session, links) = Session::start(3, identity(), conn, SessionSettings::default());
        drop(session);

        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let result = links.offer_channel("session", events_rx, out_tx).await;
        assert_eq!(result, Err(ChannelOpenFailure::ConnectFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_disconnected() {
        let conn = Arc::new(RecordingConnection::default());
        let settings = SessionSettings {
            idle_timeout: Duration::from_secs(30),
            ..SessionSettings::default()
        };
        let (mut session, links) = Session::start(4, identity(), conn.clone(), settings);

        tokio::time::sleep(Duration::from_secs(20)).await;
        links.global_request(GlobalRequest {
            name: "keepalive@openssh.com".to_string(),
            want_reply: true,
        });
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(conn.reasons.lock().is_empty());

        assert_eq!(session.closed().await, Some(WatchdogExit::IdleTimeout));
        assert_eq!(conn.reasons.lock().len(), 1);
        drop(links);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_connection() {
        let conn = Arc::new(RecordingConnection::default());
        let settings = SessionSettings {
            idle_timeout: Duration::from_secs(30),
            ..SessionSettings::default()
        };
        let (mut session, links) = Session::start(5, identity(), conn.clone(), settings);

        session.shutdown();
        assert_eq!(session.closed().await, Some(WatchdogExit::Shutdown));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(*conn.reasons.lock(), vec!["server shutdown".to_string()]);

        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let result = links.offer_channel("session", events_rx, out_tx).await;
        assert_eq!(result, Err(ChannelOpenFailure::ConnectFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_shutdown_closes_connection() {
        let conn = Arc::new(RecordingConnection::default());
        let (mut session, _links) =
            Session::start(6, identity(), conn.clone(), SessionSettings::default());
        let registry = SessionRegistry::new(4);
        registry
            .register(
                session.id(),
                session.user(),
                session.remote_addr(),
                session.client_version(),
                session.cancellation(),
            )
            .unwrap();

        registry.shutdown_all();
        assert_eq!(session.closed().await, Some(WatchdogExit::Shutdown));
        assert_eq!(*conn.reasons.lock(), vec!["server shutdown".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_session_leaves_connection_to_owner() {
        let conn = Arc::new(RecordingConnection::default());
        let (session, _links) =
            Session::start(7, identity(), conn.clone(), SessionSettings::default());

        drop(session);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(conn.reasons.lock().is_empty());
    }
}
