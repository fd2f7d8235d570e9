//! TCP listener and russh configuration.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HostKey, ServerOptions};
use crate::handler::{HoneypotHandler, HoneypotHandlerFactory, RusshConfig, run_stream};
use crate::{Error, Result};

/// SSH honeypot server.
pub struct Server {
    options: ServerOptions,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.options.address)
            .field("max_sessions", &self.options.max_sessions)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server. Options are used as given; see
    /// [`ServerBuilder`](crate::ServerBuilder) for validation.
    pub fn new(options: ServerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Returns the configured listen address.
    pub fn address(&self) -> &str {
        &self.options.address
    }

    /// Serves connections until the process ends.
    pub async fn listen(&self) -> Result<()> {
        self.listen_until(CancellationToken::new()).await
    }

    /// Serves connections until `shutdown` is cancelled, then signals every
    /// live session to close.
    ///
    /// # Errors
    ///
    /// Fails if the address does not parse, the host key cannot be loaded,
    /// or the socket cannot be bound. Per-connection failures are logged.
    pub async fn listen_until(&self, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self.options.address.parse()?;
        let config = Arc::new(self.russh_config()?);
        let factory = HoneypotHandlerFactory::new(self.options.clone());

        let listener = TcpListener::bind(addr).await?;
        info!(
            address = %addr,
            version = %self.options.version,
            max_sessions = self.options.max_sessions,
            "Honeypot listening"
        );

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer_addr)) => {
                    info!(peer_addr = %peer_addr, "Accepted connection");
                    let handler = factory.create_handler(peer_addr);
                    tokio::spawn(serve_connection(
                        Arc::clone(&config),
                        socket,
                        peer_addr,
                        handler,
                    ));
                }
                Err(e) => error!(error = %e, "Failed to accept connection"),
            }
        }

        info!(
            live_sessions = factory.state().registry.count(),
            "Honeypot shutting down"
        );
        factory.shutdown();
        Ok(())
    }

    fn russh_config(&self) -> Result<RusshConfig> {
        let mut config = RusshConfig::default();
        config.server_id = russh::SshId::Standard(self.options.version.clone());
        // Idleness is enforced per session by the watchdog.
        config.inactivity_timeout = None;
        config.methods = MethodSet::PASSWORD | MethodSet::PUBLICKEY;
        config.max_auth_attempts = self.options.auth.max_attempts as usize;
        config.auth_rejection_time = self.options.auth.rejection_delay;
        config.keys.push(load_host_key(&self.options.host_key)?);

        if let Some(banner) = &self.options.banner {
            // russh wants a &'static str; the config lives for the whole process.
            let banner: &'static str = Box::leak(banner.clone().into_boxed_str());
            config.auth_banner = Some(banner);
        }
        Ok(config)
    }
}

fn load_host_key(source: &HostKey) -> Result<KeyPair> {
    match source {
        HostKey::Ephemeral => {
            info!("Generating ephemeral Ed25519 host key");
            Ok(KeyPair::generate_ed25519())
        }
        HostKey::File(path) => {
            debug!(path = %path.display(), "Loading host key");
            Ok(russh_keys::load_secret_key(path, None)?)
        }
        HostKey::Pem(pem) => {
            let text = std::str::from_utf8(pem).map_err(|e| Error::Key(e.to_string()))?;
            Ok(russh_keys::decode_secret_key(text, None)?)
        }
    }
}

async fn serve_connection(
    config: Arc<RusshConfig>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    handler: HoneypotHandler,
) {
    let session = match run_stream(config, socket, handler).await {
        Ok(session) => session,
        Err(e) => {
            warn!(peer_addr = %peer_addr, error = %e, "SSH handshake failed");
            return;
        }
    };
    match session.await {
        Ok(()) => debug!(peer_addr = %peer_addr, "Connection closed"),
        Err(e) => debug!(peer_addr = %peer_addr, error = %e, "Connection ended with error"),
    }
}
