#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::doc_markdown)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # Honeyshell
//!
//! The session layer of a low-interaction SSH honeypot.
//!
//! Honeyshell accepts SSH connections, lets clients authenticate, and
//! serves every `session` channel with an emulated terminal and a closed
//! pseudo-shell that never executes anything. Everything the client types
//! is logged and can be recorded to asciicast files.
//!
//! ## Layout
//!
//! - [`request`]: channel request payload codec
//! - [`dispatcher`]: per-channel request state machine
//! - [`session`]: connection state, idle watchdog and session registry
//! - [`terminal`] and [`shell`]: line editing and the pseudo-shell
//! - [`recorder`]: terminal recording sinks
//! - [`Server`] and [`ServerBuilder`]: the russh-backed listener
//!
//! Pty, shell and window size are tracked per channel, so concurrent
//! channels of one connection never see each other's geometry.
//!
//! ## Example
//!
//! ```rust,ignore
//! use honeyshell::ServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), honeyshell::Error> {
//!     ServerBuilder::new()
//!         .address("0.0.0.0:2222")
//!         .hostname("web-01")
//!         .record_to("./casts")
//!         .build()?
//!         .listen()
//!         .await
//! }
//! ```

use std::io;

use thiserror::Error;

mod config;
pub mod dispatcher;
mod handler;
pub mod recorder;
pub mod request;
mod server;
pub mod session;
pub mod shell;
pub mod terminal;

pub use config::{
    AuthPolicy, DEFAULT_AUTH_REJECTION_DELAY, DEFAULT_MAX_AUTH_ATTEMPTS, DEFAULT_SERVER_VERSION,
    HostKey, PasswordHandler, ServerBuilder, ServerOptions,
};
pub use dispatcher::{ChannelDispatcher, ChannelEvent, ChannelOutput, ChannelState, RequestError};
pub use handler::{HoneypotHandler, HoneypotHandlerFactory, ServerState};
pub use recorder::{AsciicastRecorder, NullRecorder, Recording, RecordingHeader, TerminalRecorder};
pub use request::{ChannelRequest, DecodeError, PtyRequest, RequestKind, WindowChangeRequest};
pub use server::Server;
pub use session::{
    ConnectionControl, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS, Session, SessionIdentity,
    SessionInfo, SessionLinks, SessionRegistry, SessionSettings,
};
pub use shell::{CommandTable, Evaluation, PseudoShell, ShellContext, ShellSettings};
pub use terminal::{LineTerminal, TerminalError, VirtualTerminal};

/// Errors that end a server or a connection.
///
/// A malformed or illegal channel request is not one of these: it is
/// answered with a failure reply and the channel keeps going (see
/// [`RequestError`]).
#[derive(Error, Debug)]
pub enum Error {
    /// Socket I/O failed, e.g. the listen address is in use.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The SSH transport failed. Scoped to one connection.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// In-memory host key data is unusable.
    #[error("key error: {0}")]
    Key(String),

    /// The host key file could not be read or parsed.
    #[error("key loading error: {0}")]
    KeyLoad(#[from] russh_keys::Error),

    /// An option value cannot work.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A connection could not get a session, e.g. the cap was reached.
    #[error("session error: {0}")]
    Session(String),

    /// The listen address is not a socket address.
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

/// A specialized [`Result`] type for honeypot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        AsciicastRecorder, CommandTable, Error, HostKey, NullRecorder, Result, Server,
        ServerBuilder, ServerOptions, ShellContext, TerminalRecorder, Window,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_window_default() {
        assert_eq!(
            Window::default(),
            Window {
                width: 80,
                height: 24
            }
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::Session("maximum sessions reached".to_string());
        assert_eq!(err.to_string(), "session error: maximum sessions reached");

        let err: Error = "not-an-addr".parse::<SocketAddr>().unwrap_err().into();
        assert!(err.to_string().starts_with("address parse error"));
    }
}
