//! Server configuration.
//!
//! [`ServerOptions`] holds everything a listening honeypot needs;
//! [`ServerBuilder`] is the chainable way to fill it in.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::recorder::{AsciicastRecorder, TerminalRecorder};
use crate::session::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS, SessionSettings};
use crate::shell::{CommandTable, ShellSettings};
use crate::{Error, Result, Server};

/// Decides whether a `(user, password)` pair is accepted.
pub type PasswordHandler = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Default maximum authentication attempts per connection.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 6;

/// Default delay before an authentication rejection.
pub const DEFAULT_AUTH_REJECTION_DELAY: Duration = Duration::from_millis(100);

/// Version string advertised to clients.
pub const DEFAULT_SERVER_VERSION: &str = "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.6";

/// Where the server's host key comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostKey {
    /// A fresh Ed25519 key per process.
    #[default]
    Ephemeral,
    /// An OpenSSH or PEM private key file.
    File(PathBuf),
    /// Private key text held in memory.
    Pem(Vec<u8>),
}

/// How authentication attempts are answered.
///
/// Every attempt is logged regardless of the outcome.
#[derive(Clone)]
pub struct AuthPolicy {
    /// Password check. `None` accepts every password.
    pub password: Option<PasswordHandler>,
    /// Whether public key authentication succeeds.
    pub accept_public_keys: bool,
    /// Attempts allowed before the transport disconnects.
    pub max_attempts: u32,
    /// Delay before a rejection is sent.
    pub rejection_delay: Duration,
}

impl AuthPolicy {
    /// Returns whether `password` is accepted for `user`.
    pub fn check_password(&self, user: &str, password: &str) -> bool {
        self.password
            .as_ref()
            .is_none_or(|handler| handler(user, password))
    }
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            password: None,
            accept_public_keys: false,
            max_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            rejection_delay: DEFAULT_AUTH_REJECTION_DELAY,
        }
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("password", &self.password.as_ref().map(|_| "custom"))
            .field("accept_public_keys", &self.accept_public_keys)
            .field("max_attempts", &self.max_attempts)
            .field("rejection_delay", &self.rejection_delay)
            .finish()
    }
}

/// Options for a honeypot server.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Socket address to bind.
    pub address: String,
    /// SSH identification string sent to clients.
    pub version: String,
    /// Pre-authentication banner.
    pub banner: Option<String>,
    /// Host key source.
    pub host_key: HostKey,
    /// Silence allowed before a connection is closed.
    pub idle_timeout: Duration,
    /// Cap on concurrently authenticated sessions.
    pub max_sessions: usize,
    /// Authentication answers.
    pub auth: AuthPolicy,
    /// Pseudo-shell appearance and recording.
    pub shell: ShellSettings,
}

impl ServerOptions {
    /// Builds the settings every session of this server runs with.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: self.idle_timeout,
            shell: Arc::new(self.shell.clone()),
        }
    }

    /// Checks option combinations that cannot work.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` naming the offending option.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::Configuration(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.shell.prompt.is_empty() {
            return Err(Error::Configuration("prompt must not be empty".to_string()));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::Configuration(
                "idle_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:22".to_string(),
            version: DEFAULT_SERVER_VERSION.to_string(),
            banner: None,
            host_key: HostKey::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            auth: AuthPolicy::default(),
            shell: ShellSettings::default(),
        }
    }
}

/// Chainable construction of a [`Server`].
///
/// ```rust,ignore
/// let server = ServerBuilder::new()
///     .address("0.0.0.0:2222")
///     .hostname("nas")
///     .record_to("/var/lib/honeyshell/casts")
///     .build()?;
/// ```
#[derive(Default)]
pub struct ServerBuilder {
    options: ServerOptions,
}

impl ServerBuilder {
    /// Starts from default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from existing options.
    pub fn from_options(options: ServerOptions) -> Self {
        Self { options }
    }

    pub fn address(mut self, addr: impl Into<String>) -> Self {
        self.options.address = addr.into();
        self
    }

    /// Sets the identification string, e.g. `SSH-2.0-OpenSSH_9.6`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.options.version = version.into();
        self
    }

    pub fn banner(mut self, banner: impl Into<String>) -> Self {
        self.options.banner = Some(banner.into());
        self
    }

    pub fn host_key(mut self, key: HostKey) -> Self {
        self.options.host_key = key;
        self
    }

    /// Loads the host key from a file.
    pub fn host_key_file(self, path: impl Into<PathBuf>) -> Self {
        self.host_key(HostKey::File(path.into()))
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_timeout = timeout;
        self
    }

    pub fn max_sessions(mut self, max: usize) -> Self {
        self.options.max_sessions = max;
        self
    }

    /// Accepts only passwords for which `check` returns true.
    pub fn password_auth<F>(mut self, check: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.options.auth.password = Some(Arc::new(check));
        self
    }

    pub fn accept_public_keys(mut self, accept: bool) -> Self {
        self.options.auth.accept_public_keys = accept;
        self
    }

    pub fn max_auth_attempts(mut self, max: u32) -> Self {
        self.options.auth.max_attempts = max;
        self
    }

    pub fn auth_rejection_delay(mut self, delay: Duration) -> Self {
        self.options.auth.rejection_delay = delay;
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.shell.prompt = prompt.into();
        self
    }

    /// Sets the host name the pseudo-shell reports.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.options.shell.hostname = hostname.into();
        self
    }

    /// Replaces the pseudo-shell built-ins.
    pub fn commands(mut self, commands: CommandTable) -> Self {
        self.options.shell.commands = Arc::new(commands);
        self
    }

    pub fn recorder<R: TerminalRecorder + 'static>(mut self, recorder: R) -> Self {
        self.options.shell.recorder = Arc::new(recorder);
        self
    }

    /// Records every shell and exec channel as asciicast into `dir`.
    pub fn record_to(self, dir: impl Into<PathBuf>) -> Self {
        self.recorder(AsciicastRecorder::new(dir))
    }

    /// Validates the options and creates the server.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for unusable options.
    pub fn build(self) -> Result<Server> {
        self.options.validate()?;
        Ok(Server::new(self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ServerOptions::default();
        assert_eq!(opts.address, "0.0.0.0:22");
        assert!(opts.version.starts_with("SSH-2.0-OpenSSH"));
        assert_eq!(opts.idle_timeout, Duration::from_secs(120));
        assert_eq!(opts.max_sessions, 64);
        assert_eq!(opts.host_key, HostKey::Ephemeral);
        assert_eq!(opts.shell.prompt, "$ ");
        assert_eq!(opts.shell.hostname, "ubuntu");
        assert!(!opts.auth.accept_public_keys);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_default_policy_accepts_any_password() {
        let policy = AuthPolicy::default();
        assert!(policy.check_password("root", ""));
        assert!(policy.check_password("admin", "admin"));
    }

    #[test]
    fn test_builder_sets_options() {
        let server = ServerBuilder::new()
            .address("127.0.0.1:2222")
            .version("SSH-2.0-Test")
            .hostname("db-02")
            .prompt("# ")
            .idle_timeout(Duration::from_secs(30))
            .max_sessions(2)
            .accept_public_keys(true)
            .host_key_file("/etc/honeyshell/host_ed25519")
            .password_auth(|user, password| user == "root" && password == "toor")
            .build()
            .unwrap();

        let opts = server.options();
        assert_eq!(opts.version, "SSH-2.0-Test");
        assert_eq!(opts.max_sessions, 2);
        assert_eq!(opts.shell.prompt, "# ");
        assert_eq!(
            opts.host_key,
            HostKey::File(PathBuf::from("/etc/honeyshell/host_ed25519"))
        );
        assert!(opts.auth.accept_public_keys);
        assert!(opts.auth.check_password("root", "toor"));
        assert!(!opts.auth.check_password("root", "123456"));
    }

    #[test]
    fn test_build_rejects_unusable_options() {
        for builder in [
            ServerBuilder::new().prompt(""),
            ServerBuilder::new().max_sessions(0),
            ServerBuilder::new().idle_timeout(Duration::ZERO),
        ] {
            assert!(matches!(builder.build(), Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn test_session_settings_follow_options() {
        let mut commands = CommandTable::empty();
        commands.insert("uptime", |_, _| "up 42 days\n".to_string());
        let opts = ServerBuilder::new()
            .hostname("edge")
            .prompt("edge$ ")
            .idle_timeout(Duration::from_secs(5))
            .commands(commands)
            .build()
            .unwrap()
            .options()
            .session_settings();

        assert_eq!(opts.idle_timeout, Duration::from_secs(5));
        assert_eq!(opts.shell.prompt, "edge$ ");
        assert_eq!(opts.shell.hostname, "edge");
        assert!(opts.shell.commands.get("uptime").is_some());
        assert!(opts.shell.commands.get("ls").is_none());
    }
}
