//! Registry of live honeypot sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Error;

/// Default cap on concurrently registered sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

struct Entry {
    user: String,
    remote_addr: SocketAddr,
    client_version: String,
    started_at: Instant,
    shutdown: CancellationToken,
}

/// Snapshot of a registered session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Connection identifier.
    pub id: u64,
    /// Authenticated username.
    pub user: String,
    /// Client's remote address.
    pub remote_addr: SocketAddr,
    /// Client version banner.
    pub client_version: String,
    /// When the session was established.
    pub started_at: SystemTime,
    /// Total session duration so far.
    pub duration: Duration,
}

/// Tracks live sessions and enforces the session cap.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, Entry>>,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Creates a registry admitting at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Registers a session under `id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` when the cap is reached.
    pub fn register(
        &self,
        id: u64,
        user: &str,
        remote_addr: SocketAddr,
        client_version: &str,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            warn!(
                max = self.max_sessions,
                user = %user,
                addr = %remote_addr,
                "Maximum sessions reached, rejecting connection"
            );
            return Err(Error::Session("maximum sessions reached".to_string()));
        }

        sessions.insert(
            id,
            Entry {
                user: user.to_string(),
                remote_addr,
                client_version: client_version.to_string(),
                started_at: Instant::now(),
                shutdown,
            },
        );
        debug!(
            connection_id = id,
            total_sessions = sessions.len(),
            "Session registered"
        );
        Ok(())
    }

    /// Removes a session. Unknown ids are ignored.
    pub fn remove(&self, id: u64) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.remove(&id) {
            info!(
                connection_id = id,
                user = %entry.user,
                remote_addr = %entry.remote_addr,
                duration_secs = entry.started_at.elapsed().as_secs(),
                remaining_sessions = sessions.len(),
                "Session ended"
            );
        }
    }

    /// Returns the number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns a snapshot of one session.
    pub fn get(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.read().get(&id).map(|e| Self::info(id, e))
    }

    /// Returns snapshots of all sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .iter()
            .map(|(id, e)| Self::info(*id, e))
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    /// Signals every live session to shut down.
    pub fn shutdown_all(&self) {
        let sessions = self.sessions.read();
        info!(session_count = sessions.len(), "Signaling all sessions to shut down");
        for entry in sessions.values() {
            entry.shutdown.cancel();
        }
    }

    fn info(id: u64, entry: &Entry) -> SessionInfo {
        let duration = entry.started_at.elapsed();
        SessionInfo {
            id,
            user: entry.user.clone(),
            remote_addr: entry.remote_addr,
            client_version: entry.client_version.clone(),
            started_at: SystemTime::now() - duration,
            duration,
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}
