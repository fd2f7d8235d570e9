//! Idle-timeout enforcement for one connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Control over the underlying transport connection.
#[async_trait]
pub trait ConnectionControl: Send + Sync {
    /// Closes the connection. Pending reads on it fail afterwards.
    async fn disconnect(&self, reason: &str);
}

/// Why the watchdog stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// No activity within the idle timeout. The connection was closed.
    IdleTimeout,
    /// Every activity producer went away. The connection was closed.
    SourceClosed,
    /// The session was shut down. The connection was closed.
    Shutdown,
    /// The connection was torn down by its owner.
    Cancelled,
}

/// Resets an idle deadline on every activity signal and closes the
/// connection once the deadline passes, the signal source is gone, or
/// `shutdown` is cancelled.
///
/// The connection is closed at most once. Cancelling `cancel` alone stops
/// the watchdog without closing: the transport is already going away.
pub async fn run_watchdog(
    mut activity: mpsc::UnboundedReceiver<()>,
    idle_timeout: Duration,
    connection: Arc<dyn ConnectionControl>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
) -> WatchdogExit {
    let deadline = tokio::time::sleep(idle_timeout);
    tokio::pin!(deadline);

    let exit = loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break WatchdogExit::Shutdown,
            () = cancel.cancelled() => break WatchdogExit::Cancelled,
            signal = activity.recv() => match signal {
                Some(()) => deadline.as_mut().reset(Instant::now() + idle_timeout),
                None => break WatchdogExit::SourceClosed,
            },
            () = &mut deadline => break WatchdogExit::IdleTimeout,
        }
    };

    match exit {
        WatchdogExit::IdleTimeout => {
            info!(timeout_secs = idle_timeout.as_secs(), "Connection idle, closing");
            connection.disconnect("idle timeout").await;
        }
        WatchdogExit::SourceClosed => {
            debug!("Activity source closed, closing connection");
            connection.disconnect("connection finished").await;
        }
        WatchdogExit::Shutdown => {
            info!("Session shut down, closing connection");
            connection.disconnect("server shutdown").await;
        }
        WatchdogExit::Cancelled => debug!("Watchdog cancelled"),
    }
    exit
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records disconnect calls.
    #[derive(Default)]
    pub(crate) struct RecordingConnection {
        pub(crate) reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConnectionControl for RecordingConnection {
        async fn disconnect(&self, reason: &str) {
            self.reasons.lock().push(reason.to_string());
        }
    }

    fn spawn_watchdog(
        timeout: Duration,
    ) -> (
        mpsc::UnboundedSender<()>,
        Arc<RecordingConnection>,
        CancellationToken,
        CancellationToken,
        tokio::task::JoinHandle<WatchdogExit>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(RecordingConnection::default());
        let shutdown = CancellationToken::new();
        let cancel = shutdown.child_token();
        let task = tokio::spawn(run_watchdog(
            rx,
            timeout,
            conn.clone(),
            shutdown.clone(),
            cancel.clone(),
        ));
        (tx, conn, shutdown, cancel, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_closed_after_timeout() {
        let (_tx, conn, _shutdown, _cancel, task) = spawn_watchdog(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert!(conn.reasons.lock().is_empty());
        assert!(!task.is_finished());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(task.await.unwrap(), WatchdogExit::IdleTimeout);
        assert_eq!(*conn.reasons.lock(), vec!["idle timeout".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_deadline() {
        let (tx, conn, _shutdown, _cancel, task) = spawn_watchdog(Duration::from_secs(10));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(8)).await;
            tx.send(()).unwrap();
        }
        // 40s elapsed, but never 10s without a signal.
        tokio::task::yield_now().await;
        assert!(conn.reasons.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert!(!task.is_finished());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(task.await.unwrap(), WatchdogExit::IdleTimeout);
        assert_eq!(conn.reasons.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_source_closes_connection_once() {
        let (tx, conn, _shutdown, _cancel, task) = spawn_watchdog(Duration::from_secs(10));
        drop(tx);
        assert_eq!(task.await.unwrap(), WatchdogExit::SourceClosed);
        assert_eq!(conn.reasons.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_does_not_close() {
        let (_tx, conn, _shutdown, cancel, task) = spawn_watchdog(Duration::from_secs(10));
        cancel.cancel();
        assert_eq!(task.await.unwrap(), WatchdogExit::Cancelled);
        assert!(conn.reasons.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_once() {
        let (_tx, conn, shutdown, cancel, task) = spawn_watchdog(Duration::from_secs(10));
        shutdown.cancel();
        assert!(cancel.is_cancelled());
        assert_eq!(task.await.unwrap(), WatchdogExit::Shutdown);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(*conn.reasons.lock(), vec!["server shutdown".to_string()]);
    }
}
