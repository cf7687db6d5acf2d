//! Graceful shutdown coordination via `CancellationToken` and `TaskTracker`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default time sessions get to close before the process gives up on them.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinates graceful shutdown across the listener and all sessions.
#[derive(Clone, Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tracker that session tasks are spawned on.
    pub fn tracker(&self) -> &TaskTracker {
        &self.sessions
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel everything and wait up to `timeout` for sessions to finish.
    /// Returns whether every session finished in time.
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        let _ = self.sessions.close();
        info!(
            sessions = self.sessions.len(),
            timeout_secs = timeout.as_secs(),
            "draining sessions"
        );
        if tokio::time::timeout(timeout, self.sessions.wait()).await.is_err() {
            warn!("drain timed out after {timeout:?}, {} sessions still open", self.sessions.len());
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
    }

    #[test]
    fn multiple_shutdown_calls_idempotent() {
        let coord = ShutdownCoordinator::new();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
    }

    #[test]
    fn clones_share_the_token() {
        let coord = ShutdownCoordinator::new();
        let other = coord.clone();
        let token = coord.token();
        other.shutdown();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn drain_awaits_tracked_sessions() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let _ = coord.tracker().spawn(async move {
            token.cancelled().await;
        });

        assert!(coord.drain(None).await);
        assert!(coord.tracker().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out() {
        let coord = ShutdownCoordinator::new();
        // A session that ignores cancellation.
        let _ = coord.tracker().spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        assert!(!coord.drain(Some(Duration::from_millis(100))).await);
    }
}
