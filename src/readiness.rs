//! Readiness latches
//!
//! One-shot flags for provider, terminal and address in-service signals.
//! Startup blocks on the provider latch; the event router sets latches as
//! in-service events arrive.

use tokio::sync::watch;

/// One-shot boolean with wait-until-set semantics. `set` is idempotent and
/// there is no reset.
pub struct ReadinessLatch {
    tx: watch::Sender<bool>,
}

impl ReadinessLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Mark the latch set. Safe to call any number of times.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is set. Returns immediately if already set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for ReadinessLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// The readiness latches the monitor tracks.
#[derive(Default)]
pub struct ReadinessTracker {
    /// Provider reached in-service
    pub provider: ReadinessLatch,
    /// The configured route point terminal reached in-service
    pub route_point_terminal: ReadinessLatch,
    /// The configured route point address reached in-service
    pub route_point_address: ReadinessLatch,
    /// Some terminal reached in-service
    pub any_terminal: ReadinessLatch,
    /// Some address reached in-service
    pub any_address: ReadinessLatch,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }
}
