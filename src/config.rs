use std::time::Duration;

/// Tunables for the convergence loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum position delta (media seconds) that triggers a corrective
    /// seek broadcast. Deltas of exactly this value emit nothing.
    pub drift_threshold_secs: f64,
    /// Window after applying a remote update during which local player
    /// callbacks are treated as echoes, not new user intent.
    pub settle_delay: Duration,
    /// Cadence of the local position poll.
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drift_threshold_secs: 1.0,
            settle_delay: Duration::from_millis(600),
            poll_interval: Duration::from_millis(500),
        }
    }
}
