//! Tunables for one session bridge.

use std::time::Duration;

pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_DEDUPE_COOLDOWN: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_AFTER: Duration = Duration::from_secs(30);
pub const DEFAULT_PARKED_RESULTS_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long a command issuer waits for its callback.
    pub result_timeout: Duration,
    /// Redelivery bar for an already-pushed correlation key.
    pub dedupe_cooldown: Duration,
    /// Idle stretch on the push stream before a heartbeat frame.
    pub heartbeat_after: Duration,
    /// Bound on results held with no waiter to claim them.
    pub parked_results_cap: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            result_timeout: DEFAULT_RESULT_TIMEOUT,
            dedupe_cooldown: DEFAULT_DEDUPE_COOLDOWN,
            heartbeat_after: DEFAULT_HEARTBEAT_AFTER,
            parked_results_cap: DEFAULT_PARKED_RESULTS_CAP,
        }
    }
}
