//! Request manager tunables

use chktree_config::SchedulerConfig;

/// Scheduling and congestion parameters of a [`crate::RequestManager`]
///
/// All times are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestManagerConfig {
    /// Time unit by which the daemon decrements query TTLs
    pub ttl_decrement_ms: u64,
    /// Hard TTL cap, in multiples of `ttl_decrement_ms`
    pub max_ttl_factor: u64,
    pub initial_ttl_ms: u64,
    pub initial_congestion_window: u32,
    pub initial_ssthresh: u32,
    pub max_tries: u32,
    pub ttl_weight: u64,
    pub ttl_weight_fast: u64,
    pub min_sleep_ms: u64,
    pub max_sleep_ms: u64,
    /// Queued outbound messages before a send counts as failed
    pub send_queue: usize,
}

impl RequestManagerConfig {
    pub fn max_ttl_ms(&self) -> u64 {
        self.ttl_decrement_ms.saturating_mul(self.max_ttl_factor)
    }
}

impl Default for RequestManagerConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for RequestManagerConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            ttl_decrement_ms: config.ttl_decrement_ms,
            max_ttl_factor: config.max_ttl_factor,
            initial_ttl_ms: config.initial_ttl_ms,
            initial_congestion_window: config.initial_congestion_window,
            initial_ssthresh: config.initial_ssthresh,
            max_tries: config.max_tries.max(1),
            ttl_weight: config.ttl_weight,
            ttl_weight_fast: config.ttl_weight_fast,
            min_sleep_ms: config.min_sleep_ms,
            max_sleep_ms: config.max_sleep_ms.max(config.min_sleep_ms),
            send_queue: 256,
        }
    }
}
