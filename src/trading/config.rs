//! Replication engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the fan-out dispatcher and its retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Global cap on broker calls in flight across all fan-outs.
    pub max_in_flight_broker_calls: usize,

    /// Wall-clock deadline for one follower pipeline, semaphore wait included.
    pub dispatch_timeout_ms: u64,

    /// Retries after a transient broker error.
    pub max_retries: u32,

    /// Backoff curve: base delay, cap, and jitter as a percentage of the delay.
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub retry_jitter_pct: u32,

    /// TTL of the per-master follower snapshot cache.
    pub follower_snapshot_ttl_ms: u64,

    /// Worker threads = CPUs x this multiplier.
    pub worker_pool_multiplier: usize,

    /// Refresh broker sessions this long before they expire.
    pub session_refresh_guard_ms: u64,

    /// How often the reconciler polls Unknown-state orders.
    pub reconcile_interval_ms: u64,

    /// Status polls before the reconciler gives an order up as rejected.
    pub reconcile_max_attempts: u32,

    /// Stripes in the per-follower ordering lock map.
    pub follower_lock_stripes: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_in_flight_broker_calls: 50,
            dispatch_timeout_ms: 5_000,
            max_retries: 3,
            retry_base_ms: 100,
            retry_cap_ms: 2_000,
            retry_jitter_pct: 25,
            follower_snapshot_ttl_ms: 1_000,
            worker_pool_multiplier: 4,
            session_refresh_guard_ms: 300_000,
            reconcile_interval_ms: 30_000,
            reconcile_max_attempts: 20,
            follower_lock_stripes: 256,
        }
    }
}

impl ReplicationConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn follower_snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.follower_snapshot_ttl_ms)
    }

    pub fn session_refresh_guard(&self) -> Duration {
        Duration::from_millis(self.session_refresh_guard_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Backoff delay before retry `attempt` (1-based), jittered.
    ///
    /// Exponential with factor 2 from `retry_base_ms`, capped at
    /// `retry_cap_ms`, +/- `retry_jitter_pct` percent of the delay.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = self
            .retry_base_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let capped = exp.min(self.retry_cap_ms);
        let jitter_span = capped * self.retry_jitter_pct as u64 / 100;
        let delay = if jitter_span == 0 {
            capped
        } else {
            let offset = rand::thread_rng().gen_range(0..=2 * jitter_span);
            capped - jitter_span + offset
        };
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = ReplicationConfig {
            retry_jitter_pct: 0,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(10), Duration::from_millis(2_000));
    }

    #[test]
    fn jitter_stays_within_band() {
        let config = ReplicationConfig::default();
        for _ in 0..100 {
            let delay = config.backoff_delay(2).as_millis() as u64;
            // 200ms +/- 25%
            assert!((150..=250).contains(&delay), "delay {delay} out of band");
        }
    }
}
