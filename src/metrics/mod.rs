//! Replication metrics: latency percentiles and fan-out summaries.

use serde::Serialize;

use crate::models::ReplicationEvent;

/// Latency distribution of one fan-out, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Nearest-rank percentile over an unsorted sample. At the scale of one
/// fan-out (<= ~1000 followers) a sort beats any sketch.
pub fn percentile(samples: &[u64], q: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((q / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index] as f64)
}

/// Percentiles of a latency sample; None when nothing was dispatched.
pub fn latency_stats(samples: &[u64]) -> Option<LatencyStats> {
    Some(LatencyStats {
        p50: percentile(samples, 50.0)?,
        p95: percentile(samples, 95.0)?,
        p99: percentile(samples, 99.0)?,
        max: *samples.iter().max()? as f64,
    })
}

/// Counts plus latency distribution for a sealed replication event.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationSummary {
    pub total: usize,
    pub dispatched: usize,
    pub policy_skipped: usize,
    pub unmapped: usize,
    pub risk_denied: usize,
    pub broker_errored: usize,
    pub timed_out: usize,
    pub latency: Option<LatencyStats>,
    pub wall_clock_ms: i64,
}

impl ReplicationSummary {
    pub fn of(event: &ReplicationEvent) -> Self {
        Self {
            total: event.total,
            dispatched: event.dispatched,
            policy_skipped: event.policy_skipped,
            unmapped: event.unmapped,
            risk_denied: event.risk_denied,
            broker_errored: event.broker_errored,
            timed_out: event.timed_out,
            latency: latency_stats(&event.latencies_ms),
            wall_clock_ms: (event.sealed_at - event.started_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_nearest_rank() {
        let samples: Vec<u64> = (1..=10).collect();
        assert_eq!(percentile(&samples, 50.0), Some(5.0));
        assert_eq!(percentile(&samples, 95.0), Some(10.0));
        assert_eq!(percentile(&samples, 99.0), Some(10.0));
        assert_eq!(percentile(&samples, 100.0), Some(10.0));
    }

    #[test]
    fn percentile_single_sample() {
        assert_eq!(percentile(&[42], 50.0), Some(42.0));
        assert_eq!(percentile(&[42], 99.0), Some(42.0));
    }

    #[test]
    fn empty_sample_has_no_stats() {
        assert_eq!(percentile(&[], 50.0), None);
        assert!(latency_stats(&[]).is_none());
    }

    #[test]
    fn stats_are_order_independent() {
        let a = latency_stats(&[5, 1, 9, 3, 7]).unwrap();
        let b = latency_stats(&[9, 7, 5, 3, 1]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.p50, 5.0);
        assert_eq!(a.max, 9.0);
    }
}
