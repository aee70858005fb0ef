//! Replication events: the per-fan-out record of follower outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::risk::DenyReason;

/// Why the copy-policy transform produced no order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    /// Derived quantity floored to zero.
    TooSmall,
    /// Derived notional exceeds the link's per-order cap.
    LinkNotionalCap,
}

/// Terminal outcome of one follower pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FollowerOutcome {
    /// Order placed with the broker; latency measured from dispatch start.
    Dispatched { latency_ms: u64 },
    PolicySkip { reason: SkipReason },
    /// No instrument code for the order's (symbol, exchange).
    Unmapped,
    RiskDenied { reason: DenyReason },
    BrokerError { message: String },
    TimedOut,
}

impl FollowerOutcome {
    pub fn dispatched(latency: Duration) -> Self {
        FollowerOutcome::Dispatched {
            latency_ms: latency.as_millis() as u64,
        }
    }
}

/// One follower's slot in a replication event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerRecord {
    pub follower: String,
    pub order_id: Option<Uuid>,
    pub outcome: FollowerOutcome,
}

/// Aggregate record of one master-order fan-out. Append-only once sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub master_order_id: Uuid,
    pub total: usize,
    pub dispatched: usize,
    pub policy_skipped: usize,
    pub unmapped: usize,
    pub risk_denied: usize,
    pub broker_errored: usize,
    pub timed_out: usize,
    /// Per-follower wall-clock dispatch latencies, for percentile math.
    pub latencies_ms: Vec<u64>,
    pub records: Vec<FollowerRecord>,
    pub started_at: DateTime<Utc>,
    pub sealed_at: DateTime<Utc>,
}

impl ReplicationEvent {
    /// Seal a finished fan-out from its follower records.
    pub fn seal(
        master_order_id: Uuid,
        records: Vec<FollowerRecord>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut event = Self {
            master_order_id,
            total: records.len(),
            dispatched: 0,
            policy_skipped: 0,
            unmapped: 0,
            risk_denied: 0,
            broker_errored: 0,
            timed_out: 0,
            latencies_ms: Vec::new(),
            records,
            started_at,
            sealed_at: Utc::now(),
        };
        for record in &event.records {
            match &record.outcome {
                FollowerOutcome::Dispatched { latency_ms } => {
                    event.dispatched += 1;
                    event.latencies_ms.push(*latency_ms);
                }
                FollowerOutcome::PolicySkip { .. } => event.policy_skipped += 1,
                FollowerOutcome::Unmapped => event.unmapped += 1,
                FollowerOutcome::RiskDenied { .. } => event.risk_denied += 1,
                FollowerOutcome::BrokerError { .. } => event.broker_errored += 1,
                FollowerOutcome::TimedOut => event.timed_out += 1,
            }
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(follower: &str, outcome: FollowerOutcome) -> FollowerRecord {
        FollowerRecord {
            follower: follower.to_string(),
            order_id: None,
            outcome,
        }
    }

    #[test]
    fn seal_counts_partition_total() {
        let records = vec![
            record("F1", FollowerOutcome::Dispatched { latency_ms: 120 }),
            record("F2", FollowerOutcome::Dispatched { latency_ms: 80 }),
            record(
                "F3",
                FollowerOutcome::PolicySkip {
                    reason: SkipReason::TooSmall,
                },
            ),
            record("F4", FollowerOutcome::Unmapped),
            record(
                "F5",
                FollowerOutcome::RiskDenied {
                    reason: DenyReason::DailyLossBreached,
                },
            ),
            record(
                "F6",
                FollowerOutcome::BrokerError {
                    message: "margin".to_string(),
                },
            ),
            record("F7", FollowerOutcome::TimedOut),
        ];

        let event = ReplicationEvent::seal(Uuid::new_v4(), records, Utc::now());
        assert_eq!(event.total, 7);
        assert_eq!(
            event.total,
            event.dispatched
                + event.policy_skipped
                + event.unmapped
                + event.risk_denied
                + event.broker_errored
                + event.timed_out
        );
        assert_eq!(event.latencies_ms, vec![120, 80]);
    }

    #[test]
    fn empty_fanout_seals_clean() {
        let event = ReplicationEvent::seal(Uuid::new_v4(), Vec::new(), Utc::now());
        assert_eq!(event.total, 0);
        assert!(event.latencies_ms.is_empty());
    }
}
