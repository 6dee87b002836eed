//! Outbox message and its retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use supplyline_core::{MaterialId, OutboxId, RequestId, TaskId};
use supplyline_dispatch::{AllocationAttempt, DemandRequest, DispatchTask, Urgency};
use supplyline_stock::LockItem;

/// Delivery state of an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Written with the business change, never attempted.
    Pending,
    /// Claimed by a relay; becomes claimable again when the lease runs out.
    InFlight,
    Delivered,
    /// Last attempt failed, retry scheduled.
    Failed,
    /// Retries exhausted.
    DeadLettered,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InFlight => "in_flight",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "in_flight" => Some(OutboxStatus::InFlight),
            "delivered" => Some(OutboxStatus::Delivered),
            "failed" => Some(OutboxStatus::Failed),
            "dead_lettered" => Some(OutboxStatus::DeadLettered),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Delivered | OutboxStatus::DeadLettered)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts before dead-lettering.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction (0.0-1.0) of the delay used as jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(attempt)).min(max_ms),
        };

        // Deterministic spread derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let spread = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (spread - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A notification written in the same unit of work as the change it
/// announces, delivered later by the relay (at least once).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: OutboxId,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    /// Delivery attempts started so far.
    pub attempts: u32,
    pub retry_policy: RetryPolicy,
    pub last_error: Option<String>,
    /// Earliest time the message may be claimed.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: OutboxId::new(),
            topic: topic.into(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            retry_policy: RetryPolicy::default(),
            last_error: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.scheduled_at <= now
    }

    /// Take a delivery lease: the message is hidden from other relays until
    /// `now + lease`.
    pub fn claim(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.status = OutboxStatus::InFlight;
        self.attempts += 1;
        self.scheduled_at = now + to_chrono(lease);
        self.updated_at = now;
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Delivered;
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.updated_at = now;
        if self.retry_policy.should_retry(self.attempts) {
            let delay = self.retry_policy.delay_for_attempt(self.attempts);
            self.scheduled_at = now + to_chrono(delay);
            self.status = OutboxStatus::Failed;
        } else {
            self.status = OutboxStatus::DeadLettered;
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

/// Payload announcing a committed dispatch task to the logistics collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCreatedNotice {
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub material_id: MaterialId,
    pub quantity: i64,
    pub urgency: Urgency,
    pub target_area: String,
    pub allocations: Vec<LockItem>,
    pub created_at: DateTime<Utc>,
}

impl TaskCreatedNotice {
    pub const TOPIC: &'static str = "dispatch.task_created";

    pub fn new(task: &DispatchTask, request: &DemandRequest, attempt: &AllocationAttempt) -> Self {
        Self {
            task_id: task.id,
            request_id: request.id,
            material_id: request.material_id,
            quantity: request.quantity,
            urgency: request.urgency,
            target_area: request.target_area.clone(),
            allocations: attempt.items.clone(),
            created_at: task.created_at,
        }
    }

    pub fn to_message(&self, now: DateTime<Utc>) -> Result<OutboxMessage, serde_json::Error> {
        Ok(OutboxMessage::new(Self::TOPIC, serde_json::to_value(self)?, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(1), fixed.delay_for_attempt(3));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1000), Duration::from_secs(60));
        for attempt in 1..=5 {
            let nominal = 1000.0 * 2_f64.powi(attempt as i32 - 1);
            let actual = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((actual - nominal).abs() <= nominal * 0.1 + 1.0);
        }
    }

    #[test]
    fn failures_retry_then_dead_letter() {
        let now = Utc::now();
        let mut msg = OutboxMessage::new("t", serde_json::json!({}), now)
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_secs(5)));
        assert!(msg.is_claimable(now));

        msg.claim(now, Duration::from_secs(30));
        assert_eq!(msg.status, OutboxStatus::InFlight);
        assert!(!msg.is_claimable(now));

        msg.mark_failed("connection refused", now);
        assert_eq!(msg.status, OutboxStatus::Failed);
        assert_eq!(msg.scheduled_at, now + chrono::Duration::seconds(5));
        assert!(msg.is_claimable(now + chrono::Duration::seconds(5)));

        msg.claim(now, Duration::from_secs(30));
        msg.mark_failed("connection refused", now);
        assert_eq!(msg.status, OutboxStatus::DeadLettered);
        assert_eq!(msg.attempts, 2);
        assert!(!msg.is_claimable(now + chrono::Duration::days(1)));
    }

    #[test]
    fn expired_lease_is_claimable_again() {
        let now = Utc::now();
        let mut msg = OutboxMessage::new("t", serde_json::json!({}), now);
        msg.claim(now, Duration::from_secs(10));
        assert!(msg.is_claimable(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::InFlight,
            OutboxStatus::Delivered,
            OutboxStatus::Failed,
            OutboxStatus::DeadLettered,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
    }
}
