//! Engine configuration.

use std::time::Duration as StdDuration;

use chrono::Duration;

/// Timing knobs for checkout sessions and reservations.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// How long a pending reservation holds stock.
    pub reservation_ttl: Duration,
    /// How long a pending session stays confirmable.
    pub session_ttl: Duration,
    /// How long a start request waits for a concurrent request with the same key.
    pub idempotency_wait: StdDuration,
    /// Poll interval while waiting on a concurrent request.
    pub idempotency_poll_interval: StdDuration,
    /// Age after which an unfinished idempotency claim may be taken over.
    pub idempotency_lease: Duration,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::minutes(15),
            session_ttl: Duration::minutes(30),
            idempotency_wait: StdDuration::from_secs(2),
            idempotency_poll_interval: StdDuration::from_millis(25),
            idempotency_lease: Duration::seconds(60),
        }
    }
}

impl CheckoutConfig {
    /// Session TTL actually applied; never shorter than the reservation TTL.
    pub fn effective_session_ttl(&self) -> Duration {
        self.session_ttl.max(self.reservation_ttl)
    }
}

/// Configuration for the reservation reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps.
    pub interval: StdDuration,
    /// Maximum reservations (and sessions) handled per sweep.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(30),
            batch_size: 100,
        }
    }
}
