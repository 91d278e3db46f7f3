//! Backoff and circuit-breaker primitives shared by the email poller and
//! the backup scheduler.
//!
//! Adapted from the workspace's retry-policy microcrate: same
//! exponential/linear/constant strategy shape, same jitter formula, plus
//! a `Retry-After` override and a circuit breaker the original crate did
//! not need.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Backoff strategy configuration (spec §4.7: base ~1s, multiplier 2,
/// jitter ≈ ±30%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor: delay is scaled by a random value in
    /// `[1 - jitter, 1 + jitter]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Exponential delay for `attempt` (1-indexed), capped at `max_delay`,
/// before jitter.
fn exponential_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let delay = config.base_delay.saturating_mul(2_u32.saturating_pow(pow));
    delay.min(config.max_delay)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;
    if jitter <= 0.0 {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let factor = 1.0 - jitter + rng.gen::<f64>() * (2.0 * jitter);
    let millis = (delay.as_millis() as f64 * factor).round().max(0.0) as u64;
    Duration::from_millis(millis)
}

/// Compute the delay before the next attempt, honoring a provider
/// `Retry-After` header when present (spec §4.7: honored exactly,
/// `retry_after * 1000` ms, ignoring the computed delay).
pub fn next_delay(config: &BackoffConfig, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    if let Some(secs) = retry_after_secs {
        return Duration::from_millis(secs * 1000);
    }
    apply_jitter(exponential_delay(config, attempt), config.jitter)
}

/// Circuit breaker state, numerically stable for the
/// `gmail_circuit_state` gauge (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

/// Per-poller circuit breaker: trips after 5 consecutive failed polls,
/// re-probes once after a cool-off.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    trip_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: CircuitState,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(trip_threshold: u32, cooldown: Duration) -> Self {
        Self {
            trip_threshold,
            cooldown,
            consecutive_failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a `pollOnce` invocation may call the provider right now.
    /// `now` is injected so tests can drive the cool-off deterministically.
    pub fn allow_attempt(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    pub fn on_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == CircuitState::HalfOpen || self.consecutive_failures >= self.trip_threshold
        {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}
