//! Channel latency estimation.
//!
//! latency = (1 - w) * latency + w * sample        (unambiguous sample)
//! latency = (1 - w) * latency + w * 2 * latency   (ack of a retransmit)
//! RTO     = uniform(min_factor, max_factor) * latency * 2^attempt
//!
//! Latency is kept in whole milliseconds, truncating after each update,
//! and never exceeds `MAX_LATENCY`.

use std::time::Duration;

/// Initial latency before any sample: 1 second.
const INITIAL_LATENCY: Duration = Duration::from_millis(1000);
/// Weight of each new sample.
const EWMA_WEIGHT: f64 = 0.25;
/// Retransmission timeout bounds, in multiples of the latency.
const RETRANSMISSION_MIN: f64 = 2.0;
const RETRANSMISSION_MAX: f64 = 3.0;
/// Cap on the backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 16;
/// Ceiling on the latency estimate, in milliseconds.
pub const MAX_LATENCY_MS: u64 = 1 << MAX_BACKOFF_SHIFT;

/// Exponentially weighted latency tracker for one channel.
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    latency_ms: u64,
    min_latency: Option<Duration>,
    weight: f64,
    min_factor: f64,
    max_factor: f64,
}

impl LatencyEstimator {
    pub fn new() -> Self {
        Self::with_params(
            INITIAL_LATENCY,
            EWMA_WEIGHT,
            RETRANSMISSION_MIN,
            RETRANSMISSION_MAX,
        )
    }

    pub fn with_params(initial: Duration, weight: f64, min_factor: f64, max_factor: f64) -> Self {
        Self {
            latency_ms: (initial.as_millis() as u64).min(MAX_LATENCY_MS),
            min_latency: None,
            weight,
            min_factor,
            max_factor: max_factor.max(min_factor),
        }
    }

    /// Fold in a round trip measured on a first transmission.
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_millis() as f64;
        self.latency_ms =
            ((self.latency_ms as f64 * (1.0 - self.weight) + sample_ms * self.weight) as u64)
                .min(MAX_LATENCY_MS);
        if self.min_latency.map_or(true, |min| sample < min) {
            self.min_latency = Some(sample);
        }
    }

    /// Account for an acknowledgment that cannot be matched to a specific
    /// transmission. Losses are likely, so the estimate is inflated.
    pub fn inflate(&mut self) {
        let latency = self.latency_ms as f64;
        self.latency_ms = ((latency * (1.0 - self.weight) + 2.0 * latency * self.weight) as u64)
            .min(MAX_LATENCY_MS);
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    /// Smallest unambiguous sample seen, or `None` before the first.
    pub fn min_latency(&self) -> Option<Duration> {
        self.min_latency
    }

    /// Retransmission delay for `attempt` with jitter `unit` in `[0, 1)`.
    pub fn retransmit_delay(&self, attempt: u32, unit: f64) -> Duration {
        let factor = self.min_factor + (self.max_factor - self.min_factor) * unit.clamp(0.0, 1.0);
        let backoff = (1u64 << attempt.min(MAX_BACKOFF_SHIFT)) as f64;
        Duration::from_millis((factor * self.latency_ms as f64 * backoff) as u64)
    }

    /// Retransmission delay for `attempt` with a random jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.retransmit_delay(attempt, rand::random::<f64>())
    }
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self::new()
    }
}
