//! Moving average of bytes per second over a window of fixed periods.
//!
//! Values land in the slot of the period they were recorded in. The average
//! covers the last `periods` complete periods; the period still in progress
//! is not counted, so the figure only moves once per period.

use std::time::Duration;

use tokio::time::Instant;

/// Sliding-window rate average (bytes per second).
#[derive(Debug, Clone)]
pub struct RateAverage {
    period: Duration,
    periods: usize,
    /// `periods` complete slots plus the one in progress.
    slots: Vec<u64>,
    /// Absolute index of the period in progress.
    current: u64,
    origin: Instant,
}

impl RateAverage {
    pub fn new(period: Duration, periods: usize, now: Instant) -> Self {
        let periods = periods.max(1);
        Self {
            period,
            periods,
            slots: vec![0; periods + 1],
            current: 0,
            origin: now,
        }
    }

    /// 10 second window with 1 second granularity.
    pub fn upload_default(now: Instant) -> Self {
        Self::new(Duration::from_secs(1), 10, now)
    }

    /// Record `value` bytes at `now`.
    pub fn add_value(&mut self, value: u64, now: Instant) {
        self.advance(now);
        let idx = (self.current % self.slots.len() as u64) as usize;
        self.slots[idx] = self.slots[idx].saturating_add(value);
    }

    /// Average bytes per second over the last complete periods.
    pub fn average(&mut self, now: Instant) -> f64 {
        self.advance(now);
        let len = self.slots.len() as u64;
        let in_progress = (self.current % len) as usize;
        let total: u64 = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != in_progress)
            .map(|(_, v)| *v)
            .sum();
        total as f64 / (self.period.as_secs_f64() * self.periods as f64)
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.origin);
        let slot = (elapsed.as_nanos() / self.period.as_nanos().max(1)) as u64;
        if slot <= self.current {
            return;
        }
        let len = self.slots.len() as u64;
        let stale = (slot - self.current).min(len);
        for step in 1..=stale {
            let idx = ((self.current + step) % len) as usize;
            self.slots[idx] = 0;
        }
        self.current = slot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_period_not_counted() {
        let start = Instant::now();
        let mut avg = RateAverage::upload_default(start);
        avg.add_value(10_000, start);
        assert_eq!(avg.average(start), 0.0);
    }

    #[test]
    fn completed_periods_average_over_window() {
        let start = Instant::now();
        let mut avg = RateAverage::upload_default(start);
        avg.add_value(10_000, start);
        avg.add_value(10_000, start + Duration::from_millis(1500));

        // Both periods complete: 20000 bytes over a 10 s window.
        let rate = avg.average(start + Duration::from_millis(2100));
        assert!((rate - 2000.0).abs() < f64::EPSILON, "rate = {rate}");
    }

    #[test]
    fn old_values_decay_out() {
        let start = Instant::now();
        let mut avg = RateAverage::upload_default(start);
        avg.add_value(50_000, start);
        assert!(avg.average(start + Duration::from_secs(2)) > 0.0);
        assert_eq!(avg.average(start + Duration::from_secs(30)), 0.0);
    }
}
