//! Time-decaying running average
//!
//! Each report moves the value towards the reported datum by a weight that
//! depends on how long it has been since the previous report:
//!
//! ```text
//! factor = 0.5 ^ (elapsed / half_life)
//! value  = value * factor + datum * (1 - factor)
//! ```
//!
//! The first report replaces the initial value outright.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TimeDecayingAverage {
    value: f64,
    half_life: f64,
    min: f64,
    max: f64,
    last_report: Option<u64>,
    reports: u64,
}

impl TimeDecayingAverage {
    pub fn new(initial: f64, half_life_ms: u64, min: f64, max: f64) -> Self {
        Self {
            value: initial.clamp(min, max),
            half_life: half_life_ms.max(1) as f64,
            min,
            max,
            last_report: None,
            reports: 0,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn count_reports(&self) -> u64 {
        self.reports
    }

    pub fn report(&mut self, now: u64, datum: f64) {
        let datum = datum.clamp(self.min, self.max);
        match self.last_report {
            None => self.value = datum,
            Some(last) => {
                let elapsed = now.saturating_sub(last) as f64;
                let factor = 0.5f64.powf(elapsed / self.half_life);
                self.value = (self.value * factor + datum * (1.0 - factor)).clamp(self.min, self.max);
            }
        }
        self.last_report = Some(now.max(self.last_report.unwrap_or(0)));
        self.reports += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_report_replaces_initial() {
        let mut avg = TimeDecayingAverage::new(0.5, 1_000, 0.0, 1.0);
        avg.report(10, 1.0);
        assert_eq!(avg.value(), 1.0);
        assert_eq!(avg.count_reports(), 1);
    }

    #[test]
    fn test_half_life_weighting() {
        let mut avg = TimeDecayingAverage::new(0.0, 1_000, 0.0, 1.0);
        avg.report(0, 0.0);
        avg.report(1_000, 1.0);
        assert!((avg.value() - 0.5).abs() < 1e-9);
        // Same instant: no movement
        avg.report(1_000, 0.0);
        assert!((avg.value() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_clamped() {
        let mut avg = TimeDecayingAverage::new(0.0, 1_000, 0.0, 1.0);
        avg.report(0, 5.0);
        assert_eq!(avg.value(), 1.0);
    }
}
