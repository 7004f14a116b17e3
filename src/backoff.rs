//! Routing backoff controller
//!
//! When the peer rejects a request because it is overloaded we stop routing
//! to it for a random time up to the current backoff length. The length
//! doubles on every overload that arrives after the previous backoff expired
//! and resets once a request succeeds outside a backoff window.
//!
//! Two statistics ride along: the fraction of time spent backed off and the
//! probability that a request is rejected for overload, both decaying.

use rand::Rng;
use serde::Serialize;

use crate::average::TimeDecayingAverage;
use crate::config::PeerConfig;

#[derive(Debug, Clone)]
pub struct RoutingBackoff {
    length: u64,
    until: u64,
    reason: Option<String>,
    backed_off_percent: TimeDecayingAverage,
    last_sample: u64,
    p_rejected: TimeDecayingAverage,
    initial_length: u64,
    multiplier: u64,
    max_length: u64,
}

/// Point-in-time view for the volatile record and status snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackoffSnapshot {
    pub backed_off: bool,
    pub length: u64,
    pub remaining: u64,
    pub reason: Option<String>,
    pub backed_off_percent: f64,
    pub p_rejected: f64,
}

impl RoutingBackoff {
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            length: config.initial_backoff_length,
            until: 0,
            reason: None,
            backed_off_percent: TimeDecayingAverage::new(0.0, config.backoff_percent_half_life, 0.0, 1.0),
            last_sample: u64::MAX,
            p_rejected: TimeDecayingAverage::new(0.0, config.rejected_half_life, 0.0, 1.0),
            initial_length: config.initial_backoff_length,
            multiplier: config.backoff_multiplier,
            max_length: config.max_backoff_length,
        }
    }

    pub fn is_backed_off(&self, now: u64) -> bool {
        now < self.until
    }

    /// Routing backed off until this time; 0 if never backed off
    pub fn until(&self) -> u64 {
        self.until
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn remaining(&self, now: u64) -> u64 {
        self.until.saturating_sub(now)
    }

    /// Reason for the most recent backoff
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn backed_off_percent(&self) -> f64 {
        self.backed_off_percent.value()
    }

    pub fn p_rejected(&self) -> f64 {
        self.p_rejected.value()
    }

    /// The peer rejected a request as overloaded
    ///
    /// Returns true if a new backoff window started. While already backed
    /// off only the statistics move.
    pub fn report_overload<R: Rng + ?Sized>(&mut self, now: u64, reason: &str, rng: &mut R) -> bool {
        self.p_rejected.report(now, 1.0);
        self.sample_backed_off(now);

        if self.is_backed_off(now) {
            log::debug!(
                "Ignoring overload ({}), already backed off for another {} ms",
                reason,
                self.remaining(now)
            );
            return false;
        }

        self.length = self
            .length
            .saturating_mul(self.multiplier)
            .min(self.max_length);
        let jitter = if self.length > 0 {
            rng.gen_range(0..self.length)
        } else {
            0
        };
        self.until = now + jitter;
        self.reason = Some(reason.to_string());
        log::debug!(
            "Backing off for {} ms (length {}) because {}",
            jitter,
            self.length,
            reason
        );
        true
    }

    /// A request went through without overload
    pub fn report_success(&mut self, now: u64) {
        self.p_rejected.report(now, 0.0);
        self.sample_backed_off(now);

        if self.is_backed_off(now) {
            return;
        }
        self.length = self.initial_length;
    }

    /// Fold the time since the last sample into the backed-off percentage
    ///
    /// Weighted by the part of the interval that was inside the backoff
    /// window; an interval of zero length is ignored.
    pub fn sample_backed_off(&mut self, now: u64) {
        if now > self.last_sample {
            if !self.is_backed_off(now) {
                if self.last_sample > self.until {
                    self.backed_off_percent.report(now, 0.0);
                } else if self.until > 0 {
                    let inside = (self.until - self.last_sample) as f64;
                    let elapsed = (now - self.last_sample) as f64;
                    self.backed_off_percent.report(now, inside / elapsed);
                }
            } else {
                self.backed_off_percent.report(now, 1.0);
            }
        }
        self.last_sample = now;
    }

    pub fn snapshot(&self, now: u64) -> BackoffSnapshot {
        BackoffSnapshot {
            backed_off: self.is_backed_off(now),
            length: self.length,
            remaining: self.remaining(now),
            reason: self.reason.clone(),
            backed_off_percent: self.backed_off_percent(),
            p_rejected: self.p_rejected(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn controller() -> (RoutingBackoff, StdRng) {
        (RoutingBackoff::new(&PeerConfig::default()), StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_length_doubles_after_each_expired_backoff() {
        let (mut backoff, mut rng) = controller();
        let l0 = backoff.length();
        let mut now = 10_000;
        let mut lengths = Vec::new();
        for _ in 0..3 {
            assert!(backoff.report_overload(now, "overload", &mut rng));
            lengths.push(backoff.length());
            // Step past the window before the next overload
            now = backoff.until().max(now) + 1;
        }
        assert_eq!(lengths, vec![2 * l0, 4 * l0, 8 * l0]);
    }

    #[test]
    fn test_overload_while_backed_off_keeps_until() {
        let (mut backoff, mut rng) = controller();
        let mut now = 10_000;
        // Loop until the random jitter yields a non-empty window
        while !backoff.is_backed_off(now) {
            backoff.report_overload(now, "first", &mut rng);
            if !backoff.is_backed_off(now) {
                now += 1;
            }
        }
        let until = backoff.until();
        let length = backoff.length();
        assert!(!backoff.report_overload(now, "second", &mut rng));
        assert_eq!(backoff.until(), until);
        assert_eq!(backoff.length(), length);
        assert_eq!(backoff.reason(), Some("first"));
    }

    #[test]
    fn test_length_bounds_and_cap() {
        let config = PeerConfig {
            initial_backoff_length: 1_000,
            max_backoff_length: 5_000,
            ..PeerConfig::default()
        };
        let mut backoff = RoutingBackoff::new(&config);
        let mut rng = StdRng::seed_from_u64(1);
        let mut now = 1;
        for _ in 0..10 {
            let before = backoff.length();
            backoff.report_overload(now, "x", &mut rng);
            let after = backoff.length();
            assert!(after >= before && after <= (before * 2).min(5_000));
            assert!(backoff.until() < now + after);
            now = backoff.until().max(now) + 1;
        }
        assert_eq!(backoff.length(), 5_000);
    }

    #[test]
    fn test_success_resets_only_after_expiry() {
        let (mut backoff, mut rng) = controller();
        let mut now = 10_000;
        while !backoff.is_backed_off(now) {
            backoff.report_overload(now, "x", &mut rng);
            if !backoff.is_backed_off(now) {
                now += 1;
            }
        }
        let length = backoff.length();
        backoff.report_success(now);
        assert_eq!(backoff.length(), length);

        backoff.report_success(backoff.until());
        assert_eq!(backoff.length(), PeerConfig::default().initial_backoff_length);
    }

    #[test]
    fn test_backed_off_percent_partial_interval() {
        let (mut backoff, _) = controller();
        backoff.sample_backed_off(0);
        backoff.until = 500;
        // Half of [0, 1000) was backed off; first report sets the value
        backoff.sample_backed_off(1_000);
        assert!((backoff.backed_off_percent() - 0.5).abs() < 1e-9);
        // Same millisecond: ignored
        backoff.sample_backed_off(1_000);
        assert!((backoff.backed_off_percent() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_p_rejected_moves() {
        let (mut backoff, mut rng) = controller();
        backoff.report_overload(1, "x", &mut rng);
        assert_eq!(backoff.p_rejected(), 1.0);
        backoff.report_success(600_001);
        assert!((backoff.p_rejected() - 0.5).abs() < 1e-9);
    }
}
