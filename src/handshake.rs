//! Handshake scheduler
//!
//! Decides when the next handshake attempt to a disconnected (or rekeying)
//! peer is due, and when repeated failures should start an ARK fetch.
//!
//! # Modes
//!
//! - **Normal**: one attempt per randomised interval. Verified-incompatible
//!   peers only get a rare presence packet; peers whose version we cannot
//!   classify yet get a medium probe interval after the first attempt.
//! - **Burst-only**: a burst of `burst_size` attempts at the normal interval,
//!   then a long pause. The burst size is re-randomised every cycle.

use rand::Rng;
use serde::Serialize;

use crate::config::PeerConfig;
use crate::status::{PeerMode, VersionCompat};

/// Per-peer handshake timing state
#[derive(Debug, Clone)]
pub struct HandshakeScheduler {
    send_handshake_time: u64,
    handshake_count: u32,
    first_handshake: bool,
    burst_count: u32,
    burst_size: u32,
    bursting: bool,
    /// Last time the in-progress key agreement context was used
    negotiation_last_used: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandshakeSnapshot {
    pub next_handshake: u64,
    pub handshake_count: u32,
    pub bursting: bool,
    pub burst_size: u32,
}

/// `min + random(0..randomized)`
fn randomized_interval<R: Rng + ?Sized>(rng: &mut R, min: u64, randomized: u64) -> u64 {
    if randomized == 0 {
        min
    } else {
        min + rng.gen_range(0..randomized)
    }
}

fn random_burst_size<R: Rng + ?Sized>(rng: &mut R, config: &PeerConfig) -> u32 {
    if config.randomized_burst_size == 0 {
        config.min_burst_size
    } else {
        config.min_burst_size + rng.gen_range(0..config.randomized_burst_size)
    }
}

impl HandshakeScheduler {
    /// First attempt is due immediately
    pub fn new<R: Rng + ?Sized>(now: u64, config: &PeerConfig, rng: &mut R) -> Self {
        Self {
            send_handshake_time: now,
            handshake_count: 0,
            first_handshake: true,
            burst_count: 0,
            burst_size: random_burst_size(rng, config),
            bursting: false,
            negotiation_last_used: None,
        }
    }

    pub fn next_handshake_time(&self) -> u64 {
        self.send_handshake_time
    }

    pub fn handshake_count(&self) -> u32 {
        self.handshake_count
    }

    pub fn is_bursting(&self) -> bool {
        self.bursting
    }

    pub fn burst_size(&self) -> u32 {
        self.burst_size
    }

    pub fn is_due(&self, now: u64) -> bool {
        now >= self.send_handshake_time
    }

    /// Schedule the next attempt after one was sent (or could not be)
    ///
    /// Returns true when an ARK fetch should start.
    pub fn calc_next<R: Rng + ?Sized>(
        &mut self,
        now: u64,
        successful_send: bool,
        mode: PeerMode,
        compat: VersionCompat,
        invalid_version: bool,
        config: &PeerConfig,
        rng: &mut R,
    ) -> bool {
        let incompatible = !compat.is_compatible();
        let mut fetch_ark = false;

        if mode != PeerMode::BurstOnly {
            let interval = if incompatible {
                randomized_interval(
                    rng,
                    config.min_version_send_interval,
                    config.randomized_version_send_interval,
                )
            } else if invalid_version && !self.first_handshake {
                randomized_interval(
                    rng,
                    config.min_version_probe_interval,
                    config.randomized_version_probe_interval,
                )
            } else {
                randomized_interval(
                    rng,
                    config.min_handshake_interval,
                    config.randomized_handshake_interval,
                )
            };
            self.send_handshake_time = now + interval;
            if successful_send {
                self.first_handshake = false;
            }
            self.handshake_count = self.handshake_count.saturating_add(1);
            fetch_ark = self.handshake_count == config.max_handshake_count && !incompatible;
        } else {
            self.burst_count += 1;
            if incompatible {
                // One presence packet per cycle only
                self.burst_count = 0;
            } else if self.burst_count >= self.burst_size {
                self.burst_count = 0;
                fetch_ark = true;
            }
            if self.burst_count == 0 {
                self.send_handshake_time =
                    now + randomized_interval(rng, config.min_burst_pause, config.randomized_burst_pause);
                self.burst_size = random_burst_size(rng, config);
                self.bursting = false;
            } else {
                self.send_handshake_time = now
                    + randomized_interval(
                        rng,
                        config.min_handshake_interval,
                        config.randomized_handshake_interval,
                    );
            }
        }

        log::debug!(
            "Next handshake in {} ms (count {}, fetch ARK: {})",
            self.send_handshake_time.saturating_sub(now),
            self.handshake_count,
            fetch_ark
        );
        fetch_ark
    }

    /// A key agreement is in flight and was used recently
    pub fn has_live_handshake(&self, now: u64, timeout: u64) -> bool {
        match self.negotiation_last_used {
            Some(used) => now.saturating_sub(used) < timeout,
            None => false,
        }
    }

    pub fn touch_negotiation(&mut self, now: u64) {
        self.negotiation_last_used = Some(now);
    }

    pub fn clear_negotiation(&mut self) {
        self.negotiation_last_used = None;
    }

    pub fn reset_count(&mut self) {
        self.handshake_count = 0;
    }

    /// Set the failure counter directly
    ///
    /// Setting it to the ARK threshold suppresses the trigger: the next
    /// attempt counts past the threshold, and no fetch is signalled again
    /// until `reset_count`.
    pub fn force_count(&mut self, count: u32) {
        self.handshake_count = count;
    }

    pub fn start_burst(&mut self) {
        self.bursting = true;
    }

    /// Make an attempt due right away
    pub fn reset_next_to(&mut self, now: u64) {
        self.send_handshake_time = now;
    }

    pub fn snapshot(&self) -> HandshakeSnapshot {
        HandshakeSnapshot {
            next_handshake: self.send_handshake_time,
            handshake_count: self.handshake_count,
            bursting: self.bursting,
            burst_size: self.burst_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup() -> (HandshakeScheduler, PeerConfig, StdRng) {
        let config = PeerConfig::default();
        let mut rng = StdRng::seed_from_u64(42);
        let scheduler = HandshakeScheduler::new(0, &config, &mut rng);
        (scheduler, config, rng)
    }

    #[test]
    fn test_first_attempt_due_immediately() {
        let (scheduler, _, _) = setup();
        assert!(scheduler.is_due(0));
        assert_eq!(scheduler.handshake_count(), 0);
    }

    #[test]
    fn test_normal_interval_bounds() {
        let (mut scheduler, config, mut rng) = setup();
        for i in 0..20 {
            let now = i * 100_000;
            scheduler.calc_next(now, true, PeerMode::Normal, VersionCompat::Compatible, false, &config, &mut rng);
            let delay = scheduler.next_handshake_time() - now;
            assert!((10_000..15_000).contains(&delay));
        }
    }

    #[test]
    fn test_ark_triggered_exactly_once_at_threshold() {
        let (mut scheduler, config, mut rng) = setup();
        let triggers: Vec<bool> = (0..5)
            .map(|i| {
                scheduler.calc_next(i, false, PeerMode::Normal, VersionCompat::Compatible, false, &config, &mut rng)
            })
            .collect();
        assert_eq!(triggers, vec![false, true, false, false, false]);
    }

    #[test]
    fn test_incompatible_peer_gets_presence_interval_and_no_ark() {
        let (mut scheduler, config, mut rng) = setup();
        for i in 0..3 {
            let fetch = scheduler.calc_next(i, true, PeerMode::Normal, VersionCompat::TooOld, false, &config, &mut rng);
            assert!(!fetch);
            let delay = scheduler.next_handshake_time() - i;
            assert!((120_000..180_000).contains(&delay));
        }
    }

    #[test]
    fn test_version_probe_after_first_handshake() {
        let (mut scheduler, config, mut rng) = setup();
        // First attempt still uses the normal interval
        scheduler.calc_next(0, true, PeerMode::Normal, VersionCompat::Compatible, true, &config, &mut rng);
        assert!(scheduler.next_handshake_time() < 15_000);
        scheduler.calc_next(0, true, PeerMode::Normal, VersionCompat::Compatible, true, &config, &mut rng);
        assert!((20_000..30_000).contains(&scheduler.next_handshake_time()));
    }

    #[test]
    fn test_burst_cycle() {
        let (mut scheduler, config, mut rng) = setup();
        let size = scheduler.burst_size();
        assert!((1..4).contains(&size));
        scheduler.start_burst();

        let mut fetched = false;
        for i in 0..size {
            fetched = scheduler.calc_next(0, true, PeerMode::BurstOnly, VersionCompat::Compatible, false, &config, &mut rng);
            if i + 1 < size {
                assert!(!fetched);
                assert!(scheduler.next_handshake_time() < 15_000);
            }
        }
        assert!(fetched);
        assert!(!scheduler.is_bursting());
        assert!((120_000..300_000).contains(&scheduler.next_handshake_time()));
    }

    #[test]
    fn test_burst_incompatible_sends_one_then_pauses() {
        let (mut scheduler, config, mut rng) = setup();
        scheduler.start_burst();
        let fetched = scheduler.calc_next(0, true, PeerMode::BurstOnly, VersionCompat::TooNew, false, &config, &mut rng);
        assert!(!fetched);
        assert!(!scheduler.is_bursting());
        assert!(scheduler.next_handshake_time() >= 120_000);
    }

    #[test]
    fn test_live_handshake_window() {
        let (mut scheduler, _, _) = setup();
        assert!(!scheduler.has_live_handshake(0, 5_000));
        scheduler.touch_negotiation(1_000);
        assert!(scheduler.has_live_handshake(5_999, 5_000));
        assert!(!scheduler.has_live_handshake(6_000, 5_000));
        scheduler.clear_negotiation();
        assert!(!scheduler.has_live_handshake(1_000, 5_000));
    }
}
