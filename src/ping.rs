//! Link ping bookkeeping
//!
//! Outstanding ping ids live in a bounded FIFO. When it overflows, the oldest
//! entry is evicted and its age is reported as a round-trip sample, so a peer
//! that never answers still drags its average up instead of growing the table.

use std::collections::VecDeque;

use crate::average::TimeDecayingAverage;

/// Upper clamp for round-trip samples (1 hour)
pub const MAX_PING_TIME: f64 = 3_600_000.0;

#[derive(Debug, Clone)]
pub struct PingTracker {
    outstanding: VecDeque<(u64, u64)>,
    next_id: u64,
    capacity: usize,
    average: TimeDecayingAverage,
}

impl PingTracker {
    pub fn new(capacity: usize, half_life: u64) -> Self {
        Self {
            outstanding: VecDeque::with_capacity(capacity + 1),
            next_id: 0,
            capacity,
            average: TimeDecayingAverage::new(1.0, half_life, 0.0, MAX_PING_TIME),
        }
    }

    /// Register a new ping and return its id
    pub fn send_ping(&mut self, now: u64) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.outstanding.push_back((id, now));
        while self.outstanding.len() > self.capacity {
            if let Some((old_id, sent_at)) = self.outstanding.pop_front() {
                log::debug!("Evicting unanswered ping {}", old_id);
                self.average.report(now, now.saturating_sub(sent_at) as f64);
            }
        }
        id
    }

    /// Match a pong; returns the round-trip time if the id was outstanding
    pub fn received_pong(&mut self, id: u64, now: u64) -> Option<u64> {
        let pos = self.outstanding.iter().position(|(i, _)| *i == id)?;
        let (_, sent_at) = self.outstanding.remove(pos)?;
        let rtt = now.saturating_sub(sent_at);
        self.average.report(now, rtt as f64);
        Some(rtt)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn average_ping_time(&self) -> f64 {
        self.average.value()
    }

    /// Fold in a round-trip measured elsewhere (low-level pings)
    pub fn report_rtt(&mut self, now: u64, rtt: u64) {
        self.average.report(now, rtt as f64);
    }
}
