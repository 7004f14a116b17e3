//! Lightweight Prometheus-compatible metrics for one peer session.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format, labelled with the peer's short identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-peer traffic and lifecycle counters
pub struct PeerMetrics {
    /// Bytes received from the peer (counter)
    pub bytes_in_total: AtomicU64,
    /// Bytes sent to the peer (counter)
    pub bytes_out_total: AtomicU64,
    /// Handshake packets sent (counter)
    pub handshakes_sent_total: AtomicU64,
    /// Handshake attempts that could not be sent (counter)
    pub handshake_failures_total: AtomicU64,
    /// Completed handshakes (counter)
    pub connections_total: AtomicU64,
    /// Disconnections (counter)
    pub disconnections_total: AtomicU64,
    /// Overload rejections that started a backoff window (counter)
    pub backoffs_total: AtomicU64,
    /// Messages requeued after a failed transmission (counter)
    pub requeued_messages_total: AtomicU64,
    /// Session creation time (for age calculation)
    pub start_time: Instant,
}

impl PeerMetrics {
    pub fn new() -> Self {
        Self {
            bytes_in_total: AtomicU64::new(0),
            bytes_out_total: AtomicU64::new(0),
            handshakes_sent_total: AtomicU64::new(0),
            handshake_failures_total: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            disconnections_total: AtomicU64::new(0),
            backoffs_total: AtomicU64::new(0),
            requeued_messages_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self, peer: &str) -> String {
        let mut out = String::new();
        let counters: [(&str, &str, &AtomicU64); 8] = [
            ("darknet_peer_bytes_in_total", "Bytes received from the peer", &self.bytes_in_total),
            ("darknet_peer_bytes_out_total", "Bytes sent to the peer", &self.bytes_out_total),
            ("darknet_peer_handshakes_sent_total", "Handshake packets sent", &self.handshakes_sent_total),
            (
                "darknet_peer_handshake_failures_total",
                "Handshake attempts that could not be sent",
                &self.handshake_failures_total,
            ),
            ("darknet_peer_connections_total", "Completed handshakes", &self.connections_total),
            ("darknet_peer_disconnections_total", "Disconnections", &self.disconnections_total),
            ("darknet_peer_backoffs_total", "Routing backoff windows started", &self.backoffs_total),
            (
                "darknet_peer_requeued_messages_total",
                "Messages requeued after a failed transmission",
                &self.requeued_messages_total,
            ),
        ];
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name}{{peer=\"{peer}\"}} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP darknet_peer_age_seconds Seconds since the session was created\n\
             # TYPE darknet_peer_age_seconds gauge\n\
             darknet_peer_age_seconds{{peer=\"{peer}\"}} {}\n",
            self.start_time.elapsed().as_secs()
        ));
        out
    }
}

impl Default for PeerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_format() {
        let m = PeerMetrics::new();
        PeerMetrics::incr(&m.bytes_in_total, 8192);
        PeerMetrics::incr(&m.handshakes_sent_total, 3);
        let output = m.render("ab12cd34");
        assert!(output.contains("darknet_peer_bytes_in_total{peer=\"ab12cd34\"} 8192"));
        assert!(output.contains("darknet_peer_handshakes_sent_total{peer=\"ab12cd34\"} 3"));
        assert!(output.contains("darknet_peer_backoffs_total{peer=\"ab12cd34\"} 0"));
    }

    #[test]
    fn test_metrics_render_prometheus_format() {
        let output = PeerMetrics::new().render("p");
        assert!(output.contains("# TYPE darknet_peer_bytes_out_total counter"));
        assert!(output.contains("# HELP darknet_peer_requeued_messages_total"));
        assert!(output.contains("# TYPE darknet_peer_age_seconds gauge"));
        assert!(output
            .lines()
            .any(|l| l.starts_with("darknet_peer_age_seconds{peer=\"p\"} ")));
    }
}
