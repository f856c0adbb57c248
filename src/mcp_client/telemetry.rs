//! Tool-call telemetry: bounded history of call outcomes.
//!
//! Stats are computed on read over the whole buffer; nothing is maintained
//! incrementally.

use std::collections::VecDeque;

use super::types::{ServerCallStats, TelemetryEntry, TelemetryStats};

/// Default number of entries kept.
pub const DEFAULT_TELEMETRY_SIZE: usize = 1000;

/// Ring buffer of the most recent tool calls, oldest first.
#[derive(Debug, Clone)]
pub struct TelemetryBuffer {
    entries: VecDeque<TelemetryEntry>,
    max_size: usize,
}

impl TelemetryBuffer {
    /// Create a buffer holding at most `max_size` entries (minimum 1).
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            entries: VecDeque::with_capacity(max_size.min(DEFAULT_TELEMETRY_SIZE)),
            max_size,
        }
    }

    /// Append an entry, evicting the oldest ones beyond the limit.
    pub fn record(&mut self, entry: TelemetryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
    }

    /// Copy of all entries, oldest first.
    pub fn entries(&self) -> Vec<TelemetryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Aggregate success/failure rates, mean duration and per-server counts.
    pub fn stats(&self) -> TelemetryStats {
        let mut stats = TelemetryStats {
            total_calls: self.entries.len(),
            ..TelemetryStats::default()
        };

        if self.entries.is_empty() {
            return stats;
        }

        let total = self.entries.len() as f64;
        let successes = self.entries.iter().filter(|e| e.success).count() as f64;
        stats.success_rate = successes / total * 100.0;
        stats.failure_rate = 100.0 - stats.success_rate;

        let total_duration: u64 = self.entries.iter().map(|e| e.duration_ms).sum();
        stats.average_duration_ms = total_duration as f64 / total;

        for entry in &self.entries {
            let server = stats
                .by_server
                .entry(entry.server_id.clone())
                .or_insert_with(ServerCallStats::default);
            server.calls += 1;
            if entry.success {
                server.successes += 1;
            } else {
                server.failures += 1;
            }
        }

        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TELEMETRY_SIZE)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(server: &str, tool: &str, duration_ms: u64, success: bool) -> TelemetryEntry {
        let now = Utc::now();
        TelemetryEntry {
            server_id: server.into(),
            tool_name: tool.into(),
            start_time: now,
            end_time: now,
            duration_ms,
            success,
            error: if success { None } else { Some("failed".into()) },
        }
    }

    #[test]
    fn test_empty_stats_are_zero() {
        let buf = TelemetryBuffer::new(10);
        let stats = buf.stats();
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.failure_rate, 0.0);
        assert_eq!(stats.average_duration_ms, 0.0);
        assert!(stats.by_server.is_empty());
    }

    #[test]
    fn test_never_exceeds_max_size() {
        let mut buf = TelemetryBuffer::new(5);
        for i in 0..12 {
            buf.record(entry("s", &format!("t{i}"), i, true));
            assert!(buf.len() <= 5);
        }
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_evicts_oldest_and_keeps_order() {
        let mut buf = TelemetryBuffer::new(3);
        for i in 0..5 {
            buf.record(entry("s", &format!("t{i}"), i, true));
        }
        let names: Vec<String> = buf.entries().into_iter().map(|e| e.tool_name).collect();
        assert_eq!(names, vec!["t2", "t3", "t4"]);
    }

    #[test]
    fn test_stats_rates_and_average() {
        let mut buf = TelemetryBuffer::new(10);
        buf.record(entry("a", "x", 10, true));
        buf.record(entry("a", "x", 20, true));
        buf.record(entry("b", "y", 30, false));
        buf.record(entry("b", "y", 40, true));

        let stats = buf.stats();
        assert_eq!(stats.total_calls, 4);
        assert!((stats.success_rate - 75.0).abs() < f64::EPSILON);
        assert!((stats.failure_rate - 25.0).abs() < f64::EPSILON);
        assert!((stats.average_duration_ms - 25.0).abs() < f64::EPSILON);

        assert_eq!(
            stats.by_server["a"],
            ServerCallStats {
                calls: 2,
                successes: 2,
                failures: 0
            }
        );
        assert_eq!(
            stats.by_server["b"],
            ServerCallStats {
                calls: 2,
                successes: 1,
                failures: 1
            }
        );
    }

    #[test]
    fn test_zero_max_size_is_clamped() {
        let mut buf = TelemetryBuffer::new(0);
        buf.record(entry("s", "a", 1, true));
        buf.record(entry("s", "b", 1, true));
        assert_eq!(buf.max_size(), 1);
        assert_eq!(buf.entries()[0].tool_name, "b");
    }

    #[test]
    fn test_default_size() {
        let mut buf = TelemetryBuffer::default();
        assert!(buf.is_empty());
        buf.record(entry("s", "a", 1, false));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.max_size(), DEFAULT_TELEMETRY_SIZE);
    }
}
