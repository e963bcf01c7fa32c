// SPDX-License-Identifier: MIT
//! Small observability helpers shared across components: latency tracking for
//! structured logs and metrics, and a human-readable byte formatter for
//! `/api/status`.

use std::time::Instant;
use tracing::{debug, info};

/// Tracks the latency of an async operation and emits a structured log event
/// on completion. Used by [`crate::command_executor::CommandExecutor`] to
/// both log slow commands and feed the running-average metric.
pub struct LatencyTracker {
    operation: String,
    start: Instant,
}

impl LatencyTracker {
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            start: Instant::now(),
        }
    }

    /// Finish tracking, log, and return the elapsed time in whole milliseconds.
    pub fn finish_and_elapsed_ms(self) -> u64 {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        if elapsed_ms > 1000 {
            info!(operation = %self.operation, elapsed_ms, "slow CDP command");
        } else {
            debug!(operation = %self.operation, elapsed_ms, "CDP command complete");
        }
        elapsed_ms
    }
}

/// Format a byte count as a human-readable string, used by `/api/status`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_scales_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1_048_576), "1.0 MB");
    }

    #[tokio::test]
    async fn latency_tracker_reports_elapsed() {
        let tracker = LatencyTracker::start("test.op");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let elapsed = tracker.finish_and_elapsed_ms();
        assert!(elapsed >= 5);
    }
}
