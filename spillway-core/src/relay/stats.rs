//! Statistics tracking for relay buffer operations

use std::time::Duration;

/// Point-in-time statistics for one relay buffer.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Total bytes read from the channel since start
    pub bytes_read: u64,

    /// Total chunks read from the channel since start
    pub chunk_count: u64,

    /// Bytes currently retained in the catch-up window
    pub buffered_bytes: usize,

    /// Chunks currently retained in the catch-up window
    pub buffered_chunks: usize,

    /// Number of currently attached sinks
    pub attached_sinks: usize,

    /// Time since the read loop started
    pub uptime: Duration,
}

impl RelayStats {
    /// Calculates window utilization as a percentage (0-100).
    pub fn utilization_percent(&self, max_bytes: usize) -> f64 {
        if max_bytes == 0 {
            return 0.0;
        }
        (self.buffered_bytes as f64 / max_bytes as f64) * 100.0
    }

    /// Calculates ingest rate in bytes per second since start.
    pub fn data_rate_bps(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.bytes_read as f64 / self.uptime.as_secs_f64()
    }

    /// One-line summary for periodic stats logging.
    pub fn format_summary(&self, max_bytes: usize) -> String {
        format!(
            "{} read | window {}/{} ({:.0}%) | {} sinks | up {}",
            format_bytes(self.bytes_read),
            format_bytes(self.buffered_bytes as u64),
            format_bytes(max_bytes as u64),
            self.utilization_percent(max_bytes),
            self.attached_sinks,
            format_uptime(self.uptime),
        )
    }
}

/// Formats a byte count with a binary-unit suffix.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let exponent = (bytes.ilog2() / 10).min(3);
    let value = bytes as f64 / f64::from(1u32 << (10 * exponent)) as f64;
    format!("{value:.2} {}", UNITS[exponent as usize])
}

/// Formats an uptime as the largest two relevant units.
pub fn format_uptime(uptime: Duration) -> String {
    let seconds = uptime.as_secs();
    let minutes = seconds / 60;
    let hours = minutes / 60;

    if hours > 0 {
        format!("{hours}h {}m", minutes % 60)
    } else if minutes > 0 {
        format!("{minutes}m {}s", seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_tracks_window_fill() {
        let stats = RelayStats {
            buffered_bytes: 5 * 1024 * 1024,
            ..Default::default()
        };
        let percent = stats.utilization_percent(10 * 1024 * 1024);
        assert!((percent - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.utilization_percent(0), 0.0);
    }

    #[test]
    fn byte_formatting_picks_binary_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MiB");
    }

    #[test]
    fn uptime_formatting_uses_two_units() {
        assert_eq!(format_uptime(Duration::from_secs(42)), "42s");
        assert_eq!(format_uptime(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_uptime(Duration::from_secs(3700)), "1h 1m");
    }
}
