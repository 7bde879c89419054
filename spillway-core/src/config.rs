//! Centralized configuration for Spillway.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase. The operator
//! config file (sites, credentials, topology) deserializes into the same
//! structs, with code defaults filling anything the file omits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Central configuration for all Spillway components.
///
/// Groups related configuration settings into logical sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillwayConfig {
    pub topology: Topology,
    pub capture: CaptureConfig,
    pub relay: RelayConfig,
    pub transcode: TranscodeConfig,
    pub health: HealthConfig,
    pub tvheadend: TvheadendConfig,
    pub sites: Vec<SiteConfig>,
}

impl SpillwayConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    /// - `SpillwayError::Io` - File cannot be read
    /// - `SpillwayError::Configuration` - File is not valid config JSON
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| crate::SpillwayError::Configuration {
            reason: format!("{}: {e}", path.display()),
        })
    }

    /// Returns the site entry with the given id, if configured.
    pub fn site(&self, site_id: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.id == site_id)
    }

    /// Returns all sites enabled for capture.
    pub fn enabled_sites(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.iter().filter(|s| s.enabled)
    }
}

/// Pipeline topology for a capture session.
///
/// A FIFO supports a single coherent reader, so exactly one of these
/// strategies consumes the channel per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// Capture process -> channel -> relay buffer -> HTTP clients.
    #[default]
    DirectRelay,
    /// Capture process -> channel -> transcode process -> segmented playlist.
    HlsTranscode,
}

/// Capture process and stream acquisition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// External stream-fetch executable
    pub program: String,
    /// Directory holding per-session named channels
    pub pipe_dir: PathBuf,
    /// Default quality selector passed to the capture tool
    pub quality: String,
    /// Retry count for individual stream acquisition attempts
    pub retry_streams: u32,
    /// Maximum retries before the capture tool gives up
    pub retry_max: u32,
    /// Overall capture process runtime bound in seconds
    pub process_timeout_secs: u64,
    /// Stream discovery timeout in seconds
    pub discovery_timeout_secs: u64,
    /// How long to wait for a producer to open the channel, in seconds
    pub channel_open_timeout_secs: u64,
    /// Maximum sessions started in one parallel batch
    pub max_parallel: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "streamlink".to_string(),
            pipe_dir: PathBuf::from("/var/lib/spillway/pipes"),
            quality: "best".to_string(),
            retry_streams: 3,
            retry_max: 5,
            process_timeout_secs: 600,
            discovery_timeout_secs: 30,
            channel_open_timeout_secs: 30,
            max_parallel: 3,
        }
    }
}

impl CaptureConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_open_timeout_secs)
    }
}

/// Relay buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum retained bytes in the catch-up window
    pub max_buffered_bytes: usize,
    /// Read size for each channel read
    pub read_chunk_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 10 * 1024 * 1024, // 10 MiB
            read_chunk_size: 64 * 1024,           // 64 KiB
        }
    }
}

/// Transcode process and segmented-output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// External transcode executable
    pub program: String,
    /// Root directory for per-site segmented output
    pub hls_dir: PathBuf,
    /// Duration of each segment in seconds
    pub segment_duration_secs: u32,
    /// Number of segments kept in the playlist window
    pub playlist_size: u32,
    /// Segments retained past the playlist window before deletion
    pub delete_threshold: u32,
    /// Video codec, "copy" to avoid re-encoding
    pub video_codec: String,
    /// Audio codec, "copy" to avoid re-encoding
    pub audio_codec: String,
    /// How long to wait for the playlist to become valid, in seconds
    pub playlist_wait_timeout_secs: u64,
    pub dvr: DvrConfig,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            hls_dir: PathBuf::from("/var/lib/spillway/hls"),
            segment_duration_secs: 6,
            playlist_size: 5,
            delete_threshold: 10,
            video_codec: "copy".to_string(),
            audio_codec: "copy".to_string(),
            playlist_wait_timeout_secs: 30,
            dvr: DvrConfig::default(),
        }
    }
}

impl TranscodeConfig {
    pub fn playlist_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.playlist_wait_timeout_secs)
    }
}

/// DVR (timeshift) configuration for segmented output.
///
/// When enabled, the transcoder stops deleting old segments itself and a
/// periodic cleanup pass enforces the retention window instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DvrConfig {
    pub enabled: bool,
    /// Retention window for old segments in seconds
    pub window_secs: u64,
    /// Interval between cleanup passes in seconds
    pub cleanup_interval_secs: u64,
    /// Never delete segments, even past the retention window
    pub keep_all_segments: bool,
}

impl Default for DvrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: 3600, // 1 hour of timeshift
            cleanup_interval_secs: 60,
            keep_all_segments: false,
        }
    }
}

impl DvrConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Health check and restart policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health evaluations in seconds
    pub check_interval_secs: u64,
    /// Output artifact staleness threshold in seconds
    pub stale_output_threshold_secs: u64,
    /// Age below which a process is reported healthy while warming up
    pub startup_grace_secs: u64,
    /// Proactive restart bound; upstream sources expire access tokens
    pub max_session_uptime_secs: u64,
    /// Delay between stop and start during a restart, in seconds
    pub restart_settle_delay_secs: u64,
    /// Grace period between terminate and kill signals, in seconds
    pub process_grace_period_secs: u64,
    /// Restarts allowed within the window before the session is suspended
    pub max_restarts_in_window: u32,
    /// Restart ceiling window in seconds
    pub restart_window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            stale_output_threshold_secs: 30,
            startup_grace_secs: 5,
            max_session_uptime_secs: 1800,
            restart_settle_delay_secs: 3,
            process_grace_period_secs: 5,
            max_restarts_in_window: 5,
            restart_window_secs: 600,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn stale_output_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_output_threshold_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn max_session_uptime(&self) -> Duration {
        Duration::from_secs(self.max_session_uptime_secs)
    }

    pub fn restart_settle_delay(&self) -> Duration {
        Duration::from_secs(self.restart_settle_delay_secs)
    }

    pub fn process_grace_period(&self) -> Duration {
        Duration::from_secs(self.process_grace_period_secs)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

/// TV-tuner backend (TVHeadend) integration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TvheadendConfig {
    /// Directory where channel playlist files are written
    pub channel_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Base URL under which downstream consumers reach this relay
    pub stream_base_url: String,
}

impl Default for TvheadendConfig {
    fn default() -> Self {
        Self {
            channel_dir: PathBuf::from("/var/lib/spillway/channels"),
            host: "localhost".to_string(),
            port: 9981,
            username: String::new(),
            password: String::new(),
            stream_base_url: "http://localhost:8080".to_string(),
        }
    }
}

/// One capture source: a web page carrying a live stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Stable external identifier, used in paths and URLs
    pub id: String,
    /// Human-readable name for channel listings
    pub name: String,
    /// Source page URL handed to discovery and the capture tool
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// HTTP Referer header for the capture tool
    #[serde(default)]
    pub referer: Option<String>,
    /// HTTP User-Agent header for the capture tool
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Per-site quality selector override
    #[serde(default)]
    pub quality: Option<String>,
    /// Free-form extra arguments appended to the capture invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Known stream URL, bypassing discovery entirely
    #[serde(default)]
    pub stream_url: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SiteConfig {
    /// Minimal site entry, used mostly by tests and one-shot captures.
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            enabled: true,
            referer: None,
            user_agent: None,
            quality: None,
            extra_args: Vec::new(),
            stream_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_tunables() {
        let config = SpillwayConfig::default();
        assert_eq!(config.topology, Topology::DirectRelay);
        assert_eq!(config.relay.max_buffered_bytes, 10 * 1024 * 1024);
        assert_eq!(config.health.check_interval(), Duration::from_secs(30));
        assert_eq!(config.health.max_session_uptime(), Duration::from_secs(1800));
        assert_eq!(config.transcode.segment_duration_secs, 6);
        assert!(config.sites.is_empty());
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let raw = r#"{
            "topology": "hls-transcode",
            "sites": [
                {"id": "arena", "name": "Arena", "url": "https://example.com/live"}
            ]
        }"#;
        let config: SpillwayConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.topology, Topology::HlsTranscode);
        assert_eq!(config.sites.len(), 1);
        assert!(config.sites[0].enabled);
        assert_eq!(config.capture.program, "streamlink");
    }

    #[test]
    fn site_lookup_and_enabled_filter() {
        let mut config = SpillwayConfig::default();
        let mut off = SiteConfig::new("off", "Off", "https://example.com/off");
        off.enabled = false;
        config.sites.push(SiteConfig::new("on", "On", "https://example.com/on"));
        config.sites.push(off);

        assert!(config.site("on").is_some());
        assert!(config.site("missing").is_none());
        let enabled: Vec<_> = config.enabled_sites().map(|s| s.id.as_str()).collect();
        assert_eq!(enabled, vec!["on"]);
    }
}
