//! Invocation contracts for the external capture and transcode tools.
//!
//! The capture tool is streamlink-compatible: it resolves a source URL and
//! writes raw transport-stream bytes to the named channel. The transcode
//! tool is ffmpeg-compatible: it reads the channel and produces a
//! segmented playlist.

use std::path::{Path, PathBuf};

use crate::config::{CaptureConfig, SiteConfig, TranscodeConfig};

/// Arguments for one capture process invocation.
#[derive(Debug, Clone)]
pub struct CaptureCommand {
    pub url: String,
    pub channel_path: PathBuf,
    pub quality: String,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub retry_streams: u32,
    pub retry_max: u32,
    pub extra_args: Vec<String>,
}

impl CaptureCommand {
    /// Builds the invocation for a site, applying per-site overrides on
    /// top of the capture defaults.
    pub fn for_site(
        site: &SiteConfig,
        config: &CaptureConfig,
        url: impl Into<String>,
        channel_path: &Path,
    ) -> Self {
        Self {
            url: url.into(),
            channel_path: channel_path.to_path_buf(),
            quality: site.quality.clone().unwrap_or_else(|| config.quality.clone()),
            referer: site.referer.clone().or_else(|| Some(site.url.clone())),
            user_agent: site.user_agent.clone(),
            retry_streams: config.retry_streams,
            retry_max: config.retry_max,
            extra_args: site.extra_args.clone(),
        }
    }

    /// Full argument vector, channel as output target, URL and quality last.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--loglevel".to_string(),
            "info".to_string(),
            "--output".to_string(),
            self.channel_path.display().to_string(),
            "--force".to_string(),
            "--retry-streams".to_string(),
            self.retry_streams.to_string(),
            "--retry-max".to_string(),
            self.retry_max.to_string(),
        ];

        if let Some(referer) = &self.referer {
            args.push("--http-header".to_string());
            args.push(format!("Referer={referer}"));
        }
        if let Some(user_agent) = &self.user_agent {
            args.push("--http-header".to_string());
            args.push(format!("User-Agent={user_agent}"));
        }

        args.extend(self.extra_args.iter().cloned());
        args.push(self.url.clone());
        args.push(self.quality.clone());
        args
    }
}

/// Arguments for one transcode process invocation.
#[derive(Debug, Clone)]
pub struct TranscodeCommand {
    pub channel_path: PathBuf,
    pub playlist_path: PathBuf,
    pub segment_pattern: PathBuf,
    pub segment_duration_secs: u32,
    pub playlist_size: u32,
    pub delete_threshold: u32,
    pub video_codec: String,
    pub audio_codec: String,
    /// DVR keeps old segments on disk for the retention cleanup pass
    /// instead of letting the transcoder delete them.
    pub dvr: bool,
}

impl TranscodeCommand {
    pub fn new(
        config: &TranscodeConfig,
        channel_path: &Path,
        playlist_path: &Path,
        segment_pattern: &Path,
    ) -> Self {
        Self {
            channel_path: channel_path.to_path_buf(),
            playlist_path: playlist_path.to_path_buf(),
            segment_pattern: segment_pattern.to_path_buf(),
            segment_duration_secs: config.segment_duration_secs,
            playlist_size: config.playlist_size,
            delete_threshold: config.delete_threshold,
            video_codec: config.video_codec.clone(),
            audio_codec: config.audio_codec.clone(),
            dvr: config.dvr.enabled,
        }
    }

    fn hls_flags(&self) -> &'static str {
        if self.dvr {
            "append_list+omit_endlist"
        } else {
            "delete_segments+append_list+omit_endlist"
        }
    }

    /// Full argument vector: channel as input, segmented playlist as output.
    pub fn build_args(&self) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-fflags".to_string(),
            "+genpts+igndts".to_string(),
            "-thread_queue_size".to_string(),
            "512".to_string(),
            "-f".to_string(),
            "mpegts".to_string(),
            "-i".to_string(),
            self.channel_path.display().to_string(),
            "-c:v".to_string(),
            self.video_codec.clone(),
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            self.segment_duration_secs.to_string(),
            "-hls_list_size".to_string(),
            self.playlist_size.to_string(),
            "-hls_delete_threshold".to_string(),
            self.delete_threshold.to_string(),
            "-hls_flags".to_string(),
            self.hls_flags().to_string(),
            "-hls_segment_filename".to_string(),
            self.segment_pattern.display().to_string(),
            "-max_muxing_queue_size".to_string(),
            "1024".to_string(),
            self.playlist_path.display().to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpillwayConfig;

    #[test]
    fn capture_args_follow_the_invocation_contract() {
        let config = SpillwayConfig::default();
        let mut site = SiteConfig::new("arena", "Arena", "https://example.com/live");
        site.user_agent = Some("Mozilla/5.0".to_string());
        site.extra_args = vec!["--hls-live-edge".to_string(), "2".to_string()];

        let cmd = CaptureCommand::for_site(
            &site,
            &config.capture,
            "https://cdn.example.com/master.m3u8",
            Path::new("/tmp/arena.pipe"),
        );
        let args = cmd.build_args();

        let output_at = args.iter().position(|a| a == "--output").unwrap();
        assert_eq!(args[output_at + 1], "/tmp/arena.pipe");
        assert!(args.contains(&"--force".to_string()));
        assert!(args.contains(&"Referer=https://example.com/live".to_string()));
        assert!(args.contains(&"User-Agent=Mozilla/5.0".to_string()));
        assert!(args.contains(&"--hls-live-edge".to_string()));

        // URL and quality close the invocation.
        assert_eq!(args[args.len() - 2], "https://cdn.example.com/master.m3u8");
        assert_eq!(args[args.len() - 1], "best");
    }

    #[test]
    fn site_quality_overrides_default() {
        let config = SpillwayConfig::default();
        let mut site = SiteConfig::new("arena", "Arena", "https://example.com/live");
        site.quality = Some("720p".to_string());

        let cmd = CaptureCommand::for_site(&site, &config.capture, "u", Path::new("/p"));
        assert_eq!(cmd.quality, "720p");
    }

    #[test]
    fn transcode_args_read_channel_and_write_playlist() {
        let config = SpillwayConfig::default();
        let cmd = TranscodeCommand::new(
            &config.transcode,
            Path::new("/tmp/arena.pipe"),
            Path::new("/hls/arena/stream.m3u8"),
            Path::new("/hls/arena/segment_%03d.ts"),
        );
        let args = cmd.build_args();

        let input_at = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input_at + 1], "/tmp/arena.pipe");
        assert_eq!(args.last().unwrap(), "/hls/arena/stream.m3u8");
        assert!(args.contains(&"delete_segments+append_list+omit_endlist".to_string()));
    }

    #[test]
    fn dvr_mode_disables_segment_deletion() {
        let mut config = SpillwayConfig::default();
        config.transcode.dvr.enabled = true;

        let cmd = TranscodeCommand::new(
            &config.transcode,
            Path::new("/tmp/a.pipe"),
            Path::new("/hls/a/stream.m3u8"),
            Path::new("/hls/a/segment_%03d.ts"),
        );
        let args = cmd.build_args();

        assert!(args.contains(&"append_list+omit_endlist".to_string()));
        assert!(!args.iter().any(|a| a.contains("delete_segments")));
    }
}
