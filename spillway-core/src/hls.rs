//! Segmented-playlist output management for the transcode topology.
//!
//! The transcode process writes a playlist plus numbered segments into a
//! per-site directory. This module owns that directory: readiness
//! detection, segment statistics, the DVR retention pass, and teardown.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TranscodeConfig;

const PLAYLIST_NAME: &str = "stream.m3u8";
const SEGMENT_PATTERN: &str = "segment_%03d.ts";

/// Statistics over one site's segmented output.
#[derive(Debug, Clone, Default)]
pub struct HlsStats {
    pub segment_count: usize,
    pub playlist_bytes: u64,
}

/// One site's segmented output directory.
#[derive(Debug)]
pub struct HlsOutput {
    site_id: String,
    dir: PathBuf,
    playlist_path: PathBuf,
    segment_pattern: PathBuf,
    dvr_cleanup: Option<JoinHandle<()>>,
}

impl HlsOutput {
    /// Creates the per-site output directory and, when DVR retention is
    /// on, starts the periodic cleanup pass.
    ///
    /// # Errors
    /// - `std::io::Error` - Output directory could not be created
    pub async fn prepare(config: &TranscodeConfig, site_id: &str) -> std::io::Result<Self> {
        let dir = config.hls_dir.join(site_id);
        tokio::fs::create_dir_all(&dir).await?;

        let playlist_path = dir.join(PLAYLIST_NAME);
        let segment_pattern = dir.join(SEGMENT_PATTERN);

        let dvr_cleanup = if config.dvr.enabled && !config.dvr.keep_all_segments {
            Some(spawn_retention_pass(
                dir.clone(),
                config.dvr.window(),
                config.dvr.cleanup_interval(),
            ))
        } else {
            None
        };

        info!("Segmented output for {site_id} at {}", dir.display());
        Ok(Self {
            site_id: site_id.to_string(),
            dir,
            playlist_path,
            segment_pattern,
            dvr_cleanup,
        })
    }

    pub fn playlist_path(&self) -> &Path {
        &self.playlist_path
    }

    pub fn segment_pattern(&self) -> &Path {
        &self.segment_pattern
    }

    /// Playlist URL as served by the web layer.
    pub fn playlist_url(&self) -> String {
        format!("/hls/{}/{PLAYLIST_NAME}", self.site_id)
    }

    /// Waits for the transcoder to produce a valid playlist: the file
    /// exists, carries the format marker, and references a segment.
    ///
    /// Returns false on timeout.
    pub async fn wait_for_playlist(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(content) = tokio::fs::read_to_string(&self.playlist_path).await
                && content.contains("#EXTM3U")
                && content.contains(".ts")
            {
                info!("Playlist ready: {}", self.playlist_path.display());
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Timed out waiting for playlist: {}",
                    self.playlist_path.display()
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Segment count and playlist size, zeroed when the playlist is gone.
    pub async fn stats(&self) -> HlsStats {
        let Ok(content) = tokio::fs::read_to_string(&self.playlist_path).await else {
            return HlsStats::default();
        };
        HlsStats {
            segment_count: content.matches(".ts").count(),
            playlist_bytes: content.len() as u64,
        }
    }

    /// Removes the whole per-site output directory. Best-effort; a
    /// missing directory is fine.
    pub async fn cleanup(mut self) {
        if let Some(task) = self.dvr_cleanup.take() {
            task.abort();
        }
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!("Removed segmented output: {}", self.dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {e}", self.dir.display()),
        }
    }
}

impl Drop for HlsOutput {
    fn drop(&mut self) {
        if let Some(task) = self.dvr_cleanup.take() {
            task.abort();
        }
    }
}

/// Periodically deletes segments older than the retention window.
///
/// Only segment files are touched; the playlist and everything else in
/// the directory stay.
fn spawn_retention_pass(dir: PathBuf, window: Duration, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let removed = retention_sweep(&dir, window).await;
            if removed > 0 {
                debug!("DVR retention removed {removed} segment(s) in {}", dir.display());
            }
        }
    })
}

async fn retention_sweep(dir: &Path, window: Duration) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("segment_") || !name.ends_with(".ts") {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age > window && tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpillwayConfig;

    fn transcode_config(dir: &Path) -> TranscodeConfig {
        TranscodeConfig {
            hls_dir: dir.to_path_buf(),
            ..SpillwayConfig::default().transcode
        }
    }

    #[tokio::test]
    async fn prepare_creates_site_directory_and_paths() {
        let dir = tempfile::tempdir().unwrap();
        let output = HlsOutput::prepare(&transcode_config(dir.path()), "arena")
            .await
            .unwrap();

        assert!(dir.path().join("arena").is_dir());
        assert!(output.playlist_path().ends_with("arena/stream.m3u8"));
        assert_eq!(output.playlist_url(), "/hls/arena/stream.m3u8");
    }

    #[tokio::test]
    async fn playlist_wait_succeeds_once_valid() {
        let dir = tempfile::tempdir().unwrap();
        let output = HlsOutput::prepare(&transcode_config(dir.path()), "arena")
            .await
            .unwrap();

        let playlist = output.playlist_path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // Header only first; not valid until a segment shows up.
            tokio::fs::write(&playlist, "#EXTM3U\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;
            tokio::fs::write(&playlist, "#EXTM3U\n#EXTINF:6.0,\nsegment_000.ts\n")
                .await
                .unwrap();
        });

        assert!(output.wait_for_playlist(Duration::from_secs(10)).await);
        let stats = output.stats().await;
        assert_eq!(stats.segment_count, 1);
    }

    #[tokio::test]
    async fn playlist_wait_times_out_without_transcoder() {
        let dir = tempfile::tempdir().unwrap();
        let output = HlsOutput::prepare(&transcode_config(dir.path()), "arena")
            .await
            .unwrap();

        assert!(!output.wait_for_playlist(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn retention_sweep_removes_only_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let old_segment = dir.path().join("segment_000.ts");
        let new_segment = dir.path().join("segment_001.ts");
        let playlist = dir.path().join("stream.m3u8");
        std::fs::write(&old_segment, b"old").unwrap();
        std::fs::write(&new_segment, b"new").unwrap();
        std::fs::write(&playlist, "#EXTM3U\n").unwrap();

        let stale = std::time::SystemTime::now() - Duration::from_secs(7200);
        std::fs::File::options()
            .write(true)
            .open(&old_segment)
            .unwrap()
            .set_modified(stale)
            .unwrap();

        let removed = retention_sweep(dir.path(), Duration::from_secs(3600)).await;
        assert_eq!(removed, 1);
        assert!(!old_segment.exists());
        assert!(new_segment.exists());
        assert!(playlist.exists());
    }

    #[tokio::test]
    async fn cleanup_removes_directory_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let output = HlsOutput::prepare(&transcode_config(dir.path()), "arena")
            .await
            .unwrap();
        let site_dir = dir.path().join("arena");

        std::fs::remove_dir_all(&site_dir).unwrap();
        // Already gone; cleanup must not complain.
        output.cleanup().await;
        assert!(!site_dir.exists());
    }
}
