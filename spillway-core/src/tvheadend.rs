//! TV-tuner backend integration.
//!
//! Downstream channel registration is a seam: the session only needs
//! create/remove. The shipped implementation writes M3U playlist files
//! into a directory the TVHeadend instance watches, which is how the
//! deployment wires captured relays into its channel lineup.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::TvheadendConfig;

/// Errors from downstream channel registration.
///
/// Sessions treat every one of these as a logged warning; a broken tuner
/// backend never takes the relay down for other consumers.
#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("Channel file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("TVHeadend request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Downstream channel registration contract.
#[async_trait]
pub trait ChannelRegistrar: Send + Sync {
    /// Registers a channel pointing at the given stream URL.
    async fn create_channel(&self, name: &str, url: &str) -> Result<(), RegistrarError>;

    /// Removes a channel. Idempotent: removing an unknown channel is fine.
    async fn remove_channel(&self, name: &str) -> Result<(), RegistrarError>;
}

/// Registrar writing one `.m3u` playlist file per channel.
pub struct M3uRegistrar {
    config: TvheadendConfig,
}

impl M3uRegistrar {
    pub fn new(config: TvheadendConfig) -> Self {
        Self { config }
    }

    fn channel_path(&self, name: &str) -> PathBuf {
        self.config.channel_dir.join(format!("{name}.m3u"))
    }

    /// Probes the TVHeadend API; false on any failure.
    pub async fn check_connectivity(&self) -> bool {
        let url = format!(
            "http://{}:{}/api/status",
            self.config.host, self.config.port
        );
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(client) => client,
            Err(_) => return false,
        };

        let mut request = client.get(&url);
        if !self.config.username.is_empty() {
            request = request.basic_auth(&self.config.username, Some(&self.config.password));
        }

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("TVHeadend connectivity probe failed: {e}");
                false
            }
        }
    }

    /// Names of all currently registered channels.
    pub async fn active_channels(&self) -> Vec<String> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.channel_dir).await else {
            return Vec::new();
        };
        let mut channels = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "m3u")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                channels.push(stem.to_string());
            }
        }
        channels.sort();
        channels
    }

    /// Removes channel and pipe leftovers older than the given age.
    ///
    /// Crash recovery: a previous run may have left files behind that no
    /// live session owns anymore.
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.channel_dir).await else {
            return 0;
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_ours = path
                .extension()
                .is_some_and(|ext| ext == "m3u" || ext == "pipe");
            if !is_ours {
                continue;
            }
            let age = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age > max_age && tokio::fs::remove_file(&path).await.is_ok() {
                debug!("Removed stale channel file: {}", path.display());
                removed += 1;
            }
        }
        removed
    }
}

#[async_trait]
impl ChannelRegistrar for M3uRegistrar {
    async fn create_channel(&self, name: &str, url: &str) -> Result<(), RegistrarError> {
        tokio::fs::create_dir_all(&self.config.channel_dir).await?;

        let content = format!(
            "#EXTM3U\n#EXTINF:-1 tvg-id=\"{name}\" tvg-name=\"{name}\" group-title=\"Live Streams\",{name}\n{url}\n"
        );
        let path = self.channel_path(name);
        tokio::fs::write(&path, content).await?;

        info!("Channel registered: {name} -> {url}");
        Ok(())
    }

    async fn remove_channel(&self, name: &str) -> Result<(), RegistrarError> {
        let path = self.channel_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Channel removed: {name}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to remove channel {name}: {e}");
                Err(e.into())
            }
        }
    }
}
