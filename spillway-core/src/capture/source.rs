//! Discovered stream sources and the selection policy.
//!
//! Discovery itself is an external collaborator hidden behind
//! [`StreamFinder`]; the core only ranks what it returns.

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use super::CaptureError;
use crate::config::SiteConfig;

/// One selected source descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StreamSource {
    Combined { url: String },
    Separate { video: String, audio: String },
    VideoOnly { url: String },
    AudioOnly { url: String },
}

impl StreamSource {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamSource::Combined { .. } => "combined",
            StreamSource::Separate { .. } => "separate",
            StreamSource::VideoOnly { .. } => "video-only",
            StreamSource::AudioOnly { .. } => "audio-only",
        }
    }

    /// URL handed to the capture process. For separate tracks the video
    /// URL drives capture; the audio URL is carried for tooling that can
    /// mux it back in.
    pub fn capture_url(&self) -> &str {
        match self {
            StreamSource::Combined { url }
            | StreamSource::VideoOnly { url }
            | StreamSource::AudioOnly { url } => url,
            StreamSource::Separate { video, .. } => video,
        }
    }
}

/// Everything discovery turned up for one site.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredStreams {
    pub combined: Vec<String>,
    pub video: Option<String>,
    pub audio: Option<String>,
}

impl DiscoveredStreams {
    pub fn is_empty(&self) -> bool {
        self.combined.is_empty() && self.video.is_none() && self.audio.is_none()
    }

    /// Deterministic selection, first match wins:
    /// combined > separate video+audio > video-only > audio-only > none.
    pub fn select_best(&self) -> Option<StreamSource> {
        if let Some(url) = self.combined.first() {
            return Some(StreamSource::Combined { url: url.clone() });
        }
        match (&self.video, &self.audio) {
            (Some(video), Some(audio)) => Some(StreamSource::Separate {
                video: video.clone(),
                audio: audio.clone(),
            }),
            (Some(video), None) => Some(StreamSource::VideoOnly { url: video.clone() }),
            (None, Some(audio)) => Some(StreamSource::AudioOnly { url: audio.clone() }),
            (None, None) => None,
        }
    }
}

/// External stream-discovery collaborator.
#[async_trait]
pub trait StreamFinder: Send + Sync {
    /// Inspects the site and returns every usable source found.
    async fn find_streams(&self, site: &SiteConfig) -> Result<DiscoveredStreams, CaptureError>;
}

/// Finder for sites whose stream location is already known.
///
/// Serves the configured `stream_url` (or the page URL itself, which
/// streamlink-compatible tools resolve on their own) as a combined
/// source. Also the standard test double.
pub struct StaticStreamFinder;

#[async_trait]
impl StreamFinder for StaticStreamFinder {
    async fn find_streams(&self, site: &SiteConfig) -> Result<DiscoveredStreams, CaptureError> {
        let url = site.stream_url.clone().unwrap_or_else(|| site.url.clone());
        if Url::parse(&url).is_err() {
            return Err(CaptureError::DiscoveryFailed {
                site_id: site.id.clone(),
                reason: format!("not a valid URL: {url}"),
            });
        }
        Ok(DiscoveredStreams {
            combined: vec![url],
            ..Default::default()
        })
    }
}
