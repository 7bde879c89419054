//! Multi-site session registry.
//!
//! Owns one session handle per site, fans every session's events onto one
//! shared bus, and bounds how many sessions a parallel startup batch
//! launches at once.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{
    CaptureError, EventBus, SessionEvent, SessionHandle, SessionSnapshot, StreamFinder,
    spawn_session,
};
use crate::config::SpillwayConfig;
use crate::relay::RelayBuffer;
use crate::tvheadend::ChannelRegistrar;

/// Registry of capture sessions, one per site.
pub struct SessionManager {
    config: SpillwayConfig,
    finder: Arc<dyn StreamFinder>,
    registrar: Arc<dyn ChannelRegistrar>,
    events: EventBus,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        config: SpillwayConfig,
        finder: Arc<dyn StreamFinder>,
        registrar: Arc<dyn ChannelRegistrar>,
    ) -> Self {
        Self {
            config,
            finder,
            registrar,
            events: EventBus::default(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SpillwayConfig {
        &self.config
    }

    /// Subscribes to the lifecycle events of every session.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Starts capture for one configured site, spawning its session actor
    /// on first use.
    ///
    /// # Errors
    /// - `CaptureError::UnknownSite` - No such site in the configuration
    /// - `CaptureError::AlreadyRunning` - The site's session is active
    /// - Any error from the session's start sequence
    pub async fn start_site(&self, site_id: &str) -> Result<(), CaptureError> {
        let site = self
            .config
            .site(site_id)
            .cloned()
            .ok_or_else(|| CaptureError::UnknownSite {
                site_id: site_id.to_string(),
            })?;

        let handle = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(site_id) {
                Some(existing) => existing.clone(),
                None => {
                    let handle = spawn_session(
                        site,
                        self.config.clone(),
                        Arc::clone(&self.finder),
                        Arc::clone(&self.registrar),
                        self.events.clone(),
                    );
                    sessions.insert(site_id.to_string(), handle.clone());
                    handle
                }
            }
        };

        match handle.start().await {
            Ok(()) => {
                info!("Capture started for {site_id}");
                Ok(())
            }
            Err(e @ CaptureError::AlreadyRunning { .. }) => Err(e),
            Err(e) => {
                // A session that never came up does not stay registered.
                let removed = self.sessions.write().await.remove(site_id);
                if let Some(handle) = removed {
                    let _ = handle.shutdown().await;
                }
                Err(e)
            }
        }
    }

    /// Starts every enabled site, bounded by `max_parallel`.
    ///
    /// Returns per-site outcomes; one site failing never blocks the rest.
    pub async fn start_enabled(&self) -> Vec<(String, Result<(), CaptureError>)> {
        let site_ids: Vec<String> = self
            .config
            .enabled_sites()
            .take(self.config.capture.max_parallel)
            .map(|s| s.id.clone())
            .collect();

        if site_ids.is_empty() {
            warn!("No enabled sites to capture");
            return Vec::new();
        }

        let results =
            futures::future::join_all(site_ids.iter().map(|id| self.start_site(id))).await;
        site_ids.into_iter().zip(results).collect()
    }

    /// Stops one site's session and drops it from the registry.
    ///
    /// # Errors
    /// - `CaptureError::UnknownSite` - The site has no session
    pub async fn stop_site(&self, site_id: &str) -> Result<(), CaptureError> {
        let handle = self.sessions.write().await.remove(site_id).ok_or_else(|| {
            CaptureError::UnknownSite {
                site_id: site_id.to_string(),
            }
        })?;

        let _ = handle.stop().await;
        let _ = handle.shutdown().await;
        info!("Capture stopped for {site_id}");
        Ok(())
    }

    /// Restarts one site's session in place.
    ///
    /// # Errors
    /// - `CaptureError::UnknownSite` - The site has no session
    /// - Any error from the restart
    pub async fn restart_site(&self, site_id: &str) -> Result<(), CaptureError> {
        let handle = self
            .sessions
            .read()
            .await
            .get(site_id)
            .cloned()
            .ok_or_else(|| CaptureError::UnknownSite {
                site_id: site_id.to_string(),
            })?;
        handle.restart().await
    }

    /// Stops every session.
    pub async fn stop_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.stop().await;
            let _ = handle.shutdown().await;
        }
        info!("All capture sessions stopped");
    }

    /// Snapshot of one site's session.
    pub async fn status(&self, site_id: &str) -> Option<SessionSnapshot> {
        let handle = self.sessions.read().await.get(site_id).cloned()?;
        handle.snapshot().await.ok()
    }

    /// Snapshots of every registered session, sorted by site id.
    pub async fn status_all(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<SessionHandle> =
            self.sessions.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        snapshots
    }

    /// The live relay buffer for a site, for attaching HTTP sinks.
    pub async fn relay(&self, site_id: &str) -> Option<Arc<RelayBuffer>> {
        let handle = self.sessions.read().await.get(site_id).cloned()?;
        handle.relay().await.ok().flatten()
    }

    /// True while the site has a registered session.
    pub async fn is_active(&self, site_id: &str) -> bool {
        self.sessions.read().await.contains_key(site_id)
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::capture::DiscoveredStreams;
    use crate::config::SiteConfig;
    use crate::tvheadend::RegistrarError;

    struct NoStreams;

    #[async_trait]
    impl StreamFinder for NoStreams {
        async fn find_streams(
            &self,
            _site: &SiteConfig,
        ) -> Result<DiscoveredStreams, CaptureError> {
            Ok(DiscoveredStreams::default())
        }
    }

    struct NullRegistrar;

    #[async_trait]
    impl ChannelRegistrar for NullRegistrar {
        async fn create_channel(&self, _name: &str, _url: &str) -> Result<(), RegistrarError> {
            Ok(())
        }

        async fn remove_channel(&self, _name: &str) -> Result<(), RegistrarError> {
            Ok(())
        }
    }

    fn manager_with_sites(site_ids: &[&str]) -> SessionManager {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SpillwayConfig::default();
        config.capture.pipe_dir = dir.keep();
        config.capture.program = "true".to_string();
        config.health.restart_settle_delay_secs = 0;
        for id in site_ids {
            config
                .sites
                .push(SiteConfig::new(*id, format!("Site {id}"), "https://example.com/live"));
        }
        SessionManager::new(config, Arc::new(NoStreams), Arc::new(NullRegistrar))
    }

    #[tokio::test]
    async fn unknown_sites_are_rejected() {
        let manager = manager_with_sites(&["arena"]);

        let start = manager.start_site("nope").await;
        assert!(matches!(start, Err(CaptureError::UnknownSite { .. })));

        let stop = manager.stop_site("nope").await;
        assert!(matches!(stop, Err(CaptureError::UnknownSite { .. })));

        let restart = manager.restart_site("nope").await;
        assert!(matches!(restart, Err(CaptureError::UnknownSite { .. })));
    }

    #[tokio::test]
    async fn failed_start_leaves_no_registered_session() {
        let manager = manager_with_sites(&["arena"]);

        let result = manager.start_site("arena").await;
        assert!(matches!(result, Err(CaptureError::NoStreamFound { .. })));

        assert!(!manager.is_active("arena").await);
        assert_eq!(manager.active_count().await, 0);
        assert!(manager.status("arena").await.is_none());
        assert!(manager.relay("arena").await.is_none());
    }

    #[tokio::test]
    async fn parallel_startup_is_bounded_and_reports_per_site() {
        let manager = manager_with_sites(&["a", "b", "c", "d", "e"]);

        let results = manager.start_enabled().await;
        // max_parallel defaults to 3: only the first batch is attempted.
        assert_eq!(results.len(), 3);
        for (_, result) in &results {
            assert!(matches!(result, Err(CaptureError::NoStreamFound { .. })));
        }
    }

    #[tokio::test]
    async fn stop_all_drains_the_registry() {
        let manager = manager_with_sites(&["arena"]);
        let _ = manager.start_site("arena").await;

        manager.stop_all().await;
        assert_eq!(manager.active_count().await, 0);
        assert!(manager.status_all().await.is_empty());
    }
}
