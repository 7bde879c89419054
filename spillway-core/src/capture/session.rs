//! The capture session state machine.
//!
//! One session owns one capture attempt end to end: discovery, channel
//! setup, process launch, downstream registration, health monitoring, and
//! best-effort teardown. A restart is stop-then-start under a new
//! generation; resources are never shared across generations, and a late
//! notice from a killed generation is recognized and discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::health::{RestartDecision, RestartTracker};
use super::{
    CaptureError, EventBus, SessionEvent, SessionSnapshot, SessionStatus, StreamFinder,
    StreamSource,
};
use crate::config::{SpillwayConfig, SiteConfig, Topology};
use crate::hls::HlsOutput;
use crate::relay::{RelayBuffer, RelayChannel};
use crate::supervise::{
    CaptureCommand, ExitNotice, ProcessId, ProcessRole, ProcessSpec, ProcessSupervisor,
    TranscodeCommand,
};
use crate::tvheadend::ChannelRegistrar;

/// One logical, restartable capture for a single site.
///
/// Driven exclusively by its actor task; nothing here is shared mutable
/// state.
pub struct CaptureSession {
    site: SiteConfig,
    config: SpillwayConfig,
    finder: Arc<dyn StreamFinder>,
    registrar: Arc<dyn ChannelRegistrar>,
    supervisor: ProcessSupervisor,
    events: EventBus,

    status: SessionStatus,
    /// Bumped on every start; tags launched processes so callbacks from a
    /// previous instance cannot mutate this one.
    generation: u64,
    started_at: Option<Instant>,
    restart_count: u32,
    restart_tracker: RestartTracker,
    current_source: Option<StreamSource>,
    channel: Option<RelayChannel>,
    relay: Option<Arc<RelayBuffer>>,
    capture_proc: Option<ProcessId>,
    transcode_proc: Option<ProcessId>,
    hls: Option<HlsOutput>,
    channel_registered: bool,
}

impl CaptureSession {
    pub fn new(
        site: SiteConfig,
        config: SpillwayConfig,
        finder: Arc<dyn StreamFinder>,
        registrar: Arc<dyn ChannelRegistrar>,
        supervisor: ProcessSupervisor,
        events: EventBus,
    ) -> Self {
        let restart_tracker = RestartTracker::new(&config.health);
        Self {
            site,
            config,
            finder,
            registrar,
            supervisor,
            events,
            status: SessionStatus::Idle,
            generation: 0,
            started_at: None,
            restart_count: 0,
            restart_tracker,
            current_source: None,
            channel: None,
            relay: None,
            capture_proc: None,
            transcode_proc: None,
            hls: None,
            channel_registered: false,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn relay(&self) -> Option<Arc<RelayBuffer>> {
        self.relay.clone()
    }

    fn site_id(&self) -> String {
        self.site.id.clone()
    }

    fn channel_name(&self) -> String {
        format!("stream_{}", self.site.id)
    }

    fn uptime(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Stream URL downstream consumers are pointed at.
    fn downstream_url(&self) -> String {
        let base = self.config.tvheadend.stream_base_url.trim_end_matches('/');
        match &self.hls {
            Some(hls) => format!("{base}{}", hls.playlist_url()),
            None => format!("{base}/{}/stream", self.site.id),
        }
    }

    /// Drives the machine from `Idle` to `Streaming`.
    ///
    /// # Errors
    /// - `CaptureError::AlreadyRunning` - The session is not idle
    /// - `CaptureError::NoStreamFound` - Discovery produced nothing usable
    /// - `CaptureError::DiscoveryFailed` - Discovery errored or timed out
    /// - `CaptureError::Supervisor` - The capture tool could not be spawned
    /// - `CaptureError::TranscodeNotReady` - No playlist within the bound
    pub async fn start(&mut self) -> Result<(), CaptureError> {
        if self.status != SessionStatus::Idle {
            return Err(CaptureError::AlreadyRunning {
                site_id: self.site_id(),
            });
        }

        self.generation += 1;
        self.status = SessionStatus::Starting;
        self.started_at = Some(Instant::now());
        info!("Starting capture session for {} ({})", self.site.name, self.site.id);
        self.events.emit(SessionEvent::Started {
            site_id: self.site_id(),
        });

        match self.bring_up().await {
            Ok(source) => {
                self.status = SessionStatus::Streaming;
                info!("Session {} is streaming ({} source)", self.site.id, source.kind());
                self.events.emit(SessionEvent::StreamFound {
                    site_id: self.site_id(),
                    source,
                });
                Ok(())
            }
            Err(e) => {
                error!("Failed to start session for {}: {e}", self.site.id);
                self.events.emit(SessionEvent::SessionError {
                    site_id: self.site_id(),
                    reason: e.to_string(),
                });
                self.teardown().await;
                self.status = SessionStatus::Error;
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self) -> Result<StreamSource, CaptureError> {
        self.status = SessionStatus::Detecting;
        debug!("Detecting streams for {}", self.site.id);

        let streams = tokio::time::timeout(
            self.config.capture.discovery_timeout(),
            self.finder.find_streams(&self.site),
        )
        .await
        .map_err(|_| CaptureError::DiscoveryFailed {
            site_id: self.site_id(),
            reason: "discovery timed out".to_string(),
        })??;

        let source = streams.select_best().ok_or_else(|| CaptureError::NoStreamFound {
            site_id: self.site_id(),
        })?;
        info!("Selected {} source for {}", source.kind(), self.site.id);
        self.current_source = Some(source.clone());

        let channel = RelayChannel::create(&self.config.capture.pipe_dir, &self.site.id)?;
        let channel_path = channel.path().to_path_buf();
        self.channel = Some(channel);

        let capture_cmd = CaptureCommand::for_site(
            &self.site,
            &self.config.capture,
            source.capture_url(),
            &channel_path,
        );
        let spec = ProcessSpec {
            role: ProcessRole::Capture,
            program: self.config.capture.program.clone(),
            args: capture_cmd.build_args(),
            artifact: None,
            timeout: Some(self.config.capture.process_timeout()),
        };
        self.capture_proc = Some(self.supervisor.launch(spec, self.generation)?);

        match self.config.topology {
            Topology::DirectRelay => {
                let relay = RelayBuffer::new(channel_path, &self.config.relay);
                relay.start()?;
                self.relay = Some(Arc::clone(&relay));

                let open_timeout = self.config.capture.channel_open_timeout();
                if !relay.wait_ready(open_timeout).await {
                    warn!(
                        "No producer on channel for {} after {}s; proceeding",
                        self.site.id,
                        open_timeout.as_secs()
                    );
                }
            }
            Topology::HlsTranscode => {
                let hls = HlsOutput::prepare(&self.config.transcode, &self.site.id).await?;
                let transcode_cmd = TranscodeCommand::new(
                    &self.config.transcode,
                    &channel_path,
                    hls.playlist_path(),
                    hls.segment_pattern(),
                );
                let spec = ProcessSpec {
                    role: ProcessRole::Transcode,
                    program: self.config.transcode.program.clone(),
                    args: transcode_cmd.build_args(),
                    artifact: Some(hls.playlist_path().to_path_buf()),
                    timeout: None,
                };
                self.transcode_proc = Some(self.supervisor.launch(spec, self.generation)?);

                let wait = self.config.transcode.playlist_wait_timeout();
                let ready = hls.wait_for_playlist(wait).await;
                self.hls = Some(hls);
                if !ready {
                    return Err(CaptureError::TranscodeNotReady {
                        site_id: self.site_id(),
                    });
                }
            }
        }

        // Downstream registration failure is a warning, never fatal: the
        // relay keeps running for other consumers.
        let channel_name = self.channel_name();
        let url = self.downstream_url();
        match self.registrar.create_channel(&channel_name, &url).await {
            Ok(()) => self.channel_registered = true,
            Err(e) => {
                warn!(
                    "Downstream channel registration failed for {}: {e}",
                    self.site.id
                );
                self.events.emit(SessionEvent::SessionError {
                    site_id: self.site_id(),
                    reason: format!("downstream registration failed: {e}"),
                });
            }
        }

        Ok(source)
    }

    /// Tears the session down. Safe from any state, including `Idle`, and
    /// safe to call repeatedly.
    pub async fn stop(&mut self) {
        let already_stopped = self.status == SessionStatus::Stopped;
        self.status = SessionStatus::Stopping;
        info!("Stopping session for {}", self.site.id);
        self.teardown().await;
        self.status = SessionStatus::Stopped;
        if !already_stopped {
            self.events.emit(SessionEvent::Ended {
                site_id: self.site_id(),
            });
        }
    }

    /// Best-effort ordered teardown: transcode process, capture process,
    /// relay buffer, segmented output, channel unlink, downstream
    /// deregistration. A failing step is logged and never aborts the
    /// rest.
    async fn teardown(&mut self) {
        if let Some(id) = self.transcode_proc.take() {
            self.supervisor.stop(id).await;
            self.supervisor.forget(id);
        }
        if let Some(id) = self.capture_proc.take() {
            self.supervisor.stop(id).await;
            self.supervisor.forget(id);
        }
        if let Some(relay) = self.relay.take() {
            relay.stop();
        }
        if let Some(hls) = self.hls.take() {
            hls.cleanup().await;
        }
        if let Some(channel) = self.channel.take()
            && let Err(e) = channel.unlink()
        {
            warn!("Channel unlink failed during teardown for {}: {e}", self.site.id);
        }
        if self.channel_registered {
            self.channel_registered = false;
            if let Err(e) = self.registrar.remove_channel(&self.channel_name()).await {
                warn!(
                    "Downstream channel removal failed for {}: {e}",
                    self.site.id
                );
            }
        }
        self.current_source = None;
    }

    /// Full stop, settle delay, then a fresh start under a new
    /// generation. Increments `restart_count` exactly once per call,
    /// whether triggered manually or by the health policy.
    ///
    /// # Errors
    /// - `CaptureError::Suspended` - The restart ceiling tripped
    /// - Any `start()` error from the fresh attempt
    pub async fn restart(&mut self) -> Result<(), CaptureError> {
        self.restart_count += 1;

        if let RestartDecision::Suspend { restarts_in_window } =
            self.restart_tracker.record(Instant::now())
        {
            warn!(
                "Session {} hit the restart ceiling ({restarts_in_window} in {}s); suspending",
                self.site.id, self.config.health.restart_window_secs
            );
            self.stop().await;
            self.status = SessionStatus::Error;
            self.events.emit(SessionEvent::Suspended {
                site_id: self.site_id(),
                restarts_in_window,
            });
            return Err(CaptureError::Suspended {
                site_id: self.site_id(),
                restarts: restarts_in_window,
                window_secs: self.config.health.restart_window_secs,
            });
        }

        info!(
            "Restarting session for {} (attempt {})",
            self.site.id, self.restart_count
        );
        self.events.emit(SessionEvent::Restarted {
            site_id: self.site_id(),
            restart_count: self.restart_count,
        });

        self.stop().await;
        tokio::time::sleep(self.config.health.restart_settle_delay()).await;
        self.status = SessionStatus::Idle;
        self.start().await
    }

    /// One health evaluation. Only runs while `Streaming`, which also
    /// guarantees it never overlaps an in-flight restart: both execute on
    /// the session's actor task.
    pub async fn health_tick(&mut self) {
        if self.status != SessionStatus::Streaming {
            return;
        }

        for id in [self.capture_proc, self.transcode_proc].into_iter().flatten() {
            let health = self.supervisor.check_health(id);
            if !health.healthy {
                warn!("Health check failed for {}: {}", self.site.id, health.reason);
                self.policy_restart(&health.reason).await;
                return;
            }
        }

        if let Some(relay) = &self.relay
            && !relay.is_active()
        {
            warn!("Relay buffer inactive for {}; channel closed", self.site.id);
            self.policy_restart("relay channel closed").await;
            return;
        }

        let uptime = self.uptime();
        if uptime > self.config.health.max_session_uptime() {
            info!(
                "Session {} reached max uptime ({}s); proactive restart before the source expires access",
                self.site.id,
                uptime.as_secs()
            );
            self.policy_restart("max session uptime reached").await;
            return;
        }

        if let Some(relay) = &self.relay {
            debug!(
                "Health OK for {}: {}",
                self.site.id,
                relay.stats().format_summary(self.config.relay.max_buffered_bytes)
            );
        }
        self.events.emit(SessionEvent::StatusUpdate {
            site_id: self.site_id(),
            status: self.status,
            uptime,
            restart_count: self.restart_count,
        });
    }

    async fn policy_restart(&mut self, reason: &str) {
        self.events.emit(SessionEvent::SessionError {
            site_id: self.site_id(),
            reason: reason.to_string(),
        });
        if let Err(e) = self.restart().await {
            error!("Policy restart failed for {}: {e}", self.site.id);
        }
    }

    /// Routes an exit notice from the supervisor.
    ///
    /// Notices from an older generation belong to processes a previous
    /// instance already killed; they are discarded, not acted on.
    pub async fn handle_exit_notice(&mut self, notice: ExitNotice) {
        if notice.generation != self.generation {
            debug!(
                "Discarding exit notice from generation {} (current {})",
                notice.generation, self.generation
            );
            return;
        }

        if self.status == SessionStatus::Streaming {
            warn!(
                "{} process exited unexpectedly (code {:?}) for {}",
                notice.role, notice.code, self.site.id
            );
            match notice.role {
                ProcessRole::Capture => self.capture_proc = None,
                ProcessRole::Transcode => self.transcode_proc = None,
            }
            self.supervisor.forget(notice.id);
            self.policy_restart(&format!(
                "{} process exited with code {:?}",
                notice.role, notice.code
            ))
            .await;
        } else {
            debug!(
                "{} exit during {} for {}",
                notice.role, self.status, self.site.id
            );
        }
    }

    /// Cleanup when the actor winds down with the session still up.
    pub async fn shutdown(&mut self) {
        match self.status {
            SessionStatus::Starting
            | SessionStatus::Detecting
            | SessionStatus::Streaming
            | SessionStatus::Stopping => self.stop().await,
            _ => self.teardown().await,
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let hls = match &self.hls {
            Some(hls) => Some(hls.stats().await),
            None => None,
        };
        SessionSnapshot {
            site_id: self.site.id.clone(),
            site_name: self.site.name.clone(),
            status: self.status,
            uptime: self.uptime(),
            restart_count: self.restart_count,
            source: self.current_source.clone(),
            channel_path: self.channel.as_ref().map(|c| c.path().to_path_buf()),
            relay: self.relay.as_ref().map(|r| r.stats()),
            hls,
            playlist_url: self.hls.as_ref().map(|h| h.playlist_url()),
        }
    }
}
