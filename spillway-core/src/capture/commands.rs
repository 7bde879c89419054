//! Commands processed by a session actor, and the snapshot they report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::{CaptureError, SessionStatus, StreamSource};
use crate::hls::HlsStats;
use crate::relay::{RelayBuffer, RelayStats};

/// Messages a [`SessionHandle`](super::SessionHandle) sends to its actor.
///
/// Each command carries a oneshot responder; the actor processes commands
/// strictly in order, which is what serializes start/stop/restart per
/// session.
pub enum SessionCommand {
    Start {
        responder: oneshot::Sender<Result<(), CaptureError>>,
    },
    Stop {
        responder: oneshot::Sender<()>,
    },
    Restart {
        responder: oneshot::Sender<Result<(), CaptureError>>,
    },
    Snapshot {
        responder: oneshot::Sender<SessionSnapshot>,
    },
    /// Hands out the live relay buffer for sink attachment.
    Relay {
        responder: oneshot::Sender<Option<Arc<RelayBuffer>>>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Point-in-time view of one session, for status APIs and dashboards.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub site_id: String,
    pub site_name: String,
    pub status: SessionStatus,
    pub uptime: Duration,
    pub restart_count: u32,
    pub source: Option<StreamSource>,
    pub channel_path: Option<PathBuf>,
    pub relay: Option<RelayStats>,
    pub hls: Option<HlsStats>,
    pub playlist_url: Option<String>,
}

impl SessionSnapshot {
    /// True while the session is somewhere between starting and streaming.
    pub fn is_running(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Starting | SessionStatus::Detecting | SessionStatus::Streaming
        )
    }
}
