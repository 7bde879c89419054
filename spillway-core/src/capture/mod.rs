//! Capture sessions: the state machine driving one restartable capture
//! from "not running" to "streaming" to "stopped", plus the registry,
//! health policy, and event bus around it.
//!
//! Each session runs as an actor: commands, exit notices, and health
//! ticks are processed sequentially by one task, which serializes
//! start/stop/restart and removes every double-spawn / double-unlink
//! race by construction.

pub mod actor;
pub mod commands;
pub mod events;
pub mod handle;
pub mod health;
pub mod manager;
pub mod session;
pub mod source;

use serde::Serialize;

pub use actor::spawn_session;
pub use commands::{SessionCommand, SessionSnapshot};
pub use events::{EventBus, SessionEvent};
pub use handle::SessionHandle;
pub use health::{RestartDecision, RestartTracker};
pub use manager::SessionManager;
pub use session::CaptureSession;
pub use source::{DiscoveredStreams, StaticStreamFinder, StreamFinder, StreamSource};

use crate::relay::RelayError;
use crate::supervise::SupervisorError;

/// Errors from capture session orchestration.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Session for {site_id} is already running")]
    AlreadyRunning { site_id: String },

    #[error("No usable stream found for {site_id}")]
    NoStreamFound { site_id: String },

    #[error("Stream discovery failed for {site_id}: {reason}")]
    DiscoveryFailed { site_id: String, reason: String },

    #[error("Transcoder produced no playlist for {site_id}")]
    TranscodeNotReady { site_id: String },

    #[error("Session for {site_id} suspended after {restarts} restarts within {window_secs}s")]
    Suspended {
        site_id: String,
        restarts: u32,
        window_secs: u64,
    },

    #[error("Unknown site: {site_id}")]
    UnknownSite { site_id: String },

    #[error("Session actor has shut down")]
    SessionShutdown,

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of one session instance.
///
/// `Stopped` and `Error` are terminal for the instance; `restart()` runs
/// a fresh instance of the same machine under a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Starting,
    Detecting,
    Streaming,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Starting => "starting",
            SessionStatus::Detecting => "detecting",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        };
        write!(f, "{name}")
    }
}
