//! Spillway Core - capture session orchestration and live stream relay
//!
//! This crate provides the fundamental building blocks for capturing live
//! media streams with external tooling and relaying them to downstream
//! consumers: named-channel (FIFO) lifecycle, the bounded multi-client
//! relay buffer, external process supervision, capture session state
//! machines, and health-driven restart policy.

pub mod capture;
pub mod config;
pub mod hls;
pub mod relay;
pub mod supervise;
pub mod tracing_setup;
pub mod tvheadend;
pub mod vpn;

// Re-export main types for convenient access
pub use capture::{CaptureError, SessionManager, SessionStatus};
pub use config::SpillwayConfig;
pub use relay::{RelayBuffer, RelayError};
pub use supervise::{ProcessSupervisor, SupervisorError};

/// Core errors that can bubble up from any Spillway subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum SpillwayError {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpillwayError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SpillwayError::Capture(e) => match e {
                CaptureError::NoStreamFound { site_id } => {
                    format!("No usable stream found for {site_id}")
                }
                CaptureError::AlreadyRunning { site_id } => {
                    format!("Capture for {site_id} is already running")
                }
                CaptureError::UnknownSite { site_id } => format!("Unknown site: {site_id}"),
                _ => "Capture error occurred".to_string(),
            },
            SpillwayError::Relay(_) => "Stream relay error occurred".to_string(),
            SpillwayError::Supervisor(_) => "External process error occurred".to_string(),
            SpillwayError::Configuration { reason } => {
                format!("Configuration error: {reason}")
            }
            SpillwayError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SpillwayError::Configuration { .. }
                | SpillwayError::Capture(CaptureError::UnknownSite { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, SpillwayError>;
