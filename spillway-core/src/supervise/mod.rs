//! External process supervision.
//!
//! The supervisor spawns the capture and transcode processes, consumes
//! their diagnostic output, tracks liveness and output activity, and
//! enforces the graceful-terminate-then-kill stop contract. It never
//! decides to restart anything; exit notices and health reports go to the
//! owning session, and restart policy lives with the session's health
//! loop.

pub mod command;
pub mod output;
pub mod process;

pub use command::{CaptureCommand, TranscodeCommand};
pub use output::{OutputClass, classify_line};
pub use process::{
    ExitNotice, ProcessHealth, ProcessId, ProcessRole, ProcessSpec, ProcessSupervisor,
};

/// Errors from process supervision.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },

    #[error("Unknown process: {id}")]
    UnknownProcess { id: ProcessId },
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
