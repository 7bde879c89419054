//! Byte relay: named-channel lifecycle and the bounded fan-out buffer.
//!
//! A capture process writes raw stream bytes into a filesystem FIFO (the
//! named channel); the relay buffer reads the channel, retains a bounded
//! catch-up window, and fans the bytes out to any number of attached
//! client sinks.

pub mod buffer;
pub mod channel;
pub mod stats;

use std::path::PathBuf;

pub use buffer::{RelayBuffer, RelaySink, SinkId};
pub use channel::RelayChannel;
pub use stats::RelayStats;

/// Errors from channel lifecycle and relay buffer operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Channel does not exist: {path}")]
    ChannelMissing { path: PathBuf },

    #[error("Not a named channel (FIFO): {path}")]
    NotAChannel { path: PathBuf },

    #[error("Failed to create channel {path}: {source}")]
    ChannelCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Relay buffer is already reading")]
    AlreadyReading,

    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        source: std::io::Error,
    },
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
