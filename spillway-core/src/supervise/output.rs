//! Diagnostic output consumption for supervised processes.
//!
//! Capture and transcode tools write line-oriented diagnostics to their
//! stdout/stderr. Each line is classified by substring pattern and
//! re-logged at the matching level; classification is purely for
//! observability and never fails.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ProcessRole;

/// Classification of one diagnostic output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputClass {
    Error,
    Warning,
    /// High-frequency progress chatter, logged at debug only.
    Progress,
    Info,
}

/// Classifies a diagnostic line by substring pattern.
///
/// Patterns cover the streamlink and ffmpeg vocabularies; anything
/// unrecognized is plain info.
pub fn classify_line(line: &str) -> OutputClass {
    let lower = line.to_ascii_lowercase();

    if lower.contains("error") || lower.contains("failed to") || lower.contains("fatal") {
        OutputClass::Error
    } else if lower.contains("warning") || lower.contains("unable to") {
        OutputClass::Warning
    } else if lower.contains("frame=")
        || lower.contains("fps=")
        || lower.contains("[download]")
        || lower.contains("segment")
    {
        OutputClass::Progress
    } else {
        OutputClass::Info
    }
}

/// Spawns a task draining one output stream line by line.
///
/// Every line refreshes the process's last-activity timestamp. Read
/// failures end the drain silently; a process losing its output stream is
/// detected through exit and health checks, not here.
pub(crate) fn spawn_output_logger<R>(
    stream: R,
    role: ProcessRole,
    stream_name: &'static str,
    last_activity: Arc<Mutex<Instant>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            };

            *last_activity.lock() = Instant::now();

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match classify_line(trimmed) {
                OutputClass::Error => error!("[{role} {stream_name}] {trimmed}"),
                OutputClass::Warning => warn!("[{role} {stream_name}] {trimmed}"),
                OutputClass::Progress => debug!("[{role} {stream_name}] {trimmed}"),
                OutputClass::Info => info!("[{role} {stream_name}] {trimmed}"),
            }
        }
        debug!("[{role} {stream_name}] output stream ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_lines() {
        assert_eq!(classify_line("error: No playable streams found"), OutputClass::Error);
        assert_eq!(classify_line("Failed to open segment"), OutputClass::Error);
        assert_eq!(classify_line("FATAL: out of memory"), OutputClass::Error);
    }

    #[test]
    fn classifies_warning_lines() {
        assert_eq!(
            classify_line("Warning: deprecated option --hls-segment-threads"),
            OutputClass::Warning
        );
        assert_eq!(classify_line("Unable to parse manifest"), OutputClass::Warning);
    }

    #[test]
    fn classifies_progress_chatter() {
        assert_eq!(
            classify_line("frame= 1200 fps= 30 q=-1.0 size= 10240KiB"),
            OutputClass::Progress
        );
        assert_eq!(classify_line("[download] Written 4.2 MiB"), OutputClass::Progress);
        assert_eq!(classify_line("Opening segment 17"), OutputClass::Progress);
    }

    #[test]
    fn everything_else_is_info() {
        assert_eq!(classify_line("[cli][info] Opening stream"), OutputClass::Info);
        assert_eq!(classify_line("Input #0, mpegts, from 'pipe'"), OutputClass::Info);
    }

    #[tokio::test]
    async fn logger_refreshes_activity_and_survives_garbage() {
        let last_activity = Arc::new(Mutex::new(Instant::now() - std::time::Duration::from_secs(60)));
        let data: &[u8] = b"line one\n\xff\xfe garbage maybe\nerror: boom\n";

        let handle = spawn_output_logger(
            data,
            ProcessRole::Capture,
            "stderr",
            Arc::clone(&last_activity),
        );
        handle.await.unwrap();

        // At least the valid lines refreshed the timestamp.
        assert!(last_activity.lock().elapsed() < std::time::Duration::from_secs(5));
    }
}
