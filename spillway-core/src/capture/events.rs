//! Outbound lifecycle events.
//!
//! The core never calls its observers directly: every lifecycle change is
//! published on one broadcast bus that any number of independent
//! consumers (logger, web push layer, metrics) drain at their own pace.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use super::{SessionStatus, StreamSource};

/// Lifecycle and status events emitted by capture sessions.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started {
        site_id: String,
    },
    StreamFound {
        site_id: String,
        source: StreamSource,
    },
    Restarted {
        site_id: String,
        restart_count: u32,
    },
    SessionError {
        site_id: String,
        reason: String,
    },
    Ended {
        site_id: String,
    },
    /// The restart ceiling tripped; the session stays down until an
    /// operator restarts it.
    Suspended {
        site_id: String,
        restarts_in_window: u32,
    },
    StatusUpdate {
        site_id: String,
        status: SessionStatus,
        uptime: Duration,
        restart_count: u32,
    },
}

impl SessionEvent {
    pub fn site_id(&self) -> &str {
        match self {
            SessionEvent::Started { site_id }
            | SessionEvent::StreamFound { site_id, .. }
            | SessionEvent::Restarted { site_id, .. }
            | SessionEvent::SessionError { site_id, .. }
            | SessionEvent::Ended { site_id }
            | SessionEvent::Suspended { site_id, .. }
            | SessionEvent::StatusUpdate { site_id, .. } => site_id,
        }
    }
}

/// Cloneable handle on the shared event channel.
///
/// Emission never blocks and never fails: with no subscribers the event
/// is simply dropped, and a slow subscriber that overflows its queue
/// loses oldest events (broadcast semantics), never stalls the core.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("Session event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
