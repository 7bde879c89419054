//! Handle for communicating with a session actor.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::commands::{SessionCommand, SessionSnapshot};
use super::CaptureError;
use crate::relay::RelayBuffer;

/// Handle for communicating with one session actor.
///
/// Cloneable and cheap to share; every method is an ordered command to
/// the actor, so concurrent callers can never race the state machine.
#[derive(Clone)]
pub struct SessionHandle {
    site_id: String,
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(site_id: String, sender: mpsc::Sender<SessionCommand>) -> Self {
        Self { site_id, sender }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Starts the session.
    ///
    /// # Errors
    /// - `CaptureError::AlreadyRunning` - The session is not idle
    /// - `CaptureError::NoStreamFound` - Discovery produced nothing usable
    /// - `CaptureError::SessionShutdown` - The actor is gone
    pub async fn start(&self) -> Result<(), CaptureError> {
        let (responder, rx) = oneshot::channel();
        self.send(SessionCommand::Start { responder }).await?;
        rx.await.map_err(|_| CaptureError::SessionShutdown)?
    }

    /// Stops the session. Never fails: teardown is best-effort and safe
    /// from any state.
    ///
    /// # Errors
    /// - `CaptureError::SessionShutdown` - The actor is gone
    pub async fn stop(&self) -> Result<(), CaptureError> {
        let (responder, rx) = oneshot::channel();
        self.send(SessionCommand::Stop { responder }).await?;
        rx.await.map_err(|_| CaptureError::SessionShutdown)
    }

    /// Stop-settle-start under a new generation.
    ///
    /// # Errors
    /// - `CaptureError::Suspended` - The restart ceiling tripped
    /// - `CaptureError::SessionShutdown` - The actor is gone
    /// - Any error from the fresh start attempt
    pub async fn restart(&self) -> Result<(), CaptureError> {
        let (responder, rx) = oneshot::channel();
        self.send(SessionCommand::Restart { responder }).await?;
        rx.await.map_err(|_| CaptureError::SessionShutdown)?
    }

    /// Current status, stats, and resource view of the session.
    ///
    /// # Errors
    /// - `CaptureError::SessionShutdown` - The actor is gone
    pub async fn snapshot(&self) -> Result<SessionSnapshot, CaptureError> {
        let (responder, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { responder }).await?;
        rx.await.map_err(|_| CaptureError::SessionShutdown)
    }

    /// The live relay buffer, for attaching HTTP sinks. None unless the
    /// session runs the direct-relay topology and is up.
    ///
    /// # Errors
    /// - `CaptureError::SessionShutdown` - The actor is gone
    pub async fn relay(&self) -> Result<Option<Arc<RelayBuffer>>, CaptureError> {
        let (responder, rx) = oneshot::channel();
        self.send(SessionCommand::Relay { responder }).await?;
        rx.await.map_err(|_| CaptureError::SessionShutdown)
    }

    /// Ends the actor after a final teardown.
    ///
    /// # Errors
    /// - `CaptureError::SessionShutdown` - The actor is already gone
    pub async fn shutdown(&self) -> Result<(), CaptureError> {
        let (responder, rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown { responder }).await?;
        rx.await.map_err(|_| CaptureError::SessionShutdown)
    }

    async fn send(&self, command: SessionCommand) -> Result<(), CaptureError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| CaptureError::SessionShutdown)
    }
}
