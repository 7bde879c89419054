//! Actor implementation for capture sessions.
//!
//! One task per session processes commands, exit notices, and health
//! ticks sequentially. That single ordering point is what makes `stop()`
//! safe to call concurrently with an in-flight `start()`, and keeps a
//! health evaluation from ever overlapping a restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::commands::SessionCommand;
use super::session::CaptureSession;
use super::{EventBus, SessionHandle, StreamFinder};
use crate::config::{SiteConfig, SpillwayConfig};
use crate::supervise::{ExitNotice, ProcessSupervisor};
use crate::tvheadend::ChannelRegistrar;

/// Spawns the session actor for one site and returns its handle.
pub fn spawn_session(
    site: SiteConfig,
    config: SpillwayConfig,
    finder: Arc<dyn StreamFinder>,
    registrar: Arc<dyn ChannelRegistrar>,
    events: EventBus,
) -> SessionHandle {
    let (sender, receiver) = mpsc::channel(32);
    let (supervisor, exit_rx) = ProcessSupervisor::new(&config.health);
    let site_id = site.id.clone();
    let check_interval = config.health.check_interval();
    let session = CaptureSession::new(site, config, finder, registrar, supervisor, events);

    tokio::spawn(run_session_loop(session, receiver, exit_rx, check_interval));

    SessionHandle::new(site_id, sender)
}

async fn run_session_loop(
    mut session: CaptureSession,
    mut receiver: mpsc::Receiver<SessionCommand>,
    mut exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
    check_interval: Duration,
) {
    tracing::debug!("Session actor started");

    let mut health = tokio::time::interval(check_interval);
    health.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // An interval's first tick completes immediately; consume it so the
    // first real evaluation lands one full period after start.
    health.tick().await;

    loop {
        tokio::select! {
            command = receiver.recv() => {
                match command {
                    Some(command) => {
                        if !handle_command(&mut session, command).await {
                            break;
                        }
                    }
                    // Every handle is gone; wind the session down.
                    None => break,
                }
            }
            Some(notice) = exit_rx.recv() => {
                session.handle_exit_notice(notice).await;
            }
            _ = health.tick() => {
                session.health_tick().await;
            }
        }
    }

    session.shutdown().await;
    tracing::debug!("Session actor stopped");
}

/// Handles a single command. Returns false to end the actor.
async fn handle_command(session: &mut CaptureSession, command: SessionCommand) -> bool {
    match command {
        SessionCommand::Start { responder } => {
            let result = session.start().await;
            let _ = responder.send(result);
        }
        SessionCommand::Stop { responder } => {
            session.stop().await;
            let _ = responder.send(());
        }
        SessionCommand::Restart { responder } => {
            let result = session.restart().await;
            let _ = responder.send(result);
        }
        SessionCommand::Snapshot { responder } => {
            let _ = responder.send(session.snapshot().await);
        }
        SessionCommand::Relay { responder } => {
            let _ = responder.send(session.relay());
        }
        SessionCommand::Shutdown { responder } => {
            tracing::debug!("Session actor shutting down");
            let _ = responder.send(());
            return false;
        }
    }
    true
}
