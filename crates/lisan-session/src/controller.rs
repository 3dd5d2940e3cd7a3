//! Owns at most one live session and creates a fresh one per start.

use tokio::sync::Mutex;
use tracing::{debug, info};

use lisan_core::error::{LisanError, Result};
use lisan_core::protocol::ControlEvent;

use crate::session::{PeerSession, SessionDeps, SessionOptions, SessionStatus};

pub struct TutorController {
    deps: SessionDeps,
    options: SessionOptions,
    current: Mutex<Option<PeerSession>>,
}

impl TutorController {
    pub fn new(deps: SessionDeps, options: SessionOptions) -> Self {
        Self {
            deps,
            options,
            current: Mutex::new(None),
        }
    }

    /// The current session, or a fresh idle one if there is none or it has stopped.
    ///
    /// Subscribe to it before [`start`](Self::start) to see every event.
    pub async fn session(&self) -> PeerSession {
        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref().filter(|s| s.status() != SessionStatus::Stopped) {
            return existing.clone();
        }
        let session = PeerSession::spawn(self.deps.clone(), self.options.clone());
        info!(session_id = session.id(), "Created session");
        *current = Some(session.clone());
        session
    }

    /// Start a lesson on the current session, replacing it first if it has stopped.
    ///
    /// Starting a session that is already activating or active does nothing.
    pub async fn start(&self) -> Result<PeerSession> {
        let session = self.session().await;
        let outcome = session.start().await?;
        debug!(session_id = session.id(), ?outcome, "Start");
        Ok(session)
    }

    /// Stop the current session, if any. Never fails.
    pub async fn stop(&self) {
        let session = self.current.lock().await.take();
        if let Some(session) = session {
            session.stop().await;
        }
    }

    pub async fn send(&self, event: ControlEvent) -> Result<ControlEvent> {
        let session = self.current.lock().await.clone();
        match session {
            Some(session) => session.send(event).await,
            None => Err(LisanError::ChannelUnavailable("no session".into())),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.current
            .lock()
            .await
            .as_ref()
            .map_or(SessionStatus::Idle, PeerSession::status)
    }

    pub async fn current(&self) -> Option<PeerSession> {
        self.current.lock().await.clone()
    }
}
