//! The peer session actor.
//!
//! Lifecycle: `Idle → Activating → Active → Stopped`. A session is used for
//! exactly one activation; once stopped it stays stopped.
//!
//! Activation runs as its own task so a `stop()` can cancel it at any
//! suspension point. Transport events produced while activation is still in
//! flight stay queued and are processed, in arrival order, once it finishes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lisan_core::config::{Config, DisconnectPolicy};
use lisan_core::error::{LisanError, Result};
use lisan_core::lesson::LessonScript;
use lisan_core::protocol::{ControlEvent, Direction, ObservedEvent};
use lisan_media::{AudioTrack, MediaCapture, PlaybackSignal, PlaybackSink};
use lisan_signaling::{CredentialFetcher, SignalingNegotiator};

use crate::protocol::EventProtocolHandler;
use crate::transport::{EventChannel, PeerConnector, PeerLink, PeerState, TransportEvent};

const EVENT_BUFFER: usize = 256;

/// Observable session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Activating,
    Active,
    Stopped,
}

/// Result of a successful `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// This call activated the session.
    Started,
    /// Another start is in flight; nothing was done.
    AlreadyActivating,
    AlreadyActive,
}

/// Published to every subscriber.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(SessionStatus),
    Control(ObservedEvent),
    Playback(PlaybackSignal),
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub credentials: Arc<dyn CredentialFetcher>,
    pub capture: Arc<dyn MediaCapture>,
    pub negotiator: Arc<dyn SignalingNegotiator>,
    pub connector: Arc<dyn PeerConnector>,
    pub playback: Arc<dyn PlaybackSink>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub channel_label: String,
    pub on_disconnect: DisconnectPolicy,
    /// How long to wait for the event channel after negotiation. `None` waits forever.
    pub open_timeout: Option<Duration>,
    pub lesson: LessonScript,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            channel_label: config.channel_label(),
            on_disconnect: config.disconnect_policy(),
            open_timeout: config.open_timeout(),
            lesson: LessonScript::default(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

enum Command {
    Start {
        reply: oneshot::Sender<Result<StartOutcome>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Send {
        event: ControlEvent,
        reply: oneshot::Sender<Result<ControlEvent>>,
    },
}

/// Handle to a running session actor. Cheap to clone.
#[derive(Clone)]
pub struct PeerSession {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

impl PeerSession {
    /// Spawn the actor in the Idle state.
    pub fn spawn(deps: SessionDeps, options: SessionOptions) -> Self {
        let id = Uuid::new_v4().to_string();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (activation_tx, activation_rx) = mpsc::channel(1);

        let actor = SessionActor {
            id: id.clone(),
            protocol: EventProtocolHandler::new(options.lesson),
            deps,
            options,
            phase: Phase::Idle,
            resources: Resources::default(),
            pending_start: None,
            status: status_tx,
            events: events_tx.clone(),
            commands: command_rx,
            transport_tx,
            transport_rx,
            playback_tx,
            playback_rx,
            activation_tx: Some(activation_tx),
            activation_rx,
        };
        tokio::spawn(actor.run());

        Self {
            id,
            commands: command_tx,
            status: status_rx,
            events: events_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Every status change, control event and playback signal from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Activate the session. Resolves once the event channel is open and the
    /// lesson has been sent, or with the error that aborted activation.
    pub async fn start(&self) -> Result<StartOutcome> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { reply })
            .map_err(|_| LisanError::SessionTerminated)?;
        rx.await.map_err(|_| LisanError::SessionTerminated)?
    }

    /// Tear the session down. Safe in every state; returns once every
    /// resource has been released.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send one control event. Returns the event as sent, with its id and timestamp.
    pub async fn send(&self, event: ControlEvent) -> Result<ControlEvent> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { event, reply })
            .map_err(|_| LisanError::ChannelUnavailable("session has shut down".into()))?;
        rx.await
            .map_err(|_| LisanError::ChannelUnavailable("session has shut down".into()))?
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for(&self, target: SessionStatus) -> Result<()> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| LisanError::SessionTerminated)
    }
}

enum Phase {
    Idle,
    Negotiating { cancel: CancellationToken },
    AwaitingOpen { deadline: Option<Instant> },
    Active,
    Stopped,
}

impl Phase {
    fn status(&self) -> SessionStatus {
        match self {
            Self::Idle => SessionStatus::Idle,
            Self::Negotiating { .. } | Self::AwaitingOpen { .. } => SessionStatus::Activating,
            Self::Active => SessionStatus::Active,
            Self::Stopped => SessionStatus::Stopped,
        }
    }
}

/// Handles acquired during activation. Empty slots are simply skipped on release.
#[derive(Default)]
struct Resources {
    link: Option<Arc<dyn PeerLink>>,
    channel: Option<Arc<dyn EventChannel>>,
    track: Option<AudioTrack>,
}

impl Resources {
    /// Close the channel, stop outbound media, close the connection, clear
    /// every handle. Each step runs regardless of the others.
    async fn release(&mut self, session_id: &str) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(session_id, error = %e, "Failed to close event channel");
            }
        }
        if let Some(link) = &self.link {
            if let Err(e) = link.stop_senders().await {
                warn!(session_id, error = %e, "Failed to stop media senders");
            }
        }
        if let Some(track) = self.track.take() {
            track.stop();
        }
        if let Some(link) = self.link.take() {
            if let Err(e) = link.close().await {
                warn!(session_id, error = %e, "Failed to close peer connection");
            }
        }
    }
}

struct SessionActor {
    id: String,
    deps: SessionDeps,
    options: SessionOptions,
    protocol: EventProtocolHandler,
    phase: Phase,
    resources: Resources,
    pending_start: Option<oneshot::Sender<Result<StartOutcome>>>,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    playback_tx: mpsc::UnboundedSender<PlaybackSignal>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackSignal>,
    /// Taken by the one activation a session runs, so the receiver sees
    /// `None` if that task dies without reporting.
    activation_tx: Option<mpsc::Sender<Result<Resources>>>,
    activation_rx: mpsc::Receiver<Result<Resources>>,
}

impl SessionActor {
    async fn run(mut self) {
        debug!(session_id = %self.id, "Session actor started");
        loop {
            let negotiating = matches!(self.phase, Phase::Negotiating { .. });
            let deadline = match self.phase {
                Phase::AwaitingOpen { deadline } => deadline,
                _ => None,
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                result = self.activation_rx.recv(), if negotiating => {
                    self.on_activation(result.unwrap_or_else(|| Err(activation_lost())));
                }
                Some(event) = self.transport_rx.recv(), if !negotiating => {
                    self.on_transport(event).await;
                }
                Some(signal) = self.playback_rx.recv() => self.on_playback(signal),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_open_timeout().await;
                }
            }
        }

        // Every handle is gone.
        self.shutdown().await;
        debug!(session_id = %self.id, "Session actor exited");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => self.start(reply),
            Command::Stop { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
            Command::Send { event, reply } => {
                let _ = reply.send(self.send(event).await);
            }
        }
    }

    fn start(&mut self, reply: oneshot::Sender<Result<StartOutcome>>) {
        let outcome = match self.phase {
            Phase::Idle => None,
            Phase::Negotiating { .. } | Phase::AwaitingOpen { .. } => {
                Some(Ok(StartOutcome::AlreadyActivating))
            }
            Phase::Active => Some(Ok(StartOutcome::AlreadyActive)),
            Phase::Stopped => Some(Err(LisanError::SessionTerminated)),
        };
        if let Some(outcome) = outcome {
            debug!(session_id = %self.id, status = ?self.phase.status(), "Start ignored");
            let _ = reply.send(outcome);
            return;
        }

        let Some(results) = self.activation_tx.take() else {
            let _ = reply.send(Err(LisanError::SessionTerminated));
            return;
        };
        info!(session_id = %self.id, "Activating session");
        let cancel = CancellationToken::new();
        let activation = Activation {
            session_id: self.id.clone(),
            deps: self.deps.clone(),
            channel_label: self.options.channel_label.clone(),
            transport: self.transport_tx.clone(),
        };
        let token = cancel.clone();
        tokio::spawn(async move {
            let _ = results.send(activation.run(token).await).await;
        });

        self.pending_start = Some(reply);
        self.set_phase(Phase::Negotiating { cancel });
    }

    async fn send(&mut self, event: ControlEvent) -> Result<ControlEvent> {
        if !matches!(self.phase, Phase::Active) {
            return Err(LisanError::ChannelUnavailable(format!(
                "session is {:?}",
                self.phase.status()
            )));
        }
        self.send_on_channel(event).await
    }

    async fn send_on_channel(&mut self, event: ControlEvent) -> Result<ControlEvent> {
        let channel = self
            .resources
            .channel
            .clone()
            .ok_or_else(|| LisanError::ChannelUnavailable("event channel is closed".into()))?;
        let (event, wire) = self.protocol.prepare_outbound(event, Utc::now())?;
        channel.send_text(wire).await?;
        debug!(
            session_id = %self.id,
            event_type = %event.event_type,
            event_id = event.event_id.as_deref().unwrap_or_default(),
            "Sent control event"
        );
        self.publish(SessionEvent::Control(ObservedEvent {
            direction: Direction::Outbound,
            event: event.clone(),
        }));
        Ok(event)
    }

    fn on_activation(&mut self, result: Result<Resources>) {
        match result {
            Ok(resources) => {
                self.resources = resources;
                let deadline = self.options.open_timeout.map(|t| Instant::now() + t);
                debug!(session_id = %self.id, "Negotiated, waiting for the event channel");
                self.set_phase(Phase::AwaitingOpen { deadline });
            }
            Err(e) => {
                warn!(session_id = %self.id, kind = e.kind(), error = %e, "Activation failed");
                self.set_phase(Phase::Stopped);
                self.finish_start(Err(e));
            }
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        if matches!(self.phase, Phase::Idle | Phase::Stopped) {
            debug!(session_id = %self.id, ?event, "Transport event after teardown ignored");
            return;
        }
        match event {
            TransportEvent::ChannelOpen => self.on_channel_open().await,
            TransportEvent::ChannelMessage { text, received_at } => {
                match self.protocol.decode_inbound(&text, received_at) {
                    Ok(event) => {
                        debug!(
                            session_id = %self.id,
                            event_type = %event.event_type,
                            "Received control event"
                        );
                        self.publish(SessionEvent::Control(ObservedEvent {
                            direction: Direction::Inbound,
                            event,
                        }));
                    }
                    Err(e) => {
                        warn!(session_id = %self.id, error = %e, "Dropping malformed control event");
                    }
                }
            }
            TransportEvent::ChannelClosed => {
                self.resources.channel = None;
                self.on_connection_lost("event channel closed").await;
            }
            TransportEvent::PeerState(state) if state.is_terminal() => {
                self.on_connection_lost(if state == PeerState::Failed {
                    "peer connection failed"
                } else {
                    "peer connection closed"
                })
                .await;
            }
            TransportEvent::PeerState(state) => {
                info!(session_id = %self.id, ?state, "Peer connection state");
            }
            TransportEvent::RemoteAudio(audio) => {
                info!(session_id = %self.id, track = audio.track_id(), "Routing remote audio to playback");
                self.deps.playback.attach(audio, self.playback_tx.clone());
            }
        }
    }

    async fn on_channel_open(&mut self) {
        if !matches!(self.phase, Phase::AwaitingOpen { .. }) {
            debug!(session_id = %self.id, "Duplicate channel open ignored");
            return;
        }
        let Some(lesson) = self.protocol.on_channel_open() else {
            return;
        };
        match self.send_on_channel(lesson).await {
            Ok(_) => {
                info!(session_id = %self.id, "Lesson sent, session active");
                self.set_phase(Phase::Active);
                self.finish_start(Ok(StartOutcome::Started));
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to send lesson");
                self.abort(e).await;
            }
        }
    }

    async fn on_connection_lost(&mut self, reason: &str) {
        match self.phase {
            Phase::AwaitingOpen { .. } => {
                self.abort(LisanError::ChannelUnavailable(reason.to_string()))
                    .await;
            }
            Phase::Active => match self.options.on_disconnect {
                DisconnectPolicy::AutoStop => {
                    warn!(session_id = %self.id, reason, "Connection lost, stopping session");
                    self.shutdown().await;
                }
                DisconnectPolicy::AwaitUser => {
                    warn!(session_id = %self.id, reason, "Connection lost, waiting for stop");
                }
            },
            _ => {}
        }
    }

    fn on_playback(&mut self, signal: PlaybackSignal) {
        match &signal {
            PlaybackSignal::Error { track_id, message } => {
                warn!(session_id = %self.id, track = %track_id, %message, "Playback error");
            }
            other => debug!(session_id = %self.id, signal = ?other, "Playback"),
        }
        self.publish(SessionEvent::Playback(signal));
    }

    async fn on_open_timeout(&mut self) {
        let waited = self.options.open_timeout.unwrap_or_default();
        self.abort(LisanError::ChannelUnavailable(format!(
            "event channel did not open within {}s",
            waited.as_secs_f32()
        )))
        .await;
    }

    /// Fail an in-flight activation after negotiation finished.
    async fn abort(&mut self, error: LisanError) {
        self.resources.release(&self.id).await;
        self.set_phase(Phase::Stopped);
        self.finish_start(Err(error));
    }

    /// Move to Stopped from any phase, cancelling activation if it is running.
    async fn shutdown(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Stopped => return,
            Phase::Negotiating { cancel } => {
                cancel.cancel();
                // The activation task releases what it holds before reporting.
                match self.activation_rx.recv().await {
                    Some(Ok(mut resources)) => resources.release(&self.id).await,
                    Some(Err(_)) => {}
                    None => warn!(session_id = %self.id, "{}", activation_lost()),
                }
            }
            _ => {}
        }
        self.resources.release(&self.id).await;
        info!(session_id = %self.id, "Session stopped");
        self.set_phase(Phase::Stopped);
        self.finish_start(Err(LisanError::Cancelled));
    }

    fn finish_start(&mut self, result: Result<StartOutcome>) {
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(result);
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        let status = self.phase.status();
        let changed = self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        if changed {
            debug!(session_id = %self.id, ?status, "Session status");
            self.publish(SessionEvent::Status(status));
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn activation_lost() -> LisanError {
    LisanError::Transport("activation task ended without reporting".into())
}

/// One activation attempt, run off the actor.
struct Activation {
    session_id: String,
    deps: SessionDeps,
    channel_label: String,
    transport: mpsc::UnboundedSender<TransportEvent>,
}

impl Activation {
    async fn run(self, cancel: CancellationToken) -> Result<Resources> {
        let mut acquired = Resources::default();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(LisanError::Cancelled),
            result = self.establish(&mut acquired) => result,
        };
        match result {
            Ok(()) => Ok(acquired),
            Err(e) => {
                acquired.release(&self.session_id).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, acquired: &mut Resources) -> Result<()> {
        let session_id = self.session_id.as_str();
        // The track is recorded as soon as capture resolves, so a cancel
        // during the credential fetch still stops it.
        let capture = async {
            let track = self.deps.capture.acquire_audio().await?;
            acquired.track = Some(track.clone());
            Ok::<_, LisanError>(track)
        };
        let (credential, track) = tokio::join!(self.deps.credentials.fetch(), capture);
        let track = track?;
        let credential = credential?;
        debug!(session_id, track = %track.id(), "Credential and audio acquired");

        let link = self.deps.connector.connect(self.transport.clone()).await?;
        acquired.link = Some(link.clone());
        link.attach_audio(&track).await?;
        acquired.channel = Some(link.open_event_channel(&self.channel_label).await?);

        let offer = link.create_offer().await?;
        debug!(session_id, offer_len = offer.len(), "Posting offer");
        let answer = self.deps.negotiator.negotiate(credential, &offer).await?;
        link.apply_answer(answer).await?;
        Ok(())
    }
}
