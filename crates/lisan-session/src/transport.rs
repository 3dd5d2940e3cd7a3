//! Seams between the session actor and the peer connection machinery.
//!
//! Callbacks from the connection are funnelled into one ordered stream of
//! [`TransportEvent`]s that the session consumes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use lisan_core::error::Result;
use lisan_media::{AudioTrack, RemoteAudio};

/// Aggregate state of the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// The connection is gone for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    ChannelOpen,
    /// A text message on the event channel, stamped when the callback saw it.
    ChannelMessage {
        text: String,
        received_at: DateTime<Utc>,
    },
    ChannelClosed,
    PeerState(PeerState),
    RemoteAudio(RemoteAudio),
}

impl TransportEvent {
    /// A message stamped with the current time.
    pub fn message(text: impl Into<String>) -> Self {
        Self::ChannelMessage {
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// Creates peer links.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a new connection whose callbacks report into `events`.
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}

/// One peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Add the outbound audio track. Must happen before [`create_offer`](Self::create_offer).
    async fn attach_audio(&self, track: &AudioTrack) -> Result<()>;

    async fn open_event_channel(&self, label: &str) -> Result<Arc<dyn EventChannel>>;

    /// Local offer SDP, with candidates gathered.
    async fn create_offer(&self) -> Result<String>;

    /// Apply the remote SDP as an answer.
    async fn apply_answer(&self, sdp: String) -> Result<()>;

    /// Stop every outbound media sender.
    async fn stop_senders(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// The ordered message channel carrying control events.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
