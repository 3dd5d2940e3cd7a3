//! Media legs of a session: local audio capture and remote audio playback.
//!
//! The outbound leg is an [`AudioTrack`]: an Opus sample track the peer
//! connection sends, plus a stop token shared with whatever feeds it. The
//! inbound leg is a [`RemoteAudio`] packet stream handed to a [`PlaybackSink`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use lisan_core::error::{LisanError, Result};

pub mod playback;
pub mod silence;

#[cfg(feature = "audio-device")]
pub mod device;

pub use playback::DiagnosticPlayback;
pub use silence::SilenceCapture;

/// Opus frame length used on the outbound leg.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

const STREAM_ID: &str = "lisan";

/// Outbound audio track handle.
///
/// Clones share the same underlying track and stop token.
#[derive(Clone)]
pub struct AudioTrack {
    id: String,
    local: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
}

impl AudioTrack {
    /// A fresh Opus track with nothing feeding it yet.
    pub fn opus(id: impl Into<String>) -> Self {
        let id = id.into();
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            id.clone(),
            STREAM_ID.to_owned(),
        ));
        Self {
            id,
            local,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The track to attach to a peer connection.
    pub fn local(&self) -> Arc<TrackLocalStaticSample> {
        self.local.clone()
    }

    /// Write one encoded Opus frame.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()> {
        self.local
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| LisanError::Transport(format!("audio sample write failed: {e}")))
    }

    /// Stop the track and whatever is feeding it. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }
}

impl fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioTrack")
            .field("id", &self.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Acquires the local audio input.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Fails with `PermissionDenied` or `DeviceUnavailable`.
    async fn acquire_audio(&self) -> Result<AudioTrack>;
}

/// Encoded audio packets arriving from the remote peer.
pub struct RemoteAudio {
    track_id: String,
    packets: mpsc::Receiver<Bytes>,
}

impl RemoteAudio {
    pub fn new(track_id: impl Into<String>, packets: mpsc::Receiver<Bytes>) -> Self {
        Self {
            track_id: track_id.into(),
            packets,
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Next Opus payload; `None` once the remote track ends.
    pub async fn next_packet(&mut self) -> Option<Bytes> {
        self.packets.recv().await
    }

    /// Blocking variant for device threads outside the runtime.
    pub fn blocking_next_packet(&mut self) -> Option<Bytes> {
        self.packets.blocking_recv()
    }
}

impl fmt::Debug for RemoteAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAudio")
            .field("track_id", &self.track_id)
            .finish_non_exhaustive()
    }
}

/// Playback diagnostics. Observed and logged; they never change session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSignal {
    Started { track_id: String },
    Error { track_id: String, message: String },
    Ended { track_id: String, packets: u64 },
}

/// Where remote audio goes.
pub trait PlaybackSink: Send + Sync {
    /// Take ownership of the remote stream and start playing it in the background.
    fn attach(&self, audio: RemoteAudio, signals: mpsc::UnboundedSender<PlaybackSignal>);
}
