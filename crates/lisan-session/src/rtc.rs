//! WebRTC peer link built on the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use lisan_core::error::{LisanError, Result};
use lisan_media::{AudioTrack, RemoteAudio};

use crate::transport::{EventChannel, PeerConnector, PeerLink, PeerState, TransportEvent};

/// Remote packets buffered ahead of the playback sink.
const REMOTE_AUDIO_BUFFER: usize = 256;
const RTCP_BUFFER: usize = 1500;

fn transport_err(context: &'static str) -> impl FnOnce(webrtc::Error) -> LisanError {
    move |e| LisanError::Transport(format!("{context}: {e}"))
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// Builds WebRTC peer connections with Opus audio and the default interceptors.
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(transport_err("register codecs"))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(transport_err("register interceptors"))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(transport_err("create peer connection"))?,
        );

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(?state, "Peer connection state changed");
            let _ = state_events.send(TransportEvent::PeerState(state.into()));
            Box::pin(async {})
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        debug!(kind = ?track.kind(), "Ignoring non-audio remote track");
                        return;
                    }
                    let track_id = track.id();
                    info!(track = %track_id, "Remote audio track arrived");
                    let (packet_tx, packet_rx) = mpsc::channel::<Bytes>(REMOTE_AUDIO_BUFFER);
                    let _ = events.send(TransportEvent::RemoteAudio(RemoteAudio::new(
                        track_id.clone(),
                        packet_rx,
                    )));
                    tokio::spawn(async move {
                        while let Ok((packet, _)) = track.read_rtp().await {
                            if packet.payload.is_empty() {
                                continue;
                            }
                            if packet_tx.send(packet.payload).await.is_err() {
                                break;
                            }
                        }
                        debug!(track = %track_id, "Remote audio track finished");
                    });
                })
            },
        ));

        Ok(Arc::new(WebRtcLink { pc, events }))
    }
}

/// A live `RTCPeerConnection`.
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn attach_audio(&self, track: &AudioTrack) -> Result<()> {
        let sender = self
            .pc
            .add_track(track.local() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(transport_err("add audio track"))?;

        // Drain RTCP so the interceptors keep running.
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER];
            while sender.read(&mut buf).await.is_ok() {}
        });
        debug!(track = %track.id(), "Outbound audio attached");
        Ok(())
    }

    async fn open_event_channel(&self, label: &str) -> Result<Arc<dyn EventChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(transport_err("create data channel"))?;

        let open_events = self.events.clone();
        let open_label = label.to_string();
        dc.on_open(Box::new(move || {
            info!(label = %open_label, "Event channel open");
            let _ = open_events.send(TransportEvent::ChannelOpen);
            Box::pin(async {})
        }));

        let message_events = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let received_at = Utc::now();
            if !msg.is_string {
                trace!(bytes = msg.data.len(), "Ignoring binary event channel message");
            } else {
                let text = String::from_utf8_lossy(&msg.data).into_owned();
                let _ = message_events.send(TransportEvent::ChannelMessage { text, received_at });
            }
            Box::pin(async {})
        }));

        let close_events = self.events.clone();
        dc.on_close(Box::new(move || {
            let _ = close_events.send(TransportEvent::ChannelClosed);
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcEventChannel { dc }))
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(transport_err("create offer"))?;

        // Non-trickle: the posted offer carries every candidate.
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(transport_err("set local description"))?;
        let _ = gathered.recv().await;

        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| LisanError::Transport("local description missing after gathering".into()))
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| LisanError::Negotiation(format!("unusable answer SDP: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| LisanError::Negotiation(format!("remote description rejected: {e}")))
    }

    async fn stop_senders(&self) -> Result<()> {
        let mut first_error = None;
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                warn!(error = %e, "Failed to stop media sender");
                first_error.get_or_insert(LisanError::Transport(format!("stop sender: {e}")));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(transport_err("close peer connection"))
    }
}

struct RtcEventChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl EventChannel for RtcEventChannel {
    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(transport_err("event channel send"))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(transport_err("close event channel"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_state_mapping() {
        assert_eq!(PeerState::from(RTCPeerConnectionState::Unspecified), PeerState::New);
        assert_eq!(PeerState::from(RTCPeerConnectionState::Connected), PeerState::Connected);
        assert!(PeerState::from(RTCPeerConnectionState::Failed).is_terminal());
        assert!(!PeerState::from(RTCPeerConnectionState::Disconnected).is_terminal());
    }

    #[tokio::test]
    async fn test_offer_carries_audio_and_application_sections() {
        let (events, _rx) = mpsc::unbounded_channel();
        let link = WebRtcConnector::new(Vec::new()).connect(events).await.unwrap();
        link.attach_audio(&AudioTrack::opus("local")).await.unwrap();
        link.open_event_channel("oai-events").await.unwrap();

        let offer = link.create_offer().await.unwrap();
        assert!(offer.starts_with("v=0"));
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("m=application"));
        assert!(offer.contains("opus"));

        link.stop_senders().await.unwrap();
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_answer_is_a_negotiation_error() {
        let (events, _rx) = mpsc::unbounded_channel();
        let link = WebRtcConnector::new(Vec::new()).connect(events).await.unwrap();
        link.open_event_channel("oai-events").await.unwrap();
        link.create_offer().await.unwrap();

        let err = link.apply_answer("not sdp".into()).await.unwrap_err();
        assert!(matches!(err, LisanError::Negotiation(_)), "got {err:?}");
        link.close().await.unwrap();
    }
}
