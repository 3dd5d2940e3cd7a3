//! Playback sink that only reports what arrives.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{PlaybackSignal, PlaybackSink, RemoteAudio};

/// Drains remote audio without rendering it, emitting the playback signals
/// a real output would.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticPlayback;

impl DiagnosticPlayback {
    pub fn new() -> Self {
        Self
    }
}

impl PlaybackSink for DiagnosticPlayback {
    fn attach(&self, mut audio: RemoteAudio, signals: mpsc::UnboundedSender<PlaybackSignal>) {
        tokio::spawn(async move {
            let track_id = audio.track_id().to_string();
            let mut packets: u64 = 0;
            let mut bytes: usize = 0;
            while let Some(packet) = audio.next_packet().await {
                if packets == 0 {
                    info!(track = %track_id, "Remote audio started");
                    let _ = signals.send(PlaybackSignal::Started {
                        track_id: track_id.clone(),
                    });
                }
                packets += 1;
                bytes += packet.len();
            }
            debug!(track = %track_id, packets, bytes, "Remote audio ended");
            let _ = signals.send(PlaybackSignal::Ended { track_id, packets });
        });
    }
}
