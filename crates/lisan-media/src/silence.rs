//! Capture source that needs no hardware.
//!
//! Feeds the outbound track with Opus silence frames so the peer connection
//! carries a live audio sender on machines without a microphone.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace};

use lisan_core::error::Result;

use crate::{AudioTrack, FRAME_DURATION, MediaCapture};

/// A single 20 ms Opus frame of digital silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(Debug, Clone, Default)]
pub struct SilenceCapture;

impl SilenceCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaCapture for SilenceCapture {
    async fn acquire_audio(&self) -> Result<AudioTrack> {
        let track = AudioTrack::opus("lisan-silence");
        let pump = track.clone();
        tokio::spawn(async move {
            let mut ticker = interval(FRAME_DURATION);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = pump.stopped() => {
                        debug!(track = %pump.id(), "Silence pump stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let frame = Bytes::from_static(&OPUS_SILENCE);
                        if let Err(e) = pump.write_frame(frame, FRAME_DURATION).await {
                            trace!(error = %e, "Dropped silence frame");
                        }
                    }
                }
            }
        });
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_returns_live_track() {
        let track = SilenceCapture::new().acquire_audio().await.unwrap();
        assert!(!track.is_stopped());
        track.stop();
        assert!(track.is_stopped());
        tokio::time::timeout(std::time::Duration::from_secs(1), track.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_each_acquire_is_independent() {
        let capture = SilenceCapture::new();
        let first = capture.acquire_audio().await.unwrap();
        let second = capture.acquire_audio().await.unwrap();
        first.stop();
        assert!(!second.is_stopped());
        second.stop();
    }
}
