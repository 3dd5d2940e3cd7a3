//! Host audio devices.
//!
//! Microphone PCM is pulled from a cpal input stream and encoded to Opus on a
//! dedicated thread. Remote Opus is decoded on its own thread and handed to
//! the cpal output callback through a lock-free ring buffer. cpal streams are
//! not `Send` on every host, so each stream lives and dies on the thread that
//! opened it.

use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Stream, StreamConfig};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Producer, Split};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use lisan_core::error::{LisanError, Result};

use crate::{AudioTrack, FRAME_DURATION, MediaCapture, PlaybackSignal, PlaybackSink, RemoteAudio};

const SAMPLE_RATE: u32 = 48_000;
/// 20 ms of mono audio at 48 kHz.
const FRAME_SAMPLES: usize = 960;
/// Largest Opus frame (120 ms) at 48 kHz.
const MAX_DECODED_SAMPLES: usize = 5_760;
const MAX_PACKET_BYTES: usize = 4_000;
/// Two seconds of output headroom.
const PLAYBACK_BUFFER: usize = SAMPLE_RATE as usize * 2;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn mono_config() -> StreamConfig {
    StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Map a stream build failure onto the capture error taxonomy.
fn classify_build_error(err: BuildStreamError) -> LisanError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            LisanError::DeviceUnavailable("audio device is no longer available".into())
        }
        BuildStreamError::BackendSpecific { err }
            if err.description.to_lowercase().contains("permission")
                || err.description.to_lowercase().contains("denied") =>
        {
            LisanError::PermissionDenied(err.description)
        }
        other => LisanError::DeviceUnavailable(other.to_string()),
    }
}

/// Default system microphone, Opus-encoded at 48 kHz mono.
#[derive(Debug, Clone, Default)]
pub struct MicrophoneCapture;

impl MicrophoneCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaCapture for MicrophoneCapture {
    async fn acquire_audio(&self) -> Result<AudioTrack> {
        let track = AudioTrack::opus("lisan-microphone");
        let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(64);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let worker = track.clone();
        thread::Builder::new()
            .name("lisan-microphone".into())
            .spawn(move || run_microphone(worker, frame_tx, ready_tx))
            .map_err(|e| LisanError::DeviceUnavailable(format!("capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                track.stop();
                return Err(e);
            }
            Err(_) => {
                track.stop();
                return Err(LisanError::DeviceUnavailable(
                    "capture thread exited before the stream opened".into(),
                ));
            }
        }

        let writer = track.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer.stopped() => break,
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = writer.write_frame(frame, FRAME_DURATION).await {
                            trace!(error = %e, "Dropped microphone frame");
                        }
                    }
                }
            }
            debug!("Microphone writer stopped");
        });

        info!("Microphone capture started");
        Ok(track)
    }
}

fn open_input(pcm_tx: std_mpsc::SyncSender<Vec<f32>>) -> Result<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| LisanError::DeviceUnavailable("no default input device".into()))?;
    let stream = device
        .build_input_stream(
            &mono_config(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if pcm_tx.try_send(data.to_vec()).is_err() {
                    trace!(samples = data.len(), "Capture queue full");
                }
            },
            |err: cpal::StreamError| error!(%err, "Microphone stream error"),
            None,
        )
        .map_err(classify_build_error)?;
    stream
        .play()
        .map_err(|e| LisanError::DeviceUnavailable(e.to_string()))?;
    Ok(stream)
}

fn run_microphone(
    track: AudioTrack,
    frame_tx: mpsc::Sender<Bytes>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let mut encoder = match Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip) {
        Ok(encoder) => encoder,
        Err(e) => {
            let _ = ready_tx.send(Err(LisanError::DeviceUnavailable(format!(
                "opus encoder: {e}"
            ))));
            return;
        }
    };
    let (pcm_tx, pcm_rx) = std_mpsc::sync_channel::<Vec<f32>>(64);
    let stream = match open_input(pcm_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if ready_tx.send(Ok(())).is_err() {
        // The caller gave up while the device was opening.
        track.stop();
        return;
    }

    let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 4);
    let mut packet = vec![0u8; MAX_PACKET_BYTES];
    while !track.is_stopped() {
        match pcm_rx.recv_timeout(POLL_INTERVAL) {
            Ok(chunk) => pending.extend_from_slice(&chunk),
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
        while pending.len() >= FRAME_SAMPLES {
            let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
            match encoder.encode_float(&frame, &mut packet) {
                Ok(len) => {
                    if frame_tx
                        .blocking_send(Bytes::copy_from_slice(&packet[..len]))
                        .is_err()
                    {
                        track.stop();
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Opus encode failed"),
            }
        }
    }
    drop(stream);
    debug!("Microphone stream closed");
}

/// Default system output device.
#[derive(Debug, Clone, Default)]
pub struct SpeakerPlayback;

impl SpeakerPlayback {
    pub fn new() -> Self {
        Self
    }
}

impl PlaybackSink for SpeakerPlayback {
    fn attach(&self, audio: RemoteAudio, signals: mpsc::UnboundedSender<PlaybackSignal>) {
        let track_id = audio.track_id().to_string();
        let spawned = thread::Builder::new()
            .name("lisan-speaker".into())
            .spawn({
                let signals = signals.clone();
                move || run_speaker(audio, signals)
            });
        if let Err(e) = spawned {
            let _ = signals.send(PlaybackSignal::Error {
                track_id,
                message: format!("playback thread: {e}"),
            });
        }
    }
}

fn open_output(mut samples: ringbuf::HeapCons<f32>) -> Result<Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| LisanError::DeviceUnavailable("no default output device".into()))?;
    let stream = device
        .build_output_stream(
            &mono_config(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let read = samples.pop_slice(data);
                data[read..].fill(0.0);
            },
            |err: cpal::StreamError| error!(%err, "Speaker stream error"),
            None,
        )
        .map_err(classify_build_error)?;
    stream
        .play()
        .map_err(|e| LisanError::DeviceUnavailable(e.to_string()))?;
    Ok(stream)
}

fn run_speaker(mut audio: RemoteAudio, signals: mpsc::UnboundedSender<PlaybackSignal>) {
    let track_id = audio.track_id().to_string();
    let fail = |message: String| {
        warn!(track = %track_id, %message, "Remote audio playback failed");
        let _ = signals.send(PlaybackSignal::Error {
            track_id: track_id.clone(),
            message,
        });
    };

    let mut decoder = match Decoder::new(SampleRate::Hz48000, Channels::Mono) {
        Ok(decoder) => decoder,
        Err(e) => return fail(format!("opus decoder: {e}")),
    };
    let (mut producer, consumer) = HeapRb::<f32>::new(PLAYBACK_BUFFER).split();
    let stream = match open_output(consumer) {
        Ok(stream) => stream,
        Err(e) => return fail(e.to_string()),
    };

    let mut pcm = vec![0.0f32; MAX_DECODED_SAMPLES];
    let mut packets: u64 = 0;
    while let Some(packet) = audio.blocking_next_packet() {
        let decoded = match decoder.decode_float(Some(&packet[..]), &mut pcm, false) {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!(error = %e, "Skipping undecodable packet");
                continue;
            }
        };
        if packets == 0 {
            info!(track = %track_id, "Remote audio playing");
            let _ = signals.send(PlaybackSignal::Started {
                track_id: track_id.clone(),
            });
        }
        packets += 1;
        let written = producer.push_slice(&pcm[..decoded]);
        if written < decoded {
            trace!(dropped = decoded - written, "Playback buffer full");
        }
    }

    drop(stream);
    debug!(track = %track_id, packets, "Remote audio ended");
    let _ = signals.send(PlaybackSignal::Ended {
        track_id: track_id.clone(),
        packets,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_errors_are_classified() {
        let err = classify_build_error(BuildStreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "Permission denied by the host".into(),
            },
        });
        assert!(matches!(err, LisanError::PermissionDenied(_)), "got {err:?}");

        let err = classify_build_error(BuildStreamError::DeviceNotAvailable);
        assert!(matches!(err, LisanError::DeviceUnavailable(_)));
    }

    #[tokio::test]
    #[ignore = "needs a microphone"]
    async fn test_microphone_capture_starts() {
        let track = MicrophoneCapture::new().acquire_audio().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        track.stop();
    }

    #[tokio::test]
    #[ignore = "needs an output device"]
    async fn test_speaker_ends_when_stream_closes() {
        let (packet_tx, packet_rx) = mpsc::channel::<Bytes>(1);
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        SpeakerPlayback::new().attach(RemoteAudio::new("remote", packet_rx), signal_tx);
        drop(packet_tx);
        assert!(matches!(
            signal_rx.recv().await,
            Some(PlaybackSignal::Ended { packets: 0, .. })
        ));
    }
}
