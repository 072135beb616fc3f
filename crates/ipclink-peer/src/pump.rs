//! Media pumps.
//!
//! ```text
//! preview:  DeviceClient::read ──▶ $0 ──▶ video track
//!                               └─▶ $1 ──▶ audio track
//! talk:     data channel "talk" ──▶ DeviceClient::write_talk
//! ```
//!
//! Each pump is one sequential loop, so frame order is preserved and every
//! track has a single writer. A pump stops on the shutdown signal, or on the
//! first I/O error, which it reports as a [`PumpExit`].

use std::sync::Arc;

use bytes::Bytes;
use ipclink_core::MediaKind;
use ipclink_device::DeviceClient;
use ipclink_mtsp::Packet;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::transport::MediaTrack;

const LOG_EVERY_FRAMES: u64 = 300;

/// Sent by a pump that stopped on its own (error or end of input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PumpExit {
    pub pump: &'static str,
    pub reason: String,
}

impl PumpExit {
    fn new(pump: &'static str, reason: impl Into<String>) -> Self {
        Self {
            pump,
            reason: reason.into(),
        }
    }
}

pub(crate) async fn run_preview_pump<S>(
    device: Arc<DeviceClient<S>>,
    video: Arc<dyn MediaTrack>,
    audio: Arc<dyn MediaTrack>,
    mut shutdown: watch::Receiver<bool>,
    exits: mpsc::UnboundedSender<PumpExit>,
) where
    S: AsyncRead + AsyncWrite + Send,
{
    info!("Preview pump started ({})", device.address());
    let mut video_frames = 0u64;
    let mut audio_frames = 0u64;

    let exit = loop {
        let packet = tokio::select! {
            _ = shutdown.changed() => {
                debug!("Preview pump stopping on shutdown");
                return;
            }
            packet = device.read() => packet,
        };

        let frame = match packet {
            Ok(Packet::Interleaved(frame)) => frame,
            Ok(Packet::Response(resp)) => {
                trace!("Preview pump ignoring text packet: {}", resp.status_line);
                continue;
            }
            Err(e) => break PumpExit::new("preview", format!("device read: {}", e)),
        };

        let (track, counter) = match MediaKind::from_channel(frame.channel) {
            Some(MediaKind::Video) => (&video, &mut video_frames),
            Some(MediaKind::Audio) => (&audio, &mut audio_frames),
            None => {
                trace!("Preview pump ignoring channel {}", frame.channel);
                continue;
            }
        };
        if let Err(e) = track.write(&frame.payload).await {
            break PumpExit::new("preview", format!("{} track write: {}", track.kind(), e));
        }
        *counter += 1;

        if (video_frames + audio_frames) % LOG_EVERY_FRAMES == 0 {
            debug!(
                "Preview pump: {} video / {} audio frames",
                video_frames, audio_frames
            );
        }
    };

    warn!("Preview pump exited: {}", exit.reason);
    let _ = exits.send(exit);
}

pub(crate) async fn run_talk_pump<S>(
    device: Arc<DeviceClient<S>>,
    mut talk: mpsc::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    exits: mpsc::UnboundedSender<PumpExit>,
) where
    S: AsyncRead + AsyncWrite + Send,
{
    info!("Talk pump started ({})", device.address());
    let mut chunks = 0u64;

    let exit = loop {
        let audio = tokio::select! {
            _ = shutdown.changed() => {
                debug!("Talk pump stopping on shutdown");
                return;
            }
            audio = talk.recv() => audio,
        };

        let Some(audio) = audio else {
            break PumpExit::new("talk", "data channel closed");
        };
        if let Err(e) = device.write_talk(&audio).await {
            break PumpExit::new("talk", format!("device write: {}", e));
        }

        chunks += 1;
        if chunks % LOG_EVERY_FRAMES == 0 {
            debug!("Talk pump: {} chunks uploaded", chunks);
        }
    };

    warn!("Talk pump exited: {}", exit.reason);
    let _ = exits.send(exit);
}
