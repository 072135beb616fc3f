//! `ipclink probe`: records a device's preview video to an Annex-B file.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ipclink_core::MediaKind;
use ipclink_device::DeviceClient;
use ipclink_mtsp::Packet;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use webrtc::media::io::h264_writer::H264Writer;
use webrtc::media::io::Writer;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::util::marshal::Unmarshal;

const LOG_EVERY_PACKETS: u64 = 300;

#[derive(Debug)]
pub struct ProbeArgs {
    pub address: String,
    pub username: String,
    pub password: String,
    pub output: PathBuf,
    pub timeout: Duration,
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    let device = DeviceClient::dial(&args.address, args.timeout).await?;

    let started = tokio::time::timeout(args.timeout, async {
        device.handshake(&args.username, &args.password).await?;
        device.start_preview().await
    })
    .await;
    let session = match started {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            let _ = device.close().await;
            return Err(e).context("starting preview");
        }
        Err(_) => {
            let _ = device.close().await;
            return Err(anyhow!("timed out starting preview on {}", device.address()));
        }
    };
    info!(
        "Preview session {} media: {}",
        session.session_id,
        serde_json::Value::Object(session.media.clone())
    );

    let file = File::create(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;
    let mut writer = H264Writer::new(BufWriter::new(file));
    info!("Writing video to {} (Ctrl-C to stop)", args.output.display());

    let recorded = record(&device, &mut writer).await;

    if let Err(e) = writer.close() {
        warn!("Closing {}: {}", args.output.display(), e);
    }
    match tokio::time::timeout(args.timeout, device.stop(&session.session_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Stopping preview: {}", e),
        Err(_) => warn!("Stopping preview timed out"),
    }
    if let Err(e) = device.close().await {
        warn!("Closing device: {}", e);
    }

    let packets = recorded?;
    info!("Recorded {} video packets to {}", packets, args.output.display());
    Ok(())
}

/// Copies video-channel RTP into `writer` until Ctrl-C or the device stream
/// ends.
async fn record<S, W>(device: &DeviceClient<S>, writer: &mut W) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Send,
    W: Writer,
{
    let mut packets = 0u64;
    loop {
        let packet = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("Ctrl-C received, stopping");
                return Ok(packets);
            }
            packet = device.read() => match packet {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Device stream ended: {}", e);
                    return Ok(packets);
                }
            },
        };

        let Packet::Interleaved(frame) = packet else {
            continue;
        };
        if MediaKind::from_channel(frame.channel) != Some(MediaKind::Video) {
            continue;
        }

        let mut buf = &frame.payload[..];
        let rtp = match RtpPacket::unmarshal(&mut buf) {
            Ok(rtp) => rtp,
            Err(e) => {
                debug!("Skipping malformed RTP packet: {}", e);
                continue;
            }
        };
        writer.write_rtp(&rtp).context("writing H.264")?;

        packets += 1;
        if packets % LOG_EVERY_PACKETS == 0 {
            info!("{} video packets recorded", packets);
        }
    }
}
