//! Standalone talk endpoint: `/talk?address=..&username=..&password=..`.
//!
//! Each binary WebSocket message is one chunk of A-law audio, uploaded to the
//! device as it arrives.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures_util::StreamExt;
use ipclink_device::DeviceClient;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::relay::WsRelay;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct TalkTarget {
    pub address: String,
    pub username: String,
    pub password: String,
}

impl TalkTarget {
    pub fn from_query(query: &str) -> Self {
        let mut target = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "address" => target.address = value.into_owned(),
                "username" => target.username = value.into_owned(),
                "password" => target.password = value.into_owned(),
                _ => {}
            }
        }
        target
    }
}

impl std::fmt::Debug for TalkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TalkTarget")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TalkTimeouts {
    pub connect: Duration,
    pub stop: Duration,
}

pub async fn serve<S>(ws: WebSocketStream<S>, target: TalkTarget, label: String, timeouts: TalkTimeouts)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let (relay, writer) = WsRelay::spawn(sink, label.clone());

    let (device, session_id) = match start(&target, timeouts.connect).await {
        Ok(started) => started,
        Err(e) => {
            warn!("[{}] Talk to {} failed: {:#}", label, target.address, e);
            relay.send_close(CloseCode::Error, &format!("{:#}", e));
            let _ = writer.await;
            return;
        }
    };
    info!("[{}] Talk session {} on {}", label, session_id, device.address());

    let mut chunks = 0u64;
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(audio)) => {
                if let Err(e) = device.write_talk(&audio).await {
                    warn!("[{}] Talk upload failed: {}", label, e);
                    relay.send_close(CloseCode::Error, "internal error");
                    break;
                }
                chunks += 1;
            }
            Ok(Message::Close(_)) => break,
            Ok(other) => trace!("[{}] Ignoring {:?} message", label, other),
            Err(e) => {
                debug!("[{}] WebSocket read failed: {}", label, e);
                break;
            }
        }
    }
    info!("[{}] Talk ended after {} chunks", label, chunks);

    match tokio::time::timeout(timeouts.stop, device.stop(&session_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("[{}] Stopping talk session {}: {}", label, session_id, e),
        Err(_) => warn!("[{}] Stopping talk session {} timed out", label, session_id),
    }
    if let Err(e) = device.close().await {
        warn!("[{}] Closing talk device: {}", label, e);
    }

    drop(relay);
    let _ = writer.await;
}

/// Dials, authenticates and starts a talk session. The connection is closed
/// again if any step after dialing fails.
async fn start(target: &TalkTarget, timeout: Duration) -> Result<(DeviceClient, String)> {
    if target.address.is_empty() {
        bail!("missing address");
    }
    let device = DeviceClient::dial(&target.address, timeout).await?;

    let started = tokio::time::timeout(timeout, async {
        device.handshake(&target.username, &target.password).await?;
        device.start_talk().await
    })
    .await;

    let err = match started {
        Ok(Ok(session_id)) => return Ok((device, session_id)),
        Ok(Err(e)) => anyhow::Error::new(e),
        Err(_) => anyhow!("timed out starting talk on {}", device.address()),
    };
    if let Err(e) = device.close().await {
        debug!("Closing talk device after failure: {}", e);
    }
    Err(err)
}
