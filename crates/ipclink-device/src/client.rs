use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipclink_core::with_default_port;
use ipclink_mtsp::{Headers, MtspConn, Packet, Response};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::DeviceError;
use crate::messages::{
    ControlRequest, ControlResponse, PreviewParams, PreviewSession, StopParams, TalkParams,
};
use crate::rtp::TalkPacketizer;

// ── Operation state ───────────────────────────────────────────────────────────

/// State owned by the operation lock: JSON `seq` and the talk RTP counters.
#[derive(Debug, Default)]
struct OpState {
    seq: u32,
    talk: TalkPacketizer,
}

// ── DeviceClient ──────────────────────────────────────────────────────────────

/// Client for one device connection.
///
/// Control calls and `write_talk` hold the operation lock for their whole
/// duration (request write + matching response read). `read` does not take
/// it, so a media read loop can run alongside talk uploads.
pub struct DeviceClient<S = TcpStream> {
    conn: MtspConn<S>,
    op: Mutex<OpState>,
    address: String,
}

impl DeviceClient<TcpStream> {
    /// Opens a TCP connection to the device. `:554` is used when `address`
    /// names no port.
    pub async fn dial(address: &str, connect_timeout: Duration) -> Result<Self, DeviceError> {
        let target = with_default_port(address);
        debug!("Dialing device {}", target);

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| DeviceError::ConnectTimeout {
                address: target.clone(),
                timeout_ms: connect_timeout.as_millis() as u64,
            })?
            .map_err(|source| DeviceError::Connect {
                address: target.clone(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("TCP_NODELAY on {}: {}", target, e);
        }
        info!("Connected to device {}", target);
        Ok(Self::from_stream(stream, target))
    }
}

impl<S> DeviceClient<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Wraps an already-connected stream.
    pub fn from_stream(stream: S, address: impl Into<String>) -> Self {
        Self {
            conn: MtspConn::new(stream),
            op: Mutex::new(OpState::default()),
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sends the credential handshake. Anything but 200 is an
    /// authentication failure.
    pub async fn handshake(&self, username: &str, password: &str) -> Result<(), DeviceError> {
        let _op = self.op.lock().await;

        let credentials = BASE64.encode(format!("{}:{}", username, password));
        let headers = Headers::new()
            .with("Authorization", format!("Basic {}", credentials))
            .with("X-Handshake", "unused debug");
        self.conn.write_multitrans(&headers, &[]).await?;

        let resp = self.await_response().await?;
        if !resp.is_ok() {
            warn!("Handshake with {} refused: {}", self.address, resp.status_line);
            return Err(DeviceError::AuthenticationFailed {
                status: resp.status_code,
                reason: resp.reason().to_owned(),
            });
        }
        info!("Handshake with {} accepted", self.address);
        Ok(())
    }

    /// Starts the preview stream; interleaved media follows on `read`.
    pub async fn start_preview(&self) -> Result<PreviewSession, DeviceError> {
        let resp = self.json_request(PreviewParams::default(), Headers::new()).await?;
        let params = decode_session(&resp)?.params;
        let session_id = session_id_of(params.session_id)?;
        info!("Preview session {} started on {}", session_id, self.address);
        Ok(PreviewSession {
            session_id,
            error_code: params.error_code,
            media: params.extra,
        })
    }

    /// Starts a talk session and returns its id.
    pub async fn start_talk(&self) -> Result<String, DeviceError> {
        let resp = self.json_request(TalkParams::default(), Headers::new()).await?;
        let session_id = session_id_of(decode_session(&resp)?.params.session_id)?;
        info!("Talk session {} started on {}", session_id, self.address);
        Ok(session_id)
    }

    /// Uploads one chunk of A-law audio as an RTP packet on channel 0.
    pub async fn write_talk(&self, audio: &[u8]) -> Result<(), DeviceError> {
        let mut op = self.op.lock().await;
        let packet = op.talk.packetize(audio)?;
        self.conn.write_interleaved(&packet).await?;
        op.talk.advance(audio.len());
        Ok(())
    }

    /// Stops a preview or talk session.
    pub async fn stop(&self, session_id: &str) -> Result<(), DeviceError> {
        let headers = Headers::new().with("X-Session-Id", session_id);
        self.json_request(StopParams::default(), headers).await?;
        info!("Session {} stopped on {}", session_id, self.address);
        Ok(())
    }

    /// Next packet from the device.
    pub async fn read(&self) -> Result<Packet, DeviceError> {
        Ok(self.conn.read_packet().await?)
    }

    /// Sends `TEARDOWN` (best effort, reply not awaited) and shuts the
    /// stream down. Call at most once.
    pub async fn close(&self) -> Result<(), DeviceError> {
        let _op = self.op.lock().await;
        if let Err(e) = self.conn.write_teardown().await {
            debug!("TEARDOWN to {} failed: {}", self.address, e);
        }
        self.conn.shutdown().await?;
        info!("Closed device connection {}", self.address);
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Sends a JSON control request under the operation lock. `seq` advances
    /// only when the device answered 200.
    async fn json_request<P: Serialize>(
        &self,
        params: P,
        extra: Headers,
    ) -> Result<Response, DeviceError> {
        let mut op = self.op.lock().await;

        let body = serde_json::to_vec(&ControlRequest::new(op.seq, params))?;
        let mut headers = Headers::new().with("Content-Type", "application/json");
        for (name, value) in extra.iter() {
            headers.add(name, value);
        }
        self.conn.write_multitrans(&headers, &body).await?;

        let resp = self.await_response().await?;
        if !resp.is_ok() {
            return Err(DeviceError::Status {
                status: resp.status_code,
                reason: resp.reason().to_owned(),
            });
        }
        op.seq = op.seq.wrapping_add(1);
        Ok(resp)
    }

    /// Reads until a text response arrives. Interleaved frames that come
    /// first are dropped.
    async fn await_response(&self) -> Result<Response, DeviceError> {
        loop {
            match self.conn.read_packet().await? {
                Packet::Response(resp) => return Ok(resp),
                Packet::Interleaved(frame) => {
                    trace!(
                        "Skipping ${} frame ({} bytes) while awaiting response",
                        frame.channel,
                        frame.payload.len()
                    );
                }
            }
        }
    }
}

fn decode_session(resp: &Response) -> Result<ControlResponse, DeviceError> {
    let decoded: ControlResponse = serde_json::from_slice(&resp.body)?;
    trace!("Response type={} seq={}", decoded.kind, decoded.seq);
    if decoded.params.error_code != 0 {
        return Err(DeviceError::Rejected {
            error_code: decoded.params.error_code,
        });
    }
    Ok(decoded)
}

fn session_id_of(id: Option<String>) -> Result<String, DeviceError> {
    id.filter(|s| !s.is_empty()).ok_or(DeviceError::MissingSessionId)
}
