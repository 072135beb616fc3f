//! WebSocket listener. `/ipc` carries the relay protocol for one session per
//! connection; `/talk` is the standalone talk upload.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use ipclink_core::AppConfig;
use ipclink_peer::{PeerTransportFactory, Relay, Session, SessionOptions, WebRtcFactory};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::relay::WsRelay;
use crate::talk::{self, TalkTarget, TalkTimeouts};

pub const RELAY_PATH: &str = "/ipc";
pub const TALK_PATH: &str = "/talk";

/// Shared by every connection.
pub struct ServerContext {
    pub factory: Arc<dyn PeerTransportFactory>,
    pub options: SessionOptions,
}

// ── Entry point ───────────────────────────────────────────────────────────────

pub async fn run(cfg: AppConfig) -> Result<()> {
    let factory = WebRtcFactory::new().context("initialising WebRTC")?;
    let ctx = Arc::new(ServerContext {
        factory: Arc::new(factory),
        options: SessionOptions::from(&cfg),
    });

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    let local = listener.local_addr().context("reading listen address")?;
    info!("Relay on ws://{}{}, talk on ws://{}{}", local, RELAY_PATH, local, TALK_PATH);
    info!("ICE servers: {:?}", cfg.ice_servers);

    tokio::select! {
        _ = serve(listener, ctx) => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received, shutting down");
            Ok(())
        }
    }
}

/// Accept loop. Each connection runs on its own task.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(handle_connection(stream, peer, ctx));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

// ── Routing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Relay,
    Talk(TalkTarget),
}

impl Route {
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        match uri.path() {
            RELAY_PATH => Some(Route::Relay),
            TALK_PATH => Some(Route::Talk(TalkTarget::from_query(
                uri.query().unwrap_or_default(),
            ))),
            _ => None,
        }
    }
}

fn not_found() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("not found".into()));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("[{}] TCP_NODELAY: {}", peer, e);
    }

    let mut route = None;
    let callback = |req: &Request, resp: Response| match Route::from_uri(req.uri()) {
        Some(r) => {
            route = Some(r);
            Ok(resp)
        }
        None => {
            warn!("[{}] Refusing unknown path {}", peer, req.uri().path());
            Err(not_found())
        }
    };
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("[{}] WebSocket handshake failed: {}", peer, e);
            return;
        }
    };

    let label = peer.to_string();
    match route {
        Some(Route::Relay) => RelayConnection::new(ws, label, &ctx).run().await,
        Some(Route::Talk(target)) => {
            let timeouts = TalkTimeouts {
                connect: ctx.options.connect_timeout,
                stop: ctx.options.stop_timeout,
            };
            talk::serve(ws, target, label, timeouts).await
        }
        None => {}
    }
}

// ── Relay connection ──────────────────────────────────────────────────────────

/// Per-connection context: the WebSocket halves and the session they drive.
pub struct RelayConnection<S> {
    label: String,
    stream: SplitStream<WebSocketStream<S>>,
    relay: Arc<WsRelay>,
    writer: tokio::task::JoinHandle<()>,
    session: Session,
}

impl<S> RelayConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>, label: String, ctx: &ServerContext) -> Self {
        let (sink, stream) = ws.split();
        let (relay, writer) = WsRelay::spawn(sink, label.clone());
        let relay = Arc::new(relay);
        let session = Session::new(
            label.clone(),
            Arc::clone(&relay) as Arc<dyn Relay>,
            Arc::clone(&ctx.factory),
            ctx.options.clone(),
        );
        info!("[{}] Relay connected (session {})", label, session.id());
        Self {
            label,
            stream,
            relay,
            writer,
            session,
        }
    }

    /// Dispatches text frames until the client leaves or the session asks to
    /// close, then tears the session down.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.relay.close_requested() => {
                    debug!("[{}] Session closed the relay", self.label);
                    break;
                }
                msg = self.stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.session.handle_relay_data(&text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(other)) => trace!("[{}] Ignoring {:?} message", self.label, other),
                    Some(Err(e)) => {
                        debug!("[{}] WebSocket read failed: {}", self.label, e);
                        break;
                    }
                }
            }
        }

        self.session.on_relay_closed().await;
        self.relay.close().await;
        if let Err(e) = self.writer.await {
            warn!("[{}] WebSocket writer task failed: {}", self.label, e);
        }
        info!("[{}] Relay disconnected", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use futures_util::SinkExt;
    use ipclink_mtsp::{Headers, Inbound, TcpMtspConn};
    use ipclink_peer::{PeerError, PeerEvent, PeerTransport, PeerTransportConfig};
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Error as WsError;

    struct NoPeers;

    #[async_trait]
    impl PeerTransportFactory for NoPeers {
        async fn create(
            &self,
            _config: &PeerTransportConfig,
            _events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn PeerTransport>, PeerError> {
            Err(PeerError::Other("no peers in tests".into()))
        }
    }

    async fn start_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = Arc::new(ServerContext {
            factory: Arc::new(NoPeers),
            options: SessionOptions {
                connect_timeout: Duration::from_secs(2),
                stop_timeout: Duration::from_secs(2),
                ..SessionOptions::default()
            },
        });
        tokio::spawn(serve(listener, ctx));
        addr
    }

    /// Camera that accepts `admin`, starts talk session `t1` and logs what it
    /// receives.
    async fn start_device(accept_login: bool) -> (String, Arc<StdMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let shared = Arc::clone(&log);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = TcpMtspConn::new(stream);
                let log = Arc::clone(&shared);
                tokio::spawn(async move {
                    while let Ok(inbound) = conn.read_inbound().await {
                        let req = match inbound {
                            Inbound::Interleaved(f) => {
                                log.lock().unwrap().push(format!("talk:{}", f.payload.len()));
                                continue;
                            }
                            Inbound::Request(req) => req,
                        };
                        if req.method == "TEARDOWN" {
                            log.lock().unwrap().push("teardown".into());
                            break;
                        }
                        if req.body.is_empty() {
                            let (code, reason) =
                                if accept_login { (200, "OK") } else { (401, "Unauthorized") };
                            let _ = conn.write_response(code, reason, &Headers::new(), b"").await;
                            continue;
                        }
                        let body: Value = serde_json::from_slice(&req.body).unwrap();
                        if body["params"].get("stop").is_some() {
                            let id = req.headers.get("X-Session-Id").unwrap_or_default();
                            log.lock().unwrap().push(format!("stop:{}", id));
                        }
                        let reply = serde_json::json!({
                            "type": "response",
                            "seq": body["seq"],
                            "params": {"error_code": 0, "session_id": "t1"},
                        });
                        let _ = conn
                            .write_response(200, "OK", &Headers::new(), reply.to_string().as_bytes())
                            .await;
                    }
                });
            }
        });
        (addr, log)
    }

    async fn wait_for(log: &StdMutex<Vec<String>>, entry: &str) {
        for _ in 0..500 {
            if log.lock().unwrap().iter().any(|l| l == entry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("device never logged {entry}: {:?}", log.lock().unwrap());
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
    {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text message, got {other:?}"),
        }
    }

    #[test]
    fn routes_by_path() {
        assert_eq!(Route::from_uri(&"/ipc".parse().unwrap()), Some(Route::Relay));
        match Route::from_uri(&"/talk?address=cam&username=u".parse().unwrap()) {
            Some(Route::Talk(t)) => {
                assert_eq!(t.address, "cam");
                assert_eq!(t.username, "u");
            }
            other => panic!("unexpected route {other:?}"),
        }
        assert_eq!(Route::from_uri(&"/".parse().unwrap()), None);
        assert_eq!(Route::from_uri(&"/ipc/extra".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn unknown_path_is_refused_with_404() {
        let addr = start_server().await;
        match connect_async(format!("ws://{}/nope", addr)).await {
            Err(WsError::Http(resp)) => assert_eq!(resp.status(), StatusCode::NOT_FOUND),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("upgrade should be refused"),
        }
    }

    #[tokio::test]
    async fn relay_reports_request_errors() {
        let addr = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://{}{}", addr, RELAY_PATH))
            .await
            .unwrap();

        ws.send(Message::Text(r#"{"userData":"1","candidate":{"candidate":"c"}}"#.into()))
            .await
            .unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["userData"], "1");
        assert_eq!(reply["error"]["message"], "not open");

        ws.send(Message::Text("garbage".into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["success"], false);
    }

    #[tokio::test]
    async fn relay_open_failure_is_reported_and_session_stays_usable() {
        let addr = start_server().await;
        let (device, log) = start_device(false).await;
        let (mut ws, _) = connect_async(format!("ws://{}{}", addr, RELAY_PATH))
            .await
            .unwrap();

        let open = serde_json::json!({
            "userData": "7",
            "open": {"address": device, "username": "admin", "password": "bad"},
        });
        ws.send(Message::Text(open.to_string())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["userData"], "7");
        assert!(reply["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Authentication failed"));
        wait_for(&log, "teardown").await;

        ws.send(Message::Text(r#"{"userData":"8","sessionDescription":{"type":"answer","sdp":""}}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["error"]["message"], "not open");
    }

    #[tokio::test]
    async fn talk_uploads_binary_messages_and_stops_on_disconnect() {
        let addr = start_server().await;
        let (device, log) = start_device(true).await;
        let url = format!(
            "ws://{}{}?address={}&username=admin&password=pw",
            addr, TALK_PATH, device
        );
        let (mut ws, _) = connect_async(url).await.unwrap();

        ws.send(Message::Binary(vec![0xd5; 160])).await.unwrap();
        wait_for(&log, "talk:172").await;

        ws.close(None).await.unwrap();
        wait_for(&log, "stop:t1").await;
        wait_for(&log, "teardown").await;
    }

    #[tokio::test]
    async fn talk_start_failure_closes_with_internal_error_code() {
        let addr = start_server().await;
        let (device, _log) = start_device(false).await;
        let url = format!("ws://{}{}?address={}", addr, TALK_PATH, device);
        let (mut ws, _) = connect_async(url).await.unwrap();

        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::Error);
                assert!(frame.reason.contains("Authentication failed"));
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
