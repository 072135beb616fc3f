//! Session orchestrator: one per relay connection.
//!
//! ```text
//!  Idle ──open──▶ Opening ──offer sent──▶ Negotiating ──connected──▶ Connected
//!   ▲                │                         │                        │
//!   └──open failed───┘                         ├──ICE / peer failed─────┼──▶ Failed
//!                                              └──relay closed──────────┴──▶ Closed
//! ```
//!
//! Relay messages are handled under the session lock, so an Open (including
//! sending its offer) completes before the next message is looked at. Peer
//! events and pump exits are consumed by a per-session event task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use ipclink_core::{AppConfig, Phase};
use ipclink_device::DeviceClient;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::negotiation::SessionDescription;
use crate::pump::{run_preview_pump, run_talk_pump, PumpExit};
use crate::relay::{OpenRequest, Relay, RelayMessage, RelayRequest};
use crate::transport::{
    DataChannelSpec, LinkState, MediaTrack, PeerEvent, PeerTransport, PeerTransportConfig,
    PeerTransportFactory, TrackSpec,
};

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub ice_servers: Vec<String>,
    pub talk_max_retransmits: u16,
    /// Bounds dialing and every start/handshake round trip.
    pub connect_timeout: Duration,
    /// Bounds each stop request during teardown.
    pub stop_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SessionOptions {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            ice_servers: cfg.ice_servers.clone(),
            talk_max_retransmits: cfg.talk_max_retransmits,
            connect_timeout: cfg.connect_timeout(),
            stop_timeout: cfg.stop_timeout(),
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

/// An authenticated device connection and, once started, its session id.
struct DeviceLink {
    client: Arc<DeviceClient>,
    session_id: Option<String>,
}

impl DeviceLink {
    fn new(client: DeviceClient) -> Self {
        Self {
            client: Arc::new(client),
            session_id: None,
        }
    }
}

#[derive(Default)]
struct SessionState {
    phase: Phase,
    preview: Option<DeviceLink>,
    talk: Option<DeviceLink>,
    transport: Option<Arc<dyn PeerTransport>>,
    video: Option<Arc<dyn MediaTrack>>,
    audio: Option<Arc<dyn MediaTrack>>,
    talk_rx: Option<mpsc::Receiver<Bytes>>,
    shutdown: Option<watch::Sender<bool>>,
    pump_exits: Option<mpsc::UnboundedSender<PumpExit>>,
    pumps: Vec<JoinHandle<()>>,
    event_task: Option<JoinHandle<()>>,
}

struct Inner {
    id: Uuid,
    label: String,
    relay: Arc<dyn Relay>,
    factory: Arc<dyn PeerTransportFactory>,
    options: SessionOptions,
    state: Mutex<SessionState>,
    torn_down: AtomicBool,
}

/// Reply to a successfully dispatched relay request.
enum Reply {
    Offer(SessionDescription),
    Done,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// `label` identifies the relay connection in logs (usually the peer
    /// address).
    pub fn new(
        label: impl Into<String>,
        relay: Arc<dyn Relay>,
        factory: Arc<dyn PeerTransportFactory>,
        options: SessionOptions,
    ) -> Self {
        let inner = Inner {
            id: Uuid::new_v4(),
            label: label.into(),
            relay,
            factory,
            options,
            state: Mutex::new(SessionState::default()),
            torn_down: AtomicBool::new(false),
        };
        info!("Session {} created for {}", inner.id, inner.label);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase
    }

    // MARK: - Relay input

    /// Handles one text message from the relay and sends the reply: the offer
    /// for a successful Open, a success result otherwise, or an error result
    /// carrying the request's `userData`.
    pub async fn handle_relay_data(&self, text: &str) {
        let mut state = self.inner.state.lock().await;

        let (user_data, outcome) = match RelayMessage::parse(text) {
            Ok(msg) => {
                let outcome = self.dispatch(&mut state, &msg).await;
                (msg.user_data, outcome)
            }
            Err(e) => (RelayMessage::recover_user_data(text), Err(e.into())),
        };

        let reply = match outcome {
            Ok(Reply::Offer(offer)) => RelayMessage::offer(offer, user_data),
            Ok(Reply::Done) => RelayMessage::success(user_data),
            Err(e) => {
                warn!("[{}] Relay request failed: {}", self.inner.label, e);
                RelayMessage::failure(user_data, e.to_string())
            }
        };
        self.send(&reply).await;
    }

    /// The relay connection is gone. Tears the session down unless a failure
    /// already did.
    pub async fn on_relay_closed(&self) {
        if self.claim_teardown() {
            info!("[{}] Relay closed", self.inner.label);
            self.teardown(Phase::Closed).await;
        }
    }

    async fn dispatch(
        &self,
        state: &mut SessionState,
        msg: &RelayMessage,
    ) -> Result<Reply, SessionError> {
        let request = msg.request()?;
        if let Some(RelayRequest::Open(open)) = request {
            return self.open(state, open).await.map(Reply::Offer);
        }

        if state.phase.is_terminal() {
            return Err(SessionError::Closed);
        }
        if !state.phase.is_open() {
            return Err(SessionError::NotOpen);
        }
        let transport = state.transport.clone().ok_or(SessionError::NotOpen)?;

        match request {
            Some(RelayRequest::SessionDescription(desc)) => {
                debug!("[{}] Remote description ({})", self.inner.label, desc.sdp_type);
                transport.set_remote_description(desc).await?;
            }
            Some(RelayRequest::Candidate(candidate)) => {
                debug!("[{}] Remote candidate {}", self.inner.label, candidate.candidate);
                transport.add_ice_candidate(candidate).await?;
            }
            _ => return Err(SessionError::InvalidRequest),
        }
        Ok(Reply::Done)
    }

    // MARK: - Open

    async fn open(
        &self,
        state: &mut SessionState,
        open: OpenRequest,
    ) -> Result<SessionDescription, SessionError> {
        match state.phase {
            Phase::Idle => {}
            p if p.is_terminal() => return Err(SessionError::Closed),
            _ => return Err(SessionError::AlreadyOpen),
        }

        state.phase = Phase::Opening;
        info!(
            "[{}] Opening {} (talk={})",
            self.inner.label, open.address, open.enable_talk
        );

        match self.open_resources(state, &open).await {
            Ok(offer) => {
                state.phase = Phase::Negotiating;
                info!("[{}] Offer sent, negotiating", self.inner.label);
                Ok(offer)
            }
            Err(e) => {
                warn!("[{}] Open failed: {}", self.inner.label, e);
                self.release(state).await;
                state.phase = Phase::Idle;
                Err(e)
            }
        }
    }

    /// Acquires everything an open session needs, recording each resource in
    /// `state` as soon as it exists so a failure can release it.
    async fn open_resources(
        &self,
        state: &mut SessionState,
        open: &OpenRequest,
    ) -> Result<SessionDescription, SessionError> {
        let opts = &self.inner.options;

        state.preview = Some(DeviceLink::new(self.connect_device(open).await?));
        if open.enable_talk {
            state.talk = Some(DeviceLink::new(self.connect_device(open).await?));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = PeerTransportConfig {
            ice_servers: opts.ice_servers.clone(),
        };
        let transport = self.inner.factory.create(&config, events_tx).await?;
        state.transport = Some(Arc::clone(&transport));

        state.video = Some(transport.add_track(TrackSpec::video()).await?);
        state.audio = Some(transport.add_track(TrackSpec::audio()).await?);
        if open.enable_talk {
            let spec = DataChannelSpec::talk(opts.talk_max_retransmits);
            state.talk_rx = Some(transport.create_data_channel(spec).await?);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        state.shutdown = Some(shutdown_tx);
        state.pump_exits = Some(exits_tx);
        state.event_task = Some(tokio::spawn(run_events(
            Arc::downgrade(&self.inner),
            events_rx,
            exits_rx,
            shutdown_rx,
        )));

        Ok(transport.create_offer().await?)
    }

    /// Dials and authenticates one device connection. A connection that
    /// fails its handshake is closed here.
    async fn connect_device(&self, open: &OpenRequest) -> Result<DeviceClient, SessionError> {
        let timeout = self.inner.options.connect_timeout;
        let client = DeviceClient::dial(&open.address, timeout).await?;

        let handshake = tokio::time::timeout(timeout, client.handshake(&open.username, &open.password));
        let result = match handshake.await {
            Ok(Ok(())) => return Ok(client),
            Ok(Err(e)) => SessionError::from(e),
            Err(_) => SessionError::Timeout("device handshake"),
        };
        if let Err(e) = client.close().await {
            debug!("[{}] Closing rejected device connection: {}", self.inner.label, e);
        }
        Err(result)
    }

    // MARK: - Peer events

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Candidate(candidate) => {
                // Wait for any in-flight Open so the offer goes out first.
                let _state = self.inner.state.lock().await;
                self.send(&RelayMessage::candidate(candidate)).await;
            }
            PeerEvent::IceStateChanged(LinkState::Failed) => self.fail("ICE connection failed").await,
            PeerEvent::ConnectionStateChanged(LinkState::Failed) => {
                self.fail("peer connection failed").await
            }
            PeerEvent::ConnectionStateChanged(LinkState::Connected) => self.on_connected().await,
            other => debug!("[{}] {:?}", self.inner.label, other),
        }
    }

    async fn on_connected(&self) {
        let mut state = self.inner.state.lock().await;
        if state.phase != Phase::Negotiating {
            debug!("[{}] Connected event in phase {}", self.inner.label, state.phase);
            return;
        }

        info!("[{}] Peer connected, starting streams", self.inner.label);
        match self.start_streaming(&mut state).await {
            Ok(()) => state.phase = Phase::Connected,
            Err(e) => {
                error!("[{}] Failed to start streaming: {}", self.inner.label, e);
                drop(state);
                self.fail("device stream start failed").await;
            }
        }
    }

    async fn start_streaming(&self, state: &mut SessionState) -> Result<(), SessionError> {
        let timeout = self.inner.options.connect_timeout;

        let preview = state.preview.as_mut().ok_or(SessionError::NotOpen)?;
        let session = tokio::time::timeout(timeout, preview.client.start_preview())
            .await
            .map_err(|_| SessionError::Timeout("start preview"))??;
        debug!("[{}] Preview media: {:?}", self.inner.label, session.media);
        preview.session_id = Some(session.session_id);
        let preview_client = Arc::clone(&preview.client);

        if let Some(talk) = state.talk.as_mut() {
            let id = tokio::time::timeout(timeout, talk.client.start_talk())
                .await
                .map_err(|_| SessionError::Timeout("start talk"))??;
            talk.session_id = Some(id);
        }

        let (Some(shutdown), Some(exits)) = (state.shutdown.as_ref(), state.pump_exits.as_ref())
        else {
            return Err(SessionError::NotOpen);
        };
        let (Some(video), Some(audio)) = (state.video.clone(), state.audio.clone()) else {
            return Err(SessionError::NotOpen);
        };

        state.pumps.push(tokio::spawn(run_preview_pump(
            preview_client,
            video,
            audio,
            shutdown.subscribe(),
            exits.clone(),
        )));

        if let (Some(talk), Some(talk_rx)) = (state.talk.as_ref(), state.talk_rx.take()) {
            state.pumps.push(tokio::spawn(run_talk_pump(
                Arc::clone(&talk.client),
                talk_rx,
                shutdown.subscribe(),
                exits.clone(),
            )));
        }
        Ok(())
    }

    async fn on_pump_exit(&self, exit: PumpExit) {
        warn!(
            "[{}] {} pump ended ({}), closing session",
            self.inner.label, exit.pump, exit.reason
        );
        self.fail("media pump ended").await;
    }

    // MARK: - Teardown

    /// Failure path: closes the relay, then tears down into `Failed`. Only an
    /// open session can fail; an Open that failed has already released
    /// everything and stays retryable.
    async fn fail(&self, reason: &str) {
        let phase = self.inner.state.lock().await.phase;
        if !phase.is_open() {
            debug!("[{}] Ignoring failure in phase {}: {}", self.inner.label, phase, reason);
            return;
        }
        if !self.claim_teardown() {
            return;
        }
        warn!("[{}] {}", self.inner.label, reason);
        self.inner.relay.close().await;
        self.teardown(Phase::Failed).await;
    }

    /// First caller wins; later callers get `false`.
    fn claim_teardown(&self) -> bool {
        self.inner
            .torn_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn teardown(&self, final_phase: Phase) {
        let mut state = self.inner.state.lock().await;
        info!(
            "[{}] Tearing down session {} from {}",
            self.inner.label, self.inner.id, state.phase
        );
        self.release(&mut state).await;
        state.phase = final_phase;
        info!("[{}] Session {}", self.inner.label, final_phase);
    }

    /// Stops pumps, closes the transport, stops and closes talk then
    /// preview. Every handle is taken, so nothing is released twice.
    async fn release(&self, state: &mut SessionState) {
        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for pump in state.pumps.drain(..) {
            if let Err(e) = pump.await {
                warn!("[{}] Pump task failed: {}", self.inner.label, e);
            }
        }
        // The event task exits on the shutdown signal; it may be the caller.
        state.event_task.take();
        state.pump_exits.take();

        if let Some(transport) = state.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("[{}] Closing peer transport: {}", self.inner.label, e);
            }
        }
        state.video.take();
        state.audio.take();
        state.talk_rx.take();

        if let Some(talk) = state.talk.take() {
            self.release_device("talk", talk).await;
        }
        if let Some(preview) = state.preview.take() {
            self.release_device("preview", preview).await;
        }
    }

    async fn release_device(&self, role: &str, link: DeviceLink) {
        if let Some(id) = link.session_id.as_deref() {
            match tokio::time::timeout(self.inner.options.stop_timeout, link.client.stop(id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[{}] Stopping {} session {}: {}", self.inner.label, role, id, e),
                Err(_) => warn!("[{}] Stopping {} session {} timed out", self.inner.label, role, id),
            }
        }
        if let Err(e) = link.client.close().await {
            warn!("[{}] Closing {} device: {}", self.inner.label, role, e);
        }
    }

    async fn send(&self, msg: &RelayMessage) {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("[{}] Failed to encode relay message: {}", self.inner.label, e);
                return;
            }
        };
        if let Err(e) = self.inner.relay.send(text).await {
            warn!("[{}] Relay send failed: {}", self.inner.label, e);
        }
    }
}

// ── Event task ────────────────────────────────────────────────────────────────

/// Holds only a weak reference so a dropped session is not kept alive.
async fn run_events(
    session: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    mut exits: mpsc::UnboundedReceiver<PumpExit>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(event) = events.recv() => {
                let Some(inner) = session.upgrade() else { break };
                Session { inner }.on_peer_event(event).await;
            }
            Some(exit) = exits.recv() => {
                let Some(inner) = session.upgrade() else { break };
                Session { inner }.on_pump_exit(exit).await;
            }
            else => break,
        }
    }
    debug!("Session event task finished");
}
