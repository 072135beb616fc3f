use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ipclink_core::MediaKind;
use tokio::sync::mpsc;

use crate::error::PeerError;
use crate::negotiation::{IceCandidate, SessionDescription};

pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_PCMA: &str = "audio/PCMA";

pub const TALK_CHANNEL_LABEL: &str = "talk";

// MARK: - Config / specs

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTransportConfig {
    pub ice_servers: Vec<String>,
}

/// Outgoing send-only track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub kind: MediaKind,
    pub mime_type: &'static str,
    pub clock_rate: u32,
    pub id: String,
    pub stream_id: String,
}

impl TrackSpec {
    /// H.264 preview video.
    pub fn video() -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: MIME_TYPE_H264,
            clock_rate: 90_000,
            id: "video".into(),
            stream_id: "preview-video".into(),
        }
    }

    /// G.711 A-law preview audio.
    pub fn audio() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: MIME_TYPE_PCMA,
            clock_rate: 8_000,
            id: "audio".into(),
            stream_id: "preview-audio".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelSpec {
    pub label: String,
    pub ordered: bool,
    pub max_retransmits: u16,
}

impl DataChannelSpec {
    pub fn talk(max_retransmits: u16) -> Self {
        Self {
            label: TALK_CHANNEL_LABEL.into(),
            ordered: true,
            max_retransmits,
        }
    }
}

// MARK: - Events

/// Coarse ICE / peer-connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications from a peer transport, delivered on the channel handed to
/// [`PeerTransportFactory::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Candidate(IceCandidate),
    IceStateChanged(LinkState),
    ConnectionStateChanged(LinkState),
}

// MARK: - Traits

/// Outgoing media track. Writes take one complete RTP packet.
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> MediaKind;

    async fn write(&self, rtp: &[u8]) -> Result<(), PeerError>;
}

/// One peer connection to the remote client.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, spec: TrackSpec) -> Result<Arc<dyn MediaTrack>, PeerError>;

    /// Creates a data channel; inbound messages arrive on the returned
    /// receiver.
    async fn create_data_channel(
        &self,
        spec: DataChannelSpec,
    ) -> Result<mpsc::Receiver<Bytes>, PeerError>;

    /// Creates the local offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer transports. Injected into every session.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerTransportConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}
