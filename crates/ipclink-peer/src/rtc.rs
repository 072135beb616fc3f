//! Peer transport backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ipclink_core::MediaKind;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::PeerError;
use crate::negotiation::{IceCandidate, SessionDescription};
use crate::transport::{
    DataChannelSpec, LinkState, MediaTrack, PeerEvent, PeerTransport, PeerTransportConfig,
    PeerTransportFactory, TrackSpec,
};

/// Queue depth between a data channel callback and its consumer.
const DATA_CHANNEL_DEPTH: usize = 64;

// ── Factory ───────────────────────────────────────────────────────────────────

/// Builds peer connections from one shared webrtc-rs API object (default
/// codecs + default interceptors).
pub struct WebRtcFactory {
    api: API,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcFactory {
    async fn create(
        &self,
        config: &PeerTransportConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers,
                    ..Default::default()
                })
                .await?,
        );
        register_event_handlers(&pc, events);
        debug!("Created peer connection");

        Ok(Arc::new(WebRtcTransport {
            pc,
            data_channels: Mutex::new(Vec::new()),
        }))
    }
}

fn register_event_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                trace!("ICE gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::Candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!("Failed to serialise local ICE candidate: {}", e),
            }
        })
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let _ = tx.send(PeerEvent::IceStateChanged(ice_link_state(state)));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = tx.send(PeerEvent::ConnectionStateChanged(peer_link_state(state)));
        Box::pin(async {})
    }));
}

fn ice_link_state(state: RTCIceConnectionState) -> LinkState {
    match state {
        RTCIceConnectionState::Checking => LinkState::Checking,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => LinkState::Connected,
        RTCIceConnectionState::Disconnected => LinkState::Disconnected,
        RTCIceConnectionState::Failed => LinkState::Failed,
        RTCIceConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

fn peer_link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Checking,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    data_channels: Mutex<Vec<Arc<RTCDataChannel>>>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, spec: TrackSpec) -> Result<Arc<dyn MediaTrack>, PeerError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: spec.mime_type.to_owned(),
                clock_rate: spec.clock_rate,
                ..Default::default()
            },
            spec.id.clone(),
            spec.stream_id.clone(),
        ));

        self.pc
            .add_transceiver_from_track(
                Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        debug!("Added send-only {} track {} ({})", spec.kind, spec.id, spec.mime_type);

        Ok(Arc::new(WebRtcTrack {
            kind: spec.kind,
            track,
        }))
    }

    async fn create_data_channel(
        &self,
        spec: DataChannelSpec,
    ) -> Result<mpsc::Receiver<Bytes>, PeerError> {
        let dc = self
            .pc
            .create_data_channel(
                &spec.label,
                Some(RTCDataChannelInit {
                    ordered: Some(spec.ordered),
                    max_retransmits: Some(spec.max_retransmits),
                    ..Default::default()
                }),
            )
            .await?;

        let (tx, rx) = mpsc::channel(DATA_CHANNEL_DEPTH);
        let label = spec.label.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            let label = label.clone();
            Box::pin(async move {
                if tx.send(msg.data).await.is_err() {
                    trace!("Data channel {} message dropped: no consumer", label);
                }
            })
        }));

        let label = spec.label.clone();
        dc.on_open(Box::new(move || {
            info!("Data channel {} open", label);
            Box::pin(async {})
        }));

        self.data_channels.lock().await.push(dc);
        debug!(
            "Created data channel {} (ordered={}, max_retransmits={})",
            spec.label, spec.ordered, spec.max_retransmits
        );
        Ok(rx)
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription {
            sdp_type: offer.sdp_type.to_string(),
            sdp: offer.sdp,
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let remote = match desc.sdp_type.as_str() {
            "answer" => RTCSessionDescription::answer(desc.sdp)?,
            "offer" => RTCSessionDescription::offer(desc.sdp)?,
            "pranswer" => RTCSessionDescription::pranswer(desc.sdp)?,
            other => return Err(PeerError::UnsupportedSdpType(other.to_owned())),
        };
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.data_channels.lock().await.clear();
        self.pc.close().await?;
        Ok(())
    }
}

// ── Track ─────────────────────────────────────────────────────────────────────

struct WebRtcTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl MediaTrack for WebRtcTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn write(&self, rtp: &[u8]) -> Result<(), PeerError> {
        self.track.write(rtp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping() {
        assert_eq!(ice_link_state(RTCIceConnectionState::Completed), LinkState::Connected);
        assert_eq!(ice_link_state(RTCIceConnectionState::Failed), LinkState::Failed);
        assert_eq!(ice_link_state(RTCIceConnectionState::New), LinkState::New);
        assert_eq!(peer_link_state(RTCPeerConnectionState::Connecting), LinkState::Checking);
        assert_eq!(peer_link_state(RTCPeerConnectionState::Failed), LinkState::Failed);
    }

    #[tokio::test]
    async fn offer_carries_sendonly_tracks_and_talk_channel() {
        let factory = WebRtcFactory::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&PeerTransportConfig { ice_servers: vec![] }, tx)
            .await
            .unwrap();

        let video = transport.add_track(TrackSpec::video()).await.unwrap();
        let audio = transport.add_track(TrackSpec::audio()).await.unwrap();
        assert_eq!(video.kind(), MediaKind::Video);
        assert_eq!(audio.kind(), MediaKind::Audio);
        let _talk = transport
            .create_data_channel(DataChannelSpec::talk(16))
            .await
            .unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, "offer");
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=application"));
        assert!(offer.sdp.contains("a=sendonly"));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_remote_description_type_is_rejected() {
        let factory = WebRtcFactory::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&PeerTransportConfig { ice_servers: vec![] }, tx)
            .await
            .unwrap();
        let err = transport
            .set_remote_description(SessionDescription {
                sdp_type: "bogus".into(),
                sdp: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::UnsupportedSdpType(_)));
        transport.close().await.unwrap();
    }
}
