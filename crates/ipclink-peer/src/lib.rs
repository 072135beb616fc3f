//! Session orchestration between a relay client, a device and a WebRTC peer.
//!
//! ```text
//!  relay client ──JSON──▶ Session ──MULTITRANS──▶ device (preview + talk)
//!       ▲                   │
//!       └──offer/candidates─┤
//!                           ▼
//!                    PeerTransport (webrtc-rs) ──RTP──▶ remote browser
//! ```

pub mod error;
pub mod negotiation;
pub mod relay;
pub mod rtc;
pub mod session;
pub mod transport;

mod pump;

pub use error::{PeerError, RelayError, SessionError};
pub use negotiation::{IceCandidate, SessionDescription};
pub use relay::{OpenRequest, Relay, RelayMessage, RelayRequest};
pub use rtc::WebRtcFactory;
pub use session::{Session, SessionOptions};
pub use transport::{
    DataChannelSpec, LinkState, MediaTrack, PeerEvent, PeerTransport, PeerTransportConfig,
    PeerTransportFactory, TrackSpec,
};
