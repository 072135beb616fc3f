use ipclink_device::DeviceError;
use thiserror::Error;

// MARK: - PeerError

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("Unsupported session description type {0:?}")]
    UnsupportedSdpType(String),

    #[error("Peer transport closed")]
    Closed,

    #[error("Peer transport error: {0}")]
    Other(String),
}

// MARK: - RelayError

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay closed")]
    Closed,
}

// MARK: - SessionError

/// Orchestrator errors. The `Display` text is what the remote client sees in
/// an error result.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("already open")]
    AlreadyOpen,

    #[error("not open")]
    NotOpen,

    #[error("invalid request")]
    InvalidRequest,

    #[error("session closed")]
    Closed,

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("device: {0}")]
    Device(#[from] DeviceError),

    #[error("peer transport: {0}")]
    Peer(#[from] PeerError),

    #[error("relay: {0}")]
    Relay(#[from] RelayError),

    #[error("timed out: {0}")]
    Timeout(&'static str),
}
