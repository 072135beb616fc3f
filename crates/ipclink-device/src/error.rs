use ipclink_mtsp::FrameError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {address} after {timeout_ms} ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Authentication failed: status {status} {reason}")]
    AuthenticationFailed { status: u16, reason: String },

    #[error("Device replied status {status} {reason}")]
    Status { status: u16, reason: String },

    #[error("Device rejected request: error_code {error_code}")]
    Rejected { error_code: i64 },

    #[error("Device response carries no session_id")]
    MissingSessionId,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RTP encoding failed: {0}")]
    Rtp(#[from] webrtc::util::Error),
}
