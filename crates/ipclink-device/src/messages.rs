//! JSON bodies carried by MULTITRANS control requests.
//!
//! ```text
//! request   {"type":"request","seq":<n>,"params":{"method":"get","talk":{"mode":"aec"}}}
//! response  {"type":"response","seq":<n>,"params":{"error_code":0,"session_id":"..."}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct ControlRequest<P> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub seq: u32,
    pub params: P,
}

impl<P: Serialize> ControlRequest<P> {
    pub(crate) fn new(seq: u32, params: P) -> Self {
        Self {
            kind: "request",
            seq,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PreviewParams {
    pub method: &'static str,
    pub preview: PreviewSpec,
}

#[derive(Debug, Serialize)]
pub(crate) struct PreviewSpec {
    pub channels: Vec<u8>,
    pub resolutions: Vec<&'static str>,
}

impl Default for PreviewParams {
    fn default() -> Self {
        Self {
            method: "get",
            preview: PreviewSpec {
                channels: vec![0],
                resolutions: vec!["HD"],
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TalkParams {
    pub method: &'static str,
    pub talk: TalkSpec,
}

#[derive(Debug, Serialize)]
pub(crate) struct TalkSpec {
    pub mode: &'static str,
}

impl Default for TalkParams {
    fn default() -> Self {
        Self {
            method: "get",
            talk: TalkSpec { mode: "aec" },
        }
    }
}

/// `"stop":"null"` is a string on the wire, not JSON null.
#[derive(Debug, Serialize)]
pub(crate) struct StopParams {
    pub method: &'static str,
    pub stop: &'static str,
}

impl Default for StopParams {
    fn default() -> Self {
        Self {
            method: "do",
            stop: "null",
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct ControlResponse {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub params: SessionParams,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SessionParams {
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Everything else the device reports (codec/channel metadata).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of a successful `start_preview`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSession {
    pub session_id: String,
    pub error_code: i64,
    /// Per-channel audio/video metadata as reported by the device.
    pub media: Map<String, Value>,
}
