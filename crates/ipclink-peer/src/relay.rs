//! Relay protocol: one JSON object per message between the remote client and
//! a session.
//!
//! ```text
//! → {"userData":"1","open":{"address":"192.168.20.2","username":"admin","password":"…","enableTalk":true}}
//! ← {"userData":"1","sessionDescription":{"type":"offer","sdp":"v=0…"}}
//! ← {"candidate":{"candidate":"candidate:…","sdpMid":"0","sdpMLineIndex":0}}
//! → {"userData":"2","sessionDescription":{"type":"answer","sdp":"v=0…"}}
//! ← {"userData":"2","success":true}
//! ← {"userData":"3","success":false,"error":{"message":"not open"}}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, SessionError};
use crate::negotiation::{IceCandidate, SessionDescription};

// MARK: - Relay trait

/// Message transport between one remote client and its session.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Sends one text message.
    async fn send(&self, text: String) -> Result<(), RelayError>;

    /// Closes the relay from the session side. The owner of the relay
    /// connection then reports the disconnect back to the session.
    async fn close(&self);
}

// MARK: - Wire message

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRequest {
    pub address: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "enableTalk")]
    pub enable_talk: bool,
}

impl std::fmt::Debug for OpenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRequest")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"***")
            .field("enable_talk", &self.enable_talk)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayErrorBody {
    pub message: String,
}

/// Every field is optional on the wire; absent fields are omitted on output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open: Option<OpenRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_description: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RelayErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Validated inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRequest {
    Open(OpenRequest),
    SessionDescription(SessionDescription),
    Candidate(IceCandidate),
}

impl RelayMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Best-effort `userData` recovery from text that failed to parse as a
    /// relay message.
    pub fn recover_user_data(text: &str) -> Option<String> {
        let value: Value = serde_json::from_str(text).ok()?;
        value.get("userData")?.as_str().map(str::to_owned)
    }

    /// Extracts the single request this message carries. `Ok(None)` when no
    /// request field is present; more than one is an invalid request.
    pub fn request(&self) -> Result<Option<RelayRequest>, SessionError> {
        let mut found = Vec::with_capacity(1);
        if let Some(open) = &self.open {
            found.push(RelayRequest::Open(open.clone()));
        }
        if let Some(desc) = &self.session_description {
            found.push(RelayRequest::SessionDescription(desc.clone()));
        }
        if let Some(c) = &self.candidate {
            found.push(RelayRequest::Candidate(c.clone()));
        }
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            _ => Err(SessionError::InvalidRequest),
        }
    }

    // ── Outbound constructors ───────────────────────────────────────────────

    pub fn offer(desc: SessionDescription, user_data: Option<String>) -> Self {
        Self {
            user_data,
            session_description: Some(desc),
            ..Default::default()
        }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Self {
            candidate: Some(candidate),
            ..Default::default()
        }
    }

    pub fn success(user_data: Option<String>) -> Self {
        Self {
            user_data,
            success: Some(true),
            ..Default::default()
        }
    }

    pub fn failure(user_data: Option<String>, message: impl Into<String>) -> Self {
        Self {
            user_data,
            success: Some(false),
            error: Some(RelayErrorBody {
                message: message.into(),
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_open_request() {
        let msg = RelayMessage::parse(
            r#"{"userData":"42","open":{"address":"192.168.20.2","username":"admin","password":"pw","enableTalk":true}}"#,
        )
        .unwrap();
        assert_eq!(msg.user_data.as_deref(), Some("42"));
        match msg.request().unwrap() {
            Some(RelayRequest::Open(open)) => {
                assert_eq!(open.address, "192.168.20.2");
                assert!(open.enable_talk);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn open_defaults_missing_fields() {
        let msg = RelayMessage::parse(r#"{"open":{"address":"cam"}}"#).unwrap();
        let Some(RelayRequest::Open(open)) = msg.request().unwrap() else {
            panic!("expected open");
        };
        assert!(!open.enable_talk);
        assert!(open.password.is_empty());
    }

    #[test]
    fn more_than_one_request_is_invalid() {
        let msg = RelayMessage::parse(
            r#"{"open":{"address":"cam"},"candidate":{"candidate":"c"}}"#,
        )
        .unwrap();
        assert!(matches!(msg.request(), Err(SessionError::InvalidRequest)));
    }

    #[test]
    fn empty_message_carries_no_request() {
        let msg = RelayMessage::parse(r#"{"userData":"x"}"#).unwrap();
        assert_eq!(msg.request().unwrap(), None);
    }

    #[test]
    fn outbound_omits_absent_fields() {
        let ok = RelayMessage::success(Some("7".into())).encode().unwrap();
        assert_eq!(ok, r#"{"userData":"7","success":true}"#);

        let err = RelayMessage::failure(None, "not open").encode().unwrap();
        assert_eq!(err, r#"{"error":{"message":"not open"},"success":false}"#);

        let offer = RelayMessage::offer(SessionDescription::offer("v=0"), Some("1".into()))
            .encode()
            .unwrap();
        assert_eq!(
            offer,
            r#"{"userData":"1","sessionDescription":{"type":"offer","sdp":"v=0"}}"#
        );
    }

    #[test]
    fn user_data_recovery() {
        assert_eq!(
            RelayMessage::recover_user_data(r#"{"userData":"u1","open":5}"#).as_deref(),
            Some("u1")
        );
        assert_eq!(RelayMessage::recover_user_data("{not valid}"), None);
    }

    #[test]
    fn open_debug_hides_password() {
        let open = OpenRequest {
            password: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{open:?}").contains("hunter2"));
    }
}
