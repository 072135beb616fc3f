use serde::{Deserialize, Serialize};

/// Default TCP port of the camera's MULTITRANS control/stream service.
pub const DEFAULT_DEVICE_PORT: u16 = 554;

/// Default listen port of the relay server.
pub const DEFAULT_LISTEN_PORT: u16 = 8957;

// MARK: - MediaKind

/// Kind of media carried by an interleaved channel / outgoing track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Interleaved channel the device uses for this media kind in a preview
    /// stream.
    pub fn channel(self) -> u8 {
        match self {
            Self::Video => 0,
            Self::Audio => 1,
        }
    }

    /// Maps a preview interleaved channel back to its media kind.
    pub fn from_channel(channel: u8) -> Option<Self> {
        match channel {
            0 => Some(Self::Video),
            1 => Some(Self::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

// MARK: - Phase

/// Lifecycle phase of one relay session.
///
/// ```text
/// Idle → Opening → Negotiating → Connected → Closed
///           └──────────┴────────────┴──────→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Opening,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl Phase {
    /// True once an Open has completed and negotiation messages are accepted.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }

    /// True for `Closed` and `Failed`; no further transitions happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Appends the default device port when `address` carries none. A bare IPv6
/// address is bracketed first.
pub fn with_default_port(address: &str) -> String {
    let has_port = match address.rsplit_once(':') {
        // `[v6]:port` or `host:port`; in a bare IPv6 address the last group is not a port.
        Some((host, port)) => {
            let host_ok = if host.starts_with('[') {
                host.ends_with(']')
            } else {
                !host.is_empty() && !host.contains(':')
            };
            host_ok && port.parse::<u16>().is_ok()
        }
        None => false,
    };
    if has_port {
        address.to_owned()
    } else if address.contains(':') && !address.starts_with('[') {
        format!("[{}]:{}", address, DEFAULT_DEVICE_PORT)
    } else {
        format!("{}:{}", address, DEFAULT_DEVICE_PORT)
    }
}
