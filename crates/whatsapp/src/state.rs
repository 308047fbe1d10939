use std::fmt;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// Connection lifecycle state. Only the lifecycle manager mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    PairingReady,
    Connected,
    Reconnecting,
    LoggedOut,
    Failed,
}

impl ConnectionState {
    pub const ALL: [Self; 7] = [
        Self::Disconnected,
        Self::Connecting,
        Self::PairingReady,
        Self::Connected,
        Self::Reconnecting,
        Self::LoggedOut,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::PairingReady => "pairing_ready",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::LoggedOut => "logged_out",
            Self::Failed => "failed",
        }
    }

    /// An adapter session is open in this state.
    pub fn has_session(&self) -> bool {
        matches!(self, Self::Connecting | Self::PairingReady | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable view of the lifecycle, published on every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub state: ConnectionState,
    /// Where the pairing image can be fetched, while one exists.
    pub pairing_image_url: Option<String>,
    /// Time of the last state change.
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
}

impl StatusSnapshot {
    pub(crate) fn initial() -> Self {
        Self {
            connected: false,
            state: ConnectionState::Disconnected,
            pairing_image_url: None,
            timestamp: Utc::now(),
            last_error: None,
            reconnect_attempt: 0,
        }
    }
}
