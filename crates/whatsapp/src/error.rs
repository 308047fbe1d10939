use wagate_channels::SessionError;

use crate::state::ConnectionState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required deployment parameter is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A send was attempted while the session is not connected.
    #[error("WhatsApp is not connected (state: {state})")]
    ServiceUnavailable { state: ConnectionState },

    #[error("failed to initialize session: {0}")]
    Initialization(String),

    /// The session dropped while a command was in flight.
    #[error("session disconnected: {0}")]
    TransientDisconnect(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("credential storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("corrupt credential record: {0}")]
    CorruptRecord(#[from] postcard::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotOpen => Self::TransientDisconnect("no session is open".into()),
            SessionError::Disconnected(reason) => Self::TransientDisconnect(reason),
            SessionError::Rejected(reason) => Self::Session(reason),
            SessionError::Other(e) => Self::Session(format!("{e:#}")),
        }
    }
}

impl From<wagate_config::ConfigError> for Error {
    fn from(err: wagate_config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
