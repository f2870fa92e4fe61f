use thiserror::Error;
use transport_bus::BusError;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// An operation was invoked in a state that does not allow it.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),
    #[error("timed out waiting for {outstanding} connection(s) on channel {channel_id}")]
    ConnectTimeout {
        channel_id: String,
        outstanding: usize,
    },
    #[error("client {client_uid} link request to channel {channel_id} timed out")]
    LinkTimeout {
        client_uid: String,
        channel_id: String,
    },
    /// The back channel refused a link; the reason is passed through verbatim.
    #[error("{0}")]
    RemoteRejection(String),
    #[error("unrecognized signal: {0}")]
    UnrecognizedSignal(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("codec error: {0}")]
    Codec(String),
}

impl ChannelError {
    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        ChannelError::ProtocolMisuse(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ChannelError::ConnectTimeout { .. } | ChannelError::LinkTimeout { .. }
        )
    }

    pub fn is_misuse(&self) -> bool {
        matches!(self, ChannelError::ProtocolMisuse(_))
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Codec(err.to_string())
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;
