//! Session-level error type.

use std::time::Duration;

use roku_protocol::ProtocolError;

/// Errors raised by the debugger client.
///
/// `Protocol` and `Io` variants are fatal to the session; the others are
/// user or logic errors surfaced to the front-end.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("could not connect to {host}:{port} within {budget:?}")]
    ConnectTimeout { host: String, port: u16, budget: Duration },

    #[error("unknown stack reference id {0}")]
    UnknownStackRefId(u32),

    #[error("request already has id {0} (requests must not be resent)")]
    RequestAlreadySent(u32),

    #[error("client is shut down")]
    ShutDown,
}

impl ClientError {
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        ClientError::Protocol(ProtocolError::Io(err))
    }
}
