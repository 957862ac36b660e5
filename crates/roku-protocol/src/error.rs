//! Protocol error type shared by the codec, handshake, and message layers.

use crate::version::ProtocolVersion;

/// Errors raised while talking to the debug target.
///
/// Transport and protocol variants are fatal to the session; structured
/// errors reported *by* the target (`err_code != OK`) are not represented
/// here; they arrive as ordinary decoded updates.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The target closed the connection mid-message.
    #[error("unexpected EOF reading debug target stream")]
    UnexpectedEof,

    /// The connection failed before the full message was written.
    #[error("unexpected EOF writing debug target stream")]
    ShortWrite,

    #[error("I/O error on debug target stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic number from debug target: {0:#018x}")]
    BadMagic(u64),

    /// The major version is outside the supported set.
    #[error("unsupported protocol version: {0} (supported: {supported})", supported = crate::version::supported_majors_str())]
    UnsupportedVersion(ProtocolVersion),

    /// A version component is outside its valid range.
    #[error("invalid protocol version from target: {0}")]
    InvalidVersion(ProtocolVersion),

    #[error("unknown error code from target: {0}")]
    UnknownErrCode(u32),

    #[error("unknown update type from target: {0}")]
    UnknownUpdateType(u32),

    #[error("unknown command code in request stream: {0}")]
    UnknownCommand(u32),

    #[error("unknown variable or key type from target: {0}")]
    UnknownVariableType(u8),

    #[error("unknown thread stop reason from target: {0}")]
    UnknownStopReason(u32),

    #[error("unknown step type in request stream: {0}")]
    UnknownStepType(u8),

    /// The decoder consumed more bytes than the target declared.
    #[error("packet length mismatch: declared {declared}, consumed {consumed}")]
    PacketLengthMismatch { declared: u32, consumed: u64 },

    /// An encoder wrote a different number of bytes than it declared.
    #[error("packet size mismatch: declared {declared}, written {written}")]
    PacketSizeMismatch { declared: u32, written: u64 },

    /// A response arrived for a request id with no pending entry.
    #[error("response received for unknown request id {0}")]
    UnknownRequestId(u32),

    #[error("invalid UTF-8 in string from target")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The target flagged case-sensitive keys on a non-container variable.
    #[error("case-sensitive key flag set on non-container variable")]
    CaseSensitivityOnScalar,

    /// A value payload was present for a type that never carries one.
    #[error("variable of type {0} should not carry a value")]
    UnexpectedValue(&'static str),
}

impl ProtocolError {
    /// Fold the `UnexpectedEof` I/O kind into the dedicated variant so
    /// short reads are reported uniformly.
    pub(crate) fn from_read_error(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        } else {
            ProtocolError::Io(err)
        }
    }

    /// Fold the `WriteZero` I/O kind into the dedicated variant so short
    /// writes are reported uniformly.
    pub(crate) fn from_write_error(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WriteZero {
            ProtocolError::ShortWrite
        } else {
            ProtocolError::Io(err)
        }
    }
}
