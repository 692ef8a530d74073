use std::time::Duration;
use thiserror::Error;

/// Broad classes of [VncError], used to decide what a failure means for the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket failures, always terminal
    Transport,
    /// The server sent something we cannot decode, always terminal
    Protocol,
    /// A single operation could not get a resource, the caller decides
    Resource,
    /// A bug in the caller or in the engine
    Invariant,
    /// Misconfiguration or use after close
    Usage,
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum VncError {
    #[error("Auth is required but no authenticator provided")]
    NoAuthenticator,
    #[error("No vnc encoding selected")]
    NoEncoding,
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("Server refused the connection: {0}")]
    ServerRefused(String),
    #[error("None of the offered security types is supported: {0:?}")]
    NoSecurityType(Vec<u8>),
    #[error("Unknown pixel format")]
    WrongPixelFormat,
    #[error("Invalid protocol version string {0:?}")]
    WrongVersion(String),
    #[error("Unknown server message type {0}")]
    WrongServerMessage(u8),
    #[error("Unknown encoding type {0}")]
    UnknownEncoding(i32),
    #[error("Malformed server data: {0}")]
    Malformed(String),
    #[error("Zlib stream error: {0}")]
    Inflate(String),
    #[error("Buffer pool exhausted")]
    PoolExhausted,
    #[error("Buffer slot {0} released but not active in this pool")]
    BufferNotActive(usize),
    #[error("Server accepted the connection but sent nothing within {0:?}")]
    ServerSilent(Duration),
    #[error("Client is not running")]
    ClientNotRunning,
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Vnc Error with message: {0}")]
    Custom(String),
}

impl VncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VncError::IoError(_) | VncError::ServerSilent(_) => ErrorKind::Transport,
            VncError::AuthFailed(_)
            | VncError::ServerRefused(_)
            | VncError::NoSecurityType(_)
            | VncError::WrongPixelFormat
            | VncError::WrongVersion(_)
            | VncError::WrongServerMessage(_)
            | VncError::UnknownEncoding(_)
            | VncError::Malformed(_)
            | VncError::Inflate(_) => ErrorKind::Protocol,
            VncError::PoolExhausted => ErrorKind::Resource,
            VncError::BufferNotActive(_) => ErrorKind::Invariant,
            VncError::NoAuthenticator
            | VncError::NoEncoding
            | VncError::ClientNotRunning
            | VncError::Custom(_) => ErrorKind::Usage,
        }
    }

    /// Whether the connection must be torn down after this error
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Protocol)
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        VncError::Malformed(msg.into())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for VncError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        VncError::ClientNotRunning
    }
}
