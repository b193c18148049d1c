use thiserror::Error;

/// Main error type for KNXnet/IP operations
#[derive(Error, Debug)]
pub enum KnxError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("timeout establishing secure session with {0}")]
    SessionTimeout(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("received secure packet with sequence {received} < expected {expected}")]
    ReplayDetected { received: u64, expected: u64 },

    #[error("secure session mismatch: received ID {received}, expected {expected}")]
    SessionMismatch { received: u16, expected: u16 },

    #[error("invalid frame: {0}")]
    FrameMalformed(String),

    #[error("keyring signature mismatch (invalid keyring or wrong password)")]
    KeyringSignatureMismatch,

    #[error("unsupported service type 0x{0:04x}")]
    UnsupportedService(u16),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("timeout waiting for response")]
    Timeout,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for KNXnet/IP operations
pub type KnxResult<T> = Result<T, KnxError>;
