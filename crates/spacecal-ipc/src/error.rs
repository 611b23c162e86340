use thiserror::Error;

/// Errors from the driver IPC transport and the pose segment.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("driver speaks protocol version {driver}, expected {expected}")]
    HandshakeVersion { driver: u32, expected: u32 },

    #[error("malformed {0} envelope")]
    Malformed(&'static str),

    #[error("not connected to driver")]
    NotConnected,
}
