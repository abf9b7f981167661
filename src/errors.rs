use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Operation timed out")]
    TransportTimeout,
    #[error("Network error: {0}")]
    Io(#[source] io::Error),
    #[error("Unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEndOfBuffer { needed: usize, remaining: usize },
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("Decompressed size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Split response aborted: {0}")]
    ReassemblyAborted(String),
    #[error("Decompression failed: {0}")]
    Decompression(#[source] io::Error),
    #[error("Unexpected response type {0:#04x}")]
    UnexpectedResponse(u8),
    #[error("Failed to resolve host: {0}")]
    Resolve(String),
    #[error("Transport is not connected")]
    NotConnected,
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TransportTimeout)
    }

    /// Data arrived in full but failed verification after decompression.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::ChecksumMismatch { .. } | Error::SizeMismatch { .. }
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::TransportTimeout,
            _ => Error::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
