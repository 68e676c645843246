//! Error taxonomy for device operations
//!
//! Every fallible call returns [`DeviceError`] to its immediate caller.
//! Nothing is retried internally except the "recheck after wake" loop of
//! blocking waits.

use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors returned by device operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Another opener holds the device (exclusive or owner conflict)
    #[error("device or resource busy")]
    Busy,

    /// A nonblocking call would otherwise suspend
    #[error("operation would block")]
    WouldBlock,

    /// A blocking wait was aborted by a signal
    #[error("interrupted while waiting")]
    Interrupted,

    /// Store growth, channel buffer or keyed entry could not be allocated
    #[error("out of memory")]
    OutOfMemory,

    /// A file position or transfer range is not addressable
    #[error("bad address")]
    InvalidAddress,

    /// Channel is empty and no writers remain
    #[error("end of stream")]
    EndOfStream,

    /// Bad seek target or missing client key
    #[error("invalid argument")]
    InvalidArgument,

    /// Registry lookup found nothing
    #[error("no such device")]
    NoSuchDevice,

    /// Released handle, or an access the open mode does not allow
    #[error("bad file handle")]
    BadHandle,
}

impl DeviceError {
    /// Negative errno as a character-device entry point would return it.
    ///
    /// `EndOfStream` maps to 0, the classic "read returned nothing" result.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Busy => -16,           // EBUSY
            Self::WouldBlock => -11,     // EAGAIN
            Self::Interrupted => -4,     // EINTR
            Self::OutOfMemory => -12,    // ENOMEM
            Self::InvalidAddress => -14, // EFAULT
            Self::EndOfStream => 0,
            Self::InvalidArgument => -22, // EINVAL
            Self::NoSuchDevice => -19,    // ENODEV
            Self::BadHandle => -9,        // EBADF
        }
    }
}

impl From<std::collections::TryReserveError> for DeviceError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<DeviceError> for io::Error {
    fn from(e: DeviceError) -> Self {
        let kind = match e {
            DeviceError::Busy => io::ErrorKind::Other,
            DeviceError::WouldBlock => io::ErrorKind::WouldBlock,
            DeviceError::Interrupted => io::ErrorKind::Interrupted,
            DeviceError::OutOfMemory => io::ErrorKind::OutOfMemory,
            DeviceError::InvalidAddress | DeviceError::InvalidArgument => {
                io::ErrorKind::InvalidInput
            }
            DeviceError::EndOfStream => io::ErrorKind::UnexpectedEof,
            DeviceError::NoSuchDevice => io::ErrorKind::NotFound,
            DeviceError::BadHandle => io::ErrorKind::PermissionDenied,
        };
        io::Error::new(kind, e)
    }
}

impl embedded_io::Error for DeviceError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Self::Interrupted => embedded_io::ErrorKind::Interrupted,
            Self::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            Self::InvalidAddress | Self::InvalidArgument => embedded_io::ErrorKind::InvalidInput,
            Self::NoSuchDevice => embedded_io::ErrorKind::NotFound,
            Self::BadHandle => embedded_io::ErrorKind::PermissionDenied,
            Self::Busy | Self::WouldBlock | Self::EndOfStream => embedded_io::ErrorKind::Other,
        }
    }
}
