//! Error types that can be emitted from this library

use displaydoc::Display;
use thiserror::Error;

use std::borrow::Cow;
use std::io;

/// Generic result type with ZipError as its error variant
pub type ZipResult<T> = Result<T, ZipError>;

/// Error type for Zip
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum ZipError {
    /// i/o error: {0}
    Io(#[from] io::Error),

    /// unreadable Zip archive: {0}
    InvalidArchive(Cow<'static, str>),

    /// unsupported Zip archive: {0}
    UnsupportedArchive(Cow<'static, str>),

    /// archive is not writable in the current access mode
    UnwritableArchive,

    /// entry path is missing or not representable
    InvalidEntryPath,

    /// compression method {0} is not supported
    InvalidCompressionMethod(u16),

    /// CRC-32 mismatch: expected {expected:#010x}, computed {actual:#010x}
    InvalidCrc32 {
        /// checksum recorded in the archive
        expected: u32,
        /// checksum computed over the extracted bytes
        actual: u32,
    },

    /// operation was cancelled by the caller
    Cancelled,

    /// buffer size {0} is not usable for streaming
    InvalidBufferSize(usize),

    /// a size, offset or entry count does not fit the destination field
    ValueOutOfBounds,

    /// compressed data stream is corrupt
    CorruptedData,

    /// compression stream could not be initialized
    InvalidStream,
}

pub(crate) fn invalid_archive<T, M: Into<Cow<'static, str>>>(message: M) -> ZipResult<T> {
    Err(ZipError::InvalidArchive(message.into()))
}

impl From<ZipError> for io::Error {
    fn from(err: ZipError) -> io::Error {
        let kind = match &err {
            ZipError::Io(err) => err.kind(),
            ZipError::InvalidArchive(_) | ZipError::CorruptedData => io::ErrorKind::InvalidData,
            ZipError::UnsupportedArchive(_) => io::ErrorKind::Unsupported,
            ZipError::UnwritableArchive => io::ErrorKind::PermissionDenied,
            ZipError::Cancelled => io::ErrorKind::Interrupted,
            ZipError::InvalidCrc32 { .. } => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::InvalidInput,
        };

        io::Error::new(kind, err)
    }
}

/// Error type for time parsing
#[derive(Debug)]
pub struct DateTimeRangeError;

impl std::fmt::Display for DateTimeRangeError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "a date could not be represented within the bounds the MS-DOS date range (1980-2107)"
        )
    }
}

impl std::error::Error for DateTimeRangeError {}
