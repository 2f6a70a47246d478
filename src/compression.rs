//! Possible ZIP compression methods.

use crate::result::{ZipError, ZipResult};
use std::fmt;

/// Identifies the storage format of an entry payload.
///
/// Only passthrough storage and DEFLATE are supported; every other method
/// code is rejected when an entry is written or extracted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// Store the file as is
    Stored,
    /// Compress the file using Deflate
    #[default]
    Deflated,
}

impl CompressionMethod {
    pub(crate) const STORED: u16 = 0;
    pub(crate) const DEFLATED: u16 = 8;

    pub(crate) fn from_u16(val: u16) -> ZipResult<Self> {
        match val {
            Self::STORED => Ok(CompressionMethod::Stored),
            Self::DEFLATED => Ok(CompressionMethod::Deflated),
            other => Err(ZipError::InvalidCompressionMethod(other)),
        }
    }

    pub(crate) const fn to_u16(self) -> u16 {
        match self {
            CompressionMethod::Stored => Self::STORED,
            CompressionMethod::Deflated => Self::DEFLATED,
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Display the actual name of the enum variant
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn method_codes() {
        assert_eq!(CompressionMethod::Stored.to_u16(), 0);
        assert_eq!(CompressionMethod::Deflated.to_u16(), 8);
        assert_eq!(
            CompressionMethod::from_u16(8).unwrap(),
            CompressionMethod::Deflated
        );
        assert!(matches!(
            CompressionMethod::from_u16(12),
            Err(ZipError::InvalidCompressionMethod(12))
        ));
    }
}
