#![allow(clippy::wrong_self_convention)]

//! Types describing one archive member on the wire.

use num_enum::{FromPrimitive, IntoPrimitive};
use std::io::prelude::*;
use std::mem;

use crate::result::{invalid_archive, DateTimeRangeError, ZipResult};
use crate::spec::{self, Block};

pub(crate) mod ffi {
    pub const S_IFMT: u32 = 0o0170000;
    pub const S_IFDIR: u32 = 0o0040000;
    pub const S_IFREG: u32 = 0o0100000;
    pub const S_IFLNK: u32 = 0o0120000;
}

/// General-purpose bit flag: entry payload is encrypted. Unsupported.
pub(crate) const FLAG_ENCRYPTED: u16 = 1 << 0;
/// General-purpose bit flag: sizes and CRC live in a trailing data descriptor.
pub(crate) const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// General-purpose bit flag: the file name is UTF-8 rather than CP437.
pub(crate) const FLAG_UTF8: u16 = 1 << 11;

/// Spec version this library writes into version-made-by.
pub const DEFAULT_VERSION: u8 = 46;

/// Originating OS encoded in the upper byte of version-made-by. Decides how
/// external attributes are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum System {
    Dos = 0,
    Unix = 3,
    /// macOS archives report Darwin (19); attribute layout matches Unix.
    Darwin = 19,
    #[num_enum(default)]
    Unknown,
}

impl System {
    /// Whether external attributes carry POSIX file-mode bits.
    pub(crate) fn is_posix(self) -> bool {
        matches!(self, System::Unix | System::Darwin)
    }
}

/// Representation of a moment in time.
///
/// Zip files use an old format from DOS to store timestamps, with a
/// resolution of 2 seconds and a year range clamped to 1980-2107.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
}

impl Default for DateTime {
    /// Constructs an 'default' datetime of 1980-01-01 00:00:00
    fn default() -> DateTime {
        DateTime {
            year: 1980,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }
}

impl DateTime {
    /// Converts an msdos (u16, u16) pair to a DateTime object
    pub const fn from_msdos(datepart: u16, timepart: u16) -> DateTime {
        let seconds = (timepart & 0b0000000000011111) << 1;
        let minutes = (timepart & 0b0000011111100000) >> 5;
        let hours = (timepart & 0b1111100000000000) >> 11;
        let days = datepart & 0b0000000000011111;
        let months = (datepart & 0b0000000111100000) >> 5;
        let years = (datepart & 0b1111111000000000) >> 9;

        DateTime {
            year: years + 1980,
            month: months as u8,
            day: days as u8,
            hour: hours as u8,
            minute: minutes as u8,
            second: seconds as u8,
        }
    }

    /// Constructs a DateTime from a specific date and time
    ///
    /// The bounds are:
    /// * year: [1980, 2107]
    /// * month: [1, 12]
    /// * day: [1, 31]
    /// * hour: [0, 23]
    /// * minute: [0, 59]
    /// * second: [0, 60]
    pub fn from_date_and_time(
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
    ) -> Result<DateTime, DateTimeRangeError> {
        if (1980..=2107).contains(&year)
            && (1..=12).contains(&month)
            && (1..=31).contains(&day)
            && hour <= 23
            && minute <= 59
            && second <= 60
        {
            Ok(DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
            })
        } else {
            Err(DateTimeRangeError)
        }
    }

    /// Gets the time portion of this datetime in the msdos representation
    pub const fn timepart(&self) -> u16 {
        ((self.second as u16) >> 1) | ((self.minute as u16) << 5) | ((self.hour as u16) << 11)
    }

    /// Gets the date portion of this datetime in the msdos representation
    pub const fn datepart(&self) -> u16 {
        (self.day as u16) | ((self.month as u16) << 5) | ((self.year - 1980) << 9)
    }

    /// Get the year. There is no epoch, i.e. 2018 will be returned as 2018.
    pub const fn year(&self) -> u16 {
        self.year
    }

    /// Get the month, where 1 = january and 12 = december
    pub const fn month(&self) -> u8 {
        self.month
    }

    /// Get the day
    pub const fn day(&self) -> u8 {
        self.day
    }

    /// Get the hour
    pub const fn hour(&self) -> u8 {
        self.hour
    }

    /// Get the minute
    pub const fn minute(&self) -> u8 {
        self.minute
    }

    /// Get the second
    pub const fn second(&self) -> u8 {
        self.second
    }
}

#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub(crate) struct ZipCentralEntryBlock {
    pub magic: spec::Magic,
    pub version_made_by: u16,
    pub version_to_extract: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
    pub file_comment_length: u16,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub offset: u32,
}

impl ZipCentralEntryBlock {
    #[inline(always)]
    fn from_le(mut self) -> Self {
        from_le![
            self,
            [
                (magic, spec::Magic),
                (version_made_by, u16),
                (version_to_extract, u16),
                (flags, u16),
                (compression_method, u16),
                (last_mod_time, u16),
                (last_mod_date, u16),
                (crc32, u32),
                (compressed_size, u32),
                (uncompressed_size, u32),
                (file_name_length, u16),
                (extra_field_length, u16),
                (file_comment_length, u16),
                (disk_number, u16),
                (internal_file_attributes, u16),
                (external_file_attributes, u32),
                (offset, u32),
            ]
        ];
        self
    }

    #[inline(always)]
    fn to_le(mut self) -> Self {
        to_le![
            self,
            [
                (magic, spec::Magic),
                (version_made_by, u16),
                (version_to_extract, u16),
                (flags, u16),
                (compression_method, u16),
                (last_mod_time, u16),
                (last_mod_date, u16),
                (crc32, u32),
                (compressed_size, u32),
                (uncompressed_size, u32),
                (file_name_length, u16),
                (extra_field_length, u16),
                (file_comment_length, u16),
                (disk_number, u16),
                (internal_file_attributes, u16),
                (external_file_attributes, u32),
                (offset, u32),
            ]
        ];
        self
    }
}

impl Block for ZipCentralEntryBlock {
    fn interpret(bytes: &[u8]) -> ZipResult<Self> {
        let block = Self::deserialize(bytes).from_le();

        if block.magic != spec::CENTRAL_DIRECTORY_HEADER_SIGNATURE {
            return invalid_archive("Invalid central directory header");
        }

        Ok(block)
    }

    fn encode(self) -> Box<[u8]> {
        self.to_le().serialize()
    }
}

#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub(crate) struct ZipLocalEntryBlock {
    pub magic: spec::Magic,
    pub version_to_extract: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl ZipLocalEntryBlock {
    #[inline(always)]
    fn from_le(mut self) -> Self {
        from_le![
            self,
            [
                (magic, spec::Magic),
                (version_to_extract, u16),
                (flags, u16),
                (compression_method, u16),
                (last_mod_time, u16),
                (last_mod_date, u16),
                (crc32, u32),
                (compressed_size, u32),
                (uncompressed_size, u32),
                (file_name_length, u16),
                (extra_field_length, u16),
            ]
        ];
        self
    }

    #[inline(always)]
    fn to_le(mut self) -> Self {
        to_le![
            self,
            [
                (magic, spec::Magic),
                (version_to_extract, u16),
                (flags, u16),
                (compression_method, u16),
                (last_mod_time, u16),
                (last_mod_date, u16),
                (crc32, u32),
                (compressed_size, u32),
                (uncompressed_size, u32),
                (file_name_length, u16),
                (extra_field_length, u16),
            ]
        ];
        self
    }
}

impl Block for ZipLocalEntryBlock {
    fn interpret(bytes: &[u8]) -> ZipResult<Self> {
        let block = Self::deserialize(bytes).from_le();

        if block.magic != spec::LOCAL_FILE_HEADER_SIGNATURE {
            return invalid_archive("Invalid local file header");
        }

        Ok(block)
    }

    fn encode(self) -> Box<[u8]> {
        self.to_le().serialize()
    }
}

/// Local file header with its variable-length trailers.
#[derive(Debug, Clone)]
pub(crate) struct LocalFileRecord {
    pub block: ZipLocalEntryBlock,
    pub file_name_raw: Box<[u8]>,
    pub extra_field: Box<[u8]>,
}

impl LocalFileRecord {
    pub(crate) const FIXED_SIZE: u64 = mem::size_of::<ZipLocalEntryBlock>() as u64;

    pub(crate) fn parse<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let block = ZipLocalEntryBlock::parse(reader)?;

        let mut file_name_raw = vec![0u8; block.file_name_length as usize];
        reader.read_exact(&mut file_name_raw)?;
        let mut extra_field = vec![0u8; block.extra_field_length as usize];
        reader.read_exact(&mut extra_field)?;

        Ok(Self {
            block,
            file_name_raw: file_name_raw.into_boxed_slice(),
            extra_field: extra_field.into_boxed_slice(),
        })
    }

    pub(crate) fn write<T: Write>(&self, writer: &mut T) -> ZipResult<()> {
        self.block.write(writer)?;
        writer.write_all(&self.file_name_raw)?;
        writer.write_all(&self.extra_field)?;
        Ok(())
    }

    /// Bytes the header occupies on disk, excluding the payload.
    pub(crate) fn stored_size(&self) -> u64 {
        Self::FIXED_SIZE + self.file_name_raw.len() as u64 + self.extra_field.len() as u64
    }
}

/// Central directory entry with its variable-length trailers.
#[derive(Debug, Clone)]
pub(crate) struct CentralDirectoryRecord {
    pub block: ZipCentralEntryBlock,
    pub file_name_raw: Box<[u8]>,
    pub extra_field: Box<[u8]>,
    pub file_comment: Box<[u8]>,
}

impl CentralDirectoryRecord {
    pub(crate) const FIXED_SIZE: u64 = mem::size_of::<ZipCentralEntryBlock>() as u64;

    pub(crate) fn parse<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let block = ZipCentralEntryBlock::parse(reader)?;

        let mut file_name_raw = vec![0u8; block.file_name_length as usize];
        reader.read_exact(&mut file_name_raw)?;
        let mut extra_field = vec![0u8; block.extra_field_length as usize];
        reader.read_exact(&mut extra_field)?;
        let mut file_comment = vec![0u8; block.file_comment_length as usize];
        reader.read_exact(&mut file_comment)?;

        Ok(Self {
            block,
            file_name_raw: file_name_raw.into_boxed_slice(),
            extra_field: extra_field.into_boxed_slice(),
            file_comment: file_comment.into_boxed_slice(),
        })
    }

    pub(crate) fn write<T: Write>(&self, writer: &mut T) -> ZipResult<()> {
        self.block.write(writer)?;
        writer.write_all(&self.file_name_raw)?;
        writer.write_all(&self.extra_field)?;
        writer.write_all(&self.file_comment)?;
        Ok(())
    }

    /// Bytes the record occupies inside the central directory.
    pub(crate) fn stored_size(&self) -> u64 {
        Self::FIXED_SIZE
            + self.file_name_raw.len() as u64
            + self.extra_field.len() as u64
            + self.file_comment.len() as u64
    }
}
