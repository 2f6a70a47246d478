#![allow(clippy::wrong_self_convention)]
#![macro_use]

//! Fixed-layout ZIP records and the backward end-of-central-directory scan.
//!
//! Every record is described by a `#[repr(packed)]` block struct implementing
//! [`Block`], so a generic "read record at offset" is written once instead of
//! per record type. All multi-byte integers are little-endian on the wire.

use crate::result::{invalid_archive, ZipResult};
use memchr::memmem::FinderRev;
use std::io;
use std::io::prelude::*;
use std::mem;

pub type Magic = u32;

pub const LOCAL_FILE_HEADER_SIGNATURE: Magic = 0x04034b50;
pub const CENTRAL_DIRECTORY_HEADER_SIGNATURE: Magic = 0x02014b50;
pub(crate) const CENTRAL_DIRECTORY_END_SIGNATURE: Magic = 0x06054b50;
pub const ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE: Magic = 0x06064b50;
pub(crate) const ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE: Magic = 0x07064b50;
pub(crate) const DATA_DESCRIPTOR_SIGNATURE: Magic = 0x08074b50;

/// 32-bit fields at or above this value defer to the ZIP64 extended field.
pub const ZIP64_BYTES_THR: u64 = u32::MAX as u64;
/// 16-bit entry counts at or above this value defer to the ZIP64 EOCD record.
pub const ZIP64_ENTRY_THR: usize = u16::MAX as usize;

/// Version needed to extract an entry that uses ZIP64 extensions.
pub const ZIP64_VERSION_NEEDED: u16 = 45;
/// Version needed to extract a classic entry.
pub const DEFAULT_VERSION_NEEDED: u16 = 20;

pub trait Block: Sized + Copy {
    fn interpret(bytes: &[u8]) -> ZipResult<Self>;

    fn deserialize(block: &[u8]) -> Self {
        assert_eq!(block.len(), mem::size_of::<Self>());
        let block_ptr: *const Self = block.as_ptr().cast();
        unsafe { block_ptr.read_unaligned() }
    }

    fn parse<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let mut block = vec![0u8; mem::size_of::<Self>()];
        reader.read_exact(&mut block)?;
        Self::interpret(&block)
    }

    fn encode(self) -> Box<[u8]>;

    fn serialize(self) -> Box<[u8]> {
        let mut out_block = vec![0u8; mem::size_of::<Self>()];
        let out_view: &mut [u8] = out_block.as_mut();
        let out_ptr: *mut Self = out_view.as_mut_ptr().cast();
        unsafe {
            out_ptr.write_unaligned(self);
        }
        out_block.into_boxed_slice()
    }

    fn write<T: Write>(self, writer: &mut T) -> ZipResult<()> {
        let block = self.encode();
        writer.write_all(&block)?;
        Ok(())
    }
}

/// Convert all the fields of a struct *from* little-endian representations.
macro_rules! from_le {
    ($obj:ident, $field:ident, $type:ty) => {
        $obj.$field = <$type>::from_le($obj.$field);
    };
    ($obj:ident, [($field:ident, $type:ty) $(,)?]) => {
        from_le![$obj, $field, $type];
    };
    ($obj:ident, [($field:ident, $type:ty), $($rest:tt),+ $(,)?]) => {
        from_le![$obj, $field, $type];
        from_le!($obj, [$($rest),+]);
    };
}

/// Convert all the fields of a struct *into* little-endian representations.
macro_rules! to_le {
    ($obj:ident, $field:ident, $type:ty) => {
        $obj.$field = <$type>::to_le($obj.$field);
    };
    ($obj:ident, [($field:ident, $type:ty) $(,)?]) => {
        to_le![$obj, $field, $type];
    };
    ($obj:ident, [($field:ident, $type:ty), $($rest:tt),+ $(,)?]) => {
        to_le![$obj, $field, $type];
        to_le!($obj, [$($rest),+]);
    };
}

#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub(crate) struct EndOfCentralDirBlock {
    pub magic: Magic,
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub number_of_files_on_this_disk: u16,
    pub number_of_files: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub zip_file_comment_length: u16,
}

impl EndOfCentralDirBlock {
    #[inline(always)]
    fn from_le(mut self) -> Self {
        from_le![
            self,
            [
                (magic, Magic),
                (disk_number, u16),
                (disk_with_central_directory, u16),
                (number_of_files_on_this_disk, u16),
                (number_of_files, u16),
                (central_directory_size, u32),
                (central_directory_offset, u32),
                (zip_file_comment_length, u16)
            ]
        ];
        self
    }

    #[inline(always)]
    fn to_le(mut self) -> Self {
        to_le![
            self,
            [
                (magic, Magic),
                (disk_number, u16),
                (disk_with_central_directory, u16),
                (number_of_files_on_this_disk, u16),
                (number_of_files, u16),
                (central_directory_size, u32),
                (central_directory_offset, u32),
                (zip_file_comment_length, u16)
            ]
        ];
        self
    }
}

impl Block for EndOfCentralDirBlock {
    fn interpret(bytes: &[u8]) -> ZipResult<Self> {
        let block = Self::deserialize(bytes).from_le();

        if block.magic != CENTRAL_DIRECTORY_END_SIGNATURE {
            return invalid_archive("Invalid end of central directory signature");
        }

        Ok(block)
    }

    fn encode(self) -> Box<[u8]> {
        self.to_le().serialize()
    }
}

/// End-of-central-directory record with its trailing comment.
#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub number_of_files_on_this_disk: u16,
    pub number_of_files: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub zip_file_comment: Box<[u8]>,
}

impl EndOfCentralDirectory {
    pub(crate) const SIZE: u64 = mem::size_of::<EndOfCentralDirBlock>() as u64;

    /// Record written into freshly created archives: zero entries, the
    /// central directory starts right at offset 0.
    pub(crate) fn empty() -> Self {
        Self {
            disk_number: 0,
            disk_with_central_directory: 0,
            number_of_files_on_this_disk: 0,
            number_of_files: 0,
            central_directory_size: 0,
            central_directory_offset: 0,
            zip_file_comment: Box::new([]),
        }
    }

    fn block(&self) -> EndOfCentralDirBlock {
        EndOfCentralDirBlock {
            magic: CENTRAL_DIRECTORY_END_SIGNATURE,
            disk_number: self.disk_number,
            disk_with_central_directory: self.disk_with_central_directory,
            number_of_files_on_this_disk: self.number_of_files_on_this_disk,
            number_of_files: self.number_of_files,
            central_directory_size: self.central_directory_size,
            central_directory_offset: self.central_directory_offset,
            zip_file_comment_length: self.zip_file_comment.len().try_into().unwrap_or(u16::MAX),
        }
    }

    pub(crate) fn parse<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let EndOfCentralDirBlock {
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment_length,
            ..
        } = EndOfCentralDirBlock::parse(reader)?;

        let mut zip_file_comment = vec![0u8; zip_file_comment_length as usize];
        reader.read_exact(&mut zip_file_comment)?;

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment: zip_file_comment.into_boxed_slice(),
        })
    }

    /// Scans backward from the end of the stream for the record signature.
    ///
    /// The record carries a variable-length trailing comment, so its position
    /// cannot be computed; the first signature found from the end that parses
    /// as a complete record wins. Returns the record and its absolute offset.
    pub(crate) fn find_and_parse<T: Read + Seek>(reader: &mut T) -> ZipResult<(Self, u64)> {
        let file_length = reader.seek(io::SeekFrom::End(0))?;

        if file_length < Self::SIZE {
            return invalid_archive("Invalid zip header");
        }

        // Comment length is a u16, bounding how far back the record can sit.
        let search_lower_bound =
            file_length.saturating_sub(Self::SIZE + u16::MAX as u64);

        const END_WINDOW_SIZE: usize = 512;

        let sig_bytes = CENTRAL_DIRECTORY_END_SIGNATURE.to_le_bytes();
        let finder = FinderRev::new(&sig_bytes);

        let mut window_start: u64 = file_length
            .saturating_sub(END_WINDOW_SIZE as u64)
            .max(search_lower_bound);
        let mut window = [0u8; END_WINDOW_SIZE];
        loop {
            reader.seek(io::SeekFrom::Start(window_start))?;

            // May be less than the window size for small files.
            let end = (window_start + END_WINDOW_SIZE as u64).min(file_length);
            let cur_len = (end - window_start) as usize;
            let cur_window: &mut [u8] = &mut window[..cur_len];
            reader.read_exact(cur_window)?;

            for offset in finder.rfind_iter(cur_window) {
                let eocd_start_pos = window_start + offset as u64;
                reader.seek(io::SeekFrom::Start(eocd_start_pos))?;
                if let Ok(eocd) = Self::parse(reader) {
                    return Ok((eocd, eocd_start_pos));
                }
            }
            if window_start == search_lower_bound {
                break;
            }
            // Overlap windows by the signature length so a match straddling
            // a boundary is not missed.
            window_start = window_start
                .saturating_sub(END_WINDOW_SIZE as u64 - sig_bytes.len() as u64)
                .max(search_lower_bound);
        }

        invalid_archive("Could not find central directory end")
    }

    pub(crate) fn write<T: Write>(&self, writer: &mut T) -> ZipResult<()> {
        self.block().write(writer)?;
        writer.write_all(&self.zip_file_comment)?;
        Ok(())
    }
}

#[derive(Copy, Clone)]
#[repr(packed)]
pub(crate) struct Zip64EndOfCentralDirLocatorBlock {
    pub magic: Magic,
    pub disk_with_central_directory: u32,
    pub end_of_central_directory_offset: u64,
    pub number_of_disks: u32,
}

impl Zip64EndOfCentralDirLocatorBlock {
    #[inline(always)]
    fn from_le(mut self) -> Self {
        from_le![
            self,
            [
                (magic, Magic),
                (disk_with_central_directory, u32),
                (end_of_central_directory_offset, u64),
                (number_of_disks, u32),
            ]
        ];
        self
    }

    #[inline(always)]
    fn to_le(mut self) -> Self {
        to_le![
            self,
            [
                (magic, Magic),
                (disk_with_central_directory, u32),
                (end_of_central_directory_offset, u64),
                (number_of_disks, u32),
            ]
        ];
        self
    }
}

impl Block for Zip64EndOfCentralDirLocatorBlock {
    fn interpret(bytes: &[u8]) -> ZipResult<Self> {
        let block = Self::deserialize(bytes).from_le();

        if block.magic != ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE {
            return invalid_archive("Invalid zip64 locator signature");
        }

        Ok(block)
    }

    fn encode(self) -> Box<[u8]> {
        self.to_le().serialize()
    }
}

/// ZIP64 end-of-central-directory locator.
#[derive(Debug, Clone, Copy)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub end_of_central_directory_offset: u64,
    pub number_of_disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub(crate) const SIZE: u64 = mem::size_of::<Zip64EndOfCentralDirLocatorBlock>() as u64;

    pub(crate) fn parse<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let Zip64EndOfCentralDirLocatorBlock {
            disk_with_central_directory,
            end_of_central_directory_offset,
            number_of_disks,
            ..
        } = Zip64EndOfCentralDirLocatorBlock::parse(reader)?;

        Ok(Self {
            disk_with_central_directory,
            end_of_central_directory_offset,
            number_of_disks,
        })
    }

    pub(crate) fn write<T: Write>(&self, writer: &mut T) -> ZipResult<()> {
        Zip64EndOfCentralDirLocatorBlock {
            magic: ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE,
            disk_with_central_directory: self.disk_with_central_directory,
            end_of_central_directory_offset: self.end_of_central_directory_offset,
            number_of_disks: self.number_of_disks,
        }
        .write(writer)
    }
}

#[derive(Copy, Clone)]
#[repr(packed)]
pub(crate) struct Zip64EndOfCentralDirBlock {
    pub magic: Magic,
    pub record_size: u64,
    pub version_made_by: u16,
    pub version_needed_to_extract: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub number_of_files_on_this_disk: u64,
    pub number_of_files: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64EndOfCentralDirBlock {
    #[inline(always)]
    fn from_le(mut self) -> Self {
        from_le![
            self,
            [
                (magic, Magic),
                (record_size, u64),
                (version_made_by, u16),
                (version_needed_to_extract, u16),
                (disk_number, u32),
                (disk_with_central_directory, u32),
                (number_of_files_on_this_disk, u64),
                (number_of_files, u64),
                (central_directory_size, u64),
                (central_directory_offset, u64),
            ]
        ];
        self
    }

    #[inline(always)]
    fn to_le(mut self) -> Self {
        to_le![
            self,
            [
                (magic, Magic),
                (record_size, u64),
                (version_made_by, u16),
                (version_needed_to_extract, u16),
                (disk_number, u32),
                (disk_with_central_directory, u32),
                (number_of_files_on_this_disk, u64),
                (number_of_files, u64),
                (central_directory_size, u64),
                (central_directory_offset, u64),
            ]
        ];
        self
    }
}

impl Block for Zip64EndOfCentralDirBlock {
    fn interpret(bytes: &[u8]) -> ZipResult<Self> {
        let block = Self::deserialize(bytes).from_le();

        if block.magic != ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE {
            return invalid_archive("Invalid zip64 end of central directory signature");
        }

        Ok(block)
    }

    fn encode(self) -> Box<[u8]> {
        self.to_le().serialize()
    }
}

/// ZIP64 end-of-central-directory record.
#[derive(Debug, Clone)]
pub struct Zip64EndOfCentralDirectory {
    pub version_made_by: u16,
    pub version_needed_to_extract: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub number_of_files_on_this_disk: u64,
    pub number_of_files: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub(crate) const SIZE: u64 = mem::size_of::<Zip64EndOfCentralDirBlock>() as u64;

    pub(crate) fn parse<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let Zip64EndOfCentralDirBlock {
            version_made_by,
            version_needed_to_extract,
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            ..
        } = Zip64EndOfCentralDirBlock::parse(reader)?;

        Ok(Self {
            version_made_by,
            version_needed_to_extract,
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
        })
    }

    pub(crate) fn write<T: Write>(&self, writer: &mut T) -> ZipResult<()> {
        Zip64EndOfCentralDirBlock {
            magic: ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE,
            // Size of the remainder of this record; no extensible data.
            record_size: Self::SIZE - 12,
            version_made_by: self.version_made_by,
            version_needed_to_extract: self.version_needed_to_extract,
            disk_number: self.disk_number,
            disk_with_central_directory: self.disk_with_central_directory,
            number_of_files_on_this_disk: self.number_of_files_on_this_disk,
            number_of_files: self.number_of_files,
            central_directory_size: self.central_directory_size,
            central_directory_offset: self.central_directory_offset,
        }
        .write(writer)
    }
}

/// Parsed data descriptor, written after streamed entries whose sizes and
/// CRC were unknown when the local header went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Number of bytes the descriptor occupies on disk. Depends on the size
    /// width and on whether the optional leading signature was written.
    pub(crate) stored_size: u64,
}

impl DataDescriptor {
    /// Parses a descriptor with 32-bit size fields.
    ///
    /// Some encoders omit the leading signature; if the first word is not
    /// the signature constant it is re-interpreted as the CRC field.
    pub(crate) fn parse<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let (crc32, signed) = Self::parse_leading_crc(reader)?;
        let mut rest = [0u8; 8];
        reader.read_exact(&mut rest)?;
        let compressed_size = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as u64;
        let uncompressed_size = u32::from_le_bytes(rest[4..8].try_into().unwrap()) as u64;
        Ok(Self {
            crc32,
            compressed_size,
            uncompressed_size,
            stored_size: if signed { 16 } else { 12 },
        })
    }

    /// Parses a descriptor with 64-bit size fields (ZIP64 entries).
    pub(crate) fn parse_zip64<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let (crc32, signed) = Self::parse_leading_crc(reader)?;
        let mut rest = [0u8; 16];
        reader.read_exact(&mut rest)?;
        let compressed_size = u64::from_le_bytes(rest[0..8].try_into().unwrap());
        let uncompressed_size = u64::from_le_bytes(rest[8..16].try_into().unwrap());
        Ok(Self {
            crc32,
            compressed_size,
            uncompressed_size,
            stored_size: if signed { 24 } else { 20 },
        })
    }

    fn parse_leading_crc<T: Read>(reader: &mut T) -> ZipResult<(u32, bool)> {
        let mut word = [0u8; 4];
        reader.read_exact(&mut word)?;
        if u32::from_le_bytes(word) == DATA_DESCRIPTOR_SIGNATURE {
            reader.read_exact(&mut word)?;
            Ok((u32::from_le_bytes(word), true))
        } else {
            Ok((u32::from_le_bytes(word), false))
        }
    }
}

/// Reads a [`Block`] at an absolute offset of a seekable stream.
pub(crate) fn block_at<B: Block, T: Read + Seek>(reader: &mut T, offset: u64) -> ZipResult<B> {
    reader.seek(io::SeekFrom::Start(offset))?;
    B::parse(reader)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::result::ZipError;
    use std::io::Cursor;

    #[test]
    fn eocd_roundtrip() {
        let eocd = EndOfCentralDirectory {
            disk_number: 0,
            disk_with_central_directory: 0,
            number_of_files_on_this_disk: 2,
            number_of_files: 2,
            central_directory_size: 92,
            central_directory_offset: 1000,
            zip_file_comment: b"release build".to_vec().into_boxed_slice(),
        };
        let mut c = Cursor::new(Vec::new());
        eocd.write(&mut c).unwrap();
        assert_eq!(c.get_ref().len() as u64, EndOfCentralDirectory::SIZE + 13);

        c.set_position(0);
        let parsed = EndOfCentralDirectory::parse(&mut c).unwrap();
        assert_eq!(parsed.number_of_files, 2);
        assert_eq!(parsed.central_directory_offset, 1000);
        assert_eq!(&*parsed.zip_file_comment, b"release build");
    }

    #[test]
    fn eocd_found_behind_comment() {
        let eocd = EndOfCentralDirectory {
            zip_file_comment: vec![b'x'; 1000].into_boxed_slice(),
            ..EndOfCentralDirectory::empty()
        };
        let mut c = Cursor::new(Vec::new());
        c.write_all(&[0u8; 4096]).unwrap();
        let expected_pos = c.position();
        eocd.write(&mut c).unwrap();

        let (_, pos) = EndOfCentralDirectory::find_and_parse(&mut c).unwrap();
        assert_eq!(pos, expected_pos);
    }

    #[test]
    fn bad_signature_rejected() {
        let mut bytes = EndOfCentralDirectory::empty()
            .block()
            .encode()
            .into_vec();
        bytes[0] ^= 0xFF;
        let mut c = Cursor::new(bytes);
        assert!(matches!(
            EndOfCentralDirectory::parse(&mut c),
            Err(ZipError::InvalidArchive(_))
        ));

        let mut c = Cursor::new(vec![0u8; 20]);
        assert!(Zip64EndOfCentralDirectoryLocator::parse(&mut c).is_err());
        let mut c = Cursor::new(vec![0u8; 56]);
        assert!(Zip64EndOfCentralDirectory::parse(&mut c).is_err());
    }

    #[test]
    fn truncated_record_rejected() {
        let bytes = EndOfCentralDirectory::empty().block().encode();
        let mut c = Cursor::new(&bytes[..10]);
        assert!(EndOfCentralDirectory::parse(&mut c).is_err());
    }

    #[test]
    fn zip64_record_roundtrip() {
        let record = Zip64EndOfCentralDirectory {
            version_made_by: 45,
            version_needed_to_extract: 45,
            disk_number: 0,
            disk_with_central_directory: 0,
            number_of_files_on_this_disk: 3,
            number_of_files: 3,
            central_directory_size: 0x1_0000_0000,
            central_directory_offset: 0x2_0000_0000,
        };
        let mut c = Cursor::new(Vec::new());
        record.write(&mut c).unwrap();
        assert_eq!(c.get_ref().len() as u64, Zip64EndOfCentralDirectory::SIZE);

        c.set_position(0);
        let parsed = Zip64EndOfCentralDirectory::parse(&mut c).unwrap();
        assert_eq!(parsed.central_directory_offset, 0x2_0000_0000);
    }

    #[test]
    fn data_descriptor_with_and_without_signature() {
        let mut signed = Vec::new();
        signed.extend(DATA_DESCRIPTOR_SIGNATURE.to_le_bytes());
        signed.extend(0xdeadbeefu32.to_le_bytes());
        signed.extend(17u32.to_le_bytes());
        signed.extend(40u32.to_le_bytes());
        let parsed = DataDescriptor::parse(&mut Cursor::new(&signed)).unwrap();
        assert_eq!(parsed.crc32, 0xdeadbeef);
        assert_eq!(parsed.compressed_size, 17);
        assert_eq!(parsed.uncompressed_size, 40);
        assert_eq!(parsed.stored_size, 16);

        // Same descriptor with the signature elided: the first word is
        // already the CRC.
        let unsigned = &signed[4..];
        let parsed = DataDescriptor::parse(&mut Cursor::new(unsigned)).unwrap();
        assert_eq!(parsed.crc32, 0xdeadbeef);
        assert_eq!(parsed.stored_size, 12);
    }

    #[test]
    fn zip64_data_descriptor() {
        let mut raw = Vec::new();
        raw.extend(DATA_DESCRIPTOR_SIGNATURE.to_le_bytes());
        raw.extend(1u32.to_le_bytes());
        raw.extend(0x1_0000_0010u64.to_le_bytes());
        raw.extend(0x2_0000_0020u64.to_le_bytes());
        let parsed = DataDescriptor::parse_zip64(&mut Cursor::new(&raw)).unwrap();
        assert_eq!(parsed.compressed_size, 0x1_0000_0010);
        assert_eq!(parsed.uncompressed_size, 0x2_0000_0020);
        assert_eq!(parsed.stored_size, 24);
    }
}
