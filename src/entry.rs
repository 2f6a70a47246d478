//! In-memory representation of one archive member.
//!
//! An [`Entry`] joins the member's central directory record with its local
//! file header and, for streamed entries, the trailing data descriptor.
//! Entries are immutable: mutating the archive yields new `Entry` values.
//!
//! Size and offset fields are *effective*: a 32-bit field saturated at
//! `0xFFFFFFFF` defers to the ZIP64 extended information field. Callers must
//! go through the accessors here — nothing else in the crate reads the
//! nominal fields directly, which keeps the overflow check in one place.

use std::borrow::Cow;

use crate::cp437;
use crate::result::{ZipError, ZipResult};
use crate::spec::{DataDescriptor, ZIP64_VERSION_NEEDED};
use crate::types::{
    ffi, CentralDirectoryRecord, DateTime, LocalFileRecord, System, FLAG_ENCRYPTED, FLAG_UTF8,
};
use crate::zip64::{Zip64ExtendedInformation, Zip64Requirements};

/// Default POSIX permissions for regular file entries.
pub const DEFAULT_FILE_PERMISSIONS: u16 = 0o644;
/// Default POSIX permissions for directory entries.
pub const DEFAULT_DIRECTORY_PERMISSIONS: u16 = 0o755;

/// What kind of filesystem object an entry denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One logical archive member.
#[derive(Debug, Clone)]
pub struct Entry {
    pub(crate) central: CentralDirectoryRecord,
    pub(crate) local: LocalFileRecord,
    pub(crate) data_descriptor: Option<DataDescriptor>,
    central_zip64: Option<Zip64ExtendedInformation>,
}

impl Entry {
    /// Joins the parsed records into an entry.
    ///
    /// Fails on the encryption bit: encrypted members are categorically
    /// unsupported, and refusing here keeps them out of iteration entirely.
    pub(crate) fn new(
        central: CentralDirectoryRecord,
        local: LocalFileRecord,
        data_descriptor: Option<DataDescriptor>,
    ) -> ZipResult<Self> {
        if central.block.flags & FLAG_ENCRYPTED != 0 {
            return Err(ZipError::UnsupportedArchive(
                "encrypted entries are not supported".into(),
            ));
        }

        let central_zip64 = central_zip64(&central)?;

        Ok(Self {
            central,
            local,
            data_descriptor,
            central_zip64,
        })
    }

    /// Stored path bytes, exactly as written in the central directory.
    pub fn path_raw(&self) -> &[u8] {
        &self.central.file_name_raw
    }

    /// Decoded path: UTF-8 when general-purpose bit 11 says so, CP437 for
    /// archives predating that convention.
    pub fn path(&self) -> Cow<'_, str> {
        if self.central.block.flags & FLAG_UTF8 != 0 {
            String::from_utf8_lossy(&self.central.file_name_raw)
        } else {
            cp437::decode(&self.central.file_name_raw)
        }
    }

    /// Kind of filesystem object this entry denotes.
    ///
    /// POSIX-origin archives carry file-mode bits in the upper half of the
    /// external attributes; DOS-origin archives carry a directory attribute
    /// bit. Everything else falls back to the trailing-slash convention.
    pub fn kind(&self) -> EntryKind {
        let system = System::from((self.central.block.version_made_by >> 8) as u8);
        let attributes = self.central.block.external_file_attributes;
        if system.is_posix() && attributes >> 16 != 0 {
            return match (attributes >> 16) & ffi::S_IFMT {
                ffi::S_IFDIR => EntryKind::Directory,
                ffi::S_IFLNK => EntryKind::Symlink,
                _ => EntryKind::File,
            };
        }
        let dos_directory_bit = system == System::Dos && attributes & 0x10 != 0;
        if dos_directory_bit || self.central.file_name_raw.ends_with(b"/") {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }

    /// CRC-32 of the uncompressed payload.
    ///
    /// For streamed entries the trailing data descriptor is the later,
    /// authoritative value and wins over the central directory field.
    pub fn checksum(&self) -> u32 {
        match &self.data_descriptor {
            Some(descriptor) => descriptor.crc32,
            None => self.central.block.crc32,
        }
    }

    /// Effective uncompressed payload size.
    pub fn uncompressed_size(&self) -> u64 {
        if let Some(descriptor) = &self.data_descriptor {
            return descriptor.uncompressed_size;
        }
        Self::effective(
            self.central.block.uncompressed_size,
            self.central_zip64.and_then(|z| z.uncompressed_size),
        )
    }

    /// Effective size of the payload as stored.
    pub fn compressed_size(&self) -> u64 {
        if let Some(descriptor) = &self.data_descriptor {
            return descriptor.compressed_size;
        }
        Self::effective(
            self.central.block.compressed_size,
            self.central_zip64.and_then(|z| z.compressed_size),
        )
    }

    /// Effective absolute offset of the local file header.
    pub fn local_header_offset(&self) -> u64 {
        Self::effective(
            self.central.block.offset,
            self.central_zip64.and_then(|z| z.relative_header_offset),
        )
    }

    fn effective(nominal: u32, zip64_override: Option<u64>) -> u64 {
        effective_field(nominal, zip64_override)
    }

    /// Absolute offset of the first payload byte.
    pub(crate) fn data_offset(&self) -> u64 {
        self.local_header_offset() + self.local.stored_size()
    }

    /// Total on-disk footprint of the member's local portion: header,
    /// payload, and data descriptor if one follows. Lets the engine skip or
    /// relocate a member without parsing its payload.
    pub fn local_size(&self) -> u64 {
        let descriptor_size = self
            .data_descriptor
            .as_ref()
            .map(|d| d.stored_size)
            .unwrap_or(0);
        self.local.stored_size() + self.compressed_size() + descriptor_size
    }

    /// Whether the entry uses ZIP64 extensions.
    pub fn is_zip64(&self) -> bool {
        self.central.block.version_to_extract >= ZIP64_VERSION_NEEDED
    }

    /// Raw compression method code from the central directory.
    pub(crate) fn compression_method_raw(&self) -> u16 {
        self.central.block.compression_method
    }

    /// Last modification time, at MS-DOS 2-second resolution.
    pub fn modified(&self) -> DateTime {
        DateTime::from_msdos(
            self.central.block.last_mod_date,
            self.central.block.last_mod_time,
        )
    }

    /// POSIX permission bits, defaulted by kind when the archive carries
    /// none.
    pub fn permissions(&self) -> u16 {
        let system = System::from((self.central.block.version_made_by >> 8) as u8);
        if system.is_posix() {
            let mode = (self.central.block.external_file_attributes >> 16) as u16 & 0o7777;
            if mode != 0 {
                return mode;
            }
        }
        match self.kind() {
            EntryKind::Directory => DEFAULT_DIRECTORY_PERMISSIONS,
            _ => DEFAULT_FILE_PERMISSIONS,
        }
    }

    /// Entry comment from the central directory, if any.
    pub fn comment_raw(&self) -> &[u8] {
        &self.central.file_comment
    }
}

/// Decodes the ZIP64 overrides a central directory record requires, as
/// signalled by its saturated nominal fields.
pub(crate) fn central_zip64(
    central: &CentralDirectoryRecord,
) -> ZipResult<Option<Zip64ExtendedInformation>> {
    let requirements = Zip64Requirements {
        uncompressed_size: central.block.uncompressed_size == u32::MAX,
        compressed_size: central.block.compressed_size == u32::MAX,
        relative_header_offset: central.block.offset == u32::MAX,
        disk_start_number: central.block.disk_number == u16::MAX,
    };
    Zip64ExtendedInformation::from_extra_field(&central.extra_field, requirements)
}

/// Resolves a nominal 32-bit field against its optional ZIP64 override.
pub(crate) fn effective_field(nominal: u32, zip64_override: Option<u64>) -> u64 {
    if nominal == u32::MAX {
        zip64_override.unwrap_or(nominal as u64)
    } else {
        nominal as u64
    }
}

/// Two entries are equal iff they denote the same logical file at the same
/// archive position with the same content checksum.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.path_raw() == other.path_raw()
            && self.checksum() == other.checksum()
            && self.local_header_offset() == other.local_header_offset()
    }
}

impl Eq for Entry {}
