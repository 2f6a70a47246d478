//! The archive engine: scanning, iterating and incrementally mutating a
//! ZIP container over any [`Storage`].
//!
//! Opening an archive only locates and parses the end-of-central-directory
//! record (plus its ZIP64 counterpart when present); per-member records are
//! parsed lazily while iterating. Mutations always keep the backing store a
//! valid archive: additions snapshot the central directory tail and roll it
//! back on failure, removals rebuild into a scratch store and swap it in
//! atomically.

use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::Path;

use crate::checksum::{crc32, CRC32_SEED};
use crate::codec::{self, Consumer, Provider, DEFAULT_BUFFER_SIZE};
use crate::compression::CompressionMethod;
use crate::entry::{
    self, Entry, EntryKind, DEFAULT_DIRECTORY_PERMISSIONS, DEFAULT_FILE_PERMISSIONS,
};
use crate::result::{ZipError, ZipResult};
use crate::spec::{
    self, DataDescriptor, EndOfCentralDirectory, Zip64EndOfCentralDirectory,
    Zip64EndOfCentralDirectoryLocator, DEFAULT_VERSION_NEEDED, ZIP64_BYTES_THR, ZIP64_ENTRY_THR,
    ZIP64_VERSION_NEEDED,
};
use crate::storage::{AccessMode, FileStore, MemoryFile, Storage};
use crate::types::{
    ffi, CentralDirectoryRecord, DateTime, LocalFileRecord, System, ZipCentralEntryBlock,
    ZipLocalEntryBlock, DEFAULT_VERSION, FLAG_DATA_DESCRIPTOR, FLAG_UTF8,
};
use crate::zip64::{strip_zip64_extra, Zip64ExtendedInformation};

/// ZIP64 end-of-central-directory record together with its locator.
#[derive(Debug, Clone)]
pub(crate) struct Zip64Ending {
    record: Zip64EndOfCentralDirectory,
    locator: Zip64EndOfCentralDirectoryLocator,
}

/// Per-entry knobs for [`Archive::add_entry`], builder style.
#[derive(Debug, Clone)]
pub struct EntryOptions {
    kind: EntryKind,
    compression_method: CompressionMethod,
    modified: DateTime,
    permissions: Option<u16>,
    buffer_size: usize,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            kind: EntryKind::File,
            compression_method: CompressionMethod::default(),
            modified: DateTime::default(),
            permissions: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kind of member to write. Directories take no payload; symlink
    /// payloads are the link target bytes and are always stored verbatim.
    pub fn kind(mut self, kind: EntryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn compression_method(mut self, method: CompressionMethod) -> Self {
        self.compression_method = method;
        self
    }

    pub fn modified(mut self, modified: DateTime) -> Self {
        self.modified = modified;
        self
    }

    /// POSIX permission bits; defaulted by kind when not set.
    pub fn permissions(mut self, mode: u16) -> Self {
        self.permissions = Some(mode);
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// A ZIP archive over a seekable backing store.
///
/// An archive is single-owner and not internally synchronized; wrap it in a
/// lock to share it across threads.
#[derive(Debug)]
pub struct Archive<S: Storage> {
    storage: S,
    mode: AccessMode,
    eocd: EndOfCentralDirectory,
    eocd_offset: u64,
    zip64: Option<Zip64Ending>,
}

impl Archive<FileStore> {
    /// Opens (or, in `Create` mode, creates) a file-backed archive.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> ZipResult<Self> {
        Self::with_storage(FileStore::open(path, mode)?, mode)
    }
}

impl Archive<MemoryFile> {
    /// Fresh, empty in-memory archive.
    pub fn create_in_memory() -> ZipResult<Self> {
        Self::with_storage(MemoryFile::new(), AccessMode::Create)
    }

    /// In-memory archive over existing bytes.
    pub fn from_vec(bytes: Vec<u8>, mode: AccessMode) -> ZipResult<Self> {
        Self::with_storage(MemoryFile::with_contents(bytes), mode)
    }

    /// Borrows the raw archive bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_slice()
    }

    /// Consumes the archive, yielding the raw bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.storage.into_vec()
    }
}

impl<S: Storage> Archive<S> {
    /// Wraps an arbitrary backing store.
    ///
    /// In `Create` mode an empty store is initialized with a minimal
    /// end-of-central-directory record first, so the scan below succeeds.
    pub fn with_storage(mut storage: S, mode: AccessMode) -> ZipResult<Self> {
        if mode == AccessMode::Create && storage.length()? == 0 {
            EndOfCentralDirectory::empty().write(&mut storage)?;
        }
        let (eocd, eocd_offset) = EndOfCentralDirectory::find_and_parse(&mut storage)?;
        let zip64 = Self::read_zip64_ending(&mut storage, eocd_offset)?;
        Ok(Self {
            storage,
            mode,
            eocd,
            eocd_offset,
            zip64,
        })
    }

    /// Looks for the ZIP64 locator directly in front of the
    /// end-of-central-directory record. Both the locator and the record it
    /// points at must parse, otherwise the archive is treated as classic.
    fn read_zip64_ending(storage: &mut S, eocd_offset: u64) -> ZipResult<Option<Zip64Ending>> {
        let minimum = Zip64EndOfCentralDirectoryLocator::SIZE + Zip64EndOfCentralDirectory::SIZE;
        if eocd_offset < minimum {
            return Ok(None);
        }
        storage.seek(SeekFrom::Start(
            eocd_offset - Zip64EndOfCentralDirectoryLocator::SIZE,
        ))?;
        let Ok(locator) = Zip64EndOfCentralDirectoryLocator::parse(storage) else {
            return Ok(None);
        };
        storage.seek(SeekFrom::Start(locator.end_of_central_directory_offset))?;
        let Ok(record) = Zip64EndOfCentralDirectory::parse(storage) else {
            return Ok(None);
        };
        Ok(Some(Zip64Ending { record, locator }))
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Number of members, preferring the ZIP64 record over the saturated
    /// 16-bit count.
    pub fn total_entries(&self) -> u64 {
        match &self.zip64 {
            Some(ending) => ending.record.number_of_files,
            None => self.eocd.number_of_files as u64,
        }
    }

    /// Archive comment from the end-of-central-directory record.
    pub fn comment(&self) -> &[u8] {
        &self.eocd.zip_file_comment
    }

    fn central_directory_offset(&self) -> u64 {
        match &self.zip64 {
            Some(ending) => ending.record.central_directory_offset,
            None => self.eocd.central_directory_offset as u64,
        }
    }

    fn central_directory_size(&self) -> u64 {
        match &self.zip64 {
            Some(ending) => ending.record.central_directory_size,
            None => self.eocd.central_directory_size as u64,
        }
    }

    /// Iterates the members in central directory order.
    pub fn entries(&mut self) -> Entries<'_, S> {
        let cursor = self.central_directory_offset();
        let remaining = self.total_entries();
        Entries {
            archive: self,
            cursor,
            remaining,
        }
    }

    /// Finds a member by decoded path. Linear in the number of entries.
    pub fn entry(&mut self, path: &str) -> ZipResult<Option<Entry>> {
        for candidate in self.entries() {
            let candidate = candidate?;
            if candidate.path() == path {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Parses the central record at `cursor` plus the local records it
    /// points at. Returns the entry and the cursor of the next record.
    fn read_entry_at(&mut self, cursor: u64) -> ZipResult<(Entry, u64)> {
        self.storage.seek(SeekFrom::Start(cursor))?;
        let central = CentralDirectoryRecord::parse(&mut self.storage)?;
        let next_cursor = cursor + central.stored_size();

        let zip64 = entry::central_zip64(&central)?;
        let header_offset = entry::effective_field(
            central.block.offset,
            zip64.and_then(|z| z.relative_header_offset),
        );
        self.storage.seek(SeekFrom::Start(header_offset))?;
        let local = LocalFileRecord::parse(&mut self.storage)?;

        let descriptor = if central.block.flags & FLAG_DATA_DESCRIPTOR != 0 {
            let compressed = entry::effective_field(
                central.block.compressed_size,
                zip64.and_then(|z| z.compressed_size),
            );
            self.storage.seek(SeekFrom::Start(
                header_offset + local.stored_size() + compressed,
            ))?;
            Some(if central.block.version_to_extract >= ZIP64_VERSION_NEEDED {
                DataDescriptor::parse_zip64(&mut self.storage)?
            } else {
                DataDescriptor::parse(&mut self.storage)?
            })
        } else {
            None
        };

        Ok((Entry::new(central, local, descriptor)?, next_cursor))
    }

    /// Streams a member's payload to `consumer` and verifies its CRC-32.
    ///
    /// Directories yield a single empty chunk; symlink payloads are the raw
    /// link target bytes. Returns the checksum computed over the emitted
    /// bytes (`0` when `skip_crc32` suppressed its computation on the
    /// deflate path).
    pub fn extract(
        &mut self,
        entry: &Entry,
        buffer_size: usize,
        skip_crc32: bool,
        mut consumer: impl Consumer,
    ) -> ZipResult<u32> {
        if buffer_size == 0 {
            return Err(ZipError::InvalidBufferSize(buffer_size));
        }
        let data_offset = entry.data_offset();
        let compressed_size = entry.compressed_size();

        let checksum = match entry.kind() {
            EntryKind::Directory => {
                consumer(&[])?;
                return Ok(0);
            }
            EntryKind::Symlink => {
                self.storage.seek(SeekFrom::Start(data_offset))?;
                let mut target = vec![0u8; compressed_size as usize];
                self.storage.read_exact(&mut target)?;
                let checksum = crc32(CRC32_SEED, &target);
                consumer(&target)?;
                checksum
            }
            EntryKind::File => {
                let method = CompressionMethod::from_u16(entry.compression_method_raw())?;
                let storage = &mut self.storage;
                let provider = |position: u64, count: usize| {
                    storage.seek(SeekFrom::Start(data_offset + position))?;
                    let mut chunk = vec![0u8; count];
                    storage.read_exact(&mut chunk)?;
                    Ok(chunk)
                };
                match method {
                    CompressionMethod::Stored => {
                        codec::transfer(compressed_size, buffer_size, provider, consumer)?
                    }
                    CompressionMethod::Deflated => codec::decompress(
                        compressed_size,
                        buffer_size,
                        skip_crc32,
                        provider,
                        consumer,
                    )?,
                }
            }
        };

        if !skip_crc32 && checksum != entry.checksum() {
            return Err(ZipError::InvalidCrc32 {
                expected: entry.checksum(),
                actual: checksum,
            });
        }
        Ok(checksum)
    }

    /// Appends a member, pulling `uncompressed_size` payload bytes from
    /// `provider`.
    ///
    /// The new local record overwrites the old central directory in place;
    /// the directory is re-appended behind the payload along with the new
    /// central record and fresh end-of-directory records. If the provider
    /// fails (including [`ZipError::Cancelled`]) the overwritten tail is
    /// restored byte for byte and the store truncated to its old length.
    pub fn add_entry(
        &mut self,
        path: &str,
        uncompressed_size: u64,
        options: &EntryOptions,
        provider: impl Provider,
    ) -> ZipResult<Entry> {
        if !self.mode.is_writable() {
            return Err(ZipError::UnwritableArchive);
        }
        if path.is_empty() || path.len() >= u16::MAX as usize {
            return Err(ZipError::InvalidEntryPath);
        }
        if options.buffer_size == 0 {
            return Err(ZipError::InvalidBufferSize(options.buffer_size));
        }

        let mut name = path.to_owned();
        if options.kind == EntryKind::Directory && !name.ends_with('/') {
            name.push('/');
        }

        let cd_offset = self.central_directory_offset();
        let cd_size = self.central_directory_size();
        let old_length = self.storage.length()?;
        self.storage.seek(SeekFrom::Start(cd_offset))?;
        let mut cd_blob = vec![0u8; cd_size as usize];
        self.storage.read_exact(&mut cd_blob)?;
        let saved_eocd = self.eocd.clone();
        let saved_zip64 = self.zip64.clone();
        let saved_eocd_offset = self.eocd_offset;

        match self.write_entry(&name, uncompressed_size, options, provider, cd_offset, &cd_blob) {
            Ok(entry) => Ok(entry),
            Err(err) => {
                self.storage.seek(SeekFrom::Start(cd_offset))?;
                self.storage.write_all(&cd_blob)?;
                if let Some(ending) = &saved_zip64 {
                    ending.record.write(&mut self.storage)?;
                    ending.locator.write(&mut self.storage)?;
                }
                saved_eocd.write(&mut self.storage)?;
                self.storage.truncate(old_length)?;
                self.eocd = saved_eocd;
                self.zip64 = saved_zip64;
                self.eocd_offset = saved_eocd_offset;
                Err(err)
            }
        }
    }

    fn write_entry(
        &mut self,
        name: &str,
        declared_size: u64,
        options: &EntryOptions,
        provider: impl Provider,
        header_offset: u64,
        cd_blob: &[u8],
    ) -> ZipResult<Entry> {
        let method = match options.kind {
            EntryKind::File => options.compression_method,
            _ => CompressionMethod::Stored,
        };
        // Whether ZIP64 fields must be reserved is decided before the
        // payload goes out; the reservation keeps the header size stable so
        // it can be finalized in place afterwards.
        let reserve_zip64 = declared_size >= ZIP64_BYTES_THR || header_offset >= ZIP64_BYTES_THR;

        let mut local = build_local_record(name, method, options, reserve_zip64);
        self.storage.seek(SeekFrom::Start(header_offset))?;
        local.write(&mut self.storage)?;
        let data_offset = header_offset + local.stored_size();

        let mut compressed_total = 0u64;
        let checksum = {
            let storage = &mut self.storage;
            let consumer = |chunk: &[u8]| {
                storage.write_all(chunk)?;
                compressed_total += chunk.len() as u64;
                Ok(())
            };
            match (options.kind, method) {
                (EntryKind::Directory, _) => 0,
                (_, CompressionMethod::Stored) => {
                    codec::transfer(declared_size, options.buffer_size, provider, consumer)?
                }
                (_, CompressionMethod::Deflated) => {
                    codec::compress(declared_size, options.buffer_size, provider, consumer)?
                }
            }
        };
        let uncompressed_total = match options.kind {
            EntryKind::Directory => 0,
            _ => declared_size,
        };
        if !reserve_zip64 && compressed_total >= ZIP64_BYTES_THR {
            // Incompressible payload expanded past the 32-bit limit, but no
            // ZIP64 field was reserved in the header.
            return Err(ZipError::ValueOutOfBounds);
        }

        local.block.crc32 = checksum;
        if reserve_zip64 {
            local.block.compressed_size = u32::MAX;
            local.block.uncompressed_size = u32::MAX;
            local.extra_field = Zip64ExtendedInformation {
                uncompressed_size: Some(uncompressed_total),
                compressed_size: Some(compressed_total),
                relative_header_offset: None,
                disk_start_number: None,
            }
            .serialized()
            .into_boxed_slice();
        } else {
            local.block.compressed_size = compressed_total as u32;
            local.block.uncompressed_size = uncompressed_total as u32;
        }
        self.storage.seek(SeekFrom::Start(header_offset))?;
        local.write(&mut self.storage)?;

        // Re-append the preserved central directory behind the payload,
        // followed by the new member's record.
        let new_cd_offset = data_offset + compressed_total;
        self.storage.seek(SeekFrom::Start(new_cd_offset))?;
        self.storage.write_all(cd_blob)?;
        let central = build_central_record(
            name,
            &local,
            options,
            checksum,
            uncompressed_total,
            compressed_total,
            header_offset,
        );
        central.write(&mut self.storage)?;

        let new_cd_size = cd_blob.len() as u64 + central.stored_size();
        let total = self.total_entries() + 1;
        let comment = self.eocd.zip_file_comment.clone();
        let (eocd, zip64, eocd_offset) =
            write_endings(&mut self.storage, new_cd_offset, new_cd_size, total, comment)?;
        let end = self.storage.stream_position()?;
        self.storage.truncate(end)?;
        self.eocd = eocd;
        self.zip64 = zip64;
        self.eocd_offset = eocd_offset;

        Entry::new(central, local, None)
    }

    /// Removes a member by rebuilding the archive without it in a scratch
    /// store and swapping the stores. Surviving members keep their order;
    /// those behind the removed one shift down by its on-disk footprint.
    ///
    /// Removing an entry that is no longer present rebuilds an identical
    /// archive, so the operation is idempotent.
    pub fn remove(&mut self, target: &Entry, buffer_size: usize) -> ZipResult<()> {
        if !self.mode.is_writable() {
            return Err(ZipError::UnwritableArchive);
        }
        if buffer_size == 0 {
            return Err(ZipError::InvalidBufferSize(buffer_size));
        }

        let removed_offset = target.local_header_offset();
        let removed_span = target.local_size();
        let survivors = self.entries().collect::<ZipResult<Vec<_>>>()?;
        let comment = self.eocd.zip_file_comment.clone();

        let mut rebuilt = self.storage.make_temporary()?;
        let mut kept = Vec::with_capacity(survivors.len());
        for entry in survivors {
            if entry == *target {
                continue;
            }
            copy_region(
                &mut self.storage,
                entry.local_header_offset(),
                entry.local_size(),
                buffer_size,
                &mut rebuilt,
            )?;
            let new_offset = if entry.local_header_offset() > removed_offset {
                entry.local_header_offset() - removed_span
            } else {
                entry.local_header_offset()
            };
            kept.push(relocate_central_record(entry, new_offset));
        }

        let cd_offset = rebuilt.stream_position()?;
        let mut cd_size = 0u64;
        for record in &kept {
            record.write(&mut rebuilt)?;
            cd_size += record.stored_size();
        }
        write_endings(&mut rebuilt, cd_offset, cd_size, kept.len() as u64, comment)?;

        self.storage.replace_with(rebuilt)?;
        self.rescan()
    }

    fn rescan(&mut self) -> ZipResult<()> {
        let (eocd, eocd_offset) = EndOfCentralDirectory::find_and_parse(&mut self.storage)?;
        self.zip64 = Self::read_zip64_ending(&mut self.storage, eocd_offset)?;
        self.eocd = eocd;
        self.eocd_offset = eocd_offset;
        Ok(())
    }
}

/// Lazy iterator over an archive's members. Each step parses one central
/// directory record and the local records it points at; the first error
/// ends the iteration.
pub struct Entries<'a, S: Storage> {
    archive: &'a mut Archive<S>,
    cursor: u64,
    remaining: u64,
}

impl<S: Storage> Iterator for Entries<'_, S> {
    type Item = ZipResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.archive.read_entry_at(self.cursor) {
            Ok((entry, next_cursor)) => {
                self.cursor = next_cursor;
                self.remaining -= 1;
                Some(Ok(entry))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

fn saturated_u32(value: u64) -> u32 {
    value.min(ZIP64_BYTES_THR) as u32
}

fn build_local_record(
    name: &str,
    method: CompressionMethod,
    options: &EntryOptions,
    reserve_zip64: bool,
) -> LocalFileRecord {
    let extra_field: Box<[u8]> = if reserve_zip64 {
        // Placeholder sizes; the header is rewritten in place once the
        // payload is out and the real values are known.
        Zip64ExtendedInformation {
            uncompressed_size: Some(0),
            compressed_size: Some(0),
            relative_header_offset: None,
            disk_start_number: None,
        }
        .serialized()
        .into_boxed_slice()
    } else {
        Box::new([])
    };
    let block = ZipLocalEntryBlock {
        magic: spec::LOCAL_FILE_HEADER_SIGNATURE,
        version_to_extract: if reserve_zip64 {
            ZIP64_VERSION_NEEDED
        } else {
            DEFAULT_VERSION_NEEDED
        },
        flags: FLAG_UTF8,
        compression_method: method.to_u16(),
        last_mod_time: options.modified.timepart(),
        last_mod_date: options.modified.datepart(),
        crc32: 0,
        compressed_size: if reserve_zip64 { u32::MAX } else { 0 },
        uncompressed_size: if reserve_zip64 { u32::MAX } else { 0 },
        file_name_length: name.len() as u16,
        extra_field_length: extra_field.len() as u16,
    };
    LocalFileRecord {
        block,
        file_name_raw: name.as_bytes().to_vec().into_boxed_slice(),
        extra_field,
    }
}

fn build_central_record(
    name: &str,
    local: &LocalFileRecord,
    options: &EntryOptions,
    checksum: u32,
    uncompressed_size: u64,
    compressed_size: u64,
    header_offset: u64,
) -> CentralDirectoryRecord {
    let zip64 =
        Zip64ExtendedInformation::for_values(uncompressed_size, compressed_size, header_offset);
    let extra_field: Box<[u8]> = match &zip64 {
        Some(field) => field.serialized().into_boxed_slice(),
        None => Box::new([]),
    };
    let mode = options.permissions.unwrap_or(match options.kind {
        EntryKind::Directory => DEFAULT_DIRECTORY_PERMISSIONS,
        _ => DEFAULT_FILE_PERMISSIONS,
    });
    let type_bits = match options.kind {
        EntryKind::File => ffi::S_IFREG,
        EntryKind::Directory => ffi::S_IFDIR,
        EntryKind::Symlink => ffi::S_IFLNK,
    };
    let version_to_extract =
        if zip64.is_some() || local.block.version_to_extract >= ZIP64_VERSION_NEEDED {
            ZIP64_VERSION_NEEDED
        } else {
            DEFAULT_VERSION_NEEDED
        };
    let block = ZipCentralEntryBlock {
        magic: spec::CENTRAL_DIRECTORY_HEADER_SIGNATURE,
        version_made_by: (u8::from(System::Unix) as u16) << 8 | DEFAULT_VERSION as u16,
        version_to_extract,
        flags: FLAG_UTF8,
        compression_method: local.block.compression_method,
        last_mod_time: local.block.last_mod_time,
        last_mod_date: local.block.last_mod_date,
        crc32: checksum,
        compressed_size: saturated_u32(compressed_size),
        uncompressed_size: saturated_u32(uncompressed_size),
        file_name_length: name.len() as u16,
        extra_field_length: extra_field.len() as u16,
        file_comment_length: 0,
        disk_number: 0,
        internal_file_attributes: 0,
        external_file_attributes: (type_bits | mode as u32) << 16,
        offset: saturated_u32(header_offset),
    };
    CentralDirectoryRecord {
        block,
        file_name_raw: name.as_bytes().to_vec().into_boxed_slice(),
        extra_field,
        file_comment: Box::new([]),
    }
}

/// Rewrites a surviving member's central record for its position in the
/// rebuilt archive: any old ZIP64 field is stripped and regenerated from the
/// effective values and the new offset.
fn relocate_central_record(entry: Entry, new_offset: u64) -> CentralDirectoryRecord {
    let uncompressed = entry.uncompressed_size();
    let compressed = entry.compressed_size();
    let mut record = entry.central;

    let mut extra = strip_zip64_extra(&record.extra_field);
    let zip64 = Zip64ExtendedInformation::for_values(uncompressed, compressed, new_offset);
    record.block.uncompressed_size = saturated_u32(uncompressed);
    record.block.compressed_size = saturated_u32(compressed);
    record.block.offset = saturated_u32(new_offset);
    if let Some(field) = &zip64 {
        extra.extend_from_slice(&field.serialized());
        record.block.version_to_extract =
            record.block.version_to_extract.max(ZIP64_VERSION_NEEDED);
    }
    record.block.extra_field_length = extra.len() as u16;
    record.extra_field = extra.into_boxed_slice();
    record
}

/// Writes the ZIP64 record and locator (when any value overflows its
/// classic field) followed by the end-of-central-directory record, all at
/// the writer's current position.
fn write_endings<S: Write + Seek>(
    storage: &mut S,
    cd_offset: u64,
    cd_size: u64,
    total_entries: u64,
    comment: Box<[u8]>,
) -> ZipResult<(EndOfCentralDirectory, Option<Zip64Ending>, u64)> {
    let mut position = storage.stream_position()?;
    let needs_zip64 = total_entries >= ZIP64_ENTRY_THR as u64
        || cd_size >= ZIP64_BYTES_THR
        || cd_offset >= ZIP64_BYTES_THR;

    let mut zip64 = None;
    if needs_zip64 {
        let record = Zip64EndOfCentralDirectory {
            version_made_by: (u8::from(System::Unix) as u16) << 8 | DEFAULT_VERSION as u16,
            version_needed_to_extract: ZIP64_VERSION_NEEDED,
            disk_number: 0,
            disk_with_central_directory: 0,
            number_of_files_on_this_disk: total_entries,
            number_of_files: total_entries,
            central_directory_size: cd_size,
            central_directory_offset: cd_offset,
        };
        record.write(storage)?;
        let locator = Zip64EndOfCentralDirectoryLocator {
            disk_with_central_directory: 0,
            end_of_central_directory_offset: position,
            number_of_disks: 1,
        };
        locator.write(storage)?;
        zip64 = Some(Zip64Ending { record, locator });
        position = storage.stream_position()?;
    }

    let file_count = total_entries.min(ZIP64_ENTRY_THR as u64) as u16;
    let eocd = EndOfCentralDirectory {
        disk_number: 0,
        disk_with_central_directory: 0,
        number_of_files_on_this_disk: file_count,
        number_of_files: file_count,
        central_directory_size: saturated_u32(cd_size),
        central_directory_offset: saturated_u32(cd_offset),
        zip_file_comment: comment,
    };
    eocd.write(storage)?;
    Ok((eocd, zip64, position))
}

/// Copies `length` bytes starting at `offset` of `source` to the current
/// position of `dest`, in `buffer_size` chunks.
fn copy_region<S: Storage>(
    source: &mut S,
    offset: u64,
    length: u64,
    buffer_size: usize,
    dest: &mut S,
) -> ZipResult<()> {
    let mut buf = vec![0u8; buffer_size];
    let mut position = offset;
    let mut remaining = length;
    while remaining > 0 {
        let chunk = buffer_size.min(remaining as usize);
        source.seek(SeekFrom::Start(position))?;
        source.read_exact(&mut buf[..chunk])?;
        dest.write_all(&buf[..chunk])?;
        position += chunk as u64;
        remaining -= chunk as u64;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn provider_over(data: Vec<u8>) -> impl Provider {
        move |position: u64, count: usize| {
            let start = position as usize;
            Ok(data[start..start + count].to_vec())
        }
    }

    fn add_file(
        archive: &mut Archive<MemoryFile>,
        name: &str,
        payload: &[u8],
        options: &EntryOptions,
    ) -> Entry {
        archive
            .add_entry(
                name,
                payload.len() as u64,
                options,
                provider_over(payload.to_vec()),
            )
            .unwrap()
    }

    fn read_back(archive: &mut Archive<MemoryFile>, name: &str) -> Vec<u8> {
        let entry = archive.entry(name).unwrap().unwrap();
        let mut out = Vec::new();
        archive
            .extract(&entry, DEFAULT_BUFFER_SIZE, false, |chunk: &[u8]| {
                out.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn empty_archive_has_no_entries() {
        let mut archive = Archive::create_in_memory().unwrap();
        assert_eq!(archive.total_entries(), 0);
        assert!(archive.entries().next().is_none());
        assert_eq!(
            archive.as_bytes().len() as u64,
            EndOfCentralDirectory::SIZE
        );
    }

    #[test]
    fn add_and_extract_roundtrip() {
        let mut archive = Archive::create_in_memory().unwrap();
        let text = b"the quick brown fox jumps over the lazy dog\n".repeat(64);
        add_file(&mut archive, "fox.txt", &text, &EntryOptions::new());
        add_file(
            &mut archive,
            "raw.bin",
            b"verbatim",
            &EntryOptions::new().compression_method(CompressionMethod::Stored),
        );

        assert_eq!(archive.total_entries(), 2);
        assert_eq!(read_back(&mut archive, "fox.txt"), text);
        assert_eq!(read_back(&mut archive, "raw.bin"), b"verbatim");

        // A deflated run of repeated text must actually shrink.
        let entry = archive.entry("fox.txt").unwrap().unwrap();
        assert!(entry.compressed_size() < entry.uncompressed_size());
    }

    #[test]
    fn reopen_from_bytes() {
        let mut archive = Archive::create_in_memory().unwrap();
        add_file(&mut archive, "a.txt", b"alpha", &EntryOptions::new());
        let bytes = archive.into_vec();

        let mut reopened = Archive::from_vec(bytes, AccessMode::Read).unwrap();
        assert_eq!(read_back(&mut reopened, "a.txt"), b"alpha");
    }

    #[test]
    fn directory_and_symlink_members() {
        let mut archive = Archive::create_in_memory().unwrap();
        let dir = add_file(
            &mut archive,
            "assets",
            b"",
            &EntryOptions::new().kind(EntryKind::Directory),
        );
        assert_eq!(dir.path(), "assets/");
        assert_eq!(dir.kind(), EntryKind::Directory);

        let link = archive
            .add_entry(
                "assets/latest",
                7,
                &EntryOptions::new().kind(EntryKind::Symlink),
                provider_over(b"target/".to_vec()),
            )
            .unwrap();
        assert_eq!(link.kind(), EntryKind::Symlink);

        let entry = archive.entry("assets/latest").unwrap().unwrap();
        let mut target = Vec::new();
        archive
            .extract(&entry, 64, false, |chunk: &[u8]| {
                target.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(target, b"target/");
    }

    #[test]
    fn entry_lookup_misses_return_none() {
        let mut archive = Archive::create_in_memory().unwrap();
        add_file(&mut archive, "present", b"x", &EntryOptions::new());
        assert!(archive.entry("absent").unwrap().is_none());
    }

    #[test]
    fn remove_shifts_survivors() {
        let mut archive = Archive::create_in_memory().unwrap();
        add_file(&mut archive, "first", b"1111", &EntryOptions::new());
        add_file(&mut archive, "second", b"22222222", &EntryOptions::new());
        add_file(&mut archive, "third", b"333", &EntryOptions::new());

        let victim = archive.entry("second").unwrap().unwrap();
        archive.remove(&victim, DEFAULT_BUFFER_SIZE).unwrap();

        assert_eq!(archive.total_entries(), 2);
        assert!(archive.entry("second").unwrap().is_none());
        assert_eq!(read_back(&mut archive, "first"), b"1111");
        assert_eq!(read_back(&mut archive, "third"), b"333");

        // Removing the stale handle again rebuilds an identical archive.
        let before = archive.as_bytes().to_vec();
        archive.remove(&victim, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(archive.as_bytes(), &before[..]);
    }

    #[test]
    fn failed_add_rolls_back() {
        let mut archive = Archive::create_in_memory().unwrap();
        add_file(&mut archive, "keep.txt", b"keep me", &EntryOptions::new());
        let before = archive.as_bytes().to_vec();

        let mut chunks = 0;
        let err = archive
            .add_entry(
                "doomed.bin",
                1 << 20,
                &EntryOptions::new().buffer_size(4096),
                move |_position, count| {
                    chunks += 1;
                    if chunks > 3 {
                        Err(ZipError::Cancelled)
                    } else {
                        Ok(vec![0xA5; count])
                    }
                },
            )
            .unwrap_err();
        assert!(matches!(err, ZipError::Cancelled));

        assert_eq!(archive.as_bytes(), &before[..]);
        assert_eq!(archive.total_entries(), 1);
        assert_eq!(read_back(&mut archive, "keep.txt"), b"keep me");
    }

    #[test]
    fn read_mode_refuses_mutation() {
        let mut archive = Archive::create_in_memory().unwrap();
        add_file(&mut archive, "a", b"a", &EntryOptions::new());
        let mut readonly = Archive::from_vec(archive.into_vec(), AccessMode::Read).unwrap();

        let err = readonly
            .add_entry("b", 1, &EntryOptions::new(), |_, _| Ok(vec![0]))
            .unwrap_err();
        assert!(matches!(err, ZipError::UnwritableArchive));

        let entry = readonly.entry("a").unwrap().unwrap();
        let err = readonly.remove(&entry, DEFAULT_BUFFER_SIZE).unwrap_err();
        assert!(matches!(err, ZipError::UnwritableArchive));
    }

    #[test]
    fn corrupted_payload_fails_crc_check() {
        let mut archive = Archive::create_in_memory().unwrap();
        add_file(
            &mut archive,
            "data.bin",
            b"payload payload payload",
            &EntryOptions::new().compression_method(CompressionMethod::Stored),
        );
        let entry = archive.entry("data.bin").unwrap().unwrap();

        let mut bytes = archive.into_vec();
        // Flip one payload byte behind the local header.
        let corrupt_at = entry.data_offset() as usize + 3;
        bytes[corrupt_at] ^= 0xFF;

        let mut tampered = Archive::from_vec(bytes, AccessMode::Read).unwrap();
        let entry = tampered.entry("data.bin").unwrap().unwrap();
        let err = tampered
            .extract(&entry, 64, false, |_: &[u8]| Ok(()))
            .unwrap_err();
        assert!(matches!(err, ZipError::InvalidCrc32 { .. }));

        // The same read succeeds when verification is skipped.
        tampered
            .extract(&entry, 64, true, |_: &[u8]| Ok(()))
            .unwrap();
    }

    #[test]
    fn update_mode_appends_to_existing() {
        let mut archive = Archive::create_in_memory().unwrap();
        add_file(&mut archive, "old", b"old data", &EntryOptions::new());
        let bytes = archive.into_vec();

        let mut updated = Archive::from_vec(bytes, AccessMode::Update).unwrap();
        add_file(&mut updated, "new", b"new data", &EntryOptions::new());
        assert_eq!(updated.total_entries(), 2);
        assert_eq!(read_back(&mut updated, "old"), b"old data");
        assert_eq!(read_back(&mut updated, "new"), b"new data");
    }

    #[test]
    fn garbage_bytes_rejected() {
        let err = Archive::from_vec(vec![0u8; 1024], AccessMode::Read).unwrap_err();
        assert!(matches!(err, ZipError::InvalidArchive(_)));
    }

    #[test]
    fn file_backed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.zip");

        let mut archive = Archive::open(&path, AccessMode::Create).unwrap();
        archive
            .add_entry(
                "notes.txt",
                11,
                &EntryOptions::new(),
                provider_over(b"hello files".to_vec()),
            )
            .unwrap();
        drop(archive);

        let mut reopened = Archive::open(&path, AccessMode::Read).unwrap();
        let entry = reopened.entry("notes.txt").unwrap().unwrap();
        let mut out = Vec::new();
        reopened
            .extract(&entry, 64, false, |chunk: &[u8]| {
                out.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(out, b"hello files");
    }

    #[test]
    fn file_backed_remove_swaps_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrink.zip");

        let mut archive = Archive::open(&path, AccessMode::Create).unwrap();
        archive
            .add_entry("a", 3, &EntryOptions::new(), provider_over(b"aaa".to_vec()))
            .unwrap();
        archive
            .add_entry("b", 3, &EntryOptions::new(), provider_over(b"bbb".to_vec()))
            .unwrap();
        let victim = archive.entry("a").unwrap().unwrap();
        archive.remove(&victim, 64).unwrap();

        assert_eq!(archive.total_entries(), 1);
        // No rebuild scratch file left behind next to the archive.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != path)
            .collect();
        assert!(leftovers.is_empty());
    }
}
