//! Seekable, truncatable backing stores for archives.
//!
//! The archive engine only ever talks to a [`Storage`]; whether the bytes
//! live in a filesystem file or in a heap buffer is invisible to it. Both
//! implementations support arbitrary absolute seeks, which the backward
//! end-of-central-directory scan relies on.

use std::fs::{File, OpenOptions};
use std::io::{self, prelude::*, SeekFrom};
use std::path::{Path, PathBuf};

use crate::result::{ZipError, ZipResult};
use crate::spec::EndOfCentralDirectory;

/// How an archive's backing store was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Existing archive, no mutation permitted.
    Read,
    /// Fresh archive; the store starts out as a minimal empty archive.
    Create,
    /// Existing archive opened for incremental mutation.
    Update,
}

impl AccessMode {
    pub(crate) fn is_writable(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// Random-access backing store contract.
///
/// A store is owned by exactly one archive and is not internally
/// synchronized; callers serialize access externally.
pub trait Storage: Read + Write + Seek + Sized {
    /// Current total length in bytes.
    fn length(&mut self) -> ZipResult<u64>;

    /// Cuts the store down to `new_len` bytes. Used by write rollback.
    fn truncate(&mut self, new_len: u64) -> ZipResult<()>;

    /// Creates an empty scratch store of the same kind, used to rebuild the
    /// archive during entry removal.
    fn make_temporary(&self) -> ZipResult<Self>;

    /// Replaces this store's contents with `replacement`'s, as atomically as
    /// the medium allows, leaving the position at the start.
    fn replace_with(&mut self, replacement: Self) -> ZipResult<()>;
}

/// Filesystem-backed store: a thin wrapper over [`File`] that remembers its
/// path so the archive can be atomically replaced via a sibling temp file.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl FileStore {
    /// Opens `path` according to `mode`.
    ///
    /// `Create` refuses to clobber an existing file and immediately writes a
    /// minimal empty end-of-central-directory record, so the backing file is
    /// parseable as an archive from the moment it exists.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> ZipResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match mode {
            AccessMode::Read => OpenOptions::new().read(true).open(&path)?,
            AccessMode::Update => OpenOptions::new().read(true).write(true).open(&path)?,
            AccessMode::Create => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)?;
                EndOfCentralDirectory::empty().write(&mut file)?;
                file.sync_all()?;
                file.seek(SeekFrom::Start(0))?;
                file
            }
        };
        Ok(Self {
            file,
            path,
            writable: mode.is_writable(),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for FileStore {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileStore {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileStore {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Storage for FileStore {
    fn length(&mut self) -> ZipResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&mut self, new_len: u64) -> ZipResult<()> {
        self.file.set_len(new_len)?;
        Ok(())
    }

    fn make_temporary(&self) -> ZipResult<Self> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let (file, temp_path) = tempfile::Builder::new()
            .prefix(".zipedit-rebuild-")
            .tempfile_in(dir)?
            .into_parts();
        let path = temp_path.keep().map_err(|e| ZipError::Io(e.error))?;
        Ok(Self {
            file,
            path,
            writable: true,
        })
    }

    fn replace_with(&mut self, replacement: Self) -> ZipResult<()> {
        replacement.file.sync_all()?;
        std::fs::rename(&replacement.path, &self.path)?;
        drop(replacement.file);
        let mut options = OpenOptions::new();
        options.read(true).write(self.writable);
        self.file = options.open(&self.path)?;
        Ok(())
    }
}

/// Heap-backed store emulating file semantics over a growable buffer.
///
/// Writing past the end zero-extends; writing into the middle overwrites the
/// overlapping tail and extends if the chunk runs past the old end.
#[derive(Debug, Default, Clone)]
pub struct MemoryFile {
    buf: Vec<u8>,
    position: u64,
}

impl MemoryFile {
    /// Empty store, equivalent of a freshly created file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store over existing archive bytes.
    pub fn with_contents(buf: Vec<u8>) -> Self {
        Self { buf, position: 0 }
    }

    /// Borrows the raw archive bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the store, yielding the raw archive bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = (self.position as usize).min(self.buf.len());
        let count = buf.len().min(self.buf.len() - start);
        buf[..count].copy_from_slice(&self.buf[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let start = self.position as usize;
        if start > self.buf.len() {
            // Fill the seek gap, like a sparse file would read back.
            self.buf.resize(start, 0);
        }
        let overlap = buf.len().min(self.buf.len().saturating_sub(start));
        self.buf[start..start + overlap].copy_from_slice(&buf[..overlap]);
        self.buf.extend_from_slice(&buf[overlap..]);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => (self.buf.len() as u64).checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.position = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before byte 0",
            )),
        }
    }
}

impl Storage for MemoryFile {
    fn length(&mut self) -> ZipResult<u64> {
        Ok(self.buf.len() as u64)
    }

    fn truncate(&mut self, new_len: u64) -> ZipResult<()> {
        self.buf.truncate(new_len as usize);
        Ok(())
    }

    fn make_temporary(&self) -> ZipResult<Self> {
        Ok(Self::new())
    }

    fn replace_with(&mut self, replacement: Self) -> ZipResult<()> {
        self.buf = replacement.buf;
        self.position = 0;
        Ok(())
    }
}
