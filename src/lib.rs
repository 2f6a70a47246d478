//! A library for reading, writing and incrementally mutating ZIP archives.
//!
//! An [`Archive`] wraps a seekable backing store, either a file on disk
//! ([`storage::FileStore`]) or a heap buffer ([`storage::MemoryFile`]), and
//! exposes the members it contains as [`Entry`] values. Member payloads are
//! streamed through closures in bounded chunks, so neither reading nor
//! writing ever materializes a whole payload in memory:
//!
//! ```no_run
//! use zipedit::{AccessMode, Archive, EntryOptions};
//!
//! fn main() -> zipedit::ZipResult<()> {
//!     let mut archive = Archive::open("backup.zip", AccessMode::Update)?;
//!     let greeting = b"hello".to_vec();
//!     archive.add_entry(
//!         "hello.txt",
//!         greeting.len() as u64,
//!         &EntryOptions::new(),
//!         move |position, count| {
//!             let start = position as usize;
//!             Ok(greeting[start..start + count].to_vec())
//!         },
//!     )?;
//!     for entry in archive.entries() {
//!         println!("{}", entry?.path());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Supported member payloads are stored (verbatim) and DEFLATE, with ZIP64
//! extensions for archives and members beyond the classic 32-bit limits.
//! Encryption and multi-disk archives are not supported.

pub use crate::archive::{Archive, Entries, EntryOptions};
pub use crate::codec::{Consumer, Provider, DEFAULT_BUFFER_SIZE};
pub use crate::compression::CompressionMethod;
pub use crate::entry::{Entry, EntryKind};
pub use crate::result::{ZipError, ZipResult};
pub use crate::storage::{AccessMode, FileStore, MemoryFile, Storage};
pub use crate::types::DateTime;

mod archive;
pub mod checksum;
mod codec;
mod compression;
mod cp437;
mod entry;
pub mod result;
mod spec;
pub mod storage;
mod types;
mod zip64;
