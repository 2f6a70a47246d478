//! ZIP64 extended information extra field (header ID `0x0001`).
//!
//! | Value                  | Size    | Description                                  |
//! | ---------------------- | ------- | -------------------------------------------- |
//! | `0x0001`               | 2 bytes | Tag for this "extra" block type              |
//! | Size                   | 2 bytes | Size of this "extra" block                   |
//! | Original Size          | 8 bytes | Original uncompressed file size              |
//! | Compressed Size        | 8 bytes | Size of compressed data                      |
//! | Relative Header Offset | 8 bytes | Offset of local header record                |
//! | Disk Start Number      | 4 bytes | Number of the disk on which this file starts |
//!
//! Only the fields whose 32-bit (or 16-bit, for the disk number)
//! counterparts are saturated appear in the serialized form, in exactly the
//! order above. An absent field leaves the nominal value authoritative.

use crate::result::{invalid_archive, ZipResult};
use crate::spec::ZIP64_BYTES_THR;

pub(crate) const ZIP64_EXTRA_FIELD_HEADER_ID: u16 = 0x0001;

/// Which 64-bit overrides the surrounding record requires, derived from its
/// saturated nominal fields.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Zip64Requirements {
    pub uncompressed_size: bool,
    pub compressed_size: bool,
    pub relative_header_offset: bool,
    pub disk_start_number: bool,
}

impl Zip64Requirements {
    fn expected_data_size(self) -> usize {
        let mut size = 0;
        for present in [
            self.uncompressed_size,
            self.compressed_size,
            self.relative_header_offset,
        ] {
            if present {
                size += 8;
            }
        }
        if self.disk_start_number {
            size += 4;
        }
        size
    }

    fn any(self) -> bool {
        self.expected_data_size() > 0
    }
}

/// Parsed ZIP64 extended information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Zip64ExtendedInformation {
    pub uncompressed_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub relative_header_offset: Option<u64>,
    pub disk_start_number: Option<u32>,
}

impl Zip64ExtendedInformation {
    /// Builds the field for a record about to be written. Returns `None`
    /// when no value crosses the 32-bit threshold.
    pub(crate) fn for_values(
        uncompressed_size: u64,
        compressed_size: u64,
        relative_header_offset: u64,
    ) -> Option<Self> {
        let field = Self {
            uncompressed_size: (uncompressed_size >= ZIP64_BYTES_THR).then_some(uncompressed_size),
            compressed_size: (compressed_size >= ZIP64_BYTES_THR).then_some(compressed_size),
            relative_header_offset: (relative_header_offset >= ZIP64_BYTES_THR)
                .then_some(relative_header_offset),
            disk_start_number: None,
        };
        (field != Self::default()).then_some(field)
    }

    /// Decodes the field payload, reading exactly the overrides `req` names.
    pub(crate) fn parse(data: &[u8], req: Zip64Requirements) -> ZipResult<Self> {
        if data.len() != req.expected_data_size() {
            return invalid_archive("zip64 extra field size does not match overflowed fields");
        }

        let mut cursor = data;
        let mut next_u64 = |wanted: bool| -> Option<u64> {
            if !wanted {
                return None;
            }
            let (head, rest) = cursor.split_at(8);
            cursor = rest;
            Some(u64::from_le_bytes(head.try_into().unwrap()))
        };

        let uncompressed_size = next_u64(req.uncompressed_size);
        let compressed_size = next_u64(req.compressed_size);
        let relative_header_offset = next_u64(req.relative_header_offset);
        let disk_start_number = req
            .disk_start_number
            .then(|| u32::from_le_bytes(cursor[0..4].try_into().unwrap()));

        Ok(Self {
            uncompressed_size,
            compressed_size,
            relative_header_offset,
            disk_start_number,
        })
    }

    /// Locates and decodes the field inside a raw extra-field byte string.
    pub(crate) fn from_extra_field(
        extra: &[u8],
        req: Zip64Requirements,
    ) -> ZipResult<Option<Self>> {
        if !req.any() {
            return Ok(None);
        }
        let mut rest = extra;
        while rest.len() >= 4 {
            let id = u16::from_le_bytes(rest[0..2].try_into().unwrap());
            let size = u16::from_le_bytes(rest[2..4].try_into().unwrap()) as usize;
            let Some(body) = rest.get(4..4 + size) else {
                return invalid_archive("extra field entry overruns its container");
            };
            if id == ZIP64_EXTRA_FIELD_HEADER_ID {
                return Self::parse(body, req).map(Some);
            }
            rest = &rest[4 + size..];
        }
        // No 0x0001 entry: the saturated nominal values stay authoritative.
        Ok(None)
    }

    /// Serializes the full TLV entry (header ID, size, present fields).
    pub(crate) fn serialized(&self) -> Vec<u8> {
        let mut data_size = 0u16;
        for field in [
            self.uncompressed_size,
            self.compressed_size,
            self.relative_header_offset,
        ] {
            if field.is_some() {
                data_size += 8;
            }
        }
        if self.disk_start_number.is_some() {
            data_size += 4;
        }

        let mut out = Vec::with_capacity(4 + data_size as usize);
        out.extend(ZIP64_EXTRA_FIELD_HEADER_ID.to_le_bytes());
        out.extend(data_size.to_le_bytes());
        for field in [
            self.uncompressed_size,
            self.compressed_size,
            self.relative_header_offset,
        ]
        .into_iter()
        .flatten()
        {
            out.extend(field.to_le_bytes());
        }
        if let Some(disk) = self.disk_start_number {
            out.extend(disk.to_le_bytes());
        }
        out
    }
}

/// Returns `extra` with any `0x0001` entry removed. Used when an entry is
/// relocated and its offset override must be regenerated.
pub(crate) fn strip_zip64_extra(extra: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(extra.len());
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = u16::from_le_bytes(rest[0..2].try_into().unwrap());
        let size = u16::from_le_bytes(rest[2..4].try_into().unwrap()) as usize;
        let end = (4 + size).min(rest.len());
        if id != ZIP64_EXTRA_FIELD_HEADER_ID {
            out.extend_from_slice(&rest[..end]);
        }
        rest = &rest[end..];
    }
    out.extend_from_slice(rest);
    out
}
