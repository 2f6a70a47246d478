//! Streaming DEFLATE codec driven by provider/consumer callbacks.
//!
//! The codec never owns the whole payload: a [`Provider`] hands it input
//! chunks on demand and a [`Consumer`] receives output chunks as the
//! internal buffer fills. Streams are raw deflate (no zlib wrapper, the
//! equivalent of window bits −15), which is what ZIP entries store.
//!
//! A running CRC-32 is folded over the *uncompressed* side of the stream:
//! input chunks while compressing, output chunks while decompressing.
//! Either callback may return [`ZipError::Cancelled`] (or any other error)
//! at a chunk boundary, which aborts the loop immediately.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;

use crate::checksum::{crc32, CRC32_SEED};
use crate::result::{ZipError, ZipResult};

/// Default chunk size for all streaming operations, 16 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Supplies `count` bytes of input located at `position`. May return fewer
/// bytes only at the very end of the stream.
pub trait Provider: FnMut(u64, usize) -> ZipResult<Vec<u8>> {}
impl<T: FnMut(u64, usize) -> ZipResult<Vec<u8>>> Provider for T {}

/// Receives one chunk of output.
pub trait Consumer: FnMut(&[u8]) -> ZipResult<()> {}
impl<T: FnMut(&[u8]) -> ZipResult<()>> Consumer for T {}

fn check_buffer_size(buffer_size: usize) -> ZipResult<()> {
    if buffer_size == 0 {
        return Err(ZipError::InvalidBufferSize(buffer_size));
    }
    Ok(())
}

/// Compresses `size` bytes pulled from `provider`, pushing deflate output to
/// `consumer`. Returns the CRC-32 of the uncompressed input.
pub fn compress(
    size: u64,
    buffer_size: usize,
    mut provider: impl Provider,
    mut consumer: impl Consumer,
) -> ZipResult<u32> {
    check_buffer_size(buffer_size)?;

    let mut deflater = Compress::new(Compression::default(), false);
    let mut out = vec![0u8; buffer_size];
    let mut checksum = CRC32_SEED;
    let mut position = 0u64;

    while position < size {
        let want = buffer_size.min((size - position) as usize);
        let chunk = provider(position, want)?;
        if chunk.is_empty() {
            return Err(ZipError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        checksum = crc32(checksum, &chunk);
        position += chunk.len() as u64;

        let mut offset = 0;
        while offset < chunk.len() {
            let consumed_before = deflater.total_in();
            let produced_before = deflater.total_out();
            let status = deflater
                .compress(&chunk[offset..], &mut out, FlushCompress::None)
                .map_err(|_| ZipError::CorruptedData)?;
            offset += (deflater.total_in() - consumed_before) as usize;
            let produced = (deflater.total_out() - produced_before) as usize;
            if produced > 0 {
                consumer(&out[..produced])?;
            }
            match status {
                Status::Ok | Status::BufError => {}
                Status::StreamEnd => break,
            }
        }
    }

    // Drain whatever the deflater still buffers.
    loop {
        let produced_before = deflater.total_out();
        let status = deflater
            .compress(&[], &mut out, FlushCompress::Finish)
            .map_err(|_| ZipError::CorruptedData)?;
        let produced = (deflater.total_out() - produced_before) as usize;
        if produced > 0 {
            consumer(&out[..produced])?;
        }
        if status == Status::StreamEnd {
            break;
        }
    }

    Ok(checksum)
}

/// Decompresses `size` bytes of deflate input pulled from `provider`,
/// pushing plaintext to `consumer`. Returns the CRC-32 of the output, or
/// `0` when `skip_crc32` trades verification for speed.
pub fn decompress(
    size: u64,
    buffer_size: usize,
    skip_crc32: bool,
    mut provider: impl Provider,
    mut consumer: impl Consumer,
) -> ZipResult<u32> {
    check_buffer_size(buffer_size)?;

    let mut inflater = Decompress::new(false);
    let mut out = vec![0u8; buffer_size];
    let mut checksum = CRC32_SEED;
    let mut position = 0u64;
    let mut finished = size == 0;

    while !finished && position < size {
        let want = buffer_size.min((size - position) as usize);
        let chunk = provider(position, want)?;
        if chunk.is_empty() {
            return Err(ZipError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        position += chunk.len() as u64;

        let mut offset = 0;
        loop {
            let consumed_before = inflater.total_in();
            let produced_before = inflater.total_out();
            let status = inflater
                .decompress(&chunk[offset..], &mut out, FlushDecompress::None)
                .map_err(|_| ZipError::CorruptedData)?;
            offset += (inflater.total_in() - consumed_before) as usize;
            let produced = (inflater.total_out() - produced_before) as usize;
            if produced > 0 {
                if !skip_crc32 {
                    checksum = crc32(checksum, &out[..produced]);
                }
                consumer(&out[..produced])?;
            }
            match status {
                Status::StreamEnd => {
                    finished = true;
                    break;
                }
                Status::Ok | Status::BufError => {
                    if offset >= chunk.len() && produced == 0 {
                        break;
                    }
                }
            }
        }
    }

    if !finished {
        // All declared input consumed without the stream terminating.
        return Err(ZipError::CorruptedData);
    }

    Ok(checksum)
}

/// Copies `size` bytes from `provider` to `consumer` verbatim, returning
/// their CRC-32. The streaming path for `CompressionMethod::Stored`.
pub(crate) fn transfer(
    size: u64,
    buffer_size: usize,
    mut provider: impl Provider,
    mut consumer: impl Consumer,
) -> ZipResult<u32> {
    check_buffer_size(buffer_size)?;

    let mut checksum = CRC32_SEED;
    let mut position = 0u64;
    while position < size {
        let want = buffer_size.min((size - position) as usize);
        let chunk = provider(position, want)?;
        if chunk.is_empty() {
            return Err(ZipError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        checksum = crc32(checksum, &chunk);
        position += chunk.len() as u64;
        consumer(&chunk)?;
    }
    Ok(checksum)
}

#[cfg(test)]
mod test {
    use super::*;

    fn slice_provider(data: &[u8]) -> impl Provider + '_ {
        move |position: u64, count: usize| {
            let start = position as usize;
            let end = (start + count).min(data.len());
            Ok(data[start..end].to_vec())
        }
    }

    fn deflate_roundtrip(payload: &[u8], buffer_size: usize) {
        let mut compressed = Vec::new();
        let crc_in = compress(
            payload.len() as u64,
            buffer_size,
            slice_provider(payload),
            |chunk: &[u8]| {
                compressed.extend_from_slice(chunk);
                Ok(())
            },
        )
        .unwrap();

        let mut restored = Vec::new();
        let crc_out = decompress(
            compressed.len() as u64,
            buffer_size,
            false,
            slice_provider(&compressed),
            |chunk: &[u8]| {
                restored.extend_from_slice(chunk);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(restored, payload);
        assert_eq!(crc_in, crc_out);
        assert_eq!(crc_in, crc32(CRC32_SEED, payload));
    }

    #[test]
    fn roundtrip_text() {
        deflate_roundtrip(b"Lorem ipsum dolor sit amet, consectetur adipiscing elit.", 512);
    }

    #[test]
    fn roundtrip_empty() {
        deflate_roundtrip(b"", 512);
    }

    #[test]
    fn roundtrip_incompressible_with_tiny_buffer() {
        // Pseudo-random bytes expand slightly under deflate; a 1-byte buffer
        // forces every drain path in the loop.
        let mut state = 0x2545F491u32;
        let payload: Vec<u8> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(48271) % 0x7FFFFFFF;
                (state >> 7) as u8
            })
            .collect();
        deflate_roundtrip(&payload, 1);
    }

    #[test]
    fn roundtrip_large_repetitive() {
        let payload = b"0123456789abcdef".repeat(8192);
        deflate_roundtrip(&payload, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn skip_crc32_returns_zero() {
        let payload = b"check me";
        let mut compressed = Vec::new();
        compress(
            payload.len() as u64,
            64,
            slice_provider(payload),
            |chunk: &[u8]| {
                compressed.extend_from_slice(chunk);
                Ok(())
            },
        )
        .unwrap();

        let crc = decompress(
            compressed.len() as u64,
            64,
            true,
            slice_provider(&compressed),
            |_: &[u8]| Ok(()),
        )
        .unwrap();
        assert_eq!(crc, 0);
    }

    #[test]
    fn corrupt_stream_detected() {
        let err = decompress(
            4,
            64,
            false,
            slice_provider(&[0xde, 0xad, 0xbe, 0xef]),
            |_: &[u8]| Ok(()),
        )
        .unwrap_err();
        assert!(matches!(err, ZipError::CorruptedData | ZipError::Io(_)));
    }

    #[test]
    fn consumer_cancellation_aborts() {
        let payload = b"ab".repeat(65536);
        let mut calls = 0;
        let err = compress(
            payload.len() as u64,
            64,
            slice_provider(&payload),
            |_: &[u8]| {
                calls += 1;
                if calls >= 2 {
                    Err(ZipError::Cancelled)
                } else {
                    Ok(())
                }
            },
        )
        .unwrap_err();
        assert!(matches!(err, ZipError::Cancelled));
    }

    #[test]
    fn zero_buffer_size_rejected() {
        let err = compress(1, 0, |_, _| Ok(vec![0]), |_: &[u8]| Ok(())).unwrap_err();
        assert!(matches!(err, ZipError::InvalidBufferSize(0)));
    }

    #[test]
    fn transfer_preserves_bytes_and_crc() {
        let payload = b"stored, not squashed";
        let mut copied = Vec::new();
        let crc = transfer(
            payload.len() as u64,
            7,
            slice_provider(payload),
            |chunk: &[u8]| {
                copied.extend_from_slice(chunk);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(copied, payload);
        assert_eq!(crc, crc32(CRC32_SEED, payload));
    }
}
