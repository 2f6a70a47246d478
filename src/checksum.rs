//! Running CRC-32 and Adler-32 checksums over byte chunks.
//!
//! Both functions fold a chunk into a previously returned value, so a stream
//! can be checksummed without ever holding it in memory:
//!
//! ```
//! use zipedit::checksum::crc32;
//!
//! let whole = crc32(0, b"hello world");
//! let mut running = crc32(0, b"hello ");
//! running = crc32(running, b"world");
//! assert_eq!(whole, running);
//! ```
//!
//! With the default `fast-checksums` feature the work is delegated to
//! `crc32fast` and `adler2`; without it a portable table-driven fallback is
//! used. The two paths produce bit-identical results.

/// Initial seed for [`crc32`].
pub const CRC32_SEED: u32 = 0;

/// Initial seed for [`adler32`].
pub const ADLER32_SEED: u32 = 1;

/// Folds `data` into a running CRC-32 (IEEE, reflected, poly `0xEDB88320`).
///
/// Pass [`CRC32_SEED`] for the first chunk and the previous return value for
/// every subsequent chunk.
#[cfg(feature = "fast-checksums")]
pub fn crc32(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// Folds `data` into a running CRC-32 (IEEE, reflected, poly `0xEDB88320`).
///
/// Pass [`CRC32_SEED`] for the first chunk and the previous return value for
/// every subsequent chunk.
#[cfg(not(feature = "fast-checksums"))]
pub fn crc32(seed: u32, data: &[u8]) -> u32 {
    portable::crc32(seed, data)
}

/// Folds `data` into a running Adler-32 checksum.
///
/// Pass [`ADLER32_SEED`] for the first chunk and the previous return value
/// for every subsequent chunk.
#[cfg(feature = "fast-checksums")]
pub fn adler32(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = adler2::Adler32::from_checksum(seed);
    hasher.write_slice(data);
    hasher.checksum()
}

/// Folds `data` into a running Adler-32 checksum.
///
/// Pass [`ADLER32_SEED`] for the first chunk and the previous return value
/// for every subsequent chunk.
#[cfg(not(feature = "fast-checksums"))]
pub fn adler32(seed: u32, data: &[u8]) -> u32 {
    portable::adler32(seed, data)
}

#[cfg_attr(feature = "fast-checksums", allow(dead_code))]
pub(crate) mod portable {
    const CRC32_TABLE: [u32; 256] = build_crc32_table();

    const fn build_crc32_table() -> [u32; 256] {
        let mut table = [0u32; 256];
        let mut n = 0;
        while n < 256 {
            let mut c = n as u32;
            let mut k = 0;
            while k < 8 {
                c = if c & 1 != 0 {
                    0xEDB88320 ^ (c >> 1)
                } else {
                    c >> 1
                };
                k += 1;
            }
            table[n] = c;
            n += 1;
        }
        table
    }

    pub(crate) fn crc32(seed: u32, data: &[u8]) -> u32 {
        let mut crc = !seed;
        for byte in data {
            crc = CRC32_TABLE[((crc ^ *byte as u32) & 0xFF) as usize] ^ (crc >> 8);
        }
        !crc
    }

    const BASE: u32 = 65521;
    // Largest n such that 255 * n * (n + 1) / 2 + (n + 1) * (BASE - 1) fits in u32.
    const NMAX: usize = 5552;

    pub(crate) fn adler32(seed: u32, data: &[u8]) -> u32 {
        let mut a = seed & 0xFFFF;
        let mut b = seed >> 16;
        for chunk in data.chunks(NMAX) {
            for byte in chunk {
                a += *byte as u32;
                b += a;
            }
            a %= BASE;
            b %= BASE;
        }
        (b << 16) | a
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crc32_known_values() {
        assert_eq!(crc32(CRC32_SEED, b""), 0);
        assert_eq!(crc32(CRC32_SEED, b"1234"), 0x9be3e0a3);
        assert_eq!(crc32(CRC32_SEED, b"123456789"), 0xcbf43926);
    }

    #[test]
    fn adler32_known_values() {
        assert_eq!(adler32(ADLER32_SEED, b""), 1);
        assert_eq!(adler32(ADLER32_SEED, b"Wikipedia"), 0x11e60398);
    }

    #[test]
    fn chunked_equals_whole() {
        let data: Vec<u8> = (0u16..2048).map(|i| (i % 251) as u8).collect();
        let whole_crc = crc32(CRC32_SEED, &data);
        let whole_adler = adler32(ADLER32_SEED, &data);

        let mut running_crc = CRC32_SEED;
        let mut running_adler = ADLER32_SEED;
        for chunk in data.chunks(97) {
            running_crc = crc32(running_crc, chunk);
            running_adler = adler32(running_adler, chunk);
        }
        assert_eq!(whole_crc, running_crc);
        assert_eq!(whole_adler, running_adler);
    }

    /// The portable fallback must agree with whichever path is active.
    #[test]
    fn portable_path_agrees() {
        let data: Vec<u8> = (0u16..4096).map(|i| (i ^ (i >> 3)) as u8).collect();
        for len in [0, 1, 2, 255, 256, 1024, 4096] {
            let slice = &data[..len];
            assert_eq!(crc32(CRC32_SEED, slice), portable::crc32(CRC32_SEED, slice));
            assert_eq!(
                adler32(ADLER32_SEED, slice),
                portable::adler32(ADLER32_SEED, slice)
            );
        }
    }

    #[test]
    fn adler32_deferred_reduction_boundary() {
        // Exercise inputs straddling the NMAX batch size with high bytes.
        let data = vec![0xFFu8; 5552 * 2 + 13];
        let mut running = ADLER32_SEED;
        for chunk in data.chunks(1000) {
            running = adler32(running, chunk);
        }
        assert_eq!(running, adler32(ADLER32_SEED, &data));
    }
}
