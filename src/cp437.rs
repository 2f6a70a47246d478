//! Decoding of IBM codepage 437 (DOS Latin US) file names.
//!
//! Archives written before general-purpose bit 11 became conventional store
//! their paths in CP437 rather than UTF-8. Only decoding is supported; this
//! library always writes UTF-8 names.

use std::borrow::Cow;

/// Mapping for the high half (0x80..=0xFF); the low half is ASCII.
#[rustfmt::skip]
const HIGH_HALF: [char; 128] = [
    '\u{00c7}', '\u{00fc}', '\u{00e9}', '\u{00e2}', '\u{00e4}', '\u{00e0}', '\u{00e5}', '\u{00e7}',
    '\u{00ea}', '\u{00eb}', '\u{00e8}', '\u{00ef}', '\u{00ee}', '\u{00ec}', '\u{00c4}', '\u{00c5}',
    '\u{00c9}', '\u{00e6}', '\u{00c6}', '\u{00f4}', '\u{00f6}', '\u{00f2}', '\u{00fb}', '\u{00f9}',
    '\u{00ff}', '\u{00d6}', '\u{00dc}', '\u{00a2}', '\u{00a3}', '\u{00a5}', '\u{20a7}', '\u{0192}',
    '\u{00e1}', '\u{00ed}', '\u{00f3}', '\u{00fa}', '\u{00f1}', '\u{00d1}', '\u{00aa}', '\u{00ba}',
    '\u{00bf}', '\u{2310}', '\u{00ac}', '\u{00bd}', '\u{00bc}', '\u{00a1}', '\u{00ab}', '\u{00bb}',
    '\u{2591}', '\u{2592}', '\u{2593}', '\u{2502}', '\u{2524}', '\u{2561}', '\u{2562}', '\u{2556}',
    '\u{2555}', '\u{2563}', '\u{2551}', '\u{2557}', '\u{255d}', '\u{255c}', '\u{255b}', '\u{2510}',
    '\u{2514}', '\u{2534}', '\u{252c}', '\u{251c}', '\u{2500}', '\u{253c}', '\u{255e}', '\u{255f}',
    '\u{255a}', '\u{2554}', '\u{2569}', '\u{2566}', '\u{2560}', '\u{2550}', '\u{256c}', '\u{2567}',
    '\u{2568}', '\u{2564}', '\u{2565}', '\u{2559}', '\u{2558}', '\u{2552}', '\u{2553}', '\u{256b}',
    '\u{256a}', '\u{2518}', '\u{250c}', '\u{2588}', '\u{2584}', '\u{258c}', '\u{2590}', '\u{2580}',
    '\u{03b1}', '\u{00df}', '\u{0393}', '\u{03c0}', '\u{03a3}', '\u{03c3}', '\u{00b5}', '\u{03c4}',
    '\u{03a6}', '\u{0398}', '\u{03a9}', '\u{03b4}', '\u{221e}', '\u{03c6}', '\u{03b5}', '\u{2229}',
    '\u{2261}', '\u{00b1}', '\u{2265}', '\u{2264}', '\u{2320}', '\u{2321}', '\u{00f7}', '\u{2248}',
    '\u{00b0}', '\u{2219}', '\u{00b7}', '\u{221a}', '\u{207f}', '\u{00b2}', '\u{25a0}', '\u{00a0}',
];

fn to_char(input: u8) -> char {
    match input {
        0x00..=0x7f => input as char,
        _ => HIGH_HALF[(input - 0x80) as usize],
    }
}

/// Decodes a CP437 byte string. Borrows when the input is pure ASCII.
pub fn decode(bytes: &[u8]) -> Cow<'_, str> {
    if bytes.is_ascii() {
        // ASCII is a subset of both encodings.
        Cow::Borrowed(std::str::from_utf8(bytes).unwrap_or_default())
    } else {
        Cow::Owned(bytes.iter().copied().map(to_char).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ascii_passthrough() {
        for i in 0x00..0x80u8 {
            assert_eq!(to_char(i), i as char);
        }
        assert!(matches!(decode(b"plain/ascii.txt"), Cow::Borrowed(_)));
    }

    #[test]
    fn high_half() {
        let data = b"Cura\x87ao";
        assert!(std::str::from_utf8(data).is_err());
        assert_eq!(decode(data), "Curaçao");

        let data = [0xCC, 0xCD, 0xCD, 0xB9];
        assert_eq!(decode(&data), "╠══╣");
    }
}
