//! Reversible character substitution for short names
//!
//! The alphabet is the printable range `0x20..0x7E` without the characters
//! that are illegal in file names. Scrambled output therefore is always a
//! legal file name character. The alphabet, its order and the modulus are a
//! fixed on-disk format: names scrambled by one version must unscramble in
//! the next.

use std::fmt;
use tracing::debug;

/// Maximum length of a short name in UTF-16 units (8 + '.' + 3)
pub const SHORT_NAME_MAX: usize = 12;

/// First character of the scrambling alphabet (space)
const FIRST_CHAR: u16 = 0x20;

/// One past the last character of the alphabet (`~` is never scrambled)
const END_CHAR: u16 = 0x7E;

/// Characters that are never produced nor consumed, in ascending order
const RESERVED: [u16; 9] = [
    b'"' as u16,
    b'*' as u16,
    b'/' as u16,
    b':' as u16,
    b'<' as u16,
    b'>' as u16,
    b'?' as u16,
    b'\\' as u16,
    b'|' as u16,
];

/// Number of characters in the scrambling alphabet (94 - 9)
pub const ALPHABET_SIZE: i32 = (END_CHAR - FIRST_CHAR) as i32 - RESERVED.len() as i32;

const DOT: u16 = b'.' as u16;
const SPACE: u16 = b' ' as u16;

/// Scramble (`forward`) or unscramble a single UTF-16 unit.
///
/// Units outside the alphabet are returned unchanged, so the function is
/// total and its own inverse for a given key when `forward` is flipped.
pub fn scramble_char(value: u16, key: u8, forward: bool) -> u16 {
    if !(FIRST_CHAR..END_CHAR).contains(&value) || RESERVED.contains(&value) {
        return value;
    }

    let mut key = i32::from(key & 0x7F) % ALPHABET_SIZE;
    if !forward {
        key = -key;
    }

    // compact the alphabet so that it is contiguous
    let below = RESERVED.iter().filter(|&&r| value > r).count() as i32;
    let index = i32::from(value) - below - i32::from(FIRST_CHAR);

    let shifted = (index + key).rem_euclid(ALPHABET_SIZE);

    // re-expand around the reserved characters
    let mut out = shifted + i32::from(FIRST_CHAR);
    for &r in &RESERVED {
        if out >= i32::from(r) {
            out += 1;
        }
    }

    out as u16
}

/// Check whether `name` is a legal 8.3 short name.
///
/// 1 to 8 base characters, optionally followed by `.` and 1 to 3 extension
/// characters, no reserved characters, no spaces and no second dot.
pub fn is_legal_short_name(name: &str) -> bool {
    let legal = |s: &str| {
        s.chars().all(|c| {
            c.is_ascii_graphic() && c != '.' && !RESERVED.contains(&(c as u16))
        })
    };

    match name.split_once('.') {
        Some((base, ext)) => {
            (1..=8).contains(&base.len()) && (1..=3).contains(&ext.len()) && legal(base) && legal(ext)
        }
        None => (1..=8).contains(&name.len()) && legal(name),
    }
}

/// A short name held in a fixed, stack-allocated UTF-16 buffer
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    chars: [u16; SHORT_NAME_MAX],
    len: usize,
}

impl ShortName {
    /// Create from a string; `None` if it does not fit the 12-unit budget
    pub fn new(name: &str) -> Option<Self> {
        let mut chars = [0u16; SHORT_NAME_MAX];
        let mut len = 0;
        for unit in name.encode_utf16() {
            if len == SHORT_NAME_MAX {
                return None;
            }
            chars[len] = unit;
            len += 1;
        }
        Some(Self { chars, len })
    }

    /// Create from raw UTF-16 units
    pub fn from_utf16(units: &[u16]) -> Option<Self> {
        if units.len() > SHORT_NAME_MAX {
            return None;
        }
        let mut chars = [0u16; SHORT_NAME_MAX];
        chars[..units.len()].copy_from_slice(units);
        Some(Self {
            chars,
            len: units.len(),
        })
    }

    /// The name as UTF-16 units
    pub fn as_utf16(&self) -> &[u16] {
        &self.chars[..self.len]
    }

    /// Length in UTF-16 units
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Scramble the name in place.
    ///
    /// A missing separator is synthesized and the suffix padded with spaces
    /// to three characters; then the character before the separator and the
    /// three suffix characters are scrambled with the four key bytes.
    /// Returns `false`, leaving the name untouched, when the padded name
    /// would not fit the 12-character budget.
    pub fn scramble(&mut self, key: u32) -> bool {
        let dot = self.as_utf16().iter().rposition(|&c| c == DOT);
        let (dot_pos, padded_len) = match dot {
            Some(pos) => (pos, self.len.max(pos + 4)),
            None => (self.len, self.len + 4),
        };

        if padded_len > SHORT_NAME_MAX {
            debug!("short name {} exceeds budget, not scrambled", self);
            return false;
        }

        if dot.is_none() {
            self.chars[dot_pos] = DOT;
        }
        for slot in &mut self.chars[(dot_pos + 1).max(self.len)..padded_len] {
            *slot = SPACE;
        }
        self.len = padded_len;

        self.apply(dot_pos, key, true);
        true
    }

    /// Reverse [`ShortName::scramble`] in place.
    ///
    /// Returns `false` if the name does not have the shape of a scrambled
    /// name (separator followed by exactly three characters).
    pub fn unscramble(&mut self, key: u32) -> bool {
        // the scrambled suffix may contain '.', so the separator is found by
        // position rather than by searching for the last dot
        if self.len < 4 || self.chars[self.len - 4] != DOT {
            return false;
        }
        let dot_pos = self.len - 4;

        self.apply(dot_pos, key, false);

        while self.len > 0 && self.chars[self.len - 1] == SPACE {
            self.len -= 1;
            self.chars[self.len] = 0;
        }
        if self.len > 0 && self.chars[self.len - 1] == DOT {
            self.len -= 1;
            self.chars[self.len] = 0;
        }
        true
    }

    fn apply(&mut self, dot_pos: usize, key: u32, forward: bool) {
        let key_bytes = key.to_le_bytes();

        if dot_pos > 0 {
            self.chars[dot_pos - 1] = scramble_char(self.chars[dot_pos - 1], key_bytes[0], forward);
        }
        for i in 1..=3 {
            self.chars[dot_pos + i] = scramble_char(self.chars[dot_pos + i], key_bytes[i], forward);
        }
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf16_lossy(self.as_utf16()))
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortName({:?})", self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_alphabet_size() {
        assert_eq!(ALPHABET_SIZE, 85);
    }

    #[test]
    fn test_reserved_and_out_of_range_unchanged() {
        for c in ['"', '*', '/', ':', '<', '>', '?', '\\', '|', '~', '\u{7f}', '\u{e9}'] {
            assert_eq!(scramble_char(c as u16, 42, true), c as u16);
        }
        assert_eq!(scramble_char(0x1F, 42, true), 0x1F);
    }

    #[test]
    fn test_zero_key_is_identity() {
        for c in 0x20u16..0x7E {
            assert_eq!(scramble_char(c, 0, true), c);
            // 85 reduces to 0 as well
            assert_eq!(scramble_char(c, 85, true), c);
        }
    }

    #[test]
    fn test_scramble_char_is_bijection_on_alphabet() {
        for key in [1u8, 17, 84, 127, 200] {
            let mut seen = std::collections::HashSet::new();
            for c in 0x20u16..0x7E {
                if RESERVED.contains(&c) {
                    continue;
                }
                let s = scramble_char(c, key, true);
                assert!(!RESERVED.contains(&s), "produced reserved {s:#x}");
                assert!((0x20..0x7E).contains(&s));
                assert!(seen.insert(s));
                assert_eq!(scramble_char(s, key, false), c);
            }
            assert_eq!(seen.len(), ALPHABET_SIZE as usize);
        }
    }

    #[test]
    fn test_scramble_char_skips_reserved() {
        // ')' is followed by '*' which is reserved, so a shift of one lands on '+'
        assert_eq!(scramble_char(b')' as u16, 1, true), b'+' as u16);
        // '}' is the last character of the alphabet and wraps to ' '
        assert_eq!(scramble_char(b'}' as u16, 1, true), b' ' as u16);
    }

    #[test]
    fn test_scramble_pads_and_synthesizes_dot() {
        let mut name = ShortName::new("README").unwrap();
        assert!(name.scramble(0));
        assert_eq!(name.to_string(), "README.   ");

        let mut name = ShortName::new("A.B").unwrap();
        assert!(name.scramble(0));
        assert_eq!(name.to_string(), "A.B  ");
    }

    #[test]
    fn test_scramble_over_budget_is_noop() {
        let mut name = ShortName::new("ABCDEFGHIJ").unwrap();
        let before = name;
        assert!(!name.scramble(0xDEADBEEF));
        assert_eq!(name, before);

        assert!(ShortName::new("ABCDEFGHIJKLM").is_none());
    }

    #[test]
    fn test_scramble_changes_only_four_chars() {
        let mut name = ShortName::new("PROGRA~1.EXE").unwrap();
        assert!(name.scramble(0x0A0B0C0D));
        let scrambled = name.to_string();
        assert_eq!(&scrambled[..7], "PROGRA~");
        assert_eq!(&scrambled[8..9], ".");
        assert_ne!(scrambled, "PROGRA~1.EXE");

        assert!(name.unscramble(0x0A0B0C0D));
        assert_eq!(name.to_string(), "PROGRA~1.EXE");
    }

    #[test]
    fn test_unscramble_rejects_unscrambled_shape() {
        let mut name = ShortName::new("LONGER.TEXT").unwrap();
        assert!(!name.unscramble(7));
        assert_eq!(name.to_string(), "LONGER.TEXT");
    }

    #[test]
    fn test_legal_short_names() {
        assert!(is_legal_short_name("FOO.TXT"));
        assert!(is_legal_short_name("PROGRA~1"));
        assert!(!is_legal_short_name("TOOLONGNAME.TXT"));
        assert!(!is_legal_short_name("A.B.C"));
        assert!(!is_legal_short_name("BAD*.TXT"));
        assert!(!is_legal_short_name(""));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            base in "[A-Z0-9_~$!#%&@^-]{1,8}",
            ext in proptest::option::of("[A-Z0-9_~$-]{1,3}"),
            key in any::<u32>(),
        ) {
            let original = match ext {
                Some(ext) => format!("{base}.{ext}"),
                None => base,
            };
            prop_assert!(is_legal_short_name(&original));

            let mut name = ShortName::new(&original).unwrap();
            prop_assert!(name.scramble(key));
            prop_assert!(name.unscramble(key));
            prop_assert_eq!(name.to_string(), original);
        }
    }
}
