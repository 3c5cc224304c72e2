//! Short (8.3) name scrambling
//!
//! Alternate short names generated inside a box are scrambled so they can
//! neither collide with host short names nor leak the length of the long
//! name. The transformation is reversible with the same 32-bit key.

mod scrambler;

pub use scrambler::{is_legal_short_name, scramble_char, ShortName, ALPHABET_SIZE, SHORT_NAME_MAX};
