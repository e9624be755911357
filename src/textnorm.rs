//! Text-normalization policy: the deterministic mapping from decoded raw
//! text to `text_norm`.
//!
//! Pipeline, applied in order:
//!
//! 1. Canonical composition (NFC).
//! 2. Line-ending normalization (`CRLF`/`CR` → `LF`).
//! 3. Removal of zero-width and format invisibles (ZWSP, ZWNJ, ZWJ, word
//!    joiner, BOM, soft hyphen).
//! 4. Mapping of non-breaking / narrow / figure / thin spaces to one ASCII
//!    space.
//! 5. Replacement of the domain separator `¤` by one ASCII space; the
//!    separator count is preserved in unit metadata.
//! 6. Removal of ASCII control bytes `0x00..0x1F` except TAB, LF, CR.
//!
//! `text_raw` undergoes only step 2. Identical input yields byte-identical
//! output.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// The domain-specific segment separator preserved in `text_raw`.
pub const SEPARATOR: char = '\u{00A4}';

/// Normalize line endings only (`CRLF`/`CR` → `LF`). This is the sole
/// transformation applied to `text_raw`.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Apply the full normalization policy to produce `text_norm`.
pub fn normalize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let composed: String = text.nfc().collect();
    let composed = normalize_line_endings(&composed);

    let mut out = String::with_capacity(composed.len());
    for ch in composed.chars() {
        match ch {
            // Invisibles: dropped entirely
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' => {}
            // Space variants and the ¤ separator: one ASCII space
            '\u{00A0}' | '\u{202F}' | '\u{2007}' | '\u{2009}' | SEPARATOR => out.push(' '),
            c if (c as u32) < 0x20 && !matches!(c, '\t' | '\n' | '\r') => {}
            c => out.push(c),
        }
    }
    out
}

/// Count `¤` separators in `text_raw` (stored as `sep_count` in unit
/// metadata).
pub fn count_separators(text_raw: &str) -> usize {
    text_raw.chars().filter(|&c| c == SEPARATOR).count()
}

/// Hex SHA-256 of raw bytes (used for `source_hash`).
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
