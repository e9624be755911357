//! Encoding detection for bytes-on-disk formats.
//!
//! Ladder, in order: BOM sniff → general charset detector (when the
//! `charset-detection` feature is enabled) → `cp1252` → `latin-1`. The
//! detection path is recorded in document metadata so imports are
//! reproducible. The pipeline stays operational without the detector.

use encoding_rs::Encoding;

/// Result of decoding a source file.
#[derive(Debug, Clone)]
pub struct DecodedText {
    pub text: String,
    /// Canonical name of the encoding used.
    pub encoding: String,
    /// How the encoding was chosen: `bom`, `charset-detector`,
    /// `cp1252-fallback`, or `latin-1-fallback`.
    pub method: &'static str,
}

/// Decode raw file bytes using the detection ladder.
pub fn decode_bytes(data: &[u8]) -> DecodedText {
    // 1. BOM sniff (UTF-8 / UTF-16LE / UTF-16BE)
    if let Some((encoding, _bom_len)) = Encoding::for_bom(data) {
        let (text, _, _) = encoding.decode(data);
        return DecodedText {
            text: text.into_owned(),
            encoding: encoding.name().to_string(),
            method: "bom",
        };
    }

    // 2. General charset detector (optional)
    #[cfg(feature = "charset-detection")]
    {
        let mut detector = chardetng::EncodingDetector::new();
        detector.feed(data, true);
        let encoding = detector.guess(None, true);
        let (text, _, had_errors) = encoding.decode(data);
        if !had_errors {
            return DecodedText {
                text: text.into_owned(),
                encoding: encoding.name().to_string(),
                method: "charset-detector",
            };
        }
    }

    // 3. cp1252, falling back to latin-1 when cp1252 cannot represent a byte
    let (text, _, had_errors) = encoding_rs::WINDOWS_1252.decode(data);
    if !had_errors {
        return DecodedText {
            text: text.into_owned(),
            encoding: "windows-1252".to_string(),
            method: "cp1252-fallback",
        };
    }

    // 4. latin-1 proper: a direct byte → U+00xx mapping that never fails
    let text: String = data.iter().map(|&b| b as char).collect();
    DecodedText {
        text,
        encoding: "latin-1".to_string(),
        method: "latin-1-fallback",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_bom_detected() {
        let data = b"\xef\xbb\xbfBonjour";
        let decoded = decode_bytes(data);
        assert_eq!(decoded.method, "bom");
        assert_eq!(decoded.text, "Bonjour");
    }

    #[test]
    fn utf16le_bom_detected() {
        let mut data = vec![0xff, 0xfe];
        for unit in "ab".encode_utf16() {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        let decoded = decode_bytes(&data);
        assert_eq!(decoded.method, "bom");
        assert_eq!(decoded.text, "ab");
    }

    #[test]
    fn plain_ascii_decodes() {
        let decoded = decode_bytes(b"plain ascii text");
        assert_eq!(decoded.text, "plain ascii text");
    }

    #[test]
    fn cp1252_accents_decode() {
        // 0xE9 = é in cp1252/latin-1
        let decoded = decode_bytes(b"caf\xe9");
        assert!(decoded.text.ends_with('é'), "got {:?}", decoded.text);
    }
}
