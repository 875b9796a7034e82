//! Decodes ZIP entry names that aren't flagged UTF-8, detecting between
//! CP437 (the historical MS-DOS default) and Shift-JIS using a confidence
//! heuristic before falling back to lossy UTF-8.
//!
//! Grounded on `rc-zip`'s archive FSM encoding-detection block and its
//! standalone `encoding.rs` / `detect_utf8` helper: both run `chardetng`
//! over the accumulated central directory name bytes and special-case
//! suspicious bytes for CP437 using `oem_cp`.

use chardetng::EncodingDetector;

/// Decodes a single entry name, given whether the archive's central
/// directory as a whole was judged UTF-8-clean.
pub fn decode_name(raw: &[u8], is_utf8_flagged: bool, archive_is_utf8: bool) -> String {
    if is_utf8_flagged || archive_is_utf8 {
        if let Ok(s) = std::str::from_utf8(raw) {
            return s.to_string();
        }
    }
    decode_non_utf8(raw)
}

fn decode_non_utf8(raw: &[u8]) -> String {
    let mut detector = EncodingDetector::new();
    detector.feed(raw, true);
    let (encoding, confident) = detector.guess_assess(None, true);
    if confident {
        let (decoded, _, _) = encoding.decode(raw);
        return decoded.into_owned();
    }
    decode_cp437(raw)
}

/// Decodes bytes as IBM codepage 437, the conventional fallback for ZIP
/// names that predate the UTF-8 flag bit and aren't Shift-JIS.
pub fn decode_cp437(raw: &[u8]) -> String {
    oem_cp::decode_string_complete_table(raw, &oem_cp::code_table::CP437_WINGDINGS)
}

/// Scans a whole central directory's accumulated name bytes to decide
/// whether the archive as a whole looks like plain UTF-8 (used when
/// individual entries don't carry the UTF-8 flag but the archive-wide text
/// is still safely ASCII/UTF-8; runs once over every name before any
/// per-entry decode.
pub fn archive_looks_utf8(all_names: &[u8]) -> bool {
    std::str::from_utf8(all_names).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_name_is_utf8() {
        assert_eq!(decode_name(b"hello.txt", true, false), "hello.txt");
    }

    #[test]
    fn cp437_fallback_round_trips_ascii() {
        assert_eq!(decode_cp437(b"readme.txt"), "readme.txt");
    }
}
