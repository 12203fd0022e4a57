//! Decoder for the binary rich-text blobs message stores keep instead of (or
//! next to) a plain text column.
//!
//! The blob is an NSTypedStream archive of an attributed string. Only the first
//! string payload is extracted: it follows the `0x01 '+'` marker and carries a
//! variable-width length prefix. Attribute names further down the stream are
//! scanned for a few well-known keys.
//!
//! Every read is bounds-checked. Malformed input produces a [`DecodeError`],
//! never a panic and never an out-of-bounds slice.

use std::collections::BTreeMap;
use thiserror::Error;

/// `0x04 0x0b "streamtyped"`
pub const STREAM_HEADER: &[u8] = b"\x04\x0bstreamtyped";

/// Precedes the length prefix of the string payload.
const TEXT_MARKER: &[u8] = b"\x01+";

const MENTION_KEY: &[u8] = b"__kIMMentionConfirmedMention";
const FILE_TRANSFER_KEY: &[u8] = b"__kIMFileTransferGUIDAttributeName";

const OBJECT_REPLACEMENT: char = '\u{FFFC}';
const REPLACEMENT: char = '\u{FFFD}';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty blob")]
    Empty,
    #[error("truncated header: need {needed} bytes, have {available}")]
    TruncatedHeader { needed: usize, available: usize },
    #[error("invalid NSTypedStream header")]
    InvalidHeader,
    #[error("no text marker found")]
    MissingTextMarker,
    #[error("truncated length prefix at offset {offset}")]
    TruncatedLength { offset: usize },
    #[error("unknown length encoding: 0x{0:02x}")]
    UnknownLengthMarker(u8),
    #[error("text extends beyond blob: start {start} + length {length} > {available}")]
    PayloadOutOfBounds {
        start: usize,
        length: usize,
        available: usize,
    },
}

/// Length prefix of the string payload, one variant per marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    /// `n` with `n < 0x80`
    Direct(u8),
    /// `0x81 lo hi`
    TwoByteLe(u16),
    /// `0x82 hi lo`
    TwoByteBe(u16),
    /// `0x84 b3 b2 b1 b0`
    FourByteBe(u32),
}

impl LengthPrefix {
    /// Parse the prefix starting at `offset`.
    pub fn parse(blob: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let marker = *blob
            .get(offset)
            .ok_or(DecodeError::TruncatedLength { offset })?;
        let operand = |n: usize| {
            blob.get(offset + 1..offset + 1 + n)
                .ok_or(DecodeError::TruncatedLength { offset })
        };

        match marker {
            n if n < 0x80 => Ok(LengthPrefix::Direct(n)),
            0x81 => {
                let b = operand(2)?;
                Ok(LengthPrefix::TwoByteLe(u16::from_le_bytes([b[0], b[1]])))
            }
            0x82 => {
                let b = operand(2)?;
                Ok(LengthPrefix::TwoByteBe(u16::from_be_bytes([b[0], b[1]])))
            }
            0x84 => {
                let b = operand(4)?;
                Ok(LengthPrefix::FourByteBe(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            other => Err(DecodeError::UnknownLengthMarker(other)),
        }
    }

    /// Bytes occupied by the prefix itself, marker included.
    pub fn encoded_len(&self) -> usize {
        match self {
            LengthPrefix::Direct(_) => 1,
            LengthPrefix::TwoByteLe(_) | LengthPrefix::TwoByteBe(_) => 3,
            LengthPrefix::FourByteBe(_) => 5,
        }
    }

    pub fn length(&self) -> usize {
        match *self {
            LengthPrefix::Direct(n) => n as usize,
            LengthPrefix::TwoByteLe(n) | LengthPrefix::TwoByteBe(n) => n as usize,
            LengthPrefix::FourByteBe(n) => n as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RichTextAttributes {
    pub has_mentions: bool,
    pub has_inline_attachment: bool,
    pub has_object_replacement: bool,
    /// Payload was not valid UTF-8 and was decoded with replacement characters
    pub lossy_utf8: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBody {
    /// Empty string for an explicitly empty payload
    pub text: String,
    pub attributes: RichTextAttributes,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn decode_attributed_body(blob: &[u8]) -> Result<DecodedBody, DecodeError> {
    if blob.is_empty() {
        return Err(DecodeError::Empty);
    }
    if blob.len() < STREAM_HEADER.len() {
        return Err(DecodeError::TruncatedHeader {
            needed: STREAM_HEADER.len(),
            available: blob.len(),
        });
    }
    if !blob.starts_with(STREAM_HEADER) {
        return Err(DecodeError::InvalidHeader);
    }

    let marker_at = find(&blob[STREAM_HEADER.len()..], TEXT_MARKER)
        .map(|i| i + STREAM_HEADER.len())
        .ok_or(DecodeError::MissingTextMarker)?;
    let prefix_at = marker_at + TEXT_MARKER.len();

    // A zero marker is the empty string, not a failure
    if blob.get(prefix_at) == Some(&0) {
        return Ok(DecodedBody {
            text: String::new(),
            attributes: scan_attributes(&blob[prefix_at + 1..], ""),
        });
    }

    let prefix = LengthPrefix::parse(blob, prefix_at)?;
    let start = prefix_at + prefix.encoded_len();
    let length = prefix.length();
    let end = start
        .checked_add(length)
        .filter(|&end| end <= blob.len())
        .ok_or(DecodeError::PayloadOutOfBounds {
            start,
            length,
            available: blob.len(),
        })?;

    let payload = &blob[start..end];
    let (text, lossy) = match std::str::from_utf8(payload) {
        Ok(s) => (s.to_string(), false),
        Err(_) => (String::from_utf8_lossy(payload).into_owned(), true),
    };

    let mut attributes = scan_attributes(&blob[end..], &text);
    attributes.lossy_utf8 = lossy;
    Ok(DecodedBody { text, attributes })
}

/// Attribute keys live in the stream after the payload.
fn scan_attributes(trailer: &[u8], text: &str) -> RichTextAttributes {
    RichTextAttributes {
        has_mentions: find(trailer, MENTION_KEY).is_some(),
        has_inline_attachment: find(trailer, FILE_TRANSFER_KEY).is_some(),
        has_object_replacement: text.contains(OBJECT_REPLACEMENT),
        lossy_utf8: false,
    }
}

/// Map form of [`decode_attributed_body`]: `(text, attributes)`. On failure the
/// text is `None` and the map carries an `error` entry.
pub fn decode(blob: &[u8]) -> (Option<String>, BTreeMap<&'static str, String>) {
    let mut attrs = BTreeMap::new();
    match decode_attributed_body(blob) {
        Ok(body) => {
            let a = body.attributes;
            for (key, set) in [
                ("has_mentions", a.has_mentions),
                ("has_inline_attachment", a.has_inline_attachment),
                ("has_object_replacement", a.has_object_replacement),
                ("lossy_utf8", a.lossy_utf8),
            ] {
                if set {
                    attrs.insert(key, "true".to_string());
                }
            }
            (Some(body.text), attrs)
        }
        Err(e) => {
            attrs.insert("error", e.to_string());
            (None, attrs)
        }
    }
}

/// Remove object-replacement and replacement characters, then trim.
pub fn strip_placeholders(text: &str) -> String {
    text.chars()
        .filter(|&c| c != OBJECT_REPLACEMENT && c != REPLACEMENT)
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn has_meaningful_text(text: Option<&str>) -> bool {
    match text {
        Some(t) => !strip_placeholders(t).is_empty(),
        None => false,
    }
}

/// Outcome of the plain-column → blob → nothing fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextResolution {
    pub text: Option<String>,
    /// Set when a blob was present but could not be decoded
    pub decode_error: Option<DecodeError>,
}

/// Prefer a meaningful plain column; otherwise decode the blob; otherwise none.
pub fn resolve_text(plain: Option<&str>, blob: Option<&[u8]>) -> TextResolution {
    if has_meaningful_text(plain) {
        return TextResolution {
            text: plain.map(strip_placeholders),
            decode_error: None,
        };
    }

    let Some(blob) = blob.filter(|b| !b.is_empty()) else {
        return TextResolution::default();
    };

    match decode_attributed_body(blob) {
        Ok(body) => {
            let text = has_meaningful_text(Some(&body.text)).then(|| strip_placeholders(&body.text));
            TextResolution {
                text,
                decode_error: None,
            }
        }
        Err(e) => TextResolution {
            text: None,
            decode_error: Some(e),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Reference encoder: header, class descriptors, marker, prefix, payload,
    /// then a trailing attribute run naming `keys`.
    pub(crate) fn encode(text: &[u8], prefix: LengthPrefix, keys: &[&[u8]]) -> Vec<u8> {
        let mut out = STREAM_HEADER.to_vec();
        out.extend_from_slice(b"\x81\xe8\x03\x84\x01@\x84\x84\x84\x12NSAttributedString\x00");
        out.extend_from_slice(b"\x84\x84\x08NSObject\x00\x85\x92\x84\x84\x84\x08NSString\x01\x94\x84");
        out.extend_from_slice(TEXT_MARKER);
        match prefix {
            LengthPrefix::Direct(n) => out.push(n),
            LengthPrefix::TwoByteLe(n) => {
                out.push(0x81);
                out.extend_from_slice(&n.to_le_bytes());
            }
            LengthPrefix::TwoByteBe(n) => {
                out.push(0x82);
                out.extend_from_slice(&n.to_be_bytes());
            }
            LengthPrefix::FourByteBe(n) => {
                out.push(0x84);
                out.extend_from_slice(&n.to_be_bytes());
            }
        }
        out.extend_from_slice(text);
        out.extend_from_slice(b"\x86\x84\x02iI\x01\x01\x92\x84\x84\x84\x0cNSDictionary\x00");
        for key in keys {
            out.push(0x84);
            out.extend_from_slice(key);
            out.push(0x86);
        }
        out
    }

    fn encode_text(text: &str) -> Vec<u8> {
        let len = text.len();
        let prefix = if len < 0x80 {
            LengthPrefix::Direct(len as u8)
        } else {
            LengthPrefix::TwoByteLe(len as u16)
        };
        encode(text.as_bytes(), prefix, &[])
    }

    #[test]
    fn test_direct_length() {
        let body = decode_attributed_body(&encode_text("hello there")).unwrap();
        assert_eq!(body.text, "hello there");
        assert_eq!(body.attributes, RichTextAttributes::default());
    }

    #[test]
    fn test_all_prefix_widths() {
        let text = "x".repeat(300);
        for prefix in [
            LengthPrefix::TwoByteLe(300),
            LengthPrefix::TwoByteBe(300),
            LengthPrefix::FourByteBe(300),
        ] {
            let blob = encode(text.as_bytes(), prefix, &[]);
            let body = decode_attributed_body(&blob).unwrap();
            assert_eq!(body.text.len(), 300, "{:?}", prefix);
        }
    }

    #[test]
    fn test_two_byte_le_for_128_to_255() {
        let text = "é".repeat(100); // 200 bytes
        let blob = encode(text.as_bytes(), LengthPrefix::TwoByteLe(200), &[]);
        assert_eq!(decode_attributed_body(&blob).unwrap().text, text);
    }

    #[test]
    fn test_empty_payload_is_empty_string() {
        let blob = encode(b"", LengthPrefix::Direct(0), &[]);
        let (text, attrs) = decode(&blob);
        assert_eq!(text.as_deref(), Some(""));
        assert!(!attrs.contains_key("error"));
    }

    #[test]
    fn test_unknown_marker() {
        let mut blob = encode(b"abc", LengthPrefix::Direct(3), &[]);
        let at = find(&blob, TEXT_MARKER).unwrap() + 2;
        blob[at] = 0x83;
        assert_eq!(
            decode_attributed_body(&blob),
            Err(DecodeError::UnknownLengthMarker(0x83))
        );
    }

    #[test]
    fn test_four_byte_length_past_end() {
        // Declared length is far larger than what follows
        let blob = encode(b"short", LengthPrefix::FourByteBe(1_000_000), &[]);
        let (text, attrs) = decode(&blob);
        assert!(text.is_none());
        assert!(attrs["error"].contains("beyond blob"));
        assert!(matches!(
            decode_attributed_body(&blob),
            Err(DecodeError::PayloadOutOfBounds { length: 1_000_000, .. })
        ));
    }

    #[test]
    fn test_four_byte_prefix_cut_short() {
        let blob = encode(b"", LengthPrefix::FourByteBe(10), &[]);
        let at = find(&blob, TEXT_MARKER).unwrap() + 2;
        let truncated = &blob[..at + 3];
        assert_eq!(
            decode_attributed_body(truncated),
            Err(DecodeError::TruncatedLength { offset: at })
        );
    }

    #[test]
    fn test_truncation_at_every_offset_before_payload_end() {
        let text = "truncate me please";
        let blob = encode_text(text);
        let payload_end = find(&blob, text.as_bytes()).unwrap() + text.len();
        for cut in 0..payload_end {
            assert!(
                decode_attributed_body(&blob[..cut]).is_err(),
                "cut at {} decoded",
                cut
            );
        }
        // Trailing attribute bytes are optional
        for cut in payload_end..=blob.len() {
            assert_eq!(decode_attributed_body(&blob[..cut]).unwrap().text, text);
        }
    }

    #[test]
    fn test_garbage_never_panics() {
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        for round in 0..2000 {
            let len = (round % 64) + 1;
            let mut blob = if round % 2 == 0 {
                STREAM_HEADER.to_vec()
            } else {
                Vec::new()
            };
            for _ in 0..len {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                blob.push((state & 0xff) as u8);
            }
            if round % 3 == 0 {
                blob.extend_from_slice(TEXT_MARKER);
                blob.push(0x84);
            }
            let _ = decode(&blob);
        }
    }

    #[test]
    fn test_header_checks() {
        assert_eq!(decode_attributed_body(&[]), Err(DecodeError::Empty));
        assert!(matches!(
            decode_attributed_body(b"\x04\x0bstream"),
            Err(DecodeError::TruncatedHeader { .. })
        ));
        assert_eq!(
            decode_attributed_body(b"bplist00streamtyped\x01+\x01a"),
            Err(DecodeError::InvalidHeader)
        );
        assert_eq!(
            decode_attributed_body(b"\x04\x0bstreamtyped\x84\x01@"),
            Err(DecodeError::MissingTextMarker)
        );
    }

    #[test]
    fn test_attributes() {
        let text = "hi \u{FFFC} @bob";
        let blob = encode(
            text.as_bytes(),
            LengthPrefix::Direct(text.len() as u8),
            &[MENTION_KEY, FILE_TRANSFER_KEY],
        );
        let body = decode_attributed_body(&blob).unwrap();
        assert!(body.attributes.has_mentions);
        assert!(body.attributes.has_inline_attachment);
        assert!(body.attributes.has_object_replacement);
        assert!(!body.attributes.lossy_utf8);
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let blob = encode(b"ok\xff\xfe", LengthPrefix::Direct(4), &[]);
        let (text, attrs) = decode(&blob);
        assert_eq!(text.as_deref(), Some("ok\u{FFFD}\u{FFFD}"));
        assert_eq!(attrs.get("lossy_utf8").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_strip_placeholders() {
        assert_eq!(strip_placeholders("  \u{FFFC}photo\u{FFFD} "), "photo");
        assert!(!has_meaningful_text(Some("\u{FFFC} \u{FFFC}")));
        assert!(!has_meaningful_text(None));
        assert!(has_meaningful_text(Some("a")));
    }

    #[test]
    fn test_resolve_text_fallback_chain() {
        let blob = encode_text("from blob");

        let plain = resolve_text(Some("from column"), Some(&blob));
        assert_eq!(plain.text.as_deref(), Some("from column"));

        let fallback = resolve_text(Some("\u{FFFC}"), Some(&blob));
        assert_eq!(fallback.text.as_deref(), Some("from blob"));

        let none = resolve_text(None, None);
        assert_eq!(none, TextResolution::default());

        let broken = resolve_text(None, Some(b"\x04\x0bstreamtyped\x01+\x84\x00"));
        assert!(broken.text.is_none());
        assert!(broken.decode_error.is_some());
    }
}
