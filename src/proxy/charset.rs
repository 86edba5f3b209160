use std::borrow::Cow;

use encoding_rs::{Encoding, REPLACEMENT, UTF_8};
use tracing::debug;

/// Value of the `charset` parameter of a `Content-Type`, if any.
pub fn declared_charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let label = value.trim().trim_matches('"').trim_matches('\'').trim();
        (!label.is_empty()).then(|| label.to_string())
    })
}

/// Pick the decoder for a response. Unknown or undecodable labels fall back
/// to UTF-8 without failing.
pub fn resolve_charset(content_type: Option<&str>) -> &'static Encoding {
    let Some(label) = content_type.and_then(declared_charset) else {
        return UTF_8;
    };

    match Encoding::for_label(label.as_bytes()) {
        // The replacement encoding decodes everything to U+FFFD.
        Some(encoding) if encoding != REPLACEMENT => encoding,
        _ => {
            debug!("Unsupported charset '{}', using UTF-8", label);
            UTF_8
        }
    }
}

pub fn decode_text<'a>(bytes: &'a [u8], encoding: &'static Encoding) -> Cow<'a, str> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        debug!("Malformed {} sequences replaced while decoding", encoding.name());
    }
    text
}

/// Encode `text` for emission. Returns the bytes and the encoding actually
/// used, which differs from `encoding` for UTF-16 variants.
pub fn encode_text(text: &str, encoding: &'static Encoding) -> (Vec<u8>, &'static Encoding) {
    let (bytes, used, _) = encoding.encode(text);
    (bytes.into_owned(), used)
}

/// `Content-Type` to emit for a body re-encoded as `emitted`.
///
/// The original value is kept when it already names a charset resolving to
/// `emitted`. Otherwise the charset parameter is replaced (or added when the
/// original declared one that could not be honored).
pub fn corrected_content_type(original: &str, emitted: &'static Encoding) -> String {
    match declared_charset(original) {
        None => original.to_string(),
        Some(label) if Encoding::for_label(label.as_bytes()) == Some(emitted) => original.to_string(),
        Some(_) => {
            let mut parts: Vec<String> = original
                .split(';')
                .filter(|part| {
                    part.split_once('=')
                        .map_or(true, |(name, _)| !name.trim().eq_ignore_ascii_case("charset"))
                })
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect();
            parts.push(format!("charset={}", emitted.name().to_ascii_lowercase()));
            parts.join("; ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{SHIFT_JIS, UTF_16LE, WINDOWS_1252};

    #[test]
    fn test_declared_charset_parsing() {
        assert_eq!(declared_charset("text/html; charset=ISO-8859-1").as_deref(), Some("ISO-8859-1"));
        assert_eq!(declared_charset("text/html;Charset=\"utf-8\"").as_deref(), Some("utf-8"));
        assert_eq!(declared_charset("text/css; foo=bar; CHARSET='shift_jis'").as_deref(), Some("shift_jis"));
        assert_eq!(declared_charset("text/html"), None);
        assert_eq!(declared_charset("text/html; charset="), None);
    }

    #[test]
    fn test_resolution_and_fallback() {
        assert_eq!(resolve_charset(None), UTF_8);
        assert_eq!(resolve_charset(Some("text/html")), UTF_8);
        assert_eq!(resolve_charset(Some("text/html; charset=iso-8859-1")), WINDOWS_1252);
        assert_eq!(resolve_charset(Some("text/html; charset=Shift_JIS")), SHIFT_JIS);
        assert_eq!(resolve_charset(Some("text/html; charset=no-such-charset")), UTF_8);
        assert_eq!(resolve_charset(Some("text/html; charset=iso-2022-kr")), UTF_8);
        assert_eq!(resolve_charset(Some("text/html; charset=\"\u{1F600}\"")), UTF_8);
    }

    #[test]
    fn test_malformed_charset_keeps_ascii_intact() {
        let body = b"<a href=\"/x\">plain ascii</a>";
        let encoding = resolve_charset(Some("text/html; charset=bogus!!"));
        let text = decode_text(body, encoding);
        assert_eq!(text, "<a href=\"/x\">plain ascii</a>");
        let (bytes, used) = encode_text(&text, encoding);
        assert_eq!(bytes, body);
        assert_eq!(used, UTF_8);
    }

    #[test]
    fn test_legacy_round_trip() {
        let body = b"caf\xe9";
        let encoding = resolve_charset(Some("text/html; charset=latin1"));
        let text = decode_text(body, encoding);
        assert_eq!(text, "caf\u{e9}");
        let (bytes, used) = encode_text(&text, encoding);
        assert_eq!(bytes, body);
        assert_eq!(used, WINDOWS_1252);
    }

    #[test]
    fn test_utf16_is_emitted_as_utf8() {
        let (_, used) = encode_text("hi", UTF_16LE);
        assert_eq!(used, UTF_8);
        assert_eq!(
            corrected_content_type("text/html; charset=utf-16le", used),
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn test_content_type_correction() {
        assert_eq!(corrected_content_type("text/html", UTF_8), "text/html");
        assert_eq!(
            corrected_content_type("text/html; charset=UTF-8", UTF_8),
            "text/html; charset=UTF-8"
        );
        assert_eq!(
            corrected_content_type("text/html; charset=bogus; q=1", UTF_8),
            "text/html; q=1; charset=utf-8"
        );
    }
}
