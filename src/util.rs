//! Shared utility functions

use std::path::Path;

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8 boundaries.
///
/// If the string is already shorter than `max_bytes`, returns it unchanged.
/// Otherwise, finds the last valid UTF-8 character boundary at or before `max_bytes`
/// and returns a slice up to that point.
///
/// Used for provider tool-name limits (the Responses API caps names at 64 chars).
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Generate a unique message ID in the Anthropic `msg_` format.
///
/// Format: msg_<12 hex chars>. Uses RandomState to get a random value
/// without adding a dependency.
pub fn generate_message_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let random = RandomState::new().build_hasher().finish();
    format!("msg_{:012x}", random & 0xFFFF_FFFF_FFFF)
}

/// Split a `data:<media_type>;base64,<data>` URL into (media_type, data).
///
/// Returns None for non-data URLs or malformed headers. The base64 payload is
/// passed through untouched; nothing in the proxy ever decodes image bytes.
pub fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let media_type = header.split(';').next().unwrap_or("image/png");
    if media_type.is_empty() {
        return None;
    }
    Some((media_type, data))
}

/// Build a `data:` URL from a media type and base64 payload.
pub fn to_data_url(media_type: &str, data: &str) -> String {
    format!("data:{};base64,{}", media_type, data)
}

/// Write JSON to `path` atomically: write a `.tmp` sibling, then rename.
///
/// Errors are returned so the caller can decide whether they matter; token
/// status snapshots log them at debug and move on.
pub fn write_json_atomic(path: &Path, value: &serde_json::Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_shorter_than_max() {
        assert_eq!(truncate_utf8_safe("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_at_ascii_boundary() {
        assert_eq!(truncate_utf8_safe("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_at_utf8_boundary() {
        // Each character is 3 bytes, so 9 bytes total
        let s = "日本語";
        assert_eq!(truncate_utf8_safe(s, 4), "日");
        assert_eq!(truncate_utf8_safe(s, 6), "日本");
    }

    #[test]
    fn test_message_id_format() {
        let id = generate_message_id();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 16);
    }

    #[test]
    fn test_split_data_url() {
        let (mt, data) = split_data_url("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(mt, "image/png");
        assert_eq!(data, "iVBORw0KGgo=");
    }

    #[test]
    fn test_split_data_url_rejects_plain_urls() {
        assert!(split_data_url("https://example.com/cat.png").is_none());
        assert!(split_data_url("data:").is_none());
    }

    #[test]
    fn test_data_url_round_trip() {
        let url = to_data_url("image/jpeg", "abc123");
        let (mt, data) = split_data_url(&url).unwrap();
        assert_eq!(mt, "image/jpeg");
        assert_eq!(data, "abc123");
    }
}
