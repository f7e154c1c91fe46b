// src/utils.rs
// Small shared helpers (hashing, paths, truncation)

use sha2::{Digest, Sha256};
use std::path::Path;

/// SHA-256 hex digest of arbitrary bytes
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lossy path-to-string conversion (paths are always valid UTF-8 in our tree)
pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Truncate a string to at most `max_chars` characters, appending an ellipsis
/// marker when content was dropped. Respects char boundaries.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{}…", truncated)
}

/// Current unix timestamp in seconds
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_stable() {
        let a = content_hash(b"hello");
        let b = content_hash(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_content_hash_differs() {
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
    }

    #[test]
    fn test_truncate_chars_short_input() {
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_truncate_chars_long_input() {
        let out = truncate_chars("abcdef", 3);
        assert!(out.starts_with("abc"));
        assert!(out.ends_with('…'));
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        // Must not split a multi-byte char
        let out = truncate_chars("数据分析助手", 2);
        assert!(out.starts_with("数据"));
    }
}
