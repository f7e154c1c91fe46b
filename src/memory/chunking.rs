// src/memory/chunking.rs
// Line-based chunking of memory files for indexing

use crate::utils::content_hash;

/// A contiguous line range of a source file, the unit of indexing and
/// retrieval. Line numbers are 1-based and inclusive on both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `<path>:<start>:<end>:<hash>` — embeds the content hash so identical
    /// ranges are idempotent across re-indexing
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: u32,
    pub end_line: u32,
    pub hash: String,
    pub text: String,
}

/// Split `content` into overlapping line chunks.
///
/// Produces `[1..size], [size-overlap+1 .. 2*size-overlap], ...` until the
/// file ends; the final chunk covers through the last line even when
/// shorter. Empty or whitespace-only chunks are skipped.
pub fn chunk_content(
    content: &str,
    path: &str,
    source: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size.saturating_sub(1));

    let lines: Vec<&str> = content.split('\n').collect();
    let total = lines.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total {
        let end = (start + chunk_size).min(total);
        let text = lines[start..end].join("\n");

        if !text.trim().is_empty() {
            let hash = content_hash(text.as_bytes());
            chunks.push(Chunk {
                id: format!("{}:{}:{}:{}", path, start + 1, end, hash),
                path: path.to_string(),
                source: source.to_string(),
                start_line: (start + 1) as u32,
                end_line: end as u32,
                hash,
                text,
            });
        }

        if end >= total {
            break;
        }
        start = end - overlap;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: usize) -> String {
        (1..=n)
            .map(|i| format!("line {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_empty_content_yields_no_chunks() {
        assert!(chunk_content("", "f.md", "memory", 400, 80).is_empty());
        assert!(chunk_content("   \n \n", "f.md", "memory", 400, 80).is_empty());
    }

    #[test]
    fn test_single_small_file_is_one_chunk() {
        let chunks = chunk_content("Python decorator examples\n", "f.md", "memory", 400, 80);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 2); // trailing newline yields an empty second line
        assert!(chunks[0].id.starts_with("f.md:1:2:"));
    }

    #[test]
    fn test_overlap_is_exact() {
        let content = lines(25);
        let chunks = chunk_content(&content, "f.md", "memory", 10, 3);

        // [1..10], [8..17], [15..24], [22..25]
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 10);
        for pair in chunks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            // Consecutive chunks share exactly `overlap` lines
            assert_eq!(prev.end_line - next.start_line + 1, 3);
        }
        assert_eq!(chunks.last().unwrap().end_line, 25);
    }

    #[test]
    fn test_start_lines_monotone() {
        let content = lines(1000);
        let chunks = chunk_content(&content, "f.md", "memory", 400, 80);
        let starts: Vec<u32> = chunks.iter().map(|c| c.start_line).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn test_final_chunk_covers_last_line() {
        let content = lines(17);
        let chunks = chunk_content(&content, "f.md", "memory", 10, 2);
        assert_eq!(chunks.last().unwrap().end_line, 17);
    }

    #[test]
    fn test_identical_text_same_hash_distinct_ids_across_paths() {
        let a = chunk_content("same text", "a.md", "memory", 400, 80);
        let b = chunk_content("same text", "b.md", "memory", 400, 80);
        assert_eq!(a[0].hash, b[0].hash);
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let content = lines(500);
        let first = chunk_content(&content, "f.md", "memory", 400, 80);
        let second = chunk_content(&content, "f.md", "memory", 400, 80);
        assert_eq!(first, second);
    }

    #[test]
    fn test_overlap_clamped_below_chunk_size() {
        // Pathological config must still terminate
        let content = lines(10);
        let chunks = chunk_content(&content, "f.md", "memory", 4, 10);
        assert!(!chunks.is_empty());
        assert_eq!(chunks.last().unwrap().end_line, 10);
    }
}
