// src/memory/index_tests.rs
// Integration tests for indexing and hybrid search

use crate::memory::embeddings::EmbeddingProvider;
use crate::memory::indexer::MemoryIndexer;
use crate::memory::rotation::IndexRotation;
use crate::memory::search::SearchOptions;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

fn make_indexer(base: &Path, fts_enabled: bool) -> Arc<MemoryIndexer> {
    let rotation = IndexRotation::new(base.join(".index"), "memory".to_string(), 50.0);
    Arc::new(MemoryIndexer::new(rotation, 400, 80, fts_enabled, None))
}

/// Deterministic toy embeddings: direction encodes whether the text
/// mentions "decorator" (axis 0) or "revenue" (axis 1).
struct ToyEmbeddings;

#[async_trait]
impl EmbeddingProvider for ToyEmbeddings {
    fn name(&self) -> &str {
        "toy"
    }

    fn model(&self) -> &str {
        "toy-2d"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                let a = if t.contains("decorator") { 1.0 } else { 0.1 };
                let b = if t.contains("revenue") { 1.0 } else { 0.1 };
                vec![a, b]
            })
            .collect())
    }
}

fn search_opts(min_score: f64) -> SearchOptions {
    SearchOptions {
        max_results: 6,
        min_score,
        source_filter: Some("memory".to_string()),
        use_hybrid: true,
        vector_weight: 0.7,
        text_weight: 0.3,
        context_lines: 2,
    }
}

#[tokio::test]
async fn test_index_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("test.md");
    std::fs::write(&file, "Python decorator examples\n").unwrap();

    let indexer = make_indexer(dir.path(), true);

    let first = indexer.index_file(&file).await.unwrap();
    assert!(first.updated);
    assert_eq!(first.chunks_added, 1);

    let second = indexer.index_file(&file).await.unwrap();
    assert!(!second.updated);
    assert_eq!(second.chunks_added, 0);

    let results = indexer.search("decorator", &search_opts(0.0)).await.unwrap();
    assert_eq!(results.results.len(), 1);
    assert!(results.results[0].score > 0.0);
}

#[tokio::test]
async fn test_reindex_on_content_change() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("test.md");
    std::fs::write(&file, "original content line\n").unwrap();

    let indexer = make_indexer(dir.path(), true);
    indexer.index_file(&file).await.unwrap();

    std::fs::write(&file, "replaced content entirely\n").unwrap();
    let outcome = indexer.index_file(&file).await.unwrap();
    assert!(outcome.updated);

    let old = indexer.search("original", &search_opts(0.0)).await.unwrap();
    assert!(old.results.is_empty(), "old chunks must be gone");
    let new = indexer.search("replaced", &search_opts(0.0)).await.unwrap();
    assert_eq!(new.results.len(), 1);
}

#[tokio::test]
async fn test_empty_file_indexes_with_zero_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("empty.md");
    std::fs::write(&file, "").unwrap();

    let indexer = make_indexer(dir.path(), true);
    let outcome = indexer.index_file(&file).await.unwrap();
    assert!(outcome.updated);
    assert_eq!(outcome.chunks_added, 0);
}

#[tokio::test]
async fn test_query_empty_corpus_returns_empty() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = make_indexer(dir.path(), true);
    let response = indexer.search("anything", &search_opts(0.0)).await.unwrap();
    assert!(response.results.is_empty());

    // Blank query is also not an error
    let response = indexer.search("   ", &search_opts(0.0)).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_fts_degradation_to_like() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("facts.md");
    std::fs::write(&file, "x marks the spot\nx appears twice: x\n").unwrap();

    // FTS creation "fails" (disabled); LIKE path serves queries
    let indexer = make_indexer(dir.path(), false);
    indexer.index_file(&file).await.unwrap();

    let status = indexer.status().await.unwrap();
    assert!(!status.fts_available);

    let response = indexer.search("x", &search_opts(0.0)).await.unwrap();
    assert!(!response.results.is_empty());
    for result in &response.results {
        assert!(result.score >= 0.0 && result.score <= 1.0);
    }
}

#[tokio::test]
async fn test_results_sorted_and_bounded() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..10 {
        let file = dir.path().join(format!("f{}.md", i));
        std::fs::write(&file, format!("searchable text number {}\n", i)).unwrap();
    }

    let indexer = make_indexer(dir.path(), true);
    for i in 0..10 {
        indexer
            .index_file(&dir.path().join(format!("f{}.md", i)))
            .await
            .unwrap();
    }

    let mut opts = search_opts(0.0);
    opts.max_results = 4;
    let response = indexer.search("searchable", &opts).await.unwrap();
    assert!(response.results.len() <= 4);
    for pair in response.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for result in &response.results {
        assert!(result.score >= 0.0 && result.score <= 1.0);
    }
}

#[tokio::test]
async fn test_hybrid_search_with_vectors() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("a.md"),
        "Python decorator examples for wrapping functions\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.md"),
        "Quarterly revenue analysis for March\n",
    )
    .unwrap();

    let rotation = IndexRotation::new(dir.path().join(".index"), "memory".to_string(), 50.0);
    let indexer = Arc::new(MemoryIndexer::new(
        rotation,
        400,
        80,
        true,
        Some(Arc::new(ToyEmbeddings)),
    ));
    indexer.index_file(&dir.path().join("a.md")).await.unwrap();
    indexer.index_file(&dir.path().join("b.md")).await.unwrap();

    let response = indexer
        .search("decorator patterns", &search_opts(0.0))
        .await
        .unwrap();
    assert!(response.used_hybrid);
    assert!(!response.degraded);
    assert!(!response.results.is_empty());
    assert!(response.results[0].text.contains("decorator"));
}

#[tokio::test]
async fn test_embedding_failure_degrades_to_text() {
    struct FailingEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbeddings {
        fn name(&self) -> &str {
            "failing"
        }
        fn model(&self) -> &str {
            "failing"
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("provider offline")
        }
    }

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.md"), "searchable fallback text\n").unwrap();

    let rotation = IndexRotation::new(dir.path().join(".index"), "memory".to_string(), 50.0);
    let indexer = Arc::new(MemoryIndexer::new(
        rotation,
        400,
        80,
        true,
        Some(Arc::new(FailingEmbeddings)),
    ));
    indexer.index_file(&dir.path().join("a.md")).await.unwrap();

    let response = indexer.search("fallback", &search_opts(0.0)).await.unwrap();
    assert!(response.degraded);
    assert!(!response.used_hybrid);
    assert!(!response.results.is_empty());
}

#[tokio::test]
async fn test_dangling_file_reference_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("gone.md");
    std::fs::write(&file, "content that will lose its file\n").unwrap();

    let indexer = make_indexer(dir.path(), true);
    indexer.index_file(&file).await.unwrap();
    std::fs::remove_file(&file).unwrap();

    // The chunk still matches; context falls back to the chunk text
    let response = indexer.search("content", &search_opts(0.0)).await.unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].context, response.results[0].text);
}

#[tokio::test]
async fn test_union_across_rotated_indexes_dedups_by_score() {
    let dir = tempfile::tempdir().unwrap();
    let index_dir = dir.path().join(".index");

    // Index one file into what will become the rotated-away index
    let file_a = dir.path().join("a.md");
    std::fs::write(&file_a, "alpha content lives here\n").unwrap();
    {
        let rotation = IndexRotation::new(index_dir.clone(), "memory".to_string(), 50.0);
        let indexer = MemoryIndexer::new(rotation, 400, 80, true, None);
        indexer.index_file(&file_a).await.unwrap();
    }

    // Force rotation by shrinking the cap; new file goes to memory-1.db
    let file_b = dir.path().join("b.md");
    std::fs::write(&file_b, "beta content lives here\n").unwrap();
    let rotation = IndexRotation::new(index_dir.clone(), "memory".to_string(), 0.000001);
    let indexer = MemoryIndexer::new(rotation, 400, 80, true, None);
    indexer.index_file(&file_b).await.unwrap();

    assert!(index_dir.join("memory.db").exists());
    assert!(index_dir.join("memory-1.db").exists());

    // Union search sees chunks from both index files
    let response = indexer.search("content", &search_opts(0.0)).await.unwrap();
    let paths: Vec<&str> = response.results.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(response.results.len(), 2);
    assert!(paths.iter().any(|p| p.ends_with("a.md")));
    assert!(paths.iter().any(|p| p.ends_with("b.md")));

    // No duplicate chunk ids survive the union
    let mut ids: Vec<&str> = response.results.iter().map(|r| r.chunk_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), response.results.len());
}

#[tokio::test]
async fn test_file_ref_bindings_enrich_results() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("facts.md");
    std::fs::write(&file, "analysis backed by a chart artifact\n").unwrap();

    let indexer = make_indexer(dir.path(), true);
    indexer.index_file(&file).await.unwrap();

    let response = indexer.search("chart", &search_opts(0.0)).await.unwrap();
    let chunk_id = response.results[0].chunk_id.clone();

    let added = indexer
        .add_file_refs(
            &chunk_id,
            vec![("abc123".to_string(), "chart".to_string(), None)],
        )
        .await
        .unwrap();
    assert_eq!(added, 1);

    let response = indexer.search("chart", &search_opts(0.0)).await.unwrap();
    let refs = &response.results[0].file_refs;
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].file_id, "abc123");
    assert_eq!(refs[0].category, "chart");
}

#[tokio::test]
async fn test_remove_file_drops_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("facts.md");
    std::fs::write(&file, "chunk to be removed later\n").unwrap();

    let indexer = make_indexer(dir.path(), true);
    indexer.index_file(&file).await.unwrap();
    assert_eq!(indexer.status().await.unwrap().chunk_count, 1);

    indexer.remove_file(&file).await.unwrap();
    let status = indexer.status().await.unwrap();
    assert_eq!(status.chunk_count, 0);
    assert_eq!(status.file_count, 0);

    let response = indexer.search("removed", &search_opts(0.0)).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_min_score_filters_results() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.md"), "one single weak match here\n").unwrap();

    let indexer = make_indexer(dir.path(), false);
    indexer.index_file(&dir.path().join("a.md")).await.unwrap();

    // LIKE path scores one occurrence at 0.1; a 0.5 floor filters it out
    let response = indexer.search("weak", &search_opts(0.5)).await.unwrap();
    assert!(response.results.is_empty());

    let response = indexer.search("weak", &search_opts(0.05)).await.unwrap();
    assert_eq!(response.results.len(), 1);
}
