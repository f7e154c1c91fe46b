// src/memory/embeddings.rs
// Embedding provider abstraction, OpenAI-compatible client, and the
// SQLite-backed embedding cache

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;
use tracing::debug;

/// Max characters to embed (longer text is truncated)
const MAX_TEXT_CHARS: usize = 8000;

/// Max inputs per embedding request
const MAX_BATCH_SIZE: usize = 100;

/// Retry attempts after the initial request
const RETRY_ATTEMPTS: usize = 2;

/// Provider of dense text embeddings
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name used as part of the cache key
    fn name(&self) -> &str;

    /// Model name used as part of the cache key
    fn model(&self) -> &str;

    /// Embed a batch of texts, preserving input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
    }
}

/// OpenAI-compatible embeddings endpoint client
pub struct OpenAiEmbeddings {
    base_url: String,
    model: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(base_url: String, model: String, api_key: String) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            model,
            api_key,
            http_client,
        }
    }

    fn truncate(text: &str) -> &str {
        match text.char_indices().nth(MAX_TEXT_CHARS) {
            Some((idx, _)) => &text[..idx],
            None => text,
        }
    }

    async fn request_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            match self
                .http_client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    let json: serde_json::Value = response.json().await?;
                    let data = json["data"]
                        .as_array()
                        .ok_or_else(|| anyhow::anyhow!("invalid embedding response"))?;

                    // Results carry an index field; sort to keep input order.
                    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
                    for item in data {
                        let index = item["index"].as_u64().unwrap_or(0) as usize;
                        if let Some(values) = item["embedding"].as_array() {
                            let vec: Vec<f32> = values
                                .iter()
                                .filter_map(|v| v.as_f64().map(|f| f as f32))
                                .collect();
                            indexed.push((index, vec));
                        }
                    }
                    if indexed.len() != inputs.len() {
                        anyhow::bail!(
                            "embedding count mismatch: {} != {}",
                            indexed.len(),
                            inputs.len()
                        );
                    }
                    indexed.sort_by_key(|(i, _)| *i);
                    return Ok(indexed.into_iter().map(|(_, v)| v).collect());
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    last_error = Some(anyhow::anyhow!("embeddings API error {}: {}", status, text));
                }
                Err(e) => last_error = Some(e.into()),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown embedding error")))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let chunks: Vec<Vec<&str>> = texts
            .chunks(MAX_BATCH_SIZE)
            .map(|c| c.iter().map(|t| Self::truncate(t)).collect())
            .collect();

        if chunks.len() == 1 {
            return self.request_batch(&chunks[0]).await;
        }

        debug!(
            "Embedding {} texts in {} parallel batches",
            texts.len(),
            chunks.len()
        );
        let futures: Vec<_> = chunks.iter().map(|c| self.request_batch(c)).collect();
        let results = futures::future::join_all(futures).await;

        let mut all = Vec::with_capacity(texts.len());
        for result in results {
            all.extend(result?);
        }
        Ok(all)
    }
}

/// Encode an embedding as a little-endian f32 BLOB
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a little-endian f32 BLOB back into a vector
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cache lookup keyed by `(provider, model, content_hash)`
pub fn get_cached_embedding_sync(
    conn: &Connection,
    provider: &str,
    model: &str,
    content_hash: &str,
) -> Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM embedding_cache
             WHERE provider = ?1 AND model = ?2 AND content_hash = ?3",
            params![provider, model, content_hash],
            |row| row.get(0),
        )
        .optional()?;
    Ok(blob.map(|b| blob_to_vector(&b)))
}

pub fn put_cached_embedding_sync(
    conn: &Connection,
    provider: &str,
    model: &str,
    content_hash: &str,
    vector: &[f32],
    now: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO embedding_cache
            (provider, model, content_hash, embedding, dims, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            provider,
            model,
            content_hash,
            vector_to_blob(vector),
            vector.len() as i64,
            now
        ],
    )?;
    Ok(())
}

/// Upsert a chunk's embedding
pub fn put_chunk_vector_sync(
    conn: &Connection,
    chunk_id: &str,
    vector: &[f32],
    now: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO chunk_vectors (chunk_id, embedding, dims, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![chunk_id, vector_to_blob(vector), vector.len() as i64, now],
    )?;
    Ok(())
}
