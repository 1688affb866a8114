//! `dchat embed pending|rebuild` and inline embedding during ingest.
//!
//! A chunk's embedding is current when `embeddings.hash` equals the chunk's
//! own text hash for the configured model. Anything else is pending.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::models::Chunk;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedCounts {
    pub embedded: u64,
    pub failed: u64,
}

/// Embed chunks with no embedding or a stale one.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<EmbedCounts> {
    let provider = enabled_provider(config)?;
    let pool = db::connect(config).await?;
    let pending = find_pending_chunks(&pool, provider.model_name(), limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(EmbedCounts::default());
    }

    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let counts = embed_batches(config, &pool, provider.as_ref(), &pending, batch_size).await?;

    println!("embed pending");
    println!("  total pending: {}", pending.len());
    println!("  embedded: {}", counts.embedded);
    println!("  failed: {}", counts.failed);
    println!("ok");

    pool.close().await;
    Ok(counts)
}

/// Drop every stored vector and embed all chunks again.
pub async fn run_embed_rebuild(
    config: &Config,
    batch_size_override: Option<usize>,
) -> Result<EmbedCounts> {
    let provider = enabled_provider(config)?;
    let pool = db::connect(config).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunk_vectors")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM embeddings").execute(&mut *tx).await?;
    tx.commit().await?;

    let all = find_pending_chunks(&pool, provider.model_name(), None).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let counts = embed_batches(config, &pool, provider.as_ref(), &all, batch_size).await?;

    println!("embed rebuild");
    println!("  total chunks: {}", all.len());
    println!("  embedded: {}", counts.embedded);
    println!("  failed: {}", counts.failed);
    println!("ok");

    pool.close().await;
    Ok(counts)
}

/// Embed freshly written chunks. Never fails: returns `(written, pending)`
/// and leaves anything it could not embed for `embed pending`.
pub async fn embed_chunks_inline(
    config: &Config,
    pool: &SqlitePool,
    chunks: &[Chunk],
) -> (u64, u64) {
    if !config.embedding.is_enabled() || chunks.is_empty() {
        return (0, 0);
    }

    let provider = match embedding::create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("could not create embedding provider: {:#}", e);
            return (0, chunks.len() as u64);
        }
    };

    let mut todo = Vec::with_capacity(chunks.len());
    let mut current = 0u64;
    for chunk in chunks {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT hash FROM embeddings WHERE chunk_id = ? AND model = ?")
                .bind(&chunk.id)
                .bind(provider.model_name())
                .fetch_optional(pool)
                .await
                .unwrap_or(None);
        if existing.as_deref() == Some(chunk.hash.as_str()) {
            current += 1;
        } else {
            todo.push(PendingChunk {
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                text: chunk.text.clone(),
                hash: chunk.hash.clone(),
            });
        }
    }

    match embed_batches(config, pool, provider.as_ref(), &todo, config.embedding.batch_size).await {
        Ok(counts) => (current + counts.embedded, counts.failed),
        Err(e) => {
            tracing::warn!("inline embedding failed: {:#}", e);
            (current, todo.len() as u64)
        }
    }
}

fn enabled_provider(config: &Config) -> Result<Box<dyn EmbeddingProvider>> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    embedding::create_provider(&config.embedding)
}

#[derive(Debug, Clone)]
struct PendingChunk {
    chunk_id: String,
    document_id: String,
    text: String,
    hash: String,
}

/// A failed provider call marks its batch as failed and moves on; a failed
/// database write is an error.
async fn embed_batches(
    config: &Config,
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    pending: &[PendingChunk],
    batch_size: usize,
) -> Result<EmbedCounts> {
    let mut counts = EmbedCounts::default();
    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        let vectors = match embedding::embed_texts(&config.embedding, &texts).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("embedding batch of {} failed: {:#}", batch.len(), e);
                counts.failed += batch.len() as u64;
                continue;
            }
        };
        for (item, vector) in batch.iter().zip(&vectors) {
            store_embedding(pool, item, provider.model_name(), provider.dims(), vector).await?;
            counts.embedded += 1;
        }
    }
    Ok(counts)
}

async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.text, c.hash
        FROM chunks c
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE e.chunk_id IS NULL OR e.hash != c.hash
        ORDER BY c.document_id, c.chunk_index
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("id"),
            document_id: row.get("document_id"),
            text: row.get("text"),
            hash: row.get("hash"),
        })
        .collect())
}

async fn store_embedding(
    pool: &SqlitePool,
    item: &PendingChunk,
    model: &str,
    dims: usize,
    vector: &[f32],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, model, dims, created_at, hash)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            created_at = excluded.created_at,
            hash = excluded.hash
        "#,
    )
    .bind(&item.chunk_id)
    .bind(model)
    .bind(dims as i64)
    .bind(chrono::Utc::now().timestamp())
    .bind(&item.hash)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, embedding)
        VALUES (?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            embedding = excluded.embedding
        "#,
    )
    .bind(&item.chunk_id)
    .bind(&item.document_id)
    .bind(embedding::vec_to_blob(vector))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
