//! Store the mirror in the document database.
//!
//! Loader → chunker → embedder → SQLite. A document whose content hash has
//! not changed since the last run is left alone (unless `--full`), and
//! documents whose file has disappeared from the mirror are removed along
//! with their chunks and vectors. Inline embedding is non-fatal: chunks it
//! cannot embed stay pending for `dchat embed pending`.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashSet;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::db;
use crate::embed_cmd;
use crate::loader::{load_mirror, SOURCE_NAME};
use crate::migrate::migrate_pool;
use crate::models::{Chunk, SourceItem};
use crate::progress::{ProgressEvent, ProgressMode, ProgressReporter};

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Re-chunk every document even when its content is unchanged.
    pub full: bool,
    pub dry_run: bool,
    pub limit: Option<usize>,
    /// Only ingest (and prune) this top-level folder.
    pub doc_type: Option<String>,
    pub progress: ProgressMode,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            full: false,
            dry_run: false,
            limit: None,
            doc_type: None,
            progress: ProgressMode::Off,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub found: u64,
    pub upserted: u64,
    pub unchanged: u64,
    pub removed: u64,
    pub chunks_written: u64,
    pub extraction_skipped: u64,
    pub embeddings_written: u64,
    pub embeddings_pending: u64,
}

pub async fn run_ingest(config: &Config, options: &IngestOptions) -> Result<IngestReport> {
    let loaded = load_mirror(config)?;
    let mut items = loaded.items;
    if let Some(doc_type) = &options.doc_type {
        items.retain(|item| &item.doc_type == doc_type);
    }
    if let Some(limit) = options.limit {
        items.truncate(limit);
    }

    if options.dry_run {
        let estimated: usize = items
            .iter()
            .map(|item| {
                chunk_text(
                    "tmp",
                    &item.body,
                    config.chunking.max_tokens,
                    config.chunking.overlap_tokens,
                )
                .len()
            })
            .sum();
        println!("ingest {} (dry-run)", config.mirror.root.display());
        println!("  documents found: {}", items.len());
        println!("  estimated chunks: {}", estimated);
        println!("  extraction skipped: {}", loaded.skipped);
        return Ok(IngestReport {
            found: items.len() as u64,
            extraction_skipped: loaded.skipped as u64,
            ..IngestReport::default()
        });
    }

    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    let reporter = options.progress.reporter();
    let mut report = ingest_items(config, &pool, &items, options.full, reporter.as_ref()).await?;
    report.extraction_skipped = loaded.skipped as u64;

    // A truncated run has not seen every file, so nothing can be pruned.
    if options.limit.is_none() {
        let keep: HashSet<&str> = items.iter().map(|i| i.source_id.as_str()).collect();
        report.removed = prune_documents(&pool, &keep, options.doc_type.as_deref()).await?;
    }
    set_checkpoint(&pool, SOURCE_NAME, chrono::Utc::now().timestamp()).await?;

    println!("ingest {}", config.mirror.root.display());
    println!("  documents found: {}", report.found);
    println!("  upserted documents: {}", report.upserted);
    println!("  unchanged: {}", report.unchanged);
    println!("  removed: {}", report.removed);
    println!("  chunks written: {}", report.chunks_written);
    println!("  extraction skipped: {}", report.extraction_skipped);
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", report.embeddings_written);
        println!("  embeddings pending: {}", report.embeddings_pending);
    }
    println!("ok");

    pool.close().await;
    Ok(report)
}

/// Upsert, chunk and embed `items`.
pub async fn ingest_items(
    config: &Config,
    pool: &SqlitePool,
    items: &[SourceItem],
    full: bool,
    progress: &dyn ProgressReporter,
) -> Result<IngestReport> {
    let mut report = IngestReport {
        found: items.len() as u64,
        ..IngestReport::default()
    };
    let total = items.len() as u64;

    for (n, item) in items.iter().enumerate() {
        let (doc_id, changed) = upsert_document(pool, item).await?;
        if changed || full {
            let chunks = chunk_text(
                &doc_id,
                &item.body,
                config.chunking.max_tokens,
                config.chunking.overlap_tokens,
            );
            replace_chunks(pool, &doc_id, &chunks).await?;
            let (written, pending) = embed_cmd::embed_chunks_inline(config, pool, &chunks).await;
            report.embeddings_written += written;
            report.embeddings_pending += pending;
            report.chunks_written += chunks.len() as u64;
            report.upserted += 1;
        } else {
            report.unchanged += 1;
        }
        progress.report(ProgressEvent::Ingesting {
            n: n as u64 + 1,
            total,
        });
    }

    Ok(report)
}

/// Hash of everything that determines a document's chunks.
pub fn dedup_hash(item: &SourceItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.source.as_bytes());
    hasher.update([0]);
    hasher.update(item.source_id.as_bytes());
    hasher.update([0]);
    hasher.update(item.doc_type.as_bytes());
    hasher.update([0]);
    hasher.update(item.body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Insert or update the document row. Returns its id and whether the
/// content differs from what was stored.
async fn upsert_document(pool: &SqlitePool, item: &SourceItem) -> Result<(String, bool)> {
    let hash = dedup_hash(item);

    let existing: Option<(String, String)> =
        sqlx::query_as("SELECT id, dedup_hash FROM documents WHERE source = ? AND source_id = ?")
            .bind(&item.source)
            .bind(&item.source_id)
            .fetch_optional(pool)
            .await?;

    let changed = existing.as_ref().map(|(_, h)| h != &hash).unwrap_or(true);
    let doc_id = existing
        .map(|(id, _)| id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    sqlx::query(
        r#"
        INSERT INTO documents (id, source, source_id, source_url, title, doc_type, created_at, updated_at, content_type, body, file_hash, metadata_json, dedup_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source, source_id) DO UPDATE SET
            source_url = excluded.source_url,
            title = excluded.title,
            doc_type = excluded.doc_type,
            updated_at = excluded.updated_at,
            content_type = excluded.content_type,
            body = excluded.body,
            file_hash = excluded.file_hash,
            metadata_json = excluded.metadata_json,
            dedup_hash = excluded.dedup_hash
        "#,
    )
    .bind(&doc_id)
    .bind(&item.source)
    .bind(&item.source_id)
    .bind(&item.source_url)
    .bind(&item.title)
    .bind(&item.doc_type)
    .bind(item.created_at.timestamp())
    .bind(item.updated_at.timestamp())
    .bind(&item.content_type)
    .bind(&item.body)
    .bind(&item.file_hash)
    .bind(&item.metadata_json)
    .bind(&hash)
    .execute(pool)
    .await?;

    Ok((doc_id, changed))
}

async fn replace_chunks(pool: &SqlitePool, document_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;
    delete_chunk_rows(&mut tx, document_id).await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn delete_chunk_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
) -> Result<()> {
    for sql in [
        "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        "DELETE FROM chunks_fts WHERE document_id = ?",
        "DELETE FROM chunks WHERE document_id = ?",
    ] {
        sqlx::query(sql).bind(document_id).execute(&mut **tx).await?;
    }
    Ok(())
}

/// Remove stored documents whose file is no longer in the mirror. With a
/// `doc_type`, only that folder's documents are considered.
async fn prune_documents(
    pool: &SqlitePool,
    keep: &HashSet<&str>,
    doc_type: Option<&str>,
) -> Result<u64> {
    let stored: Vec<(String, String)> = match doc_type {
        Some(dt) => {
            sqlx::query_as("SELECT id, source_id FROM documents WHERE source = ? AND doc_type = ?")
                .bind(SOURCE_NAME)
                .bind(dt)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT id, source_id FROM documents WHERE source = ?")
                .bind(SOURCE_NAME)
                .fetch_all(pool)
                .await?
        }
    };

    let mut removed = 0u64;
    for (id, source_id) in stored {
        if keep.contains(source_id.as_str()) {
            continue;
        }
        let mut tx = pool.begin().await?;
        delete_chunk_rows(&mut tx, &id).await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!("removed document {} ({})", id, source_id);
        removed += 1;
    }
    Ok(removed)
}

pub async fn get_checkpoint(pool: &SqlitePool, source: &str) -> Result<Option<i64>> {
    let cursor: Option<String> =
        sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
            .bind(source)
            .fetch_optional(pool)
            .await?;
    Ok(cursor.and_then(|s| s.parse::<i64>().ok()))
}

/// Record the time of the last completed ingest.
async fn set_checkpoint(pool: &SqlitePool, source: &str, at: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
        "#,
    )
    .bind(source)
    .bind(at.to_string())
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}
