//! Fetch a stored document and its chunks by id.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub doc_type: String,
    pub created_at: String,
    pub updated_at: String,
    pub content_type: String,
    pub file_hash: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub index: i64,
    pub text: String,
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<DocumentResponse> {
    let Some(row) = sqlx::query(
        "SELECT id, source, source_id, source_url, title, doc_type, created_at, updated_at, \
         content_type, file_hash, body, metadata_json FROM documents WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    else {
        bail!("document not found: {}", id);
    };

    let metadata_json: String = row.get("metadata_json");
    let chunks = sqlx::query(
        "SELECT chunk_index, text FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
    )
    .bind(id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|r| ChunkResponse {
        index: r.get("chunk_index"),
        text: r.get("text"),
    })
    .collect();

    Ok(DocumentResponse {
        id: row.get("id"),
        source: row.get("source"),
        source_id: row.get("source_id"),
        source_url: row.get("source_url"),
        title: row.get("title"),
        doc_type: row.get("doc_type"),
        created_at: format_ts_iso(row.get("created_at")),
        updated_at: format_ts_iso(row.get("updated_at")),
        content_type: row.get("content_type"),
        file_hash: row.get("file_hash"),
        body: row.get("body"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_else(|_| serde_json::json!({})),
        chunks,
    })
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let doc = get_document(&pool, id).await;
    pool.close().await;
    let doc = doc?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("title:        {}", doc.title.as_deref().unwrap_or("(untitled)"));
    println!("doc_type:     {}", doc.doc_type);
    println!("path:         {}", doc.source_id);
    if let Some(url) = &doc.source_url {
        println!("drive_url:    {}", url);
    }
    println!("created_at:   {}", doc.created_at);
    println!("updated_at:   {}", doc.updated_at);
    println!("content_type: {}", doc.content_type);
    println!("file_hash:    {}", doc.file_hash);
    println!("metadata:     {}", doc.metadata);
    println!();
    println!("--- Body ---");
    println!("{}", doc.body);
    println!();
    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("[chunk {}]", chunk.index);
        println!("{}", chunk.text);
        println!();
    }
    Ok(())
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
