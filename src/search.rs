//! Retrieval over the document store.
//!
//! Three modes share one scoring path:
//!
//! - **keyword**: FTS5 `bm25` rank over `chunks_fts`.
//! - **semantic**: cosine similarity between the query vector and every
//!   stored chunk vector.
//! - **hybrid**: both candidate lists min-max normalised to `[0, 1]` and
//!   mixed as `(1 - alpha) * keyword + alpha * semantic`.
//!
//! With embeddings disabled, hybrid degrades to keyword. Chunk results feed
//! the chat chain; document results (MAX over a document's chunks) feed
//! `dchat search` and `POST /search`.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::Config;
use crate::db;
use crate::embedding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Semantic,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Only documents from this top-level mirror folder.
    #[serde(default)]
    pub doc_type: Option<String>,
    /// `YYYY-MM-DD`; only documents modified on or after this day.
    #[serde(default)]
    pub since: Option<String>,
}

impl SearchFilter {
    fn since_timestamp(&self) -> Result<Option<i64>> {
        self.since
            .as_deref()
            .map(|s| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(|d| d.and_time(NaiveTime::MIN).and_utc().timestamp())
                    .with_context(|| format!("invalid --since date '{}', expected YYYY-MM-DD", s))
            })
            .transpose()
    }
}

/// A ranked chunk with its full text and the document it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f64,
    pub title: Option<String>,
    pub source_id: String,
    pub source_url: Option<String>,
    pub doc_type: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub title: Option<String>,
    pub source_id: String,
    pub doc_type: String,
    pub source_url: Option<String>,
    pub updated_at: i64,
    pub score: f64,
    pub snippet: String,
}

/// Turn free text into an FTS5 query that cannot fail to parse: each
/// whitespace-separated term is quoted and the terms are joined with `OR`.
/// Terms with no letters or digits are dropped.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Top `k` chunks for `query`.
pub async fn retrieve_chunks(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    mode: SearchMode,
    filter: &SearchFilter,
    k: usize,
) -> Result<Vec<RetrievedChunk>> {
    let mut scored = score_candidates(pool, config, query, mode, filter).await?;
    scored.truncate(k);
    Ok(scored
        .into_iter()
        .map(|(c, score)| RetrievedChunk {
            chunk_id: c.chunk_id,
            document_id: c.document_id,
            chunk_index: c.chunk_index,
            text: c.text,
            score,
            title: c.title,
            source_id: c.source_id,
            source_url: c.source_url,
            doc_type: c.doc_type,
            updated_at: c.updated_at,
        })
        .collect())
}

/// Top `limit` documents, each scored by its best chunk.
pub async fn search_documents(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    mode: SearchMode,
    filter: &SearchFilter,
    limit: usize,
) -> Result<Vec<SearchResult>> {
    let scored = score_candidates(pool, config, query, mode, filter).await?;

    // `scored` is best-first, so the first chunk seen for a document is its max.
    let mut by_doc: HashMap<String, SearchResult> = HashMap::new();
    for (c, score) in scored {
        by_doc.entry(c.document_id.clone()).or_insert_with(|| SearchResult {
            id: c.document_id,
            title: c.title,
            source_id: c.source_id,
            doc_type: c.doc_type,
            source_url: c.source_url,
            updated_at: c.updated_at,
            score,
            snippet: c.snippet,
        });
    }

    let mut results: Vec<SearchResult> = by_doc.into_values().collect();
    results.sort_by(|a, b| {
        desc(a.score, b.score)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.id.cmp(&b.id))
    });
    results.truncate(limit);
    Ok(results)
}

pub async fn run_search(
    config: &Config,
    query: &str,
    mode: SearchMode,
    filter: &SearchFilter,
    limit: Option<usize>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let limit = limit.unwrap_or(config.retrieval.final_limit.max(1) as usize);
    let results = search_documents(&pool, config, query, mode, filter, limit).await?;
    pool.close().await;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(result.updated_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.score,
            result.doc_type,
            result.title.as_deref().unwrap_or("(untitled)")
        );
        println!("    updated: {}", date);
        println!("    path: {}", result.source_id);
        if let Some(url) = &result.source_url {
            println!("    url: {}", url);
        }
        println!("    excerpt: \"{}\"", result.snippet.replace('\n', " ").trim());
        println!("    id: {}", result.id);
        println!();
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Candidate {
    chunk_id: String,
    document_id: String,
    chunk_index: i64,
    text: String,
    snippet: String,
    title: Option<String>,
    source_id: String,
    source_url: Option<String>,
    doc_type: String,
    updated_at: i64,
    raw_score: f64,
}

impl Candidate {
    fn from_row(row: &SqliteRow, raw_score: f64) -> Self {
        Self {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            chunk_index: row.get("chunk_index"),
            text: row.get("text"),
            snippet: row.get("snippet"),
            title: row.get("title"),
            source_id: row.get("source_id"),
            source_url: row.get("source_url"),
            doc_type: row.get("doc_type"),
            updated_at: row.get("updated_at"),
            raw_score,
        }
    }
}

fn desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Every candidate with its final score, best first.
async fn score_candidates(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    mode: SearchMode,
    filter: &SearchFilter,
) -> Result<Vec<(Candidate, f64)>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let embeddings = config.embedding.is_enabled();
    let alpha = match mode {
        SearchMode::Keyword => 0.0,
        SearchMode::Semantic if !embeddings => {
            bail!("Mode 'semantic' requires embeddings. Set [embedding] provider in config.")
        }
        SearchMode::Semantic => 1.0,
        SearchMode::Hybrid if !embeddings => {
            tracing::debug!("embeddings disabled, hybrid search uses keyword scores only");
            0.0
        }
        SearchMode::Hybrid => config.retrieval.hybrid_alpha,
    };
    let since = filter.since_timestamp()?;
    let doc_type = filter.doc_type.as_deref();

    let keyword = if alpha < 1.0 {
        keyword_candidates(pool, query, doc_type, since, config.retrieval.candidate_k_keyword).await?
    } else {
        Vec::new()
    };
    let vector = if alpha > 0.0 {
        vector_candidates(pool, config, query, doc_type, since, config.retrieval.candidate_k_vector)
            .await?
    } else {
        Vec::new()
    };

    Ok(combine(keyword, vector, alpha))
}

/// Mix normalised keyword and vector scores. A chunk missing from one list
/// scores 0 there.
fn combine(keyword: Vec<Candidate>, vector: Vec<Candidate>, alpha: f64) -> Vec<(Candidate, f64)> {
    let kw = normalize_scores(&keyword);
    let vec = normalize_scores(&vector);
    let kw_map: HashMap<&str, f64> = keyword.iter().map(|c| c.chunk_id.as_str()).zip(kw).collect();
    let vec_map: HashMap<&str, f64> = vector.iter().map(|c| c.chunk_id.as_str()).zip(vec).collect();

    let mut merged: HashMap<&str, &Candidate> = HashMap::new();
    for c in keyword.iter().chain(vector.iter()) {
        merged.entry(c.chunk_id.as_str()).or_insert(c);
    }

    let mut scored: Vec<(Candidate, f64)> = merged
        .into_iter()
        .map(|(id, c)| {
            let k = kw_map.get(id).copied().unwrap_or(0.0);
            let v = vec_map.get(id).copied().unwrap_or(0.0);
            (c.clone(), (1.0 - alpha) * k + alpha * v)
        })
        .collect();
    scored.sort_by(|(a, sa), (b, sb)| {
        desc(*sa, *sb)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    scored
}

async fn keyword_candidates(
    pool: &SqlitePool,
    query: &str,
    doc_type: Option<&str>,
    since: Option<i64>,
    candidate_k: i64,
) -> Result<Vec<Candidate>> {
    let Some(fts) = fts_query(query) else {
        return Ok(Vec::new());
    };
    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id, chunks_fts.document_id, chunks_fts.rank AS rank,
               snippet(chunks_fts, 2, '>>>', '<<<', '...', 48) AS snippet,
               c.chunk_index, c.text,
               d.title, d.source_id, d.source_url, d.doc_type, d.updated_at
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.chunk_id
        JOIN documents d ON d.id = chunks_fts.document_id
        WHERE chunks_fts MATCH ?
          AND (? IS NULL OR d.doc_type = ?)
          AND (? IS NULL OR d.updated_at >= ?)
        ORDER BY chunks_fts.rank
        LIMIT ?
        "#,
    )
    .bind(&fts)
    .bind(doc_type)
    .bind(doc_type)
    .bind(since)
    .bind(since)
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    // bm25 rank is lower-is-better.
    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            Candidate::from_row(row, -rank)
        })
        .collect())
}

async fn vector_candidates(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    doc_type: Option<&str>,
    since: Option<i64>,
    candidate_k: i64,
) -> Result<Vec<Candidate>> {
    let query_vec = embedding::embed_query(&config.embedding, query).await?;

    let rows = sqlx::query(
        r#"
        SELECT cv.chunk_id, cv.document_id, cv.embedding,
               substr(c.text, 1, 240) AS snippet,
               c.chunk_index, c.text,
               d.title, d.source_id, d.source_url, d.doc_type, d.updated_at
        FROM chunk_vectors cv
        JOIN chunks c ON c.id = cv.chunk_id
        JOIN documents d ON d.id = cv.document_id
        WHERE (? IS NULL OR d.doc_type = ?)
          AND (? IS NULL OR d.updated_at >= ?)
        "#,
    )
    .bind(doc_type)
    .bind(doc_type)
    .bind(since)
    .bind(since)
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<Candidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let similarity =
                embedding::cosine_similarity(&query_vec, &embedding::blob_to_vec(&blob)) as f64;
            Candidate::from_row(row, similarity)
        })
        .collect();
    candidates.sort_by(|a, b| desc(a.raw_score, b.raw_score));
    candidates.truncate(candidate_k.max(0) as usize);
    Ok(candidates)
}

/// Min-max normalise to `[0, 1]`; a list whose scores are all equal maps
/// to all `1.0`.
fn normalize_scores(candidates: &[Candidate]) -> Vec<f64> {
    let min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);
    candidates
        .iter()
        .map(|c| {
            if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - min) / (max - min)
            }
        })
        .collect()
}
