//! `dchat stats`: what the document store holds.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::ingest::get_checkpoint;
use crate::loader::SOURCE_NAME;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocTypeStats {
    pub doc_type: String,
    pub documents: i64,
    pub chunks: i64,
    pub embedded: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub documents: i64,
    pub chunks: i64,
    pub embedded: i64,
    pub by_doc_type: Vec<DocTypeStats>,
    pub last_ingest: Option<i64>,
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<StoreStats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(pool)
        .await?;

    let by_doc_type = sqlx::query(
        r#"
        SELECT
            d.doc_type,
            COUNT(DISTINCT d.id) AS documents,
            COUNT(DISTINCT c.id) AS chunks,
            COUNT(DISTINCT cv.chunk_id) AS embedded
        FROM documents d
        LEFT JOIN chunks c ON c.document_id = d.id
        LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
        GROUP BY d.doc_type
        ORDER BY documents DESC, d.doc_type ASC
        "#,
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| DocTypeStats {
        doc_type: row.get("doc_type"),
        documents: row.get("documents"),
        chunks: row.get("chunks"),
        embedded: row.get("embedded"),
    })
    .collect();

    Ok(StoreStats {
        documents,
        chunks,
        embedded,
        by_doc_type,
        last_ingest: get_checkpoint(pool, SOURCE_NAME).await?,
    })
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("dchat store");
    println!("  database: {}", config.db.path.display());
    println!("  size: {}", format_bytes(db_size));
    println!("  documents: {}", stats.documents);
    println!("  chunks: {}", stats.chunks);
    println!(
        "  embedded: {} / {} ({}%)",
        stats.embedded,
        stats.chunks,
        if stats.chunks > 0 {
            stats.embedded * 100 / stats.chunks
        } else {
            0
        }
    );
    println!(
        "  last ingest: {}",
        stats
            .last_ingest
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    if !stats.by_doc_type.is_empty() {
        println!();
        println!(
            "  {:<24} {:>6} {:>8} {:>10}",
            "DOC TYPE", "DOCS", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(51));
        for s in &stats.by_doc_type {
            println!(
                "  {:<24} {:>6} {:>8} {:>10}",
                s.doc_type, s.documents, s.chunks, s.embedded
            );
        }
    }
    Ok(())
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    match delta {
        d if d < 0 => crate::get::format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} minutes ago", d / 60),
        d if d < 86_400 => format!("{} hours ago", d / 3600),
        d => format!("{} days ago", d / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ingest_items;
    use crate::migrate::migrate_pool;
    use crate::models::SourceItem;
    use crate::progress::NoProgress;

    fn item(source_id: &str, doc_type: &str) -> SourceItem {
        let now = chrono::Utc::now();
        SourceItem {
            source: SOURCE_NAME.into(),
            source_id: source_id.into(),
            source_url: None,
            title: None,
            doc_type: doc_type.into(),
            created_at: now,
            updated_at: now,
            content_type: "text/plain".into(),
            body: format!("body of {}", source_id),
            file_hash: String::new(),
            metadata_json: "{}".into(),
        }
    }

    #[tokio::test]
    async fn counts_by_doc_type() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::minimal();
        config.db.path = tmp.path().join("st.sqlite");
        let pool = db::connect(&config).await.unwrap();
        migrate_pool(&pool).await.unwrap();

        let empty = collect_stats(&pool).await.unwrap();
        assert_eq!(empty.documents, 0);
        assert!(empty.by_doc_type.is_empty());
        assert_eq!(empty.last_ingest, None);

        let items = vec![item("Notes/a.txt", "Notes"), item("Notes/b.txt", "Notes"), item("c.txt", "root")];
        ingest_items(&config, &pool, &items, false, &NoProgress).await.unwrap();
        let stats = collect_stats(&pool).await.unwrap();
        assert_eq!(stats.documents, 3);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.embedded, 0);
        assert_eq!(
            stats.by_doc_type,
            vec![
                DocTypeStats { doc_type: "Notes".into(), documents: 2, chunks: 2, embedded: 0 },
                DocTypeStats { doc_type: "root".into(), documents: 1, chunks: 1, embedded: 0 },
            ]
        );
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
