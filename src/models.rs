//! Core data models shared by the loader, ingest pipeline and retriever.
//!
//! Drive-side types (remote entries, the drive map) live next to the code
//! that produces them in [`crate::drive_client`] and [`crate::drive_tree`].

use chrono::{DateTime, Utc};

/// A mirrored file turned into text, before it is stored.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub source: String,
    /// Path relative to the mirror root, `/`-separated.
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    /// Name of the top-level mirror folder the file sits in.
    pub doc_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_type: String,
    pub body: String,
    /// SHA-256 of the file bytes; joins the item to the metadata index.
    pub file_hash: String,
    pub metadata_json: String,
}

/// A chunk of a document's body text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}
