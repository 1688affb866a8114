//! Turn the local mirror into [`SourceItem`]s.
//!
//! Each top-level directory of the mirror is a document type: a file at
//! `Reports/2024/q3.docx` is loaded with `doc_type = "Reports"`. Files
//! directly under the mirror root get `doc_type = "root"`. The metadata
//! index written by `dchat download` is joined in by content hash to
//! recover the Drive id and URL of each file.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::Config;
use crate::extract::{content_type_for_path, extract_text, needs_extraction};
use crate::metadata::{hash_bytes, relative_to, MetadataIndex};
use crate::models::SourceItem;

pub const SOURCE_NAME: &str = "drive";
pub const ROOT_DOC_TYPE: &str = "root";

#[derive(Debug, Default)]
pub struct LoadReport {
    pub items: Vec<SourceItem>,
    /// Files that matched but could not be turned into text.
    pub skipped: usize,
}

/// `doc_type` of a `/`-joined mirror path.
pub fn doc_type_of(relative: &str) -> &str {
    match relative.split_once('/') {
        Some((top, _)) => top,
        None => ROOT_DOC_TYPE,
    }
}

pub fn load_mirror(config: &Config) -> Result<LoadReport> {
    let root = &config.mirror.root;
    if !root.is_dir() {
        bail!(
            "mirror directory does not exist: {} (run `dchat download` first)",
            root.display()
        );
    }

    let include = build_globset(&config.loader.include_globs)?;
    let mut excludes = vec!["**/.*".to_string(), "**/*.part".to_string()];
    excludes.extend(config.loader.exclude_globs.iter().cloned());
    let exclude = build_globset(&excludes)?;
    let index = MetadataIndex::load(&config.mirror.metadata_file)?;

    let mut report = LoadReport::default();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_to(entry.path(), root)?;
        if exclude.is_match(&rel) || !include.is_match(&rel) {
            continue;
        }

        match load_file(entry.path(), &rel, &index, config.loader.max_extract_bytes) {
            Ok(item) => report.items.push(item),
            Err(e) => {
                tracing::warn!("skipping {}: {:#}", rel, e);
                report.skipped += 1;
            }
        }
    }

    report.items.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    Ok(report)
}

fn load_file(
    path: &Path,
    rel: &str,
    index: &MetadataIndex,
    max_extract_bytes: u64,
) -> Result<SourceItem> {
    let stat = std::fs::metadata(path)?;
    let content_type = content_type_for_path(path);

    if needs_extraction(&content_type) && stat.len() > max_extract_bytes {
        bail!(
            "{} bytes exceeds loader.max_extract_bytes ({})",
            stat.len(),
            max_extract_bytes
        );
    }

    let bytes = std::fs::read(path)?;
    let file_hash = hash_bytes(&bytes);
    let body = if needs_extraction(&content_type) {
        extract_text(&bytes, &content_type)?
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    };

    let modified: DateTime<Utc> = stat.modified()?.into();
    let created: DateTime<Utc> = stat.created().map(Into::into).unwrap_or(modified);
    let doc_type = doc_type_of(rel).to_string();
    let indexed = index.get(&file_hash);

    let metadata_json = match indexed {
        Some(meta) => {
            let mut value = serde_json::to_value(meta)?;
            value["doc_type"] = serde_json::Value::String(doc_type.clone());
            value.to_string()
        }
        None => serde_json::json!({
            "relative_path": rel,
            "doc_type": doc_type,
            "file_hash": file_hash,
        })
        .to_string(),
    };

    Ok(SourceItem {
        source: SOURCE_NAME.to_string(),
        source_id: rel.to_string(),
        source_url: indexed.map(|m| m.google_drive_url.clone()),
        title: path.file_name().map(|n| n.to_string_lossy().into_owned()),
        doc_type,
        created_at: created,
        updated_at: modified,
        content_type,
        body,
        file_hash,
        metadata_json,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileMetadata;

    fn config_for(dir: &Path) -> Config {
        let mut config = Config::minimal();
        config.mirror.root = dir.join("mirror");
        config.mirror.metadata_file = dir.join("file_metadata.json");
        config
    }

    fn write(root: &Path, rel: &str, body: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn doc_type_is_top_level_folder() {
        assert_eq!(doc_type_of("Reports/2024/q3.md"), "Reports");
        assert_eq!(doc_type_of("Notes/a.md"), "Notes");
        assert_eq!(doc_type_of("top.md"), ROOT_DOC_TYPE);
    }

    #[test]
    fn loads_matching_files_with_doc_type() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(tmp.path());
        let root = &config.mirror.root;
        write(root, "Policies/leave.md", b"# Leave\n\nTwenty days.");
        write(root, "Policies/deep/travel.txt", b"Book early.");
        write(root, "Policies/logo.png", b"\x89PNG");
        write(root, "readme.md", b"hello");
        write(root, "Policies/.hidden.md", b"secret");

        let report = load_mirror(&config).unwrap();
        let ids: Vec<&str> = report.items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["Policies/deep/travel.txt", "Policies/leave.md", "readme.md"]);
        assert_eq!(report.items[0].doc_type, "Policies");
        assert_eq!(report.items[2].doc_type, ROOT_DOC_TYPE);
        assert_eq!(report.items[1].content_type, "text/markdown");
        assert_eq!(report.items[1].title.as_deref(), Some("leave.md"));
        assert_eq!(report.skipped, 0);
    }

    #[test]
    fn broken_binary_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(tmp.path());
        write(&config.mirror.root, "Decks/broken.pptx", b"not a zip");
        write(&config.mirror.root, "Decks/ok.md", b"fine");

        let report = load_mirror(&config).unwrap();
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn metadata_index_supplies_drive_url() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(tmp.path());
        write(&config.mirror.root, "Notes/plan.md", b"the plan");

        let mut index = MetadataIndex::new();
        index.insert(FileMetadata {
            source: "mirror/Notes/plan.md".into(),
            filename: "plan.md".into(),
            extension: ".md".into(),
            created_date: "2024-01-01T00:00:00Z".into(),
            modified_date: "2024-01-01T00:00:00Z".into(),
            relative_path: "Notes/plan.md".into(),
            parent_directory: "Notes".into(),
            file_hash: hash_bytes(b"the plan"),
            mime_type: "text/markdown".into(),
            processing_date: "2024-01-01T00:00:00Z".into(),
            google_drive_url: "https://drive.google.com/file/d/abc/view".into(),
            google_drive_id: "abc".into(),
        });
        index.save(&config.mirror.metadata_file).unwrap();

        let report = load_mirror(&config).unwrap();
        let item = &report.items[0];
        assert_eq!(
            item.source_url.as_deref(),
            Some("https://drive.google.com/file/d/abc/view")
        );
        let meta: serde_json::Value = serde_json::from_str(&item.metadata_json).unwrap();
        assert_eq!(meta["google_drive_id"], "abc");
        assert_eq!(meta["doc_type"], "Notes");
    }

    #[test]
    fn missing_mirror_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_mirror(&config_for(tmp.path())).unwrap_err();
        assert!(err.to_string().contains("mirror directory does not exist"));
    }
}
