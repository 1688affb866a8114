//! `dchat status`: is everything in place for the next step of the
//! pipeline?

use anyhow::Result;
use walkdir::WalkDir;

use crate::chat::count_documents;
use crate::config::Config;
use crate::db;
use crate::drive_auth::{token_status, TokenStatus};
use crate::metadata::MetadataIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub credentials_present: bool,
    pub token: TokenStatus,
    /// Number of files in the mirror, `None` when it does not exist.
    pub mirror_files: Option<usize>,
    /// `None` when the index file is missing or unreadable.
    pub metadata_entries: Option<usize>,
    /// Documents in the store, `None` when there is no database yet.
    pub documents: Option<i64>,
}

pub async fn collect_status(config: &Config) -> Result<StatusReport> {
    let mirror_files = config.mirror.root.is_dir().then(|| {
        WalkDir::new(&config.mirror.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    });

    let metadata_entries = if config.mirror.metadata_file.is_file() {
        MetadataIndex::load(&config.mirror.metadata_file)
            .map(|index| index.len())
            .ok()
    } else {
        None
    };

    let documents = if config.db.path.is_file() {
        let pool = db::connect(config).await?;
        let count = count_documents(&pool).await.ok();
        pool.close().await;
        count
    } else {
        None
    };

    Ok(StatusReport {
        credentials_present: config.drive.credentials_path.is_file(),
        token: token_status(&config.drive),
        mirror_files,
        metadata_entries,
        documents,
    })
}

pub async fn run_status(config: &Config) -> Result<()> {
    let report = collect_status(config).await?;

    println!("{:<12} {:<40} STATUS", "CHECK", "PATH");
    println!(
        "{:<12} {:<40} {}",
        "credentials",
        config.drive.credentials_path.display(),
        if report.credentials_present { "ok" } else { "missing" }
    );
    println!(
        "{:<12} {:<40} {}",
        "token",
        config.drive.token_path.display(),
        report.token.as_str()
    );
    println!(
        "{:<12} {:<40} {}",
        "mirror",
        config.mirror.root.display(),
        match report.mirror_files {
            Some(n) => format!("{} files", n),
            None => "missing".to_string(),
        }
    );
    println!(
        "{:<12} {:<40} {}",
        "metadata",
        config.mirror.metadata_file.display(),
        match report.metadata_entries {
            Some(n) => format!("{} entries", n),
            None => "missing".to_string(),
        }
    );
    println!(
        "{:<12} {:<40} {}",
        "database",
        config.db.path.display(),
        match report.documents {
            Some(n) => format!("{} documents", n),
            None => "missing".to_string(),
        }
    );
    Ok(())
}
