//! `dchat tree` and `dchat download`: authenticate, walk the remote tree
//! and reconcile the local mirror.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::drive_auth::{authorize, TokenSource};
use crate::drive_client::{DriveApi, GoogleDriveClient};
use crate::drive_tree::{list_tree, map_drive_structure_with_progress, render_tree};
use crate::metadata::MetadataIndex;
use crate::mirror::{plan, reconcile, MirrorOptions, MirrorReport};
use crate::progress::ProgressMode;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Print what would change without touching disk.
    pub dry_run: bool,
    /// Skip printing the remote tree first.
    pub quiet_tree: bool,
    pub progress: ProgressMode,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            quiet_tree: false,
            progress: ProgressMode::Off,
        }
    }
}

/// Authorized Drive client for `config`.
pub async fn connect_drive(config: &Config) -> Result<GoogleDriveClient> {
    let token = authorize(config).await?;
    let tokens = TokenSource::new(token).persist_to(config.drive.token_path.clone());
    GoogleDriveClient::new(&config.drive, Arc::new(tokens))
}

pub async fn run_auth(config: &Config) -> Result<()> {
    let token = authorize(config).await?;
    println!("authorized");
    println!("  token file: {}", config.drive.token_path.display());
    println!("  scopes: {}", token.scopes.join(" "));
    if let Some(expiry) = token.expiry {
        println!("  expires: {}", expiry.to_rfc3339());
    }
    println!("ok");
    Ok(())
}

pub async fn run_tree(config: &Config) -> Result<()> {
    let client = connect_drive(config).await?;
    print_tree(&client, config).await
}

async fn print_tree(api: &dyn DriveApi, config: &Config) -> Result<()> {
    let tree = list_tree(api, &config.drive.root_folder_id).await?;
    print!("{}", render_tree(&tree));
    Ok(())
}

pub async fn run_download(config: &Config, options: &DownloadOptions) -> Result<Option<MirrorReport>> {
    let client = connect_drive(config).await?;
    download_with(&client, config, options).await
}

/// The download pipeline against any [`DriveApi`]. Returns `None` for a
/// dry run.
pub async fn download_with(
    api: &dyn DriveApi,
    config: &Config,
    options: &DownloadOptions,
) -> Result<Option<MirrorReport>> {
    let base = config.mirror.root.as_path();

    if !options.quiet_tree {
        println!("Structure of your Google Drive:");
        print_tree(api, config).await?;
        println!();
    }

    let reporter = options.progress.reporter();
    let map = map_drive_structure_with_progress(api, &config.drive.root_folder_id, reporter.as_ref())
        .await
        .context("failed to map the remote drive")?;
    println!(
        "Found {} files in {} folders.",
        map.files.len(),
        map.folders.len()
    );

    if options.dry_run {
        print_plan(&map, base)?;
        return Ok(None);
    }

    MetadataIndex::remove_file(&config.mirror.metadata_file)?;
    std::fs::create_dir_all(base)
        .with_context(|| format!("failed to create mirror root {}", base.display()))?;
    println!("Downloading all files to: {}", display_abs(base));

    let mut index = MetadataIndex::new();
    let mirror_options = MirrorOptions {
        skip_unchanged: config.mirror.skip_unchanged,
    };
    let report = reconcile(api, &map, base, &mut index, &mirror_options, reporter.as_ref()).await?;
    index.save(&config.mirror.metadata_file)?;

    println!("download {}", config.drive.root_folder_id);
    println!("  folders created: {}", report.folders_created);
    println!("  files deleted: {}", report.files_deleted);
    println!("  downloaded: {}", report.downloaded);
    println!("  exported: {}", report.exported);
    if config.mirror.skip_unchanged {
        println!("  unchanged: {}", report.skipped_unchanged);
    }
    println!("  unsupported: {}", report.unsupported);
    println!("  failed: {}", report.failed);
    println!("  empty dirs removed: {}", report.dirs_removed);
    println!("  metadata entries: {}", index.len());
    println!("ok");

    Ok(Some(report))
}

fn print_plan(map: &crate::drive_tree::DriveMap, base: &Path) -> Result<()> {
    let plan = plan(map, base)?;
    for dir in &plan.create {
        println!("would create: {}", dir);
    }
    for file in &plan.delete {
        println!("would delete: {}", file);
    }
    for file in &plan.fetch {
        println!("would fetch: {}", file);
    }
    for file in &plan.unsupported {
        println!("unsupported: {}", file);
    }
    println!(
        "dry run: {} to create, {} to delete, {} to fetch, {} unsupported",
        plan.create.len(),
        plan.delete.len(),
        plan.fetch.len(),
        plan.unsupported.len()
    );
    Ok(())
}

fn display_abs(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}
