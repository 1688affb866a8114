//! Reconcile a local directory with a [`DriveMap`].
//!
//! [`reconcile`] makes the mirror match the remote tree in five passes:
//!
//! 1. create every remote folder under `base`;
//! 2. delete local files that no longer correspond to a remote file;
//! 3. download regular files and export Workspace files;
//! 4. hash and describe each written file in the [`MetadataIndex`];
//! 5. remove directories left empty, deepest first.
//!
//! A failure on a single file is logged and counted in the
//! [`MirrorReport`]; the run carries on with the next file. Nothing outside
//! `base` is ever written or removed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::drive_client::{ByteSink, DriveApi};
use crate::drive_tree::{DriveFile, DriveMap};
use crate::metadata::{extract_metadata, relative_to, MetadataIndex};
use crate::progress::{ProgressEvent, ProgressReporter};

/// How a Workspace type is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportFormat {
    pub export_mime: &'static str,
    pub extension: &'static str,
}

const EXPORTS: &[(&str, ExportFormat)] = &[
    (
        "application/vnd.google-apps.document",
        ExportFormat {
            export_mime: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            extension: ".docx",
        },
    ),
    (
        "application/vnd.google-apps.spreadsheet",
        ExportFormat {
            export_mime: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            extension: ".xlsx",
        },
    ),
    (
        "application/vnd.google-apps.presentation",
        ExportFormat {
            export_mime: "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            extension: ".pptx",
        },
    ),
    (
        "application/vnd.google-apps.drawing",
        ExportFormat {
            export_mime: "application/pdf",
            extension: ".pdf",
        },
    ),
    (
        "application/vnd.google-apps.script",
        ExportFormat {
            export_mime: "application/vnd.google-apps.script+json",
            extension: ".json",
        },
    ),
];

pub fn export_format(google_mime: &str) -> Option<ExportFormat> {
    EXPORTS
        .iter()
        .find(|(mime, _)| *mime == google_mime)
        .map(|(_, format)| *format)
}

/// What the mirror does with one remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Download,
    Export(ExportFormat),
    /// Workspace type with no export mapping.
    Unsupported,
}

pub fn transfer_for(file: &DriveFile) -> Transfer {
    if !file.mime_type.starts_with(crate::drive_client::WORKSPACE_MIME_PREFIX) {
        return Transfer::Download;
    }
    match export_format(&file.mime_type) {
        Some(format) => Transfer::Export(format),
        None => Transfer::Unsupported,
    }
}

/// Path of `file` relative to the mirror root. Exports get their extension
/// appended unless the name already ends with it.
pub fn local_relative_path(file: &DriveFile) -> String {
    match transfer_for(file) {
        Transfer::Export(format) if !file.path.ends_with(format.extension) => {
            format!("{}{}", file.path, format.extension)
        }
        _ => file.path.clone(),
    }
}

fn to_local(base: &Path, relative: &str) -> PathBuf {
    relative.split('/').fold(base.to_path_buf(), |p, seg| p.join(seg))
}

#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    /// Keep a local copy whose size and mtime already match the remote.
    pub skip_unchanged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub folders_created: usize,
    pub files_deleted: usize,
    pub downloaded: usize,
    pub exported: usize,
    pub skipped_unchanged: usize,
    pub unsupported: usize,
    pub failed: usize,
    pub dirs_removed: usize,
}

/// The transfers to perform, one per distinct local path, in map order.
/// When two remote files land on the same path the later one wins.
fn planned_transfers(map: &DriveMap) -> Vec<(&DriveFile, String, Transfer)> {
    let mut last_for_path: HashMap<String, usize> = HashMap::new();
    let mut candidates: Vec<(&DriveFile, String, Transfer)> = Vec::new();

    for file in &map.files {
        let transfer = transfer_for(file);
        if transfer == Transfer::Unsupported {
            continue;
        }
        let local = local_relative_path(file);
        if let Some(prev) = last_for_path.insert(local.clone(), candidates.len()) {
            tracing::warn!(
                path = %local,
                first = %candidates[prev].0.id,
                second = %file.id,
                "two remote files map to the same local path; keeping the later one"
            );
        }
        candidates.push((file, local, transfer));
    }

    candidates
        .into_iter()
        .enumerate()
        .filter(|(i, (_, local, _))| last_for_path.get(local) == Some(i))
        .map(|(_, c)| c)
        .collect()
}

/// What a reconcile would do, without touching disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorPlan {
    pub create: Vec<String>,
    pub delete: Vec<String>,
    pub fetch: Vec<String>,
    pub unsupported: Vec<String>,
}

pub fn plan(map: &DriveMap, base: &Path) -> Result<MirrorPlan> {
    let transfers = planned_transfers(map);
    let expected: BTreeSet<&str> = transfers.iter().map(|(_, p, _)| p.as_str()).collect();

    let create = map
        .folders
        .iter()
        .filter(|f| !to_local(base, &f.path).is_dir())
        .map(|f| f.path.clone())
        .collect();

    let mut delete = Vec::new();
    for (rel, _) in local_files(base)? {
        if !expected.contains(rel.as_str()) {
            delete.push(rel);
        }
    }

    Ok(MirrorPlan {
        create,
        delete,
        fetch: transfers.into_iter().map(|(_, p, _)| p).collect(),
        unsupported: map
            .files
            .iter()
            .filter(|f| transfer_for(f) == Transfer::Unsupported)
            .map(|f| f.path.clone())
            .collect(),
    })
}

/// Every non-directory entry under `base`: the `/`-joined relative key
/// and the path on disk. Keys of non-UTF-8 names are lossy, so deletions
/// go through the real path.
fn local_files(base: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(base).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", base.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        out.push((relative_to(entry.path(), base)?, entry.into_path()));
    }
    Ok(out)
}

/// Remove files standing where the folder `rel` (or one of its parents)
/// has to be created. Returns how many were removed.
fn clear_file_obstacles(base: &Path, rel: &str) -> Result<usize> {
    let mut removed = 0;
    let mut path = base.to_path_buf();
    for segment in rel.split('/') {
        path.push(segment);
        let Ok(stat) = std::fs::symlink_metadata(&path) else {
            break;
        };
        if stat.is_dir() {
            continue;
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
        tracing::info!("deleted {} to make room for a folder", path.display());
        removed += 1;
        break;
    }
    Ok(removed)
}

pub async fn reconcile(
    api: &dyn DriveApi,
    map: &DriveMap,
    base: &Path,
    index: &mut MetadataIndex,
    options: &MirrorOptions,
    progress: &dyn ProgressReporter,
) -> Result<MirrorReport> {
    let mut report = MirrorReport::default();
    std::fs::create_dir_all(base)
        .with_context(|| format!("failed to create mirror root {}", base.display()))?;

    for folder in &map.folders {
        let dir = to_local(base, &folder.path);
        if dir.is_dir() {
            continue;
        }
        match clear_file_obstacles(base, &folder.path) {
            Ok(n) => report.files_deleted += n,
            Err(e) => {
                tracing::warn!("{e:#}");
                report.failed += 1;
                continue;
            }
        }
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                tracing::info!("created directory {}", dir.display());
                report.folders_created += 1;
            }
            Err(e) => {
                tracing::warn!("failed to create {}: {}", dir.display(), e);
                report.failed += 1;
            }
        }
    }

    let transfers = planned_transfers(map);
    let expected: BTreeSet<&str> = transfers.iter().map(|(_, p, _)| p.as_str()).collect();

    for (rel, path) in local_files(base)? {
        if expected.contains(rel.as_str()) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("deleted {}", path.display());
                report.files_deleted += 1;
            }
            Err(e) => {
                tracing::warn!("failed to delete {}: {}", path.display(), e);
                report.failed += 1;
            }
        }
    }

    for file in &map.files {
        if transfer_for(file) == Transfer::Unsupported {
            tracing::warn!(
                "unsupported Google Workspace format {} for {}",
                file.mime_type,
                file.path
            );
            report.unsupported += 1;
        }
    }

    let total = transfers.len() as u64;
    for (n, (file, rel, transfer)) in transfers.iter().enumerate() {
        let path = to_local(base, rel);
        progress.report(ProgressEvent::Transfer {
            n: n as u64 + 1,
            total,
            path: rel.clone(),
        });

        if options.skip_unchanged && *transfer == Transfer::Download && is_unchanged(&path, file) {
            report.skipped_unchanged += 1;
        } else {
            match fetch(api, file, *transfer, &path, rel, progress).await {
                Ok(bytes) => {
                    tracing::debug!(bytes, "fetched {}", rel);
                    match transfer {
                        Transfer::Export(_) => report.exported += 1,
                        _ => report.downloaded += 1,
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to fetch {}: {:#}", rel, e);
                    report.failed += 1;
                    continue;
                }
            }
        }

        match extract_metadata(&path, base, file) {
            Ok(meta) => {
                index.insert(meta);
            }
            Err(e) => {
                tracing::warn!("failed to index {}: {:#}", rel, e);
                report.failed += 1;
            }
        }
    }

    report.dirs_removed = remove_empty_dirs(base);
    Ok(report)
}

fn is_unchanged(path: &Path, file: &DriveFile) -> bool {
    let (Some(remote_size), Some(remote_mtime)) = (file.size, file.modified_time) else {
        return false;
    };
    let Ok(stat) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(local_mtime) = stat.modified() else {
        return false;
    };
    stat.is_file() && stat.len() == remote_size && DateTime::<Utc>::from(local_mtime) >= remote_mtime
}

/// Writes into `<name>.part` and renames over the target on success.
struct FileSink<'a> {
    file: tokio::fs::File,
    rel: &'a str,
    progress: &'a dyn ProgressReporter,
    last_step: u8,
}

#[async_trait]
impl ByteSink for FileSink<'_> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    fn percent(&mut self, percent: u8) {
        let step = percent / 10;
        if step > self.last_step {
            self.last_step = step;
            self.progress.report(ProgressEvent::TransferPercent {
                path: self.rel.to_string(),
                percent,
            });
        }
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

async fn fetch(
    api: &dyn DriveApi,
    file: &DriveFile,
    transfer: Transfer,
    path: &Path,
    rel: &str,
    progress: &dyn ProgressReporter,
) -> Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(path);
    let mut sink = FileSink {
        file: tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("failed to create {}", part.display()))?,
        rel,
        progress,
        last_step: 0,
    };

    let result = match transfer {
        Transfer::Export(format) => api.export(&file.id, format.export_mime, &mut sink).await,
        _ => api.download(&file.id, &mut sink).await,
    };
    let finished = match result {
        Ok(bytes) => sink.file.flush().await.map(|_| bytes).map_err(Into::into),
        Err(e) => Err(e),
    };
    drop(sink);

    match finished {
        Ok(bytes) => {
            tokio::fs::rename(&part, path)
                .await
                .with_context(|| format!("failed to move {} into place", part.display()))?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e)
        }
    }
}

/// Remove empty directories below `base`, children before parents.
fn remove_empty_dirs(base: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(base).min_depth(1).contents_first(true) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_dir() {
            continue;
        }
        let is_empty = std::fs::read_dir(entry.path())
            .map(|mut it| it.next().is_none())
            .unwrap_or(false);
        if !is_empty {
            continue;
        }
        match std::fs::remove_dir(entry.path()) {
            Ok(()) => {
                tracing::info!("removed empty directory {}", entry.path().display());
                removed += 1;
            }
            Err(e) => tracing::warn!("failed to remove {}: {}", entry.path().display(), e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive_tree::fake::FakeDrive;
    use crate::drive_tree::map_drive_structure;
    use crate::progress::NoProgress;

    const DOC: &str = "application/vnd.google-apps.document";

    fn file(path: &str, mime: &str) -> DriveFile {
        DriveFile {
            id: path.into(),
            name: path.rsplit('/').next().unwrap_or(path).into(),
            path: path.into(),
            mime_type: mime.into(),
            size: None,
            modified_time: None,
            google_drive_url: String::new(),
        }
    }

    #[test]
    fn export_table() {
        assert_eq!(export_format(DOC).unwrap().extension, ".docx");
        assert_eq!(
            export_format("application/vnd.google-apps.drawing").unwrap().export_mime,
            "application/pdf"
        );
        assert_eq!(
            export_format("application/vnd.google-apps.script").unwrap().extension,
            ".json"
        );
        assert!(export_format("application/vnd.google-apps.form").is_none());
    }

    #[test]
    fn export_extension_appended_once() {
        assert_eq!(local_relative_path(&file("Notes/Plan", DOC)), "Notes/Plan.docx");
        assert_eq!(local_relative_path(&file("Notes/Plan.docx", DOC)), "Notes/Plan.docx");
        assert_eq!(local_relative_path(&file("a.pdf", "application/pdf")), "a.pdf");
        assert_eq!(
            transfer_for(&file("Form", "application/vnd.google-apps.form")),
            Transfer::Unsupported
        );
    }

    fn drive() -> FakeDrive {
        let mut d = FakeDrive::default();
        d.folder("root", "d1", "Reports")
            .file("d1", "f1", "q1.txt", b"first quarter")
            .workspace("d1", "g1", "Plan", DOC, b"PK-docx-bytes")
            .workspace("d1", "g2", "Survey", "application/vnd.google-apps.form", b"")
            .folder("root", "d2", "Empty")
            .file("root", "f2", "top.md", b"# top");
        d
    }

    #[tokio::test]
    async fn fresh_mirror_matches_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("mirror");
        let api = drive();
        let map = map_drive_structure(&api, "root").await.unwrap();
        let mut index = MetadataIndex::new();

        let report = reconcile(&api, &map, &base, &mut index, &MirrorOptions::default(), &NoProgress)
            .await
            .unwrap();

        assert_eq!(report.folders_created, 2);
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.exported, 1);
        assert_eq!(report.unsupported, 1);
        assert_eq!(report.failed, 0);
        // The empty remote folder has nothing in it locally either.
        assert_eq!(report.dirs_removed, 1);
        assert!(!base.join("Empty").exists());

        assert_eq!(
            std::fs::read(base.join("Reports").join("Plan.docx")).unwrap(),
            b"PK-docx-bytes"
        );
        let keys: Vec<String> = local_files(&base).unwrap().into_iter().map(|(rel, _)| rel).collect();
        assert_eq!(keys, vec!["Reports/Plan.docx", "Reports/q1.txt", "top.md"]);
        assert_eq!(index.len(), 3);
        assert!(index.iter().any(|m| m.relative_path == "Reports/Plan.docx"));
    }

    #[tokio::test]
    async fn stale_files_are_deleted_and_exports_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();
        let api = drive();
        let map = map_drive_structure(&api, "root").await.unwrap();

        std::fs::create_dir_all(base.join("Gone").join("deeper")).unwrap();
        std::fs::write(base.join("Gone").join("deeper").join("old.txt"), b"old").unwrap();
        std::fs::write(base.join("stray.bin"), b"x").unwrap();

        let mut index = MetadataIndex::new();
        reconcile(&api, &map, &base, &mut index, &MirrorOptions::default(), &NoProgress)
            .await
            .unwrap();
        let second = reconcile(&api, &map, &base, &mut index, &MirrorOptions::default(), &NoProgress)
            .await
            .unwrap();

        assert!(!base.join("stray.bin").exists());
        assert!(!base.join("Gone").exists());
        assert!(base.join("Reports").join("Plan.docx").exists());
        // A second pass has nothing left to delete.
        assert_eq!(second.files_deleted, 0);
        assert_eq!(second.exported, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stray_file_with_non_utf8_name_is_deleted() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();
        let stray = base.join(OsStr::from_bytes(b"bad\xffname.txt"));
        std::fs::write(&stray, b"stray").unwrap();
        let api = drive();
        let map = map_drive_structure(&api, "root").await.unwrap();

        let mut index = MetadataIndex::new();
        let report = reconcile(&api, &map, &base, &mut index, &MirrorOptions::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.failed, 0);
        assert!(!stray.exists());
    }

    #[tokio::test]
    async fn file_in_place_of_a_folder_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();
        std::fs::write(base.join("Reports"), b"not a folder").unwrap();
        let api = drive();
        let map = map_drive_structure(&api, "root").await.unwrap();

        let mut index = MetadataIndex::new();
        let report = reconcile(&api, &map, &base, &mut index, &MirrorOptions::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.files_deleted, 1);
        assert!(base.join("Reports").is_dir());
        assert!(base.join("Reports").join("q1.txt").is_file());
    }

    #[tokio::test]
    async fn one_failing_file_does_not_stop_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut api = drive();
        api.failing.push("f1".into());
        let map = map_drive_structure(&api, "root").await.unwrap();
        let mut index = MetadataIndex::new();

        let report = reconcile(&api, &map, tmp.path(), &mut index, &MirrorOptions::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.downloaded, 1);
        assert!(tmp.path().join("top.md").exists());
        assert!(!tmp.path().join("Reports").join("q1.txt").exists());
        assert!(!tmp.path().join("Reports").join("q1.txt.part").exists());
    }

    #[tokio::test]
    async fn unchanged_files_are_not_refetched() {
        let tmp = tempfile::tempdir().unwrap();
        let api = drive();
        let mut map = map_drive_structure(&api, "root").await.unwrap();
        let mut index = MetadataIndex::new();
        reconcile(&api, &map, tmp.path(), &mut index, &MirrorOptions::default(), &NoProgress)
            .await
            .unwrap();

        let long_ago = DateTime::parse_from_rfc3339("2001-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        for f in &mut map.files {
            f.modified_time = Some(long_ago);
        }
        api.fetched.lock().unwrap().clear();

        let mut index = MetadataIndex::new();
        let options = MirrorOptions { skip_unchanged: true };
        let report = reconcile(&api, &map, tmp.path(), &mut index, &options, &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.skipped_unchanged, 2);
        assert_eq!(report.exported, 1);
        assert_eq!(*api.fetched.lock().unwrap(), vec!["g1".to_string()]);
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_paths_keep_the_later_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut api = FakeDrive::default();
        api.file("root", "a", "same.txt", b"first").file("root", "b", "same.txt", b"second");
        let map = map_drive_structure(&api, "root").await.unwrap();
        let mut index = MetadataIndex::new();

        let report = reconcile(&api, &map, tmp.path(), &mut index, &MirrorOptions::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(std::fs::read(tmp.path().join("same.txt")).unwrap(), b"second");
        assert_eq!(index.iter().next().unwrap().google_drive_id, "b");
    }

    #[tokio::test]
    async fn plan_reports_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("stray.bin"), b"x").unwrap();
        let api = drive();
        let map = map_drive_structure(&api, "root").await.unwrap();

        let p = plan(&map, tmp.path()).unwrap();
        assert_eq!(p.create, vec!["Reports", "Empty"]);
        assert_eq!(p.delete, vec!["stray.bin"]);
        assert_eq!(p.fetch, vec!["Reports/q1.txt", "Reports/Plan.docx", "top.md"]);
        assert_eq!(p.unsupported, vec!["Reports/Survey"]);
        assert!(!tmp.path().join("Reports").exists());
    }
}
