//! Walk the remote folder hierarchy.
//!
//! Two views of the same walk: [`list_tree`] keeps the nesting for display,
//! [`map_drive_structure`] flattens it into the folder and file lists the
//! mirror reconciles against. Paths are `/`-joined, relative to the walk's
//! root, and built from [`sanitize_name`]d segments.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use crate::drive_client::{drive_url, DriveApi, RemoteEntry};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Label of the walk's root in rendered trees.
pub const ROOT_LABEL: &str = "My Drive";

#[derive(Debug, Clone, PartialEq)]
pub struct DriveFolder {
    pub id: String,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub path: String,
    pub mime_type: String,
    pub size: Option<u64>,
    pub modified_time: Option<DateTime<Utc>>,
    pub google_drive_url: String,
}

/// Flattened remote hierarchy, in depth-first pre-order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriveMap {
    pub files: Vec<DriveFile>,
    pub folders: Vec<DriveFolder>,
}

/// Make a Drive name usable as one path segment.
///
/// Drive allows `/` and arbitrary names; a local segment may not contain a
/// separator or NUL, and must not be empty, `.` or `..`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" => "_".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

fn join(parent: &str, name: &str) -> String {
    let segment = sanitize_name(name);
    if parent.is_empty() {
        segment
    } else {
        format!("{}/{}", parent, segment)
    }
}

/// Nested listing used for `dchat tree`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeNode {
    /// Empty for the root.
    pub path: String,
    pub folders: Vec<TreeNode>,
    pub files: Vec<String>,
}

type TreeFuture<'a> = Pin<Box<dyn Future<Output = Result<TreeNode>> + Send + 'a>>;

pub async fn list_tree(api: &dyn DriveApi, root_id: &str) -> Result<TreeNode> {
    list_subtree(api, root_id.to_string(), String::new()).await
}

fn list_subtree<'a>(api: &'a dyn DriveApi, folder_id: String, path: String) -> TreeFuture<'a> {
    Box::pin(async move {
        let children = api.list_children(&folder_id).await?;
        let mut node = TreeNode {
            path: path.clone(),
            ..TreeNode::default()
        };
        for child in children {
            if child.is_folder() {
                let sub = list_subtree(api, child.id, join(&path, &child.name)).await?;
                node.folders.push(sub);
            } else {
                node.files.push(child.name);
            }
        }
        Ok(node)
    })
}

/// Folders first (recursively), then files, two spaces per level.
pub fn render_tree(node: &TreeNode) -> String {
    let mut out = String::new();
    render_into(node, 0, &mut out);
    out
}

fn render_into(node: &TreeNode, indent: usize, out: &mut String) {
    let label = if node.path.is_empty() {
        ROOT_LABEL
    } else {
        node.path.as_str()
    };
    out.push_str(&format!("{:indent$}[{}]\n", "", label, indent = indent));
    for folder in &node.folders {
        render_into(folder, indent + 2, out);
    }
    for file in &node.files {
        out.push_str(&format!("{:indent$}{}\n", "", file, indent = indent + 2));
    }
}

pub async fn map_drive_structure(api: &dyn DriveApi, root_id: &str) -> Result<DriveMap> {
    map_drive_structure_with_progress(api, root_id, &NoProgress).await
}

/// Depth-first pre-order walk: a folder is recorded before anything inside
/// it, siblings keep their listing order.
pub async fn map_drive_structure_with_progress(
    api: &dyn DriveApi,
    root_id: &str,
    progress: &dyn ProgressReporter,
) -> Result<DriveMap> {
    let mut map = DriveMap::default();
    let root_children: VecDeque<RemoteEntry> = api.list_children(root_id).await?.into();
    let mut stack: Vec<(String, VecDeque<RemoteEntry>)> = vec![(String::new(), root_children)];

    while let Some((parent, pending)) = stack.last_mut() {
        let Some(entry) = pending.pop_front() else {
            stack.pop();
            continue;
        };
        let path = join(parent, &entry.name);

        if entry.is_folder() {
            let children = api.list_children(&entry.id).await?;
            map.folders.push(DriveFolder {
                id: entry.id,
                name: entry.name,
                path: path.clone(),
            });
            progress.report(ProgressEvent::Mapping {
                folders: map.folders.len() as u64,
                files: map.files.len() as u64,
            });
            stack.push((path, children.into()));
        } else {
            map.files.push(DriveFile {
                google_drive_url: drive_url(&entry.id),
                id: entry.id,
                name: entry.name,
                path,
                mime_type: entry.mime_type,
                size: entry.size,
                modified_time: entry.modified_time,
            });
        }
    }

    Ok(map)
}
