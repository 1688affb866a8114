//! Google Drive v3 client.
//!
//! [`DriveApi`] is the seam between the mirror and the network: the mirror
//! only needs to list a folder's children and stream a file (or a
//! Workspace export) into a [`ByteSink`]. [`GoogleDriveClient`] implements
//! it over `reqwest`; tests implement it in memory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DriveConfig;
use crate::drive_auth::TokenSource;
use crate::http_retry::send_with_retry;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
/// Prefix shared by all online-only Google Workspace types.
pub const WORKSPACE_MIME_PREFIX: &str = "application/vnd.google-apps.";

const LIST_FIELDS: &str = "nextPageToken, files(id, name, mimeType, size, modifiedTime)";

/// One child of a Drive folder.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Absent for folders and Workspace files.
    pub size: Option<u64>,
    pub modified_time: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    pub fn is_workspace(&self) -> bool {
        !self.is_folder() && self.mime_type.starts_with(WORKSPACE_MIME_PREFIX)
    }
}

pub fn drive_url(file_id: &str) -> String {
    format!("https://drive.google.com/file/d/{}/view", file_id)
}

/// Receives a transfer's bytes in order.
#[async_trait]
pub trait ByteSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Called when the integer percentage of a sized transfer increases.
    fn percent(&mut self, _percent: u8) {}
}

#[async_trait]
impl ByteSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Non-trashed children of `folder_id`, across all result pages.
    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>>;

    /// Stream the file's content. Returns the byte count.
    async fn download(&self, file_id: &str, sink: &mut dyn ByteSink) -> Result<u64>;

    /// Stream a Workspace file converted to `mime`. Returns the byte count.
    async fn export(&self, file_id: &str, mime: &str, sink: &mut dyn ByteSink) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<ApiFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFile {
    id: String,
    name: String,
    mime_type: String,
    /// int64 fields arrive as JSON strings.
    size: Option<String>,
    modified_time: Option<DateTime<Utc>>,
}

impl From<ApiFile> for RemoteEntry {
    fn from(f: ApiFile) -> Self {
        RemoteEntry {
            size: f.size.and_then(|s| s.parse().ok()),
            id: f.id,
            name: f.name,
            mime_type: f.mime_type,
            modified_time: f.modified_time,
        }
    }
}

pub struct GoogleDriveClient {
    http: reqwest::Client,
    api_base: String,
    tokens: Arc<TokenSource>,
    page_size: u32,
    max_retries: u32,
}

impl GoogleDriveClient {
    pub fn new(config: &DriveConfig, tokens: Arc<TokenSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            tokens,
            page_size: config.page_size,
            max_retries: config.max_retries,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.api_base, path);
        let url = url.as_str();
        let http = &self.http;
        // A rejected refresh is not a transient Drive error.
        let token = self
            .tokens
            .access_token()
            .await
            .context("failed to obtain a Drive access token")?;
        let token = token.as_str();
        send_with_retry("Drive API", self.max_retries, || async move {
            Ok(http.get(url).query(query).bearer_auth(token).send().await?)
        })
        .await
    }

    async fn stream(&self, mut response: reqwest::Response, sink: &mut dyn ByteSink) -> Result<u64> {
        let total = response.content_length().filter(|n| *n > 0);
        let mut received = 0u64;
        let mut last_percent = 0u8;

        while let Some(chunk) = response.chunk().await.context("transfer interrupted")? {
            sink.write_chunk(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                let percent = ((received.min(total) * 100) / total) as u8;
                if percent > last_percent {
                    last_percent = percent;
                    sink.percent(percent);
                }
            }
        }
        Ok(received)
    }
}

#[async_trait]
impl DriveApi for GoogleDriveClient {
    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>> {
        let q = format!("'{}' in parents and trashed=false", folder_id.replace('\'', "\\'"));
        let page_size = self.page_size.to_string();
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("q", q.as_str()),
                ("spaces", "drive"),
                ("fields", LIST_FIELDS),
                ("pageSize", page_size.as_str()),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let response = self
                .get("files", &query)
                .await
                .with_context(|| format!("failed to list folder {}", folder_id))?;
            let page: FileList = response.json().await?;
            entries.extend(page.files.into_iter().map(RemoteEntry::from));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        Ok(entries)
    }

    async fn download(&self, file_id: &str, sink: &mut dyn ByteSink) -> Result<u64> {
        let response = self
            .get(&format!("files/{}", file_id), &[("alt", "media")])
            .await
            .with_context(|| format!("failed to download {}", file_id))?;
        self.stream(response, sink).await
    }

    async fn export(&self, file_id: &str, mime: &str, sink: &mut dyn ByteSink) -> Result<u64> {
        let response = self
            .get(&format!("files/{}/export", file_id), &[("mimeType", mime)])
            .await
            .with_context(|| format!("failed to export {} as {}", file_id, mime))?;
        self.stream(response, sink).await
    }
}
