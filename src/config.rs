//! TOML configuration.
//!
//! A single file (default `./config/dchat.toml`) drives every command. Only
//! `[db]` and `[chunking]` are required; the remaining sections fall back to
//! defaults that reproduce a plain "mirror My Drive into `downloaded_files/`"
//! setup.
//!
//! ```toml
//! [db]
//! path = "./data/dchat.sqlite"
//!
//! [chunking]
//! max_tokens = 250
//! overlap_tokens = 50
//!
//! [drive]
//! credentials_path = "credentials.json"
//! token_path = "token.json"
//!
//! [mirror]
//! root = "downloaded_files"
//! metadata_file = "file_metadata.json"
//!
//! [llm]
//! model = "gpt-4o-mini"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Read-only Drive scope requested by default.
pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

fn default_overlap() -> usize {
    0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    /// Results returned by `search` and chunks handed to the chat model.
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            final_limit: default_final_limit(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_final_limit() -> i64 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7860".to_string()
}

/// Google Drive access: OAuth files and API tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    /// OAuth client secrets downloaded from the Google Cloud console.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    /// Where the access/refresh token is cached between runs.
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
    /// Changing scopes invalidates the cached token.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_root_folder_id")]
    pub root_folder_id: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_drive_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_drive_max_retries")]
    pub max_retries: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            token_path: default_token_path(),
            scopes: default_scopes(),
            root_folder_id: default_root_folder_id(),
            page_size: default_page_size(),
            api_base: default_api_base(),
            timeout_secs: default_drive_timeout_secs(),
            max_retries: default_drive_max_retries(),
        }
    }
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}
fn default_token_path() -> PathBuf {
    PathBuf::from("token.json")
}
fn default_scopes() -> Vec<String> {
    vec![DRIVE_READONLY_SCOPE.to_string()]
}
fn default_root_folder_id() -> String {
    "root".to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}
fn default_drive_timeout_secs() -> u64 {
    300
}
fn default_drive_max_retries() -> u32 {
    3
}

/// Local mirror of the drive.
#[derive(Debug, Deserialize, Clone)]
pub struct MirrorConfig {
    #[serde(default = "default_mirror_root")]
    pub root: PathBuf,
    /// Content-addressed metadata index written after each download.
    #[serde(default = "default_metadata_file")]
    pub metadata_file: PathBuf,
    /// Keep local copies whose size and mtime already match the remote file.
    #[serde(default)]
    pub skip_unchanged: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            root: default_mirror_root(),
            metadata_file: default_metadata_file(),
            skip_unchanged: false,
        }
    }
}

fn default_mirror_root() -> PathBuf {
    PathBuf::from("downloaded_files")
}
fn default_metadata_file() -> PathBuf {
    PathBuf::from("file_metadata.json")
}

/// Which mirrored files become documents.
#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Binary files above this size are not extracted.
    #[serde(default = "default_max_extract_bytes")]
    pub max_extract_bytes: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_extract_bytes: default_max_extract_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.md", "**/*.txt", "**/*.docx", "**/*.pptx", "**/*.xlsx", "**/*.pdf",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_extract_bytes() -> u64 {
    50 * 1024 * 1024
}

/// Chat model behind the conversational chain.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// OpenAI-compatible base URL, e.g. `http://localhost:11434/v1` for Ollama.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            base_url: None,
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Question/answer pairs kept in the conversation buffer.
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_history_turns: default_max_history_turns(),
        }
    }
}

fn default_max_history_turns() -> usize {
    10
}

impl Config {
    /// Defaults for every section; used when no config file is available.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/dchat.sqlite"),
            },
            chunking: ChunkingConfig {
                max_tokens: 250,
                overlap_tokens: 0,
            },
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            server: ServerConfig::default(),
            drive: DriveConfig::default(),
            mirror: MirrorConfig::default(),
            loader: LoaderConfig::default(),
            llm: LlmConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.llm.provider.as_str() {
        "openai" | "ollama" => {}
        other => bail!("Unknown llm provider: '{}'. Must be openai or ollama.", other),
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        bail!("llm.temperature must be in [0.0, 2.0]");
    }

    if config.drive.scopes.is_empty() {
        bail!("drive.scopes must not be empty");
    }
    if !(1..=1000).contains(&config.drive.page_size) {
        bail!("drive.page_size must be in [1, 1000]");
    }
    if config.mirror.root.as_os_str().is_empty() {
        bail!("mirror.root must not be empty");
    }

    Ok(())
}
