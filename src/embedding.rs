//! Embedding providers and vector helpers.
//!
//! | `embedding.provider` | Backend |
//! |----------------------|---------|
//! | `disabled` | none; search falls back to keyword mode |
//! | `openai` | `POST {url}/embeddings` (OpenAI or compatible), needs `OPENAI_API_KEY` |
//! | `ollama` | `POST {url}/api/embed` on a local Ollama |
//! | `local` | in-process `fastembed` (build with `--features local-embeddings`) |
//!
//! HTTP providers share the retry policy in [`crate::http_retry`].
//! Vectors are stored as little-endian `f32` BLOBs ([`vec_to_blob`]).

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::http_retry::send_with_retry;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
#[cfg(feature = "local-embeddings")]
const LOCAL_DEFAULT_MODEL: &str = "all-minilm-l6-v2";

pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
}

pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

/// An HTTP provider: model and dimensionality come straight from config.
pub struct RemoteProvider {
    model: String,
    dims: usize,
}

impl RemoteProvider {
    fn new(config: &EmbeddingConfig, needs_api_key: bool) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", config.provider))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", config.provider))?;
        if needs_api_key && std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for RemoteProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings")]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(RemoteProvider::new(config, true)?)),
        "ollama" => Ok(Box::new(RemoteProvider::new(config, false)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| LOCAL_DEFAULT_MODEL.to_string());
            let dims = config.dims.unwrap_or_else(|| local_model_dims(&model_name));
            Ok(Box::new(LocalProvider { model_name, dims }))
        }
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("the local embedding provider needs a build with --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embed `texts` with the configured provider, one vector per text, in order.
pub async fn embed_texts(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let vectors = match config.provider.as_str() {
        "openai" => embed_openai(config, texts).await?,
        "ollama" => embed_ollama(config, texts).await?,
        #[cfg(feature = "local-embeddings")]
        "local" => embed_local(config, texts).await?,
        "disabled" => bail!("Embedding provider is disabled"),
        other => bail!("Embedding provider '{}' is not available in this build", other),
    };
    if vectors.len() != texts.len() {
        bail!(
            "embedding provider returned {} vectors for {} texts",
            vectors.len(),
            texts.len()
        );
    }
    Ok(vectors)
}

pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    embed_texts(config, &[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

#[derive(Deserialize)]
struct OpenAiEmbeddings {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

async fn embed_openai(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| anyhow!("OPENAI_API_KEY not set"))?;
    let model = config
        .model
        .as_deref()
        .ok_or_else(|| anyhow!("embedding.model required"))?;
    let base = config.url.as_deref().unwrap_or(OPENAI_DEFAULT_URL);
    let url = format!("{}/embeddings", base.trim_end_matches('/'));
    let client = http_client(config)?;
    let body = serde_json::json!({ "model": model, "input": texts });

    let response = send_with_retry("OpenAI API", config.max_retries, || {
        let request = client.post(&url).bearer_auth(&api_key).json(&body);
        async move { Ok(request.send().await?) }
    })
    .await?;

    let parsed: OpenAiEmbeddings = response.json().await?;
    Ok(order_by_index(parsed.data))
}

fn order_by_index(mut data: Vec<OpenAiEmbedding>) -> Vec<Vec<f32>> {
    data.sort_by_key(|d| d.index);
    data.into_iter().map(|d| d.embedding).collect()
}

#[derive(Deserialize)]
struct OllamaEmbeddings {
    embeddings: Vec<Vec<f32>>,
}

async fn embed_ollama(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model = config
        .model
        .as_deref()
        .ok_or_else(|| anyhow!("embedding.model required"))?;
    let base = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
    let url = format!("{}/api/embed", base.trim_end_matches('/'));
    let client = http_client(config)?;
    let body = serde_json::json!({ "model": model, "input": texts });

    let response = send_with_retry("Ollama API", config.max_retries, || {
        let request = client.post(&url).json(&body);
        async move {
            request
                .send()
                .await
                .map_err(|e| anyhow!("is Ollama running at {}? {}", base, e))
        }
    })
    .await?;

    let parsed: OllamaEmbeddings = response.json().await?;
    Ok(parsed.embeddings)
}

#[cfg(feature = "local-embeddings")]
fn local_model_dims(name: &str) -> usize {
    match name {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        _ => 384,
    }
}

#[cfg(feature = "local-embeddings")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel as M;
    Ok(match name {
        "all-minilm-l6-v2" => M::AllMiniLML6V2,
        "bge-small-en-v1.5" => M::BGESmallENV15,
        "bge-base-en-v1.5" => M::BGEBaseENV15,
        "bge-large-en-v1.5" => M::BGELargeENV15,
        "nomic-embed-text-v1" => M::NomicEmbedTextV1,
        "nomic-embed-text-v1.5" => M::NomicEmbedTextV15,
        other => bail!(
            "Unknown local embedding model '{}'. Supported: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5",
            other
        ),
    })
}

#[cfg(feature = "local-embeddings")]
async fn embed_local(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let name = config
        .model
        .clone()
        .unwrap_or_else(|| LOCAL_DEFAULT_MODEL.to_string());
    let model = fastembed_model(&name)?;
    let batch_size = config.batch_size;
    let texts = texts.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut embedder = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow!("failed to load local embedding model {}: {}", name, e))?;
        embedder
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow!("local embedding failed: {}", e))
    })
    .await?
}

/// Little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (dot, na, nb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(d, x2, y2), (x, y)| {
            (d + x * y, x2 + x * x, y2 + y * y)
        });
    let denom = na.sqrt() * nb.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn cosine_cases() {
        assert!((cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn openai_vectors_follow_index_order() {
        let raw = r#"{"data": [
            {"index": 1, "embedding": [0.5, 0.5]},
            {"index": 0, "embedding": [1.0, 0.0]}
        ]}"#;
        let parsed: OpenAiEmbeddings = serde_json::from_str(raw).unwrap();
        assert_eq!(order_by_index(parsed.data), vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn disabled_provider_by_default() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        assert_eq!(provider.dims(), 0);
    }

    #[test]
    fn ollama_needs_model() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[tokio::test]
    async fn disabled_provider_refuses_to_embed() {
        let err = embed_texts(&EmbeddingConfig::default(), &["x".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }
}
