use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmConfig;
use crate::llm::prompt::truncate_to_char_boundary;
use crate::llm::Embedder;

/// Maximum characters sent per text to the embedding API.
/// A 512-word chunk of prose is roughly 3 000 characters; anything longer is
/// cut rather than rejected by the server.
const MAX_EMBED_CHARS: usize = 4_000;

/// Embedding client for Ollama or OpenAI-compatible servers.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }

    async fn embed_batch(&self, api: EmbedApi, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self
            .client
            .post(api.url(&self.config.base_url))
            .json(&api.request_body(&self.config.embedding_model, batch));
        if api == EmbedApi::OpenAi {
            request = request.bearer_auth(self.config.api_key.as_deref().unwrap_or_default());
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to reach {} embedding endpoint", self.config.provider))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} embedding endpoint returned {status}: {body}", self.config.provider);
        }

        let body: Value = resp
            .json()
            .await
            .context("Failed to read embedding response")?;
        api.parse_response(body)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let api = EmbedApi::for_provider(&self.config.provider)?;

        let truncated: Vec<String> = texts
            .iter()
            .map(|t| truncate_to_char_boundary(t, MAX_EMBED_CHARS).to_string())
            .collect();

        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in truncated.chunks(api.batch_size()) {
            embeddings.extend(self.embed_batch(api, batch).await?);
        }

        check_shape(&embeddings, texts.len(), self.config.embedding_dim)?;
        tracing::debug!(count = embeddings.len(), "embed");
        Ok(embeddings)
    }
}

/// One vector per input, each of the configured dimension.
fn check_shape(embeddings: &[Vec<f32>], expected: usize, dim: usize) -> Result<()> {
    anyhow::ensure!(
        embeddings.len() == expected,
        "Embedding API returned {} vectors for {expected} inputs",
        embeddings.len()
    );
    if let Some(bad) = embeddings.iter().find(|e| e.len() != dim) {
        anyhow::bail!("Embedding dimension {} does not match configured {dim}", bad.len());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmbedApi {
    /// `POST /api/embed`, vectors under `embeddings`
    Ollama,
    /// `POST /v1/embeddings`, vectors under `data[].embedding` tagged by `index`
    OpenAi,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    truncate: Option<bool>,
}

#[derive(Deserialize)]
struct OllamaEmbeddings {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddings {
    data: Vec<IndexedEmbedding>,
}

#[derive(Deserialize)]
struct IndexedEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl EmbedApi {
    fn for_provider(provider: &str) -> Result<Self> {
        match provider {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            other => anyhow::bail!("Unknown LLM provider: {other}"),
        }
    }

    fn url(self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Self::Ollama => format!("{base}/api/embed"),
            Self::OpenAi => format!("{base}/v1/embeddings"),
        }
    }

    fn batch_size(self) -> usize {
        match self {
            Self::Ollama => 32,
            Self::OpenAi => 64,
        }
    }

    fn request_body<'a>(self, model: &'a str, input: &'a [String]) -> EmbedRequest<'a> {
        EmbedRequest {
            model,
            input,
            truncate: (self == Self::Ollama).then_some(true),
        }
    }

    fn parse_response(self, body: Value) -> Result<Vec<Vec<f32>>> {
        match self {
            Self::Ollama => {
                let parsed: OllamaEmbeddings =
                    serde_json::from_value(body).context("Malformed Ollama embedding response")?;
                Ok(parsed.embeddings)
            }
            Self::OpenAi => {
                let mut parsed: OpenAiEmbeddings =
                    serde_json::from_value(body).context("Malformed OpenAI embedding response")?;
                // Servers may reorder; `index` is authoritative
                parsed.data.sort_by_key(|d| d.index);
                Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
            }
        }
    }
}
