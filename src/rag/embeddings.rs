use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::Secret;
use crate::error::{ChatError, Result};

/// Gemini accepts at most this many requests per `batchEmbedContents` call.
const MAX_BATCH: usize = 100;

/// Turns text into a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a user question for similarity search.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed document chunks for indexing. Defaults to one call per text.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    fn name(&self) -> &str;
}

/// Rejects vectors that would silently poison a similarity search.
pub fn check_vector(values: Vec<f32>) -> Result<Vec<f32>> {
    if values.is_empty() {
        return Err(ChatError::retrieval("embedding provider returned an empty vector"));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ChatError::retrieval("embedding provider returned non-finite values"));
    }
    if values.iter().all(|v| *v == 0.0) {
        return Err(ChatError::retrieval("embedding provider returned a zero vector"));
    }
    Ok(values)
}

pub struct GeminiEmbedder {
    client: Client,
    base_url: String,
    model: String,
    api_key: Secret,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest<'a> {
    model: &'a str,
    content: Content<'a>,
    task_type: &'static str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedContentRequest<'a>>,
}

#[derive(Deserialize)]
struct EmbedContentResponse {
    embedding: ContentEmbedding,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Deserialize)]
struct ContentEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}

impl GeminiEmbedder {
    pub fn new(client: Client, base_url: &str, model: &str, api_key: Secret) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}:{}", self.base_url, self.model, method)
    }

    fn request<'a>(&'a self, text: &'a str, task_type: &'static str) -> EmbedContentRequest<'a> {
        EmbedContentRequest {
            model: &self.model,
            content: Content {
                parts: vec![Part { text }],
            },
            task_type,
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, method: &str, body: &B) -> Result<R> {
        let response = self
            .client
            .post(self.endpoint(method))
            .header("x-goog-api-key", self.api_key.expose())
            .json(body)
            .send()
            .await
            .map_err(|e| ChatError::retrieval(format!("embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::retrieval(format!(
                "embedding API returned {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ChatError::retrieval(format!("malformed embedding response: {}", e)))
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(ChatError::validation("cannot embed empty text"));
        }

        let response: EmbedContentResponse = self
            .post("embedContent", &self.request(text, "RETRIEVAL_QUERY"))
            .await?;
        check_vector(response.embedding.values)
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(ChatError::validation("cannot embed empty text"));
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            let body = BatchEmbedRequest {
                requests: batch
                    .iter()
                    .map(|t| self.request(t, "RETRIEVAL_DOCUMENT"))
                    .collect(),
            };
            let response: BatchEmbedResponse = self.post("batchEmbedContents", &body).await?;

            if response.embeddings.len() != batch.len() {
                return Err(ChatError::retrieval(format!(
                    "embedding API returned {} vectors for {} texts",
                    response.embeddings.len(),
                    batch.len()
                )));
            }
            for embedding in response.embeddings {
                vectors.push(check_vector(embedding.values)?);
            }
        }

        Ok(vectors)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

#[cfg(feature = "local-embeddings")]
mod local {
    use std::path::Path;

    use async_trait::async_trait;
    use fastembed::{InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel};

    use super::{check_vector, Embedder};
    use crate::error::{ChatError, Result};

    /// ONNX model loaded from disk; runs in-process instead of calling a remote API.
    pub struct LocalEmbedder {
        model: TextEmbedding,
        name: String,
    }

    fn read(dir: &Path, file: &str) -> Result<Vec<u8>> {
        std::fs::read(dir.join(file))
            .map_err(|e| ChatError::configuration(format!("failed to read {}: {}", file, e)))
    }

    impl LocalEmbedder {
        pub fn new(model_dir: &Path) -> Result<Self> {
            if !model_dir.exists() {
                return Err(ChatError::configuration(format!(
                    "model directory not found: {}",
                    model_dir.display()
                )));
            }
            tracing::info!("Loading local embedding model from {}", model_dir.display());

            let user_model = UserDefinedEmbeddingModel {
                onnx_file: read(model_dir, "model.onnx")?,
                tokenizer_files: TokenizerFiles {
                    tokenizer_file: read(model_dir, "tokenizer.json")?,
                    config_file: read(model_dir, "config.json")?,
                    special_tokens_map_file: read(model_dir, "special_tokens_map.json")?,
                    tokenizer_config_file: read(model_dir, "tokenizer_config.json")?,
                },
            };

            let model = TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
                .map_err(|e| ChatError::configuration(format!("failed to initialize embedding model: {}", e)))?;

            Ok(Self {
                model,
                name: model_dir.display().to_string(),
            })
        }

        fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            let vectors = self
                .model
                .embed(texts, None)
                .map_err(|e| ChatError::retrieval(format!("local embedding failed: {}", e)))?;
            vectors.into_iter().map(check_vector).collect()
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.trim().is_empty() {
                return Err(ChatError::validation("cannot embed empty text"));
            }
            self.run(vec![text.to_string()])?
                .into_iter()
                .next()
                .ok_or_else(|| ChatError::retrieval("local model returned no embedding"))
        }

        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.run(texts.to_vec())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}
