pub mod embeddings;
pub mod generation;
pub mod prompt;
pub mod vector_store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::config::{EmbeddingProvider, GenerationProvider, Settings};
use crate::error::{ChatError, Result};
use crate::models::{Answer, RetrievedChunk};
use self::embeddings::{Embedder, GeminiEmbedder};
use self::generation::{GeminiGenerator, GenerationOptions, Generator, OpenAiGenerator, RetryPolicy};
use self::prompt::PromptComposer;
use self::vector_store::{QdrantStore, VectorStore};

/// Runs the question pipeline: embed, retrieve, compose, generate.
///
/// Holds no per-request state; one engine is shared by every request.
#[derive(Clone)]
pub struct ChatEngine {
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    generator: Arc<dyn Generator>,
    composer: PromptComposer,
    top_k: u64,
    call_timeout: Duration,
    generation_timeout: Duration,
}

impl ChatEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        generator: Arc<dyn Generator>,
        composer: PromptComposer,
        top_k: u64,
    ) -> Self {
        Self {
            embedder,
            vector_store,
            generator,
            composer,
            top_k: top_k.max(1),
            call_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(30),
        }
    }

    /// Deadline for each embedding and vector query call, and for generation
    /// unless [`with_generation_timeout`](Self::with_generation_timeout) overrides it.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self.generation_timeout = timeout;
        self
    }

    /// Deadline for the whole generation step, retries and backoff included.
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    /// Build the remote clients once, at startup.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.remote_timeout)
            .build()
            .map_err(|e| ChatError::configuration(format!("failed to build HTTP client: {}", e)))?;

        let embedder: Arc<dyn Embedder> = match settings.embedding_provider {
            EmbeddingProvider::Gemini => {
                let key = settings
                    .embedding_api_key
                    .clone()
                    .ok_or_else(|| ChatError::configuration("missing embedding API key"))?;
                Arc::new(GeminiEmbedder::new(
                    http.clone(),
                    &settings.gemini_base_url,
                    &settings.embedding_model,
                    key,
                ))
            }
            #[cfg(feature = "local-embeddings")]
            EmbeddingProvider::Local => Arc::new(embeddings::LocalEmbedder::new(
                &settings.local_embedding_model_dir,
            )?),
            #[cfg(not(feature = "local-embeddings"))]
            EmbeddingProvider::Local => {
                return Err(ChatError::configuration(
                    "local embeddings require the local-embeddings feature",
                ))
            }
        };

        let vector_store = Arc::new(QdrantStore::new(
            &settings.qdrant_url,
            &settings.vector_db_api_key,
            &settings.vector_index_name,
            settings.remote_timeout,
        )?);

        let options = GenerationOptions {
            temperature: settings.temperature,
            max_output_tokens: settings.max_output_tokens,
        };
        let retry = RetryPolicy {
            max_retries: settings.max_retries,
            ..RetryPolicy::default()
        };
        let generator: Arc<dyn Generator> = match settings.generation_provider {
            GenerationProvider::Gemini => {
                let key = settings
                    .generation_api_key
                    .clone()
                    .ok_or_else(|| ChatError::configuration("missing generation API key"))?;
                Arc::new(
                    GeminiGenerator::new(
                        http.clone(),
                        &settings.gemini_base_url,
                        &settings.generation_model,
                        key,
                        options,
                    )
                    .with_retry_policy(retry),
                )
            }
            GenerationProvider::OpenAi => Arc::new(
                OpenAiGenerator::new(
                    http,
                    &settings.generation_base_url,
                    &settings.generation_model,
                    settings.generation_api_key.clone(),
                    options,
                )
                .with_retry_policy(retry),
            ),
        };

        tracing::info!(
            "Chat engine ready (embedding: {}, generation: {}, index: {}, top_k: {})",
            embedder.name(),
            generator.name(),
            settings.vector_index_name,
            settings.top_k
        );

        Ok(Self::new(
            embedder,
            vector_store,
            generator,
            PromptComposer::new(settings.organization_name.clone()),
            settings.top_k,
        )
        .with_call_timeout(settings.remote_timeout)
        // The HTTP client enforces `remote_timeout` per attempt.
        .with_generation_timeout(retry.worst_case(settings.remote_timeout)))
    }

    pub fn top_k(&self) -> u64 {
        self.top_k
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub async fn vector_store_healthy(&self) -> bool {
        self.vector_store.health_check().await
    }

    pub async fn answer(&self, question: &str) -> Result<Answer> {
        self.answer_as(question, None).await
    }

    /// Like [`answer`](Self::answer), with the caller's stated role shown to the model.
    /// Retrieval always uses the bare question.
    pub async fn answer_as(&self, question: &str, role: Option<&str>) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ChatError::validation("question cannot be empty"));
        }

        let vector = timed(
            "embedding",
            self.call_timeout,
            ChatError::Retrieval,
            self.embedder.embed(question),
        )
        .await?;

        let chunks = timed(
            "vector query",
            self.call_timeout,
            ChatError::Retrieval,
            self.vector_store.query(&vector, self.top_k),
        )
        .await?;
        tracing::debug!("Retrieved {} chunks", chunks.len());

        let framed = match role.map(str::trim).filter(|r| !r.is_empty()) {
            Some(role) => format!("[User: {}] {}", role, question),
            None => question.to_string(),
        };
        let prompt = self.composer.compose(&framed, &chunks);

        let text = timed(
            "generation",
            self.generation_timeout,
            ChatError::Generation,
            self.generator.generate(&prompt),
        )
        .await?;

        Ok(Answer {
            text,
            sources: distinct_sources(&chunks),
        })
    }
}

async fn timed<T>(
    step: &str,
    limit: Duration,
    on_timeout: fn(String) -> ChatError,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(format!("{} timed out after {:?}", step, limit))),
    }
}

/// Source ids without duplicates, in first-seen order.
fn distinct_sources(chunks: &[RetrievedChunk]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if !sources.contains(&chunk.source_id) {
            sources.push(chunk.source_id.clone());
        }
    }
    sources
}
