use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::Secret;
use crate::error::{ChatError, Result};
use crate::models::{CompletionRequest, CompletionResponse, Message};

/// Sends a composed prompt to a hosted LLM and returns its reply.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_output_tokens: 1000,
        }
    }
}

/// Exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Longest the retry loop can run when every attempt takes `per_attempt`,
    /// backoff and maximum jitter included.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let jitter = self.base_delay / 2;
        (0..self.max_retries).fold(per_attempt * (self.max_retries + 1), |total, attempt| {
            total + self.base_delay * (1 << attempt.min(6)) + jitter
        })
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let jitter = rand::random_range(0..=base / 2);
        Duration::from_millis(base.saturating_mul(1 << attempt.min(6)) + jitter)
    }
}

enum Failure {
    /// Timeouts, dropped connections, 429 and 5xx.
    Transient(String),
    Fatal(String),
}

async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Failure>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Failure::Transient(msg)) if attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Transient generation failure, retrying: {}",
                    msg
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(Failure::Transient(msg)) | Err(Failure::Fatal(msg)) => {
                return Err(ChatError::generation(msg))
            }
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn post_json<B: Serialize, R: DeserializeOwned>(
    request: RequestBuilder,
    body: &B,
) -> std::result::Result<R, Failure> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| Failure::Transient(format!("generation request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let msg = format!("generation API returned {}: {}", status, text);
        return Err(if is_transient(status) {
            Failure::Transient(msg)
        } else {
            Failure::Fatal(msg)
        });
    }

    response
        .json()
        .await
        .map_err(|e| Failure::Fatal(format!("malformed generation response: {}", e)))
}

fn finish(text: String) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::generation("model returned an empty completion"));
    }
    Ok(text.to_string())
}

pub struct GeminiGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: Secret,
    options: GenerationOptions,
    retry: RetryPolicy,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GeminiGenerator {
    pub fn new(client: Client, base_url: &str, model: &str, api_key: Secret, options: GenerationOptions) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.trim_start_matches("models/").to_string(),
            api_key,
            options,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = self.endpoint();
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.options.temperature,
                max_output_tokens: self.options.max_output_tokens,
            },
        };

        let response: GenerateResponse = with_retries(&self.retry, || {
            post_json(
                self.client
                    .post(&url)
                    .header("x-goog-api-key", self.api_key.expose()),
                &body,
            )
        })
        .await?;

        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ChatError::generation(format!("prompt blocked by provider: {}", reason)));
        }

        let text = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect::<String>())
            .ok_or_else(|| ChatError::generation("no candidates in Gemini response"))?;

        finish(text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Client for OpenAI-compatible gateways such as LiteLLM.
pub struct OpenAiGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<Secret>,
    options: GenerationOptions,
    retry: RetryPolicy,
}

impl OpenAiGenerator {
    pub fn new(
        client: Client,
        base_url: &str,
        model: &str,
        api_key: Option<Secret>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            options,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: Some(self.options.temperature),
            max_tokens: Some(self.options.max_output_tokens),
        };

        let response: CompletionResponse = with_retries(&self.retry, || {
            let mut req = self.client.post(&url);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key.expose());
            }
            post_json(req, &body)
        })
        .await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ChatError::generation("no choices in completion response"))?;

        finish(text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
