//! Process configuration, read once from the environment at startup.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::error::{ChatError, Result};

pub const DEFAULT_ORGANIZATION: &str =
    "CISNR (Centre of Intelligent System & Network Research) at UET Peshawar";

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Gemini,
    /// fastembed model on local disk, only with the `local-embeddings` feature.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationProvider {
    Gemini,
    /// Any OpenAI-compatible `/chat/completions` endpoint (LiteLLM, vLLM, ...).
    OpenAi,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub embedding_provider: EmbeddingProvider,
    /// Absent only when embeddings are computed locally.
    pub embedding_api_key: Option<Secret>,
    pub embedding_model: String,
    pub local_embedding_model_dir: PathBuf,

    pub generation_provider: GenerationProvider,
    /// Required for Gemini; optional for OpenAI-compatible gateways.
    pub generation_api_key: Option<Secret>,
    pub generation_model: String,
    pub generation_base_url: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub max_retries: u32,

    pub gemini_base_url: String,

    pub qdrant_url: String,
    pub vector_db_api_key: Secret,
    pub vector_index_name: String,
    pub top_k: u64,

    pub secret_key: Secret,
    pub remote_timeout: Duration,
    pub http_timeout: Duration,
    pub host: String,
    pub port: u16,
    pub static_dir: PathBuf,
    pub organization_name: String,
}

/// Environment keys as the `config` crate sees them (lowercased).
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    google_api_key: Option<String>,
    embedding_api_key: Option<String>,
    generation_api_key: Option<String>,
    embedding_provider: Option<String>,
    embedding_model: Option<String>,
    local_embedding_model_dir: Option<String>,
    generation_provider: Option<String>,
    generation_model: Option<String>,
    generation_base_url: Option<String>,
    generation_temperature: Option<String>,
    generation_max_tokens: Option<String>,
    generation_max_retries: Option<String>,
    gemini_base_url: Option<String>,
    qdrant_url: Option<String>,
    qdrant_api_key: Option<String>,
    vector_index_name: Option<String>,
    top_k: Option<String>,
    secret_key: Option<String>,
    remote_timeout_secs: Option<String>,
    http_timeout_secs: Option<String>,
    host: Option<String>,
    port: Option<String>,
    static_dir: Option<String>,
    organization_name: Option<String>,
}

impl Settings {
    /// Load `.env` (when present) and the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_source(Environment::default())
    }

    /// Build settings from an explicit variable map instead of the process environment.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_source(Environment::default().source(Some(map)))
    }

    fn from_source(source: Environment) -> Result<Self> {
        let raw: RawSettings = Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ChatError::configuration(format!("failed to read environment: {}", e)))?;

        Self::validate(raw)
    }

    fn validate(raw: RawSettings) -> Result<Self> {
        let mut missing: Vec<&'static str> = Vec::new();
        let mut invalid: Vec<String> = Vec::new();

        let google_api_key = non_empty(raw.google_api_key);

        let embedding_provider = match non_empty(raw.embedding_provider).as_deref() {
            None | Some("gemini") => EmbeddingProvider::Gemini,
            Some("local") if cfg!(feature = "local-embeddings") => EmbeddingProvider::Local,
            Some("local") => {
                invalid.push(
                    "EMBEDDING_PROVIDER=local requires the local-embeddings feature".to_string(),
                );
                EmbeddingProvider::Local
            }
            Some(other) => {
                invalid.push(format!("EMBEDDING_PROVIDER: unknown provider '{}'", other));
                EmbeddingProvider::Gemini
            }
        };

        let generation_provider = match non_empty(raw.generation_provider).as_deref() {
            None | Some("gemini") => GenerationProvider::Gemini,
            Some("openai") => GenerationProvider::OpenAi,
            Some(other) => {
                invalid.push(format!("GENERATION_PROVIDER: unknown provider '{}'", other));
                GenerationProvider::Gemini
            }
        };

        let embedding_api_key = non_empty(raw.embedding_api_key).or_else(|| google_api_key.clone());
        if embedding_provider == EmbeddingProvider::Gemini && embedding_api_key.is_none() {
            missing.push("EMBEDDING_API_KEY (or GOOGLE_API_KEY)");
        }

        let generation_api_key = non_empty(raw.generation_api_key).or_else(|| google_api_key.clone());
        if generation_provider == GenerationProvider::Gemini && generation_api_key.is_none() {
            missing.push("GENERATION_API_KEY (or GOOGLE_API_KEY)");
        }

        let vector_db_api_key = non_empty(raw.qdrant_api_key);
        if vector_db_api_key.is_none() {
            missing.push("QDRANT_API_KEY");
        }

        let vector_index_name = non_empty(raw.vector_index_name);
        if vector_index_name.is_none() {
            missing.push("VECTOR_INDEX_NAME");
        }

        let secret_key = non_empty(raw.secret_key);
        if secret_key.is_none() {
            missing.push("SECRET_KEY");
        }

        let temperature = parse_or(raw.generation_temperature, "GENERATION_TEMPERATURE", 0.3_f32, &mut invalid);
        let max_output_tokens = parse_or(raw.generation_max_tokens, "GENERATION_MAX_TOKENS", 1000_u32, &mut invalid);
        let max_retries = parse_or(raw.generation_max_retries, "GENERATION_MAX_RETRIES", 2_u32, &mut invalid);
        let top_k = parse_or(raw.top_k, "TOP_K", 6_u64, &mut invalid);
        if top_k == 0 {
            invalid.push("TOP_K must be greater than zero".to_string());
        }
        let remote_timeout_secs = parse_or(raw.remote_timeout_secs, "REMOTE_TIMEOUT_SECS", 30_u64, &mut invalid);
        let http_timeout_secs = parse_or(raw.http_timeout_secs, "HTTP_TIMEOUT_SECS", 120_u64, &mut invalid);
        let port = parse_or(raw.port, "PORT", 5000_u16, &mut invalid);

        if !missing.is_empty() || !invalid.is_empty() {
            let mut problems = Vec::new();
            if !missing.is_empty() {
                problems.push(format!("missing required configuration: {}", missing.join(", ")));
            }
            problems.extend(invalid);
            return Err(ChatError::configuration(problems.join("; ")));
        }

        // Every required value was checked above.
        let (Some(vector_db_api_key), Some(vector_index_name), Some(secret_key)) =
            (vector_db_api_key, vector_index_name, secret_key)
        else {
            return Err(ChatError::configuration("missing required configuration"));
        };

        Ok(Self {
            embedding_provider,
            embedding_api_key: embedding_api_key.map(Secret::new),
            embedding_model: non_empty(raw.embedding_model)
                .unwrap_or_else(|| "models/embedding-001".to_string()),
            local_embedding_model_dir: non_empty(raw.local_embedding_model_dir)
                .unwrap_or_else(|| "models/bge-small-en-v1.5".to_string())
                .into(),
            generation_provider,
            generation_api_key: generation_api_key.map(Secret::new),
            generation_model: non_empty(raw.generation_model)
                .unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            generation_base_url: non_empty(raw.generation_base_url)
                .unwrap_or_else(|| "http://localhost:4000".to_string()),
            temperature,
            max_output_tokens,
            max_retries,
            gemini_base_url: non_empty(raw.gemini_base_url)
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            qdrant_url: non_empty(raw.qdrant_url)
                .unwrap_or_else(|| "http://localhost:6334".to_string()),
            vector_db_api_key: Secret::new(vector_db_api_key),
            vector_index_name,
            top_k,
            secret_key: Secret::new(secret_key),
            remote_timeout: Duration::from_secs(remote_timeout_secs),
            http_timeout: Duration::from_secs(http_timeout_secs),
            host: non_empty(raw.host).unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            static_dir: non_empty(raw.static_dir)
                .unwrap_or_else(|| "static".to_string())
                .into(),
            organization_name: non_empty(raw.organization_name)
                .unwrap_or_else(|| DEFAULT_ORGANIZATION.to_string()),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T, invalid: &mut Vec<String>) -> T {
    match non_empty(raw) {
        None => default,
        Some(value) => value.parse().unwrap_or_else(|_| {
            invalid.push(format!("{}: cannot parse '{}'", key, value));
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("GOOGLE_API_KEY", "google-key"),
            ("QDRANT_API_KEY", "qdrant-key"),
            ("VECTOR_INDEX_NAME", "ncai"),
            ("SECRET_KEY", "session-secret"),
        ]
    }

    #[test]
    fn loads_defaults_with_required_keys() {
        let settings = Settings::from_vars(required()).unwrap();
        assert_eq!(settings.vector_index_name, "ncai");
        assert_eq!(settings.top_k, 6);
        assert_eq!(settings.port, 5000);
        assert_eq!(settings.generation_provider, GenerationProvider::Gemini);
        assert_eq!(settings.generation_api_key.as_ref().map(Secret::expose), Some("google-key"));
        assert_eq!(settings.embedding_api_key.as_ref().map(Secret::expose), Some("google-key"));
        assert_eq!(settings.remote_timeout, Duration::from_secs(30));
    }

    #[test]
    fn reports_every_missing_key() {
        let err = Settings::from_vars(vec![("VECTOR_INDEX_NAME", "ncai")]).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, ChatError::Configuration(_)));
        assert!(msg.contains("GENERATION_API_KEY"));
        assert!(msg.contains("EMBEDDING_API_KEY"));
        assert!(msg.contains("QDRANT_API_KEY"));
        assert!(msg.contains("SECRET_KEY"));
        assert!(!msg.contains("VECTOR_INDEX_NAME"));
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let vars: Vec<_> = required()
            .into_iter()
            .map(|(k, v)| if k == "SECRET_KEY" { (k, "   ") } else { (k, v) })
            .collect();
        let err = Settings::from_vars(vars).unwrap_err();
        assert!(err.to_string().contains("SECRET_KEY"));
    }

    #[test]
    fn dedicated_keys_override_shared_key() {
        let mut vars = required();
        vars.push(("GENERATION_API_KEY", "gen-key"));
        vars.push(("EMBEDDING_API_KEY", "emb-key"));
        let settings = Settings::from_vars(vars).unwrap();
        assert_eq!(settings.generation_api_key.unwrap().expose(), "gen-key");
        assert_eq!(settings.embedding_api_key.unwrap().expose(), "emb-key");
    }

    #[test]
    fn openai_gateway_needs_no_generation_key() {
        let settings = Settings::from_vars(vec![
            ("GENERATION_PROVIDER", "openai"),
            ("EMBEDDING_API_KEY", "emb-key"),
            ("QDRANT_API_KEY", "qdrant-key"),
            ("VECTOR_INDEX_NAME", "ncai"),
            ("SECRET_KEY", "session-secret"),
        ])
        .unwrap();
        assert_eq!(settings.generation_provider, GenerationProvider::OpenAi);
        assert!(settings.generation_api_key.is_none());

        let err = Settings::from_vars(vec![
            ("EMBEDDING_API_KEY", "emb-key"),
            ("QDRANT_API_KEY", "qdrant-key"),
            ("VECTOR_INDEX_NAME", "ncai"),
            ("SECRET_KEY", "session-secret"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("GENERATION_API_KEY"));
    }

    #[test]
    fn rejects_zero_top_k_and_bad_numbers() {
        let mut vars = required();
        vars.push(("TOP_K", "0"));
        vars.push(("PORT", "http"));
        let msg = Settings::from_vars(vars).unwrap_err().to_string();
        assert!(msg.contains("TOP_K"));
        assert!(msg.contains("PORT"));
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let settings = Settings::from_vars(required()).unwrap();
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("google-key"));
        assert!(!debug.contains("qdrant-key"));
        assert!(!debug.contains("session-secret"));
    }
}
