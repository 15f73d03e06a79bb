//! Environment-driven settings.
//!
//! Everything is read once at startup; `.env` files are honored via
//! `dotenvy`. Only the provider API key is required — every other value
//! has a default that matches the pipeline's reference deployment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::chat::ChatOptions;
use crate::types::PipelineError;

#[derive(Clone, Debug)]
pub struct Settings {
    /// Base URL of the OpenAI-compatible provider.
    pub provider_base_url: String,
    pub provider_api_key: String,
    pub embedding_model: String,
    pub chat_model: String,
    /// Fixed system-wide embedding dimensionality; must match the vector
    /// store's configuration.
    pub embedding_dimension: usize,
    pub database_path: PathBuf,
    pub bind_address: SocketAddr,
    pub similarity_threshold: f32,
    pub max_matches: usize,
    pub context_token_budget: usize,
    pub completion_max_tokens: u32,
    pub temperature: f32,
    /// Concurrent embedding calls per training run.
    pub embed_concurrency: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self, PipelineError> {
        dotenvy::dotenv().ok();

        let provider_api_key = std::env::var("PAGESMITH_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                PipelineError::Config(
                    "PAGESMITH_API_KEY (or OPENAI_API_KEY) must be set".into(),
                )
            })?;

        Ok(Self {
            provider_base_url: env_or("PAGESMITH_PROVIDER_URL", "https://api.openai.com"),
            provider_api_key,
            embedding_model: env_or("PAGESMITH_EMBEDDING_MODEL", "text-embedding-ada-002"),
            chat_model: env_or("PAGESMITH_CHAT_MODEL", "gpt-3.5-turbo"),
            embedding_dimension: parse_env("PAGESMITH_EMBEDDING_DIM", 1536)?,
            database_path: PathBuf::from(env_or("PAGESMITH_DB", "pagesmith.db")),
            bind_address: parse_env(
                "PAGESMITH_BIND",
                "127.0.0.1:8080"
                    .parse()
                    .map_err(|err| PipelineError::Config(format!("{err}")))?,
            )?,
            similarity_threshold: parse_env("PAGESMITH_SIMILARITY_THRESHOLD", 0.78)?,
            max_matches: parse_env("PAGESMITH_MAX_MATCHES", 8)?,
            context_token_budget: parse_env("PAGESMITH_CONTEXT_BUDGET", 1200)?,
            completion_max_tokens: parse_env("PAGESMITH_COMPLETION_MAX_TOKENS", 512)?,
            temperature: parse_env("PAGESMITH_TEMPERATURE", 0.1)?,
            embed_concurrency: parse_env("PAGESMITH_EMBED_CONCURRENCY", 8)?,
        })
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            similarity_threshold: self.similarity_threshold,
            max_matches: self.max_matches,
            context_token_budget: self.context_token_budget,
            completion_max_tokens: self.completion_max_tokens,
            temperature: self.temperature,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T, PipelineError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|err| PipelineError::Config(format!("{key}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_unset_values() {
        // Parse helpers fall back when the variable is absent.
        let threshold: f32 = parse_env("PAGESMITH_TEST_UNSET_THRESHOLD", 0.78).unwrap();
        assert!((threshold - 0.78).abs() < f32::EPSILON);
        assert_eq!(env_or("PAGESMITH_TEST_UNSET_MODEL", "fallback"), "fallback");
    }

    #[test]
    fn bad_values_are_config_errors() {
        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe { std::env::set_var("PAGESMITH_TEST_BAD_DIM", "not-a-number") };
        let err = parse_env::<usize>("PAGESMITH_TEST_BAD_DIM", 1536).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        unsafe { std::env::remove_var("PAGESMITH_TEST_BAD_DIM") };
    }
}
