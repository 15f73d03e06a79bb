//! Client for the language-model provider: embeddings, moderation, and
//! chat completions over an OpenAI-shaped HTTP API.
//!
//! The same client (and therefore the same embedding model) is used at
//! ingestion time and at query time, which keeps ingestion and retrieval
//! in one embedding space. Rate limits, 5xx responses, and transport
//! failures are reported as transient; malformed requests are fatal.

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;
use crate::types::PipelineError;

/// Result of embedding one input text.
#[derive(Clone, Debug)]
pub struct EmbeddingOutput {
    pub vector: Vec<f32>,
    pub token_count: u32,
    pub model: String,
}

/// Result of embedding a batch; token usage is only reported per request
/// by the provider, so the batch keeps the aggregate.
#[derive(Clone, Debug)]
pub struct BatchEmbeddingOutput {
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: u32,
    pub model: String,
}

/// Parameters for one chat completion call.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Clone)]
pub struct ModelClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    embedding_model: String,
    chat_model: String,
}

impl ModelClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            embedding_model: "text-embedding-ada-002".to_string(),
            chat_model: "gpt-3.5-turbo".to_string(),
        }
    }

    #[must_use]
    pub fn with_models(
        mut self,
        embedding_model: impl Into<String>,
        chat_model: impl Into<String>,
    ) -> Self {
        self.embedding_model = embedding_model.into();
        self.chat_model = chat_model.into();
        self
    }

    /// Embeds a single text, returning its vector, token usage, and the
    /// model that produced it. Newlines are collapsed to spaces first;
    /// embedding models score whitespace-heavy input poorly.
    pub async fn embed(&self, text: &str) -> Result<EmbeddingOutput, PipelineError> {
        let input = vec![normalize_for_embedding(text)];
        let response = self.request_embeddings(&input).await?;
        let vector = response
            .data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .ok_or_else(|| PipelineError::Provider {
                message: "embedding response contained no vectors".into(),
                transient: false,
            })?;
        Ok(EmbeddingOutput {
            vector,
            token_count: response.usage.total_tokens,
            model: response.model,
        })
    }

    /// Embeds several texts in one request; results come back in input
    /// order. Purely an optimization over repeated [`embed`](Self::embed)
    /// calls — identical text yields identical vectors either way.
    pub async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<BatchEmbeddingOutput, PipelineError> {
        let input: Vec<String> = texts
            .iter()
            .map(|text| normalize_for_embedding(text))
            .collect();
        let response = self.request_embeddings(&input).await?;
        if response.data.len() != texts.len() {
            return Err(PipelineError::Provider {
                message: format!(
                    "embedding response returned {} vectors for {} inputs",
                    response.data.len(),
                    texts.len()
                ),
                transient: false,
            });
        }
        let mut data = response.data;
        data.sort_by_key(|datum| datum.index);
        Ok(BatchEmbeddingOutput {
            vectors: data.into_iter().map(|datum| datum.embedding).collect(),
            total_tokens: response.usage.total_tokens,
            model: response.model,
        })
    }

    async fn request_embeddings(
        &self,
        input: &[String],
    ) -> Result<EmbeddingsResponse, PipelineError> {
        let response = self
            .http
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsBody {
                model: &self.embedding_model,
                input,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response.json().await.map_err(decode_error)
    }

    /// Submits text to the moderation endpoint; returns whether it was
    /// flagged as policy-violating.
    pub async fn moderate(&self, input: &str) -> Result<bool, PipelineError> {
        let response = self
            .http
            .post(format!("{}/v1/moderations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ModerationBody { input })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let body: ModerationResponse = response.json().await.map_err(decode_error)?;
        Ok(body.results.first().is_some_and(|result| result.flagged))
    }

    /// Runs a chat completion and returns the full assistant message.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, PipelineError> {
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&CompletionBody {
                model: &self.chat_model,
                messages: &request.messages,
                temperature: request.temperature,
                max_tokens: request.max_tokens,
                stream: false,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let body: CompletionResponse = response.json().await.map_err(decode_error)?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .ok_or_else(|| PipelineError::Provider {
                message: "completion response contained no choices".into(),
                transient: false,
            })
    }

    /// Runs a chat completion in streaming mode, yielding assistant text
    /// deltas as they arrive.
    ///
    /// Dropping the stream cancels generation: the underlying connection
    /// is released without treating the disconnect as an error.
    pub async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<impl Stream<Item = Result<String, PipelineError>> + Send + 'static, PipelineError>
    {
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&CompletionBody {
                model: &self.chat_model,
                messages: &request.messages,
                temperature: request.temperature,
                max_tokens: request.max_tokens,
                stream: true,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let mut bytes = response.bytes_stream();

        Ok(try_stream! {
            let mut buffer = String::new();
            let mut done = false;
            while !done {
                let Some(chunk) = bytes.next().await else {
                    break;
                };
                let chunk = chunk.map_err(transport_error)?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        done = true;
                        break;
                    }
                    let frame: StreamFrame =
                        serde_json::from_str(data).map_err(|err| PipelineError::Provider {
                            message: format!("bad stream frame: {err}"),
                            transient: false,
                        })?;
                    let delta = frame
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content);
                    if let Some(delta) = delta {
                        if !delta.is_empty() {
                            yield delta;
                        }
                    }
                }
            }
        })
    }
}

/// Collapses internal line breaks to spaces before embedding.
fn normalize_for_embedding(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

fn transport_error(err: reqwest::Error) -> PipelineError {
    PipelineError::Provider {
        message: err.to_string(),
        transient: true,
    }
}

fn decode_error(err: reqwest::Error) -> PipelineError {
    PipelineError::Provider {
        message: format!("bad provider response: {err}"),
        transient: false,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PipelineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let transient = status.as_u16() == 429 || status.is_server_error();
    let body = response.text().await.unwrap_or_default();
    Err(PipelineError::Provider {
        message: format!("{status}: {body}"),
        transient,
    })
}

#[derive(Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
    model: String,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Default, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Serialize)]
struct ModerationBody<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Deserialize)]
struct ModerationResult {
    flagged: bool,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Deserialize)]
struct StreamFrame {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
