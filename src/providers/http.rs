//! HTTP collaborators: an OpenAI-compatible endpoint for embeddings and chat
//! completions, and the continuity service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    ContinuityClient, Embedder, IngestAck, IngestRequest, ProviderError, RemoteContext,
    RemoteContextRequest, TextClassifier,
};
use crate::config::ProvidersConfig;
use crate::memory::EMBEDDING_DIM;

/// Longest response body echoed into an [`ProviderError::Http`].
const ERROR_BODY_CHARS: usize = 300;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

async fn post_json<B: Serialize>(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &B,
) -> Result<(u16, Vec<u8>), ProviderError> {
    let mut request = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(body)?);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let response = request.send().await?;
    let status = response.status();
    let bytes = response.bytes().await?;
    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes);
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body: text.chars().take(ERROR_BODY_CHARS).collect(),
        });
    }
    Ok((status.as_u16(), bytes.to_vec()))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProviderError> {
    Ok(serde_json::from_slice(body)?)
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Client for an OpenAI-compatible API; implements [`Embedder`] and [`TextClassifier`].
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    embedding_model: String,
    completion_model: String,
}

impl OpenAiClient {
    pub fn new(config: &ProvidersConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            embedding_model: config.embedding_model.clone(),
            completion_model: config.completion_model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
            dimensions: EMBEDDING_DIM,
        };
        let url = join_url(&self.base_url, "embeddings");
        let (_, body) = post_json(&self.client, &url, self.api_key.as_deref(), &request).await?;
        let response: EmbeddingResponse = decode(&body)?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::Malformed("no embedding in response".into()))
    }
}

#[async_trait]
impl TextClassifier for OpenAiClient {
    async fn complete(&self, prompt: &str, schema_hint: &str) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: &self.completion_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: schema_hint,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.2,
        };
        let url = join_url(&self.base_url, "chat/completions");
        let (_, body) = post_json(&self.client, &url, self.api_key.as_deref(), &request).await?;
        let response: ChatResponse = decode(&body)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Malformed("no completion choice".into()))
    }
}

/// Client for the continuity service (`POST {base}/ingest`, `POST {base}/context`).
pub struct HttpContinuityClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContinuityClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl ContinuityClient for HttpContinuityClient {
    async fn ingest(&self, request: &IngestRequest) -> Result<IngestAck, ProviderError> {
        let url = join_url(&self.base_url, "ingest");
        let (status, body) = post_json(&self.client, &url, None, request).await?;
        // Some deployments answer 202 with an empty body.
        let mut ack: IngestAck = if body.is_empty() {
            IngestAck::default()
        } else {
            decode(&body)?
        };
        ack.status = status;
        ack.accepted = true;
        Ok(ack)
    }

    async fn fetch_context(
        &self,
        request: &RemoteContextRequest,
    ) -> Result<Option<RemoteContext>, ProviderError> {
        let url = join_url(&self.base_url, "context");
        let (_, body) = post_json(&self.client, &url, None, request).await?;
        if body.is_empty() {
            return Ok(None);
        }
        decode(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://x/v1/", "/embeddings"), "http://x/v1/embeddings");
        assert_eq!(join_url("http://x/v1", "chat/completions"), "http://x/v1/chat/completions");
    }

    #[test]
    fn embedding_request_asks_for_store_dimension() {
        let body = serde_json::to_value(EmbeddingRequest {
            model: "m",
            input: "hi",
            dimensions: EMBEDDING_DIM,
        })
        .unwrap();
        assert_eq!(body["dimensions"], 384);
    }

    #[test]
    fn chat_response_tolerates_null_content() {
        let body = br#"{"choices":[{"message":{"content":null}}]}"#;
        let response: ChatResponse = decode(body).unwrap();
        assert!(response.choices[0].message.content.is_none());
    }

    #[test]
    fn null_context_decodes_to_none() {
        let ctx: Option<RemoteContext> = decode(b"null").unwrap();
        assert!(ctx.is_none());
    }
}
