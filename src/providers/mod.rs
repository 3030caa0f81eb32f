//! External collaborators: embedding, completion/classification and the
//! continuity service.
//!
//! Every collaborator sits behind an `async_trait` so the engine can run
//! against scripted doubles in tests. Calls are always wrapped in
//! [`with_timeout`]; callers degrade to an empty/`None` default on any
//! [`ProviderError`].

pub mod http;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::ProvidersConfig;
use crate::messages::Message;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Malformed(e.to_string())
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

#[async_trait]
pub trait TextClassifier: Send + Sync {
    /// Free-form completion. `schema_hint` is a system instruction describing
    /// the expected output; the result may still be malformed.
    async fn complete(&self, prompt: &str, schema_hint: &str) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait ContinuityClient: Send + Sync {
    async fn ingest(&self, request: &IngestRequest) -> Result<IngestAck, ProviderError>;

    /// `Ok(None)` when the service has nothing for this pair.
    async fn fetch_context(
        &self,
        request: &RemoteContextRequest,
    ) -> Result<Option<RemoteContext>, ProviderError>;
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestWindow {
    pub started_at: String,
    pub ended_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub session_id: String,
    pub owner_id: String,
    pub persona_id: String,
    pub messages: Vec<Message>,
    pub window: IngestWindow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestAck {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteContextRequest {
    pub owner_id: String,
    pub persona_id: String,
    pub query: Option<String>,
    pub session_start: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteMemory {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: String,
    pub content: String,
}

/// Context as returned by the continuity service. Every field is optional on
/// the wire; the assembler re-applies local caps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteContext {
    pub foundation: Vec<RemoteMemory>,
    pub relevant: Vec<RemoteMemory>,
    pub entity_cards: Vec<String>,
    pub commitments: Vec<String>,
    pub threads: Vec<String>,
    pub frictions: Vec<String>,
    pub habits: Vec<String>,
    pub recent_wins: Vec<String>,
    pub rolling_summary: Option<String>,
    pub session_summary: Option<String>,
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// The collaborators available to the engine. Absent ones degrade exactly like
/// a failing one.
#[derive(Clone, Default)]
pub struct Providers {
    pub embedder: Option<Arc<dyn Embedder>>,
    pub classifier: Option<Arc<dyn TextClassifier>>,
    pub continuity: Option<Arc<dyn ContinuityClient>>,
}

impl Providers {
    /// HTTP implementations for whatever the config names.
    pub fn from_config(config: &ProvidersConfig) -> anyhow::Result<Self> {
        let openai = Arc::new(http::OpenAiClient::new(config)?);
        let continuity = match config.continuity_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                let client: Arc<dyn ContinuityClient> = Arc::new(http::HttpContinuityClient::new(url)?);
                Some(client)
            }
            _ => None,
        };
        Ok(Self {
            embedder: Some(openai.clone()),
            classifier: Some(openai),
            continuity,
        })
    }
}

/// Race `fut` against `limit`, mapping an elapsed deadline to [`ProviderError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit)),
    }
}

/// Embed with a deadline; `None` on any failure.
pub async fn embed_or_none(embedder: Option<&Arc<dyn Embedder>>, text: &str, limit: Duration) -> Option<Vec<f32>> {
    let embedder = embedder?;
    match with_timeout(limit, embedder.embed(text)).await {
        Ok(v) if !v.is_empty() => Some(v),
        Ok(_) => {
            tracing::warn!("embedding provider returned an empty vector");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "embedding unavailable");
            None
        }
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```[a-zA-Z]*").expect("valid fence regex"))
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid trailing comma regex"))
}

/// Best-effort repair of model output into a JSON object: strip code fences,
/// take the outermost `{…}` span, drop trailing commas.
pub fn extract_json(raw: &str) -> Option<serde_json::Value> {
    let stripped = fence_re().replace_all(raw, "");
    let text = stripped.trim();
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str::<serde_json::Value>(text) {
        return Some(value);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let span = &text[start..=end];
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(span) {
        return Some(value);
    }
    let repaired = trailing_comma_re().replace_all(span, "$1");
    serde_json::from_str(&repaired).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_plain_object() {
        assert_eq!(extract_json(r#"{"a":1}"#), Some(json!({"a": 1})));
    }

    #[test]
    fn extract_from_fenced_and_chatty_output() {
        let raw = "Sure! Here you go:\n```json\n{\"memories\": [], \"loops\": [],}\n```\nAnything else?";
        assert_eq!(extract_json(raw), Some(json!({"memories": [], "loops": []})));
    }

    #[test]
    fn extract_gives_up_on_garbage() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("} backwards {").is_none());
        assert!(extract_json("{\"a\": [1, 2}").is_none());
    }

    #[tokio::test]
    async fn timeout_maps_to_provider_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ProviderError>(1)
        };
        let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));

        let fast = async { Ok::<_, ProviderError>(2) };
        assert_eq!(with_timeout(Duration::from_secs(1), fast).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn embed_or_none_without_provider() {
        assert!(embed_or_none(None, "hi", Duration::from_millis(10)).await.is_none());
    }
}
