#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearth::config::HearthConfig;
use hearth::memory::store::{attach_embedding, store_memory};
use hearth::memory::types::{MemoryInput, MemoryType};
use hearth::memory::EMBEDDING_DIM;
use hearth::providers::{
    ContinuityClient, Embedder, IngestAck, IngestRequest, ProviderError, RemoteContext,
    RemoteContextRequest, TextClassifier,
};
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    hearth::db::open_memory_database().unwrap()
}

/// Deterministic 384-dim embedding with a spike at position `seed`.
pub fn test_embedding(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[seed % EMBEDDING_DIM] = 1.0;
    v
}

/// Bag-of-words vector: every word lands in one bucket. Texts sharing words
/// end up close under cosine distance.
pub fn word_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let bucket = word
            .to_lowercase()
            .bytes()
            .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        v[bucket % EMBEDDING_DIM] += 1.0;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    } else {
        v[0] = 1.0;
    }
    v
}

/// Config with short timeouts so failing collaborators resolve quickly.
pub fn test_config() -> HearthConfig {
    let mut config = HearthConfig::default();
    config.providers.embed_timeout_ms = 200;
    config.providers.classify_timeout_ms = 500;
    config.providers.completion_timeout_ms = 500;
    config.providers.ingest_timeout_ms = 500;
    config.providers.remote_context_timeout_ms = 200;
    config.extraction.rolling_timeout_ms = 500;
    config.tasks.task_timeout_secs = 10;
    config
}

pub fn input(source: &str, refs: &[&str], importance: Option<u8>) -> MemoryInput {
    MemoryInput {
        source: source.to_string(),
        entity_refs: refs.iter().map(|r| r.to_string()).collect(),
        importance,
        ..Default::default()
    }
}

/// Store an extracted memory and attach `embedding`. Returns the memory id.
pub fn insert_embedded(
    conn: &mut Connection,
    owner: &str,
    memory_type: MemoryType,
    content: &str,
    refs: &[&str],
    embedding: &[f32],
    at: DateTime<Utc>,
) -> String {
    let id = store_memory(conn, owner, memory_type, content, &input("extraction", refs, Some(2)), None, at)
        .unwrap()
        .id;
    attach_embedding(conn, &id, embedding).unwrap();
    id
}

pub fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

// ── Collaborator doubles ──────────────────────────────────────────────────────

/// Embeds with [`word_embedding`].
pub struct WordEmbedder;

#[async_trait]
impl Embedder for WordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(word_embedding(text))
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Http {
            status: 503,
            body: "overloaded".into(),
        })
    }
}

/// Never answers inside any sane deadline.
pub struct SlowEmbedder(pub Duration);

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        tokio::time::sleep(self.0).await;
        Ok(test_embedding(1))
    }
}

/// Replies from a queue, one per call, and records every schema hint it was
/// called with. An empty queue answers `Unavailable`.
#[derive(Default)]
pub struct ScriptedClassifier {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    pub hints: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedClassifier {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.hints.lock().unwrap().len()
    }
}

#[async_trait]
impl TextClassifier for ScriptedClassifier {
    async fn complete(&self, _prompt: &str, schema_hint: &str) -> Result<String, ProviderError> {
        self.hints.lock().unwrap().push(schema_hint.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ProviderError::Unavailable("script exhausted".into())))
    }
}

/// Records ingest requests; serves `context` (or an error when `fail` is set).
#[derive(Default)]
pub struct RecordingContinuity {
    pub ingested: Mutex<Vec<IngestRequest>>,
    pub context_requests: Mutex<Vec<RemoteContextRequest>>,
    pub context: Option<RemoteContext>,
    pub fail: bool,
}

#[async_trait]
impl ContinuityClient for RecordingContinuity {
    async fn ingest(&self, request: &IngestRequest) -> Result<IngestAck, ProviderError> {
        if self.fail {
            return Err(ProviderError::Http {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        self.ingested.lock().unwrap().push(request.clone());
        Ok(IngestAck {
            status: 202,
            accepted: true,
        })
    }

    async fn fetch_context(
        &self,
        request: &RemoteContextRequest,
    ) -> Result<Option<RemoteContext>, ProviderError> {
        self.context_requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(ProviderError::Transport("connection refused".into()));
        }
        Ok(self.context.clone())
    }
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
