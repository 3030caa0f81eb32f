//! Context assembly: the bounded payload injected into a turn's prompt.
//!
//! Two paths produce the same [`ContextPayload`] shape. The remote path asks
//! the continuity service; the local path computes everything from the store.
//! Remote failures of any kind fall back to local, and both pass through
//! [`ContextPayload::enforce_caps`].

pub mod remote;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::{ContextConfig, HearthConfig};
use crate::db::DbHandle;
use crate::loops::store::{pending_loops, recent_wins};
use crate::loops::{Loop, LoopKind};
use crate::memory::search::{foundation_memories, memories_sharing_refs, search_memories, ScoredMemory};
use crate::memory::types::{Memory, MemoryType};
use crate::memory::{normalize_content, truncate};
use crate::messages::Role;
use crate::providers::{embed_or_none, Embedder, Providers};
use crate::session::state::load_state;
use crate::session::summary::{latest_session_summary, SessionSummary};

/// Summary texts treated as empty.
const PLACEHOLDER_SUMMARIES: [&str; 7] = ["n/a", "none", "(none)", "no summary yet", "tbd", "...", "pending"];

// ── Public types ──────────────────────────────────────────────────────────────

/// One turn of the conversation the context is built for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
}

impl TranscriptEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextMemory {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
}

impl From<&Memory> for ContextMemory {
    fn from(m: &Memory) -> Self {
        Self {
            id: Some(m.id.clone()),
            memory_type: m.memory_type,
            content: m.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextPayload {
    pub foundation: Vec<ContextMemory>,
    pub relevant: Vec<ContextMemory>,
    pub entity_cards: Vec<String>,
    pub commitments: Vec<String>,
    pub threads: Vec<String>,
    pub frictions: Vec<String>,
    pub habits: Vec<String>,
    pub recent_wins: Vec<String>,
    pub rolling_summary: Option<String>,
    pub session_summary: Option<String>,
    pub session_start: bool,
    pub source: ContextSource,
}

// ── Transcript helpers ────────────────────────────────────────────────────────

/// The final user message, used as the retrieval query.
pub fn query_of(transcript: &[TranscriptEntry]) -> Option<&str> {
    transcript
        .iter()
        .rev()
        .find(|e| e.role == Role::User)
        .map(|e| e.content.trim())
        .filter(|q| !q.is_empty())
}

/// True when nothing precedes the final user message.
pub fn is_session_start(transcript: &[TranscriptEntry]) -> bool {
    match transcript.iter().rposition(|e| e.role == Role::User) {
        Some(idx) => idx == 0,
        None => transcript.is_empty(),
    }
}

// ── Cap enforcement ───────────────────────────────────────────────────────────

fn type_cap(memory_type: MemoryType, config: &ContextConfig) -> usize {
    match memory_type {
        MemoryType::Profile => config.profile_cap,
        MemoryType::People => config.people_cap,
        MemoryType::Project => config.project_cap,
    }
}

/// Drop memories already in `exclude` or with content seen earlier, then
/// apply per-type and overall caps. Input order is preserved.
pub fn cap_relevant(
    memories: impl IntoIterator<Item = ContextMemory>,
    exclude_ids: &HashSet<String>,
    exclude_contents: &HashSet<String>,
    config: &ContextConfig,
) -> Vec<ContextMemory> {
    let mut seen = exclude_contents.clone();
    let mut per_type: HashMap<MemoryType, usize> = HashMap::new();
    let mut out = Vec::new();
    for m in memories {
        if out.len() >= config.relevant_cap {
            break;
        }
        if m.id.as_ref().is_some_and(|id| exclude_ids.contains(id)) {
            continue;
        }
        if !seen.insert(normalize_content(&m.content)) {
            continue;
        }
        let count = per_type.entry(m.memory_type).or_default();
        if *count >= type_cap(m.memory_type, config) {
            continue;
        }
        *count += 1;
        out.push(m);
    }
    out
}

/// Dedupe by normalized content keeping the first (newest) occurrence, then cap.
pub fn cap_texts(texts: impl IntoIterator<Item = String>, cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    texts
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(normalize_content(t)))
        .take(cap)
        .collect()
}

pub fn is_placeholder(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    t.is_empty() || PLACEHOLDER_SUMMARIES.contains(&t.as_str())
}

/// Trim and cap a summary; `None` when empty or a placeholder.
pub fn clean_summary(text: Option<&str>, max_chars: usize) -> Option<String> {
    let text = text?.trim();
    if is_placeholder(text) {
        return None;
    }
    Some(truncate(text, max_chars))
}

/// `one_liner`, then `Open loops: a; b` when there are any.
pub fn render_session_summary(summary: &SessionSummary) -> String {
    let mut out = summary.one_liner.trim().to_string();
    if !summary.open_loops.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("Open loops: ");
        out.push_str(&summary.open_loops.join("; "));
    }
    out
}

impl ContextPayload {
    /// Re-apply every cap. Idempotent.
    pub fn enforce_caps(&mut self, config: &ContextConfig) {
        self.foundation.truncate(config.foundation_cap);
        let foundation_ids: HashSet<String> = self.foundation.iter().filter_map(|m| m.id.clone()).collect();
        let foundation_contents: HashSet<String> =
            self.foundation.iter().map(|m| normalize_content(&m.content)).collect();
        self.relevant = cap_relevant(
            std::mem::take(&mut self.relevant),
            &foundation_ids,
            &foundation_contents,
            config,
        );
        self.entity_cards = cap_texts(std::mem::take(&mut self.entity_cards), config.entity_card_cap);
        self.commitments = cap_texts(std::mem::take(&mut self.commitments), config.commitment_cap);
        self.threads = cap_texts(std::mem::take(&mut self.threads), config.thread_cap);
        self.frictions = cap_texts(std::mem::take(&mut self.frictions), config.friction_cap);
        self.habits = cap_texts(std::mem::take(&mut self.habits), config.habit_cap);
        self.recent_wins = cap_texts(std::mem::take(&mut self.recent_wins), config.commitment_cap);
        self.rolling_summary = clean_summary(self.rolling_summary.as_deref(), config.rolling_summary_chars);
        self.session_summary = clean_summary(self.session_summary.as_deref(), config.session_summary_chars);
    }

    pub fn is_empty(&self) -> bool {
        self.foundation.is_empty()
            && self.relevant.is_empty()
            && self.entity_cards.is_empty()
            && self.commitments.is_empty()
            && self.threads.is_empty()
            && self.frictions.is_empty()
            && self.habits.is_empty()
            && self.recent_wins.is_empty()
            && self.rolling_summary.is_none()
            && self.session_summary.is_none()
    }

    /// Prompt block. Entity cards precede the relevant memories; the last
    /// session's summary is only shown at session start.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut section = |title: &str, lines: Vec<&str>| {
            if lines.is_empty() {
                return;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("## ");
            out.push_str(title);
            out.push('\n');
            for line in lines {
                out.push_str("- ");
                out.push_str(line);
                out.push('\n');
            }
        };

        section("About the user", self.foundation.iter().map(|m| m.content.as_str()).collect());
        section(
            "Relevant memories",
            self.entity_cards
                .iter()
                .map(String::as_str)
                .chain(self.relevant.iter().map(|m| m.content.as_str()))
                .collect(),
        );
        section("Commitments", self.commitments.iter().map(String::as_str).collect());
        section("Open threads", self.threads.iter().map(String::as_str).collect());
        section("Frictions", self.frictions.iter().map(String::as_str).collect());
        section("Habits", self.habits.iter().map(String::as_str).collect());
        section("Recent wins", self.recent_wins.iter().map(String::as_str).collect());
        section("Conversation so far", self.rolling_summary.iter().map(String::as_str).collect());
        if self.session_start {
            section("Last session", self.session_summary.iter().map(String::as_str).collect());
        }
        out
    }
}

// ── Local path ────────────────────────────────────────────────────────────────

/// `[ref]: fact; fact; fact` cards for the refs of the relevant set, in the
/// order the refs were first seen.
pub fn build_entity_cards(refs: &[String], related: &[Memory], config: &ContextConfig) -> Vec<String> {
    refs.iter()
        .filter_map(|r| {
            let facts = cap_texts(
                related
                    .iter()
                    .filter(|m| m.metadata.entity_refs.contains(r))
                    .map(|m| m.content.clone()),
                config.facts_per_card,
            );
            (!facts.is_empty()).then(|| format!("[{r}]: {}", facts.join("; ")))
        })
        .take(config.entity_card_cap)
        .collect()
}

fn loop_texts(loops: &[Loop], kind: LoopKind) -> Vec<String> {
    loops
        .iter()
        .filter(|l| l.kind == kind)
        .map(|l| l.content.clone())
        .collect()
}

/// Everything the local path reads, in one connection call.
fn assemble_local(
    conn: &rusqlite::Connection,
    config: &HearthConfig,
    owner_id: &str,
    persona_id: &str,
    query_embedding: Option<&[f32]>,
    session_start: bool,
    now: DateTime<Utc>,
) -> Result<ContextPayload> {
    let cfg = &config.context;
    let foundation = foundation_memories(conn, owner_id, Some(persona_id), cfg.foundation_cap)?;
    let foundation_ids: HashSet<String> = foundation.iter().map(|m| m.id.clone()).collect();
    let foundation_contents: HashSet<String> =
        foundation.iter().map(|m| normalize_content(&m.content)).collect();

    let scored: Vec<ScoredMemory> = match query_embedding {
        Some(embedding) => search_memories(
            conn,
            owner_id,
            Some(persona_id),
            embedding,
            config.retrieval.candidate_k,
            &config.retrieval,
            now,
        )?,
        None => Vec::new(),
    };
    let by_id: HashMap<String, Memory> = scored.iter().map(|s| (s.memory.id.clone(), s.memory.clone())).collect();
    let relevant = cap_relevant(
        scored.iter().map(|s| ContextMemory::from(&s.memory)),
        &foundation_ids,
        &foundation_contents,
        cfg,
    );

    let mut refs: Vec<String> = Vec::new();
    for m in relevant.iter().filter_map(|m| m.id.as_ref().and_then(|id| by_id.get(id))) {
        for r in &m.metadata.entity_refs {
            if !refs.contains(r) {
                refs.push(r.clone());
            }
        }
    }
    let shown: HashSet<String> = foundation_ids
        .iter()
        .cloned()
        .chain(relevant.iter().filter_map(|m| m.id.clone()))
        .collect();
    let related = memories_sharing_refs(conn, owner_id, Some(persona_id), &refs, &shown)?;
    let entity_cards = build_entity_cards(&refs, &related, cfg);

    let pending = pending_loops(conn, owner_id, persona_id, None)?;
    let wins = recent_wins(conn, owner_id, persona_id, now - Duration::hours(cfg.wins_window_hours))?;
    let state = load_state(conn, owner_id, persona_id)?;
    let session_summary = latest_session_summary(conn, owner_id, persona_id)?
        .map(|s| render_session_summary(&s.summary));

    let mut payload = ContextPayload {
        foundation: foundation.iter().map(ContextMemory::from).collect(),
        relevant,
        entity_cards,
        commitments: loop_texts(&pending, LoopKind::Commitment),
        threads: loop_texts(&pending, LoopKind::Thread),
        frictions: loop_texts(&pending, LoopKind::Friction),
        habits: loop_texts(&pending, LoopKind::Habit),
        recent_wins: wins.into_iter().map(|l| l.content).collect(),
        rolling_summary: state.rolling_summary,
        session_summary,
        session_start,
        source: ContextSource::Local,
    };
    payload.enforce_caps(cfg);
    Ok(payload)
}

/// Compute the payload from the local store. A missing embedding only
/// empties the relevant block.
pub async fn build_local_context(
    db: &DbHandle,
    embedder: Option<&Arc<dyn Embedder>>,
    config: &Arc<HearthConfig>,
    owner_id: &str,
    persona_id: &str,
    transcript: &[TranscriptEntry],
    now: DateTime<Utc>,
) -> Result<ContextPayload> {
    let session_start = is_session_start(transcript);
    let embedding = match query_of(transcript) {
        Some(query) => embed_or_none(embedder, query, config.providers.embed_timeout()).await,
        None => None,
    };
    let config = Arc::clone(config);
    let (owner, persona) = (owner_id.to_string(), persona_id.to_string());
    db.call(move |conn| {
        assemble_local(
            conn,
            &config,
            &owner,
            &persona,
            embedding.as_deref(),
            session_start,
            now,
        )
    })
    .await
}

/// Remote first when enabled, local otherwise or on any remote failure.
pub async fn build_context(
    db: &DbHandle,
    providers: &Providers,
    config: &Arc<HearthConfig>,
    owner_id: &str,
    persona_id: &str,
    transcript: &[TranscriptEntry],
    now: DateTime<Utc>,
) -> Result<ContextPayload> {
    if config.context.remote_enabled {
        if let Some(client) = providers.continuity.as_ref() {
            match remote::fetch_remote_context(client, config, owner_id, persona_id, transcript).await {
                Ok(Some(payload)) => return Ok(payload),
                Ok(None) => {
                    tracing::debug!(owner = owner_id, persona = persona_id, "remote context empty, using local")
                }
                Err(e) => {
                    tracing::warn!(owner = owner_id, persona = persona_id, error = %e, "remote context failed, using local")
                }
            }
        }
    }
    build_local_context(
        db,
        providers.embedder.as_ref(),
        config,
        owner_id,
        persona_id,
        transcript,
        now,
    )
    .await
}
