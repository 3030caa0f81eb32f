//! Structured once-per-session summaries generated at session close.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::lifecycle::{session_messages, Session};
use super::state::update_state;
use crate::clock::format_ts;
use crate::config::{HearthConfig, SessionConfig};
use crate::db::DbHandle;
use crate::memory::truncate;
use crate::messages::{Message, Role};
use crate::providers::{extract_json, with_timeout, TextClassifier};

pub const SUMMARY_SCHEMA_HINT: &str = "You summarize one conversation session between a user and a companion. \
Reply with a single JSON object and nothing else: \
{\"one_liner\": string, \"what_mattered\": [string], \"open_loops\": [string], \
\"commitments\": [string], \"people\": [string], \"tone\": string}. \
Keep every list to at most 5 short items. Only include what the user actually said.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSummary {
    pub one_liner: String,
    pub what_mattered: Vec<String>,
    pub open_loops: Vec<String>,
    pub commitments: Vec<String>,
    pub people: Vec<String>,
    pub tone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryMetadata {
    pub parse_error: bool,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredSummary {
    pub session_id: String,
    pub summary: SessionSummary,
    pub metadata: SummaryMetadata,
    pub created_at: String,
}

fn clean_list(value: Option<&serde_json::Value>, config: &SessionConfig) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .take(config.summary_list_cap)
                .map(|s| truncate(s, config.summary_item_chars))
                .collect()
        })
        .unwrap_or_default()
}

/// Parse and cap a model reply. `None` when no JSON object with a non-empty
/// `one_liner` can be recovered.
pub fn parse_summary(raw: &str, config: &SessionConfig) -> Option<SessionSummary> {
    let value = extract_json(raw)?;
    let obj = value.as_object()?;
    let one_liner = obj.get("one_liner")?.as_str()?.trim();
    if one_liner.is_empty() {
        return None;
    }
    Some(SessionSummary {
        one_liner: truncate(one_liner, config.one_liner_chars),
        what_mattered: clean_list(obj.get("what_mattered"), config),
        open_loops: clean_list(obj.get("open_loops"), config),
        commitments: clean_list(obj.get("commitments"), config),
        people: clean_list(obj.get("people"), config),
        tone: obj
            .get("tone")
            .and_then(|t| t.as_str())
            .map(|t| truncate(t.trim(), config.summary_item_chars))
            .unwrap_or_default(),
    })
}

/// Plain one-liner used when the model call or its JSON fails: the first
/// sentence of the raw reply if there was one, else the first user message.
pub fn fallback_summary(raw: Option<&str>, messages: &[Message], config: &SessionConfig) -> SessionSummary {
    let from_raw = raw
        .map(|r| r.trim())
        .filter(|r| !r.is_empty() && !r.starts_with('{'))
        .map(|r| {
            let end = r.find(['.', '!', '?', '\n']).map(|i| i + 1).unwrap_or(r.len());
            r[..end].trim().to_string()
        })
        .filter(|s| !s.is_empty());

    let one_liner = from_raw.unwrap_or_else(|| {
        let first = messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.trim())
            .unwrap_or("nothing in particular");
        format!("Talked about: {first}")
    });

    SessionSummary {
        one_liner: truncate(&one_liner, config.one_liner_chars),
        ..Default::default()
    }
}

pub fn build_summary_prompt(messages: &[Message]) -> String {
    let mut prompt = String::from("Conversation transcript:\n");
    for m in messages {
        prompt.push_str(m.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(m.content.trim());
        prompt.push('\n');
    }
    prompt
}

/// Insert or replace the summary for a session; never creates a second row.
pub fn upsert_session_summary(
    conn: &Connection,
    session: &Session,
    summary: &SessionSummary,
    metadata: &SummaryMetadata,
    now: DateTime<Utc>,
) -> Result<()> {
    let now_str = format_ts(now);
    conn.execute(
        "INSERT INTO session_summaries (session_id, owner_id, persona_id, summary, metadata, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
         ON CONFLICT(session_id) DO UPDATE SET \
           summary = excluded.summary, metadata = excluded.metadata, updated_at = excluded.updated_at",
        params![
            session.id,
            session.owner_id,
            session.persona_id,
            serde_json::to_string(summary)?,
            serde_json::to_string(metadata)?,
            now_str,
        ],
    )?;
    Ok(())
}

pub fn get_session_summary(conn: &Connection, session_id: &str) -> Result<Option<StoredSummary>> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT session_id, summary, metadata, created_at FROM session_summaries WHERE session_id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    row.map(decode_stored).transpose()
}

pub fn latest_session_summary(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
) -> Result<Option<StoredSummary>> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT session_id, summary, metadata, created_at FROM session_summaries \
             WHERE owner_id = ?1 AND persona_id = ?2 ORDER BY created_at DESC LIMIT 1",
            params![owner_id, persona_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    row.map(decode_stored).transpose()
}

fn decode_stored((session_id, summary, metadata, created_at): (String, String, String, String)) -> Result<StoredSummary> {
    Ok(StoredSummary {
        session_id,
        summary: serde_json::from_str(&summary)?,
        metadata: serde_json::from_str(&metadata)?,
        created_at,
    })
}

/// Generate and store the summary for a closed session. Completion failures
/// fall back to a one-liner with `parse_error = true`; only storage errors
/// are returned.
pub async fn summarize_session(
    db: DbHandle,
    classifier: Option<Arc<dyn TextClassifier>>,
    config: Arc<HearthConfig>,
    session: Session,
) -> Result<()> {
    let messages = {
        let session = session.clone();
        db.call(move |conn| session_messages(conn, &session)).await?
    };

    let raw = match classifier {
        Some(classifier) if !messages.is_empty() => {
            let prompt = build_summary_prompt(&messages);
            match with_timeout(
                config.providers.completion_timeout(),
                classifier.complete(&prompt, SUMMARY_SCHEMA_HINT),
            )
            .await
            {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "session summary completion failed");
                    None
                }
            }
        }
        _ => None,
    };

    let parsed = raw.as_deref().and_then(|r| parse_summary(r, &config.session));
    let parse_error = parsed.is_none();
    let summary =
        parsed.unwrap_or_else(|| fallback_summary(raw.as_deref(), &messages, &config.session));
    let metadata = SummaryMetadata {
        parse_error,
        model: raw.as_ref().map(|_| config.providers.completion_model.clone()),
    };

    db.call(move |conn| {
        let now = crate::clock::now();
        upsert_session_summary(conn, &session, &summary, &metadata, now)?;
        update_state(conn, &session.owner_id, &session.persona_id, now, |s| {
            let log = &mut s.state.diagnostics.session_summary;
            log.attempt(now);
            if parse_error {
                log.failure(now, "summary fell back to a plain one-liner");
            } else {
                log.success(now);
            }
        })?;
        tracing::info!(session_id = %session.id, parse_error, "session summary stored");
        Ok(())
    })
    .await
}
