//! Persisted conversation log.
//!
//! The judge window, session boundaries, continuity ingest ranges and the
//! rolling summary all read from here.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::clock::{format_ts, parse_ts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

pub fn record_message(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
    session_id: Option<&str>,
    role: Role,
    content: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    if content.trim().is_empty() {
        bail!("message content must not be empty");
    }
    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO messages (id, owner_id, persona_id, session_id, role, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, owner_id, persona_id, session_id, role.as_str(), content, format_ts(now)],
    )?;
    Ok(id)
}

/// User messages at or after `since`, newest first.
pub fn recent_user_messages(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
    since: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE owner_id = ?1 AND persona_id = ?2 AND role = 'user' AND created_at >= ?3 \
         ORDER BY created_at DESC, id DESC LIMIT ?4"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![owner_id, persona_id, format_ts(since), limit as i64],
            message_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn last_user_message_at(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn.query_row(
        "SELECT MAX(created_at) FROM messages WHERE owner_id = ?1 AND persona_id = ?2 AND role = 'user'",
        params![owner_id, persona_id],
        |row| row.get(0),
    )?;
    Ok(raw.as_deref().and_then(parse_ts))
}

/// Both roles of one session, chronological: rows tagged with `session_id`,
/// plus untagged rows between `from` and `to` inclusive.
pub fn session_transcript(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
    session_id: &str,
    from: &str,
    to: &str,
) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE owner_id = ?1 AND persona_id = ?2 \
           AND (session_id = ?3 OR (session_id IS NULL AND created_at >= ?4 AND created_at <= ?5)) \
         ORDER BY created_at ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![owner_id, persona_id, session_id, from, to], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The last `limit` messages of both roles, returned chronologically.
pub fn recent_messages(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
    limit: usize,
) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE owner_id = ?1 AND persona_id = ?2 \
         ORDER BY created_at DESC, id DESC LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(params![owner_id, persona_id, limit as i64], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.reverse();
    Ok(rows)
}
