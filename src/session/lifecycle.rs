//! Session state machine: Active (no `ended_at`) → Closed.
//!
//! A session closes once the last user activity is older than the active
//! window. The closing timestamp is that last activity, not the wall clock,
//! so idle gaps never count toward session length.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::clock::{format_ts, parse_ts};
use crate::messages::{last_user_message_at, session_transcript, Message};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub persona_id: String,
    pub started_at: String,
    pub last_activity_at: String,
    pub ended_at: Option<String>,
    pub turn_count: u32,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Result of [`ensure_active_session`].
#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    pub session: Session,
    pub created: bool,
    /// A stale session closed on the way in; its side effects are the caller's.
    pub closed: Option<Session>,
}

const SESSION_COLUMNS: &str =
    "id, owner_id, persona_id, started_at, last_activity_at, ended_at, turn_count";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        persona_id: row.get(2)?,
        started_at: row.get(3)?,
        last_activity_at: row.get(4)?,
        ended_at: row.get(5)?,
        turn_count: row.get(6)?,
    })
}

pub fn open_session(conn: &Connection, owner_id: &str, persona_id: &str) -> Result<Option<Session>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE owner_id = ?1 AND persona_id = ?2 AND ended_at IS NULL"
    );
    Ok(conn
        .query_row(&sql, params![owner_id, persona_id], session_from_row)
        .optional()?)
}

pub fn get_session(conn: &Connection, id: &str) -> Result<Option<Session>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], session_from_row).optional()?)
}

/// Latest user activity for the pair: the later of the last logged user
/// message and the open session's `last_activity_at`.
pub fn last_user_activity(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
    open: Option<&Session>,
) -> Result<Option<DateTime<Utc>>> {
    let from_log = last_user_message_at(conn, owner_id, persona_id)?;
    let from_session = open.and_then(|s| parse_ts(&s.last_activity_at));
    Ok(from_log.max(from_session))
}

/// Close the open session if its last user activity predates `now - active_window`.
pub fn close_stale_session_if_any(
    conn: &mut Connection,
    owner_id: &str,
    persona_id: &str,
    active_window: Duration,
    now: DateTime<Utc>,
) -> Result<Option<Session>> {
    let tx = conn.transaction()?;
    let Some(open) = open_session(&tx, owner_id, persona_id)? else {
        return Ok(None);
    };
    let Some(last) = last_user_activity(&tx, owner_id, persona_id, Some(&open))? else {
        return Ok(None);
    };
    if now - last < active_window {
        return Ok(None);
    }

    let started = parse_ts(&open.started_at).unwrap_or(last);
    let ended_at = format_ts(last.max(started));
    tx.execute(
        "UPDATE sessions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
        params![ended_at, open.id],
    )?;
    tx.commit()?;

    tracing::info!(
        owner = owner_id,
        persona = persona_id,
        session_id = %open.id,
        turns = open.turn_count,
        ended_at = %ended_at,
        "session closed"
    );
    Ok(Some(Session {
        ended_at: Some(ended_at),
        ..open
    }))
}

/// Close any stale session, then reuse the open one (bumping activity and
/// turn count) or start a new one.
pub fn ensure_active_session(
    conn: &mut Connection,
    owner_id: &str,
    persona_id: &str,
    active_window: Duration,
    now: DateTime<Utc>,
) -> Result<EnsureOutcome> {
    let closed = close_stale_session_if_any(conn, owner_id, persona_id, active_window, now)?;
    let now_str = format_ts(now);

    let tx = conn.transaction()?;
    let mut created = false;
    if open_session(&tx, owner_id, persona_id)?.is_none() {
        let id = uuid::Uuid::now_v7().to_string();
        // The partial unique index turns a concurrent creator into a no-op here.
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO sessions (id, owner_id, persona_id, started_at, last_activity_at, turn_count) \
             VALUES (?1, ?2, ?3, ?4, ?4, 1)",
            params![id, owner_id, persona_id, now_str],
        )?;
        created = inserted == 1;
    }
    if !created {
        tx.execute(
            "UPDATE sessions SET last_activity_at = ?1, turn_count = turn_count + 1 \
             WHERE owner_id = ?2 AND persona_id = ?3 AND ended_at IS NULL",
            params![now_str, owner_id, persona_id],
        )?;
    }
    let session = open_session(&tx, owner_id, persona_id)?
        .ok_or_else(|| anyhow::anyhow!("no open session after ensure for {owner_id}/{persona_id}"))?;
    tx.commit()?;

    if created {
        tracing::info!(owner = owner_id, persona = persona_id, session_id = %session.id, "session started");
    }
    Ok(EnsureOutcome {
        session,
        created,
        closed,
    })
}

/// Close every stale session in the store. Returns the sessions closed.
pub fn close_all_stale_sessions(
    conn: &mut Connection,
    active_window: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<Session>> {
    let pairs: Vec<(String, String)> = {
        let mut stmt = conn.prepare("SELECT owner_id, persona_id FROM sessions WHERE ended_at IS NULL")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut closed = Vec::new();
    for (owner_id, persona_id) in pairs {
        if let Some(session) = close_stale_session_if_any(conn, &owner_id, &persona_id, active_window, now)? {
            closed.push(session);
        }
    }
    Ok(closed)
}

/// Messages of both roles belonging to the session. Replies logged after the
/// last user turn are included.
pub fn session_messages(conn: &Connection, session: &Session) -> Result<Vec<Message>> {
    let end = session
        .ended_at
        .clone()
        .unwrap_or_else(|| format_ts(crate::clock::now()));
    session_transcript(
        conn,
        &session.owner_id,
        &session.persona_id,
        &session.id,
        &session.started_at,
        &end,
    )
}
