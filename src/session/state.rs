//! Per `(owner, persona)` mutable state: the rolling summary plus a typed bag
//! of counters, scheduling timestamps and diagnostics.
//!
//! The bag is cross-turn memory for the background subsystems. It is never a
//! system of record for facts or loops. Keys this build does not know about
//! are preserved through `extra`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::format_ts;
use crate::tasks::TaskFailure;

/// Background failures kept in diagnostics, newest last.
pub const MAX_BACKGROUND_FAILURES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorState {
    pub last_run_at: Option<String>,
    pub last_memory_count_at_run: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptLog {
    pub last_attempt_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// No retry before this timestamp. Cleared on success.
    pub retry_after: Option<String>,
}

impl AttemptLog {
    pub fn attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt_at = Some(format_ts(now));
    }

    pub fn success(&mut self, now: DateTime<Utc>) {
        self.last_success_at = Some(format_ts(now));
        self.consecutive_failures = 0;
        self.retry_after = None;
    }

    pub fn failure(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.last_error_at = Some(format_ts(now));
        self.last_error = Some(error.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Push the next retry out by `base` doubled per consecutive failure,
    /// capped at `max`.
    pub fn back_off(&mut self, now: DateTime<Utc>, base: Duration, max: Duration) {
        let doublings = self.consecutive_failures.saturating_sub(1).min(16);
        let delay = base.saturating_mul(1u32 << doublings).min(max);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        self.retry_after = Some(format_ts(now.checked_add_signed(delay).unwrap_or(now)));
    }

    pub fn backing_off(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.as_deref().is_some_and(|until| format_ts(now).as_str() < until)
    }
}

/// Outcome of one continuity ingest call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestTrace {
    pub session_id: String,
    pub status: Option<u16>,
    pub ms: u64,
    pub ok: bool,
    pub error: Option<String>,
    pub at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityDiagnostics {
    pub last_trace: Option<IngestTrace>,
    /// Failure timestamps within the alert window.
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundDiagnostics {
    pub failures: Vec<TaskFailure>,
    pub total_failures: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnostics {
    pub extraction: AttemptLog,
    pub rolling_summary: AttemptLog,
    pub summary_spine: AttemptLog,
    pub session_summary: AttemptLog,
    pub curator: AttemptLog,
    pub continuity: ContinuityDiagnostics,
    pub background: BackgroundDiagnostics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateBag {
    pub last_interaction: Option<String>,
    pub message_count: u64,
    pub last_message_preview: Option<String>,
    pub summary_spine: Option<String>,
    /// Messages seen since the spine was last regenerated.
    pub spine_message_count: u64,
    pub curator: CuratorState,
    pub diagnostics: Diagnostics,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StateBag {
    pub fn record_background_failure(&mut self, failure: TaskFailure) {
        let bg = &mut self.diagnostics.background;
        bg.total_failures += 1;
        bg.failures.push(failure);
        if bg.failures.len() > MAX_BACKGROUND_FAILURES {
            let excess = bg.failures.len() - MAX_BACKGROUND_FAILURES;
            bg.failures.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub owner_id: String,
    pub persona_id: String,
    pub rolling_summary: Option<String>,
    pub state: StateBag,
    pub updated_at: Option<String>,
}

/// Current state for the pair; an empty default when none has been written.
pub fn load_state(conn: &Connection, owner_id: &str, persona_id: &str) -> Result<SessionState> {
    let row: Option<(Option<String>, String, String)> = conn
        .query_row(
            "SELECT rolling_summary, state, updated_at FROM session_state \
             WHERE owner_id = ?1 AND persona_id = ?2",
            params![owner_id, persona_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let (rolling_summary, state, updated_at) = match row {
        Some((rolling, raw, updated)) => {
            let bag = serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(owner = owner_id, persona = persona_id, error = %e, "unreadable session state, starting fresh");
                StateBag::default()
            });
            (rolling, bag, Some(updated))
        }
        None => (None, StateBag::default(), None),
    };

    Ok(SessionState {
        owner_id: owner_id.to_string(),
        persona_id: persona_id.to_string(),
        rolling_summary,
        state,
        updated_at,
    })
}

pub fn save_state(conn: &Connection, state: &SessionState, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO session_state (owner_id, persona_id, rolling_summary, state, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(owner_id, persona_id) DO UPDATE SET \
           rolling_summary = excluded.rolling_summary, \
           state = excluded.state, \
           updated_at = excluded.updated_at",
        params![
            state.owner_id,
            state.persona_id,
            state.rolling_summary,
            serde_json::to_string(&state.state)?,
            format_ts(now),
        ],
    )?;
    Ok(())
}

/// Read-modify-write inside one transaction.
pub fn update_state<F>(
    conn: &mut Connection,
    owner_id: &str,
    persona_id: &str,
    now: DateTime<Utc>,
    f: F,
) -> Result<SessionState>
where
    F: FnOnce(&mut SessionState),
{
    let tx = conn.transaction()?;
    let mut state = load_state(&tx, owner_id, persona_id)?;
    f(&mut state);
    save_state(&tx, &state, now)?;
    tx.commit()?;
    state.updated_at = Some(format_ts(now));
    Ok(state)
}
