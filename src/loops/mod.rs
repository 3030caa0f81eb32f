//! Actionable loops: commitments, habits, threads and frictions pulled out of
//! conversation.
//!
//! - [`classify`] holds the pure text heuristics (commitment downgrade,
//!   dedupe signatures, completion cues).
//! - [`store`] writes and reads the `loops` table.

pub mod classify;
pub mod store;

use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopKind {
    Commitment,
    Habit,
    Thread,
    Friction,
}

impl LoopKind {
    pub const ALL: [LoopKind; 4] = [Self::Commitment, Self::Habit, Self::Thread, Self::Friction];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commitment => "COMMITMENT",
            Self::Habit => "HABIT",
            Self::Thread => "THREAD",
            Self::Friction => "FRICTION",
        }
    }

    /// Lenient parse of classifier output; anything unrecognized is a THREAD.
    pub fn parse_or_thread(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.parse().ok()).unwrap_or(Self::Thread)
    }
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoopKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COMMITMENT" => Ok(Self::Commitment),
            "HABIT" => Ok(Self::Habit),
            "THREAD" => Ok(Self::Thread),
            "FRICTION" => Ok(Self::Friction),
            _ => Err(format!("unknown loop kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopStatus {
    Pending,
    Completed,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
        }
    }
}

impl std::str::FromStr for LoopStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(format!("unknown loop status: {s}")),
        }
    }
}

/// A row of the `loops` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    pub id: String,
    pub owner_id: String,
    pub persona_id: String,
    pub content: String,
    pub kind: LoopKind,
    pub status: LoopStatus,
    /// Dedupe signature (snake_case key or normalized content).
    pub dedupe_key: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

pub(crate) const LOOP_COLUMNS: &str =
    "id, owner_id, persona_id, content, kind, status, dedupe_key, created_at, updated_at, completed_at";

pub(crate) fn loop_from_row(row: &Row<'_>) -> rusqlite::Result<Loop> {
    let kind: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Loop {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        persona_id: row.get(2)?,
        content: row.get(3)?,
        kind: kind.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?,
        dedupe_key: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

/// A sanitized loop proposed by the extraction judge.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopCandidate {
    pub kind: LoopKind,
    pub content: String,
    pub dedupe_key: Option<String>,
    pub confidence: f64,
}
