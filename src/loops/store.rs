//! Loop persistence: signature-deduped writes, completion, and the reads the
//! context assembler needs.
//!
//! At most one PENDING loop exists per `(owner, persona, kind, signature)`.
//! [`write_loops`] checks for an existing pending row first and then inserts
//! with `INSERT OR IGNORE`, so the partial unique index absorbs the case where
//! two concurrent runs both pass the check.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;

use super::classify::{
    effective_kind, has_completion_cue, is_completion_report, loop_signature, salient_keywords,
    says_done,
};
use super::{loop_from_row, Loop, LoopCandidate, LoopKind, LOOP_COLUMNS};
use crate::clock::format_ts;

/// Content prefixes left behind by older win-tracking formats.
const LEGACY_WIN_MARKERS: [&str; 4] = ["[win]", "[legacy]", "[migrated]", "win:"];

/// Outcome of one [`write_loops`] batch.
#[derive(Debug, Default, Serialize)]
pub struct LoopWriteReport {
    pub written: Vec<String>,
    pub duplicates: usize,
    pub dropped: usize,
}

/// Which rule closed a commitment in [`auto_complete_commitment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionRule {
    SoleCommitment,
    KeywordMatch,
}

pub fn write_loops(
    conn: &mut Connection,
    owner_id: &str,
    persona_id: &str,
    candidates: &[LoopCandidate],
    min_confidence: f64,
    now: DateTime<Utc>,
) -> Result<LoopWriteReport> {
    let mut report = LoopWriteReport::default();
    let mut batch: HashSet<(LoopKind, String)> = HashSet::new();
    let now_str = format_ts(now);
    let tx = conn.transaction()?;

    for candidate in candidates {
        let content = candidate.content.trim();
        if content.is_empty() || candidate.confidence < min_confidence {
            report.dropped += 1;
            continue;
        }
        let kind = effective_kind(candidate.kind, content);
        if kind == LoopKind::Commitment && is_completion_report(content) {
            tracing::debug!(content, "skipping completion report as a new commitment");
            report.dropped += 1;
            continue;
        }

        let signature = loop_signature(candidate.dedupe_key.as_deref(), content);
        if signature.is_empty() || !batch.insert((kind, signature.clone())) {
            report.duplicates += 1;
            continue;
        }

        if pending_exists(&tx, owner_id, persona_id, kind, &signature)? {
            report.duplicates += 1;
            continue;
        }

        let id = uuid::Uuid::now_v7().to_string();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO loops (id, owner_id, persona_id, content, kind, status, dedupe_key, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6, ?7, ?7)",
            params![id, owner_id, persona_id, content, kind.as_str(), signature, now_str],
        )?;
        if inserted == 0 {
            report.duplicates += 1;
        } else {
            tracing::debug!(id = %id, kind = %kind, "loop created");
            report.written.push(id);
        }
    }

    tx.commit()?;
    Ok(report)
}

fn pending_exists(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
    kind: LoopKind,
    signature: &str,
) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM loops WHERE owner_id = ?1 AND persona_id = ?2 \
         AND kind = ?3 AND dedupe_key = ?4 AND status = 'PENDING')",
        params![owner_id, persona_id, kind.as_str(), signature],
        |row| row.get(0),
    )?)
}

/// PENDING loops, newest first, optionally of one kind.
pub fn pending_loops(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
    kind: Option<LoopKind>,
) -> Result<Vec<Loop>> {
    let sql = format!(
        "SELECT {LOOP_COLUMNS} FROM loops \
         WHERE owner_id = ?1 AND persona_id = ?2 AND status = 'PENDING' \
           AND (?3 IS NULL OR kind = ?3) \
         ORDER BY created_at DESC, id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![owner_id, persona_id, kind.map(|k| k.as_str())],
            loop_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_loop(conn: &Connection, id: &str) -> Result<Option<Loop>> {
    let sql = format!("SELECT {LOOP_COLUMNS} FROM loops WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], loop_from_row).optional()?)
}

/// Mark a pending loop completed. Returns `false` if it was not pending.
pub fn complete_loop(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let now_str = format_ts(now);
    let n = conn.execute(
        "UPDATE loops SET status = 'COMPLETED', completed_at = ?1, updated_at = ?1 \
         WHERE id = ?2 AND status = 'PENDING'",
        params![now_str, id],
    )?;
    Ok(n == 1)
}

/// Close a pending commitment the turn reports as done.
///
/// Two rules, tried in order: exactly one pending commitment and the turn says
/// done/finished/completed; or the turn has a completion cue and shares a
/// salient keyword with exactly one pending commitment.
pub fn auto_complete_commitment(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
    turn_text: &str,
    now: DateTime<Utc>,
) -> Result<Option<(Loop, CompletionRule)>> {
    let pending = pending_loops(conn, owner_id, persona_id, Some(LoopKind::Commitment))?;
    if pending.is_empty() {
        return Ok(None);
    }

    let (target, rule) = if pending.len() == 1 && says_done(turn_text) {
        (&pending[0], CompletionRule::SoleCommitment)
    } else if has_completion_cue(turn_text) {
        let turn_words = salient_keywords(turn_text);
        let matches: Vec<&Loop> = pending
            .iter()
            .filter(|l| !salient_keywords(&l.content).is_disjoint(&turn_words))
            .collect();
        match matches.as_slice() {
            [only] => (*only, CompletionRule::KeywordMatch),
            _ => return Ok(None),
        }
    } else {
        return Ok(None);
    };

    if !complete_loop(conn, &target.id, now)? {
        return Ok(None);
    }
    tracing::info!(owner = owner_id, persona = persona_id, loop_id = %target.id, ?rule, "commitment auto-completed");
    Ok(get_loop(conn, &target.id)?.map(|l| (l, rule)))
}

pub fn is_legacy_win(content: &str) -> bool {
    let lower = content.trim_start().to_lowercase();
    LEGACY_WIN_MARKERS.iter().any(|m| lower.starts_with(m))
}

/// Commitments completed at or after `since`, newest first, legacy markers excluded.
pub fn recent_wins(
    conn: &Connection,
    owner_id: &str,
    persona_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<Loop>> {
    let sql = format!(
        "SELECT {LOOP_COLUMNS} FROM loops \
         WHERE owner_id = ?1 AND persona_id = ?2 AND kind = 'COMMITMENT' \
           AND status = 'COMPLETED' AND completed_at >= ?3 \
         ORDER BY completed_at DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![owner_id, persona_id, format_ts(since)], loop_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().filter(|l| !is_legacy_win(&l.content)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::loops::LoopStatus;
    use chrono::Duration;

    fn candidate(kind: LoopKind, content: &str, key: Option<&str>) -> LoopCandidate {
        LoopCandidate {
            kind,
            content: content.into(),
            dedupe_key: key.map(str::to_string),
            confidence: 0.9,
        }
    }

    #[test]
    fn batch_and_existing_duplicates_are_skipped() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let batch = vec![
            candidate(LoopKind::Commitment, "Go for a walk", Some("walk")),
            candidate(LoopKind::Commitment, "Take a walk", Some("walk")),
        ];
        let report = write_loops(&mut conn, "u1", "p1", &batch, 0.5, now).unwrap();
        assert_eq!(report.written.len(), 1);
        assert_eq!(report.duplicates, 1);

        let again = write_loops(&mut conn, "u1", "p1", &batch[..1], 0.5, now).unwrap();
        assert!(again.written.is_empty());
        assert_eq!(pending_loops(&conn, "u1", "p1", None).unwrap().len(), 1);
    }

    #[test]
    fn same_signature_different_kind_is_kept() {
        let mut conn = db::open_memory_database().unwrap();
        let batch = vec![
            candidate(LoopKind::Habit, "Morning run", None),
            candidate(LoopKind::Friction, "Morning run", None),
        ];
        let report = write_loops(&mut conn, "u1", "p1", &batch, 0.5, Utc::now()).unwrap();
        assert_eq!(report.written.len(), 2);
    }

    #[test]
    fn low_confidence_and_completion_reports_dropped() {
        let mut conn = db::open_memory_database().unwrap();
        let mut weak = candidate(LoopKind::Thread, "Plan the trip", None);
        weak.confidence = 0.2;
        let batch = vec![weak, candidate(LoopKind::Commitment, "I did my walk", None)];
        let report = write_loops(&mut conn, "u1", "p1", &batch, 0.5, Utc::now()).unwrap();
        assert_eq!(report.dropped, 2);
        assert!(report.written.is_empty());
    }

    #[test]
    fn hedged_commitment_stored_as_thread() {
        let mut conn = db::open_memory_database().unwrap();
        let batch = vec![candidate(LoopKind::Commitment, "I might go for a walk", None)];
        write_loops(&mut conn, "u1", "p1", &batch, 0.5, Utc::now()).unwrap();
        let threads = pending_loops(&conn, "u1", "p1", Some(LoopKind::Thread)).unwrap();
        assert_eq!(threads.len(), 1);
        assert!(pending_loops(&conn, "u1", "p1", Some(LoopKind::Commitment)).unwrap().is_empty());
    }

    #[test]
    fn sole_commitment_completes_on_done() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        write_loops(&mut conn, "u1", "p1", &[candidate(LoopKind::Commitment, "File the taxes", None)], 0.5, now)
            .unwrap();
        let (done, rule) = auto_complete_commitment(&conn, "u1", "p1", "ok that's done", now)
            .unwrap()
            .unwrap();
        assert_eq!(rule, CompletionRule::SoleCommitment);
        assert_eq!(done.status, LoopStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn keyword_rule_picks_the_matching_commitment() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let batch = vec![
            candidate(LoopKind::Commitment, "Go for a walk", None),
            candidate(LoopKind::Commitment, "Call the landlord", None),
        ];
        write_loops(&mut conn, "u1", "p1", &batch, 0.5, now).unwrap();

        let (done, rule) = auto_complete_commitment(&conn, "u1", "p1", "I did my walk today", now)
            .unwrap()
            .unwrap();
        assert_eq!(rule, CompletionRule::KeywordMatch);
        assert_eq!(done.content, "Go for a walk");
        let pending = pending_loops(&conn, "u1", "p1", Some(LoopKind::Commitment)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "Call the landlord");
    }

    #[test]
    fn no_completion_without_cue() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        write_loops(&mut conn, "u1", "p1", &[candidate(LoopKind::Commitment, "Go for a walk", None)], 0.5, now)
            .unwrap();
        assert!(auto_complete_commitment(&conn, "u1", "p1", "thinking about my walk", now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn completed_signature_can_be_reopened() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let c = [candidate(LoopKind::Commitment, "Go for a walk", None)];
        let first = write_loops(&mut conn, "u1", "p1", &c, 0.5, now).unwrap();
        complete_loop(&conn, &first.written[0], now).unwrap();
        let second = write_loops(&mut conn, "u1", "p1", &c, 0.5, now).unwrap();
        assert_eq!(second.written.len(), 1);
    }

    #[test]
    fn recent_wins_window_and_legacy_filter() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let batch = vec![
            candidate(LoopKind::Commitment, "Go for a walk", None),
            candidate(LoopKind::Commitment, "[win] old format", None),
            candidate(LoopKind::Commitment, "Call the landlord", None),
        ];
        let report = write_loops(&mut conn, "u1", "p1", &batch, 0.5, now).unwrap();
        complete_loop(&conn, &report.written[0], now).unwrap();
        complete_loop(&conn, &report.written[1], now).unwrap();
        complete_loop(&conn, &report.written[2], now - Duration::hours(72)).unwrap();

        let wins = recent_wins(&conn, "u1", "p1", now - Duration::hours(48)).unwrap();
        assert_eq!(wins.len(), 1);
        assert_eq!(wins[0].content, "Go for a walk");
    }
}
