use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::clock::{age_in_days, parse_ts};
use crate::config::RetrievalConfig;
use crate::memory::types::Memory;
use crate::memory::{embedding_to_bytes, memory_from_row, MEMORY_COLUMNS};

/// Filter shared by every read: owner match, persona-or-global scope, allowed types.
const SCOPE_FILTER: &str = "m.owner_id = ?1 \
     AND (m.persona_scope IS NULL OR m.persona_scope = ?2) \
     AND m.type IN ('PROFILE','PEOPLE','PROJECT')";

const NOT_ARCHIVED: &str = "json_extract(m.metadata, '$.status') != 'ARCHIVED'";

// ── Public types ──────────────────────────────────────────────────────────────

/// A retrieval candidate with its score components.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub similarity: f64,
    pub recency: f64,
    pub frequency: f64,
    /// Final ranking key: the blended score, or the similarity when blending is off.
    pub score: f64,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Vector prefilter (top `candidate_k` by cosine distance, scoped) → drop
/// archived → blended rerank → top `limit`.
pub fn search_memories(
    conn: &Connection,
    owner_id: &str,
    persona_scope: Option<&str>,
    query_embedding: &[f32],
    limit: usize,
    config: &RetrievalConfig,
    now: DateTime<Utc>,
) -> Result<Vec<ScoredMemory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS}, vec_distance_cosine(v.embedding, ?3) AS distance \
         FROM memories m JOIN memories_vec v ON v.id = m.id \
         WHERE {SCOPE_FILTER} \
         ORDER BY distance ASC LIMIT ?4"
    );
    let mut stmt = conn.prepare(&sql)?;
    let candidates = stmt
        .query_map(
            params![
                owner_id,
                persona_scope,
                embedding_to_bytes(query_embedding),
                config.candidate_k as i64
            ],
            |row| {
                let memory = memory_from_row(row)?;
                let distance: f64 = row.get(9)?;
                Ok((memory, 1.0 - distance))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let active: Vec<(Memory, f64)> = candidates
        .into_iter()
        .filter(|(m, _)| !m.metadata.is_archived())
        .collect();

    tracing::debug!(owner = owner_id, candidates = active.len(), "vector prefilter done");

    let mut ranked = rank_candidates(active, config, now);
    ranked.truncate(limit);
    Ok(ranked)
}

/// Score and sort candidates. Pure: the caller supplies similarities.
pub fn rank_candidates(
    candidates: Vec<(Memory, f64)>,
    config: &RetrievalConfig,
    now: DateTime<Utc>,
) -> Vec<ScoredMemory> {
    let memories: Vec<&Memory> = candidates.iter().map(|(m, _)| m).collect();
    let frequencies = frequency_scores(&memories);

    let mut scored: Vec<ScoredMemory> = candidates
        .into_iter()
        .zip(frequencies)
        .map(|((memory, similarity), frequency)| {
            let age = parse_ts(&memory.created_at)
                .map(|created| age_in_days(created, now))
                .unwrap_or(0.0);
            let recency = recency_score(age, config.half_life_days);
            let score = if config.blended_scoring {
                blended_score(similarity, recency, frequency, config)
            } else {
                similarity
            };
            ScoredMemory {
                memory,
                similarity,
                recency,
                frequency,
                score,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored
}

/// Exponential decay: 1.0 at age 0, 0.5 at one half-life.
pub fn recency_score(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 0.0;
    }
    (-(std::f64::consts::LN_2 / half_life_days) * age_days.max(0.0)).exp()
}

/// Per-candidate entity frequency within the candidate set: the mean count of
/// the candidate's refs, normalized by the most frequent ref in the set.
pub fn frequency_scores(candidates: &[&Memory]) -> Vec<f64> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for memory in candidates {
        for r in &memory.metadata.entity_refs {
            *counts.entry(r.as_str()).or_insert(0) += 1;
        }
    }
    let max_count = counts.values().copied().max().unwrap_or(0);
    if max_count == 0 {
        return vec![0.0; candidates.len()];
    }

    candidates
        .iter()
        .map(|memory| {
            let refs = &memory.metadata.entity_refs;
            if refs.is_empty() {
                return 0.0;
            }
            let total: usize = refs
                .iter()
                .map(|r| counts.get(r.as_str()).copied().unwrap_or(0))
                .sum();
            (total as f64 / refs.len() as f64) / max_count as f64
        })
        .collect()
}

pub fn blended_score(similarity: f64, recency: f64, frequency: f64, config: &RetrievalConfig) -> f64 {
    config.similarity_weight * similarity
        + config.recency_weight * recency
        + config.frequency_weight * frequency
}

/// Pinned active memories visible to the persona, oldest first.
pub fn foundation_memories(
    conn: &Connection,
    owner_id: &str,
    persona_scope: Option<&str>,
    cap: usize,
) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m \
         WHERE {SCOPE_FILTER} AND {NOT_ARCHIVED} \
           AND json_extract(m.metadata, '$.pinned') = 1 \
         ORDER BY m.created_at ASC LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![owner_id, persona_scope, cap as i64], memory_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Active memories sharing at least one of `refs` that are pinned or have
/// importance ≥ 2, excluding `exclude_ids`. Newest first.
pub fn memories_sharing_refs(
    conn: &Connection,
    owner_id: &str,
    persona_scope: Option<&str>,
    refs: &[String],
    exclude_ids: &HashSet<String>,
) -> Result<Vec<Memory>> {
    if refs.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m \
         WHERE {SCOPE_FILTER} AND {NOT_ARCHIVED} \
           AND (json_extract(m.metadata, '$.pinned') = 1 \
                OR json_extract(m.metadata, '$.importance') >= 2) \
           AND EXISTS (SELECT 1 FROM json_each(m.metadata, '$.entityRefs') r \
                       WHERE r.value IN (SELECT value FROM json_each(?3))) \
         ORDER BY m.updated_at DESC"
    );
    let wanted = serde_json::to_string(refs)?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![owner_id, persona_scope, wanted], memory_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|m| !exclude_ids.contains(&m.id))
        .collect())
}

/// Every active memory of the owner across all scopes, oldest first.
pub fn active_memories(conn: &Connection, owner_id: &str) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m \
         WHERE m.owner_id = ?1 AND m.type IN ('PROFILE','PEOPLE','PROJECT') AND {NOT_ARCHIVED} \
         ORDER BY m.created_at ASC, m.id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![owner_id], memory_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Active memories created strictly after `since` (all of them when `None`).
pub fn count_active_since(conn: &Connection, owner_id: &str, since: Option<&str>) -> Result<u64> {
    let sql = format!(
        "SELECT COUNT(*) FROM memories m \
         WHERE m.owner_id = ?1 AND {NOT_ARCHIVED} AND (?2 IS NULL OR m.created_at > ?2)"
    );
    let n: i64 = conn.query_row(&sql, params![owner_id, since], |row| row.get(0))?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::{archive_memory, attach_embedding, store_memory};
    use crate::memory::types::{MemoryInput, MemoryType};
    use chrono::Duration;

    fn spike(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 384];
        v[i] = 1.0;
        v
    }

    fn store(conn: &mut Connection, content: &str, refs: &[&str], at: DateTime<Utc>) -> String {
        let input = MemoryInput {
            source: "extraction".into(),
            entity_refs: refs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        store_memory(conn, "u1", MemoryType::Profile, content, &input, None, at)
            .unwrap()
            .id
    }

    fn memory_at(created_at: DateTime<Utc>, refs: &[&str]) -> Memory {
        serde_json::from_value(serde_json::json!({
            "id": uuid::Uuid::now_v7().to_string(),
            "owner_id": "u1",
            "persona_scope": null,
            "type": "PROFILE",
            "content": "x",
            "memory_key": null,
            "metadata": {"source": "test", "entityRefs": refs},
            "created_at": crate::clock::format_ts(created_at),
            "updated_at": crate::clock::format_ts(created_at),
        }))
        .unwrap()
    }

    #[test]
    fn recency_halves_at_half_life() {
        assert!((recency_score(0.0, 14.0) - 1.0).abs() < 1e-12);
        assert!((recency_score(14.0, 14.0) - 0.5).abs() < 1e-12);
        assert!(recency_score(1.0, 14.0) > recency_score(2.0, 14.0));
    }

    #[test]
    fn equal_similarity_prefers_newer() {
        let now = Utc::now();
        let older = memory_at(now - Duration::days(10), &[]);
        let newer = memory_at(now - Duration::days(1), &[]);
        let newer_id = newer.id.clone();
        let ranked = rank_candidates(
            vec![(older, 0.8), (newer, 0.8)],
            &RetrievalConfig::default(),
            now,
        );
        assert_eq!(ranked[0].memory.id, newer_id);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn frequency_normalized_by_most_common_ref() {
        let now = Utc::now();
        let a = memory_at(now, &["person:asha"]);
        let b = memory_at(now, &["person:asha", "place:pune"]);
        let c = memory_at(now, &[]);
        let scores = frequency_scores(&[&a, &b, &c]);
        assert!((scores[0] - 1.0).abs() < 1e-12);
        assert!((scores[1] - 0.75).abs() < 1e-12);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn pure_similarity_when_blending_disabled() {
        let now = Utc::now();
        let config = RetrievalConfig {
            blended_scoring: false,
            ..Default::default()
        };
        let old_close = memory_at(now - Duration::days(300), &[]);
        let id = old_close.id.clone();
        let ranked = rank_candidates(vec![(memory_at(now, &[]), 0.2), (old_close, 0.9)], &config, now);
        assert_eq!(ranked[0].memory.id, id);
        assert_eq!(ranked[0].score, 0.9);
    }

    #[test]
    fn search_skips_archived_and_unembedded() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let kept = store(&mut conn, "likes tea", &[], now);
        let archived = store(&mut conn, "likes coffee", &[], now);
        let _no_vec = store(&mut conn, "likes juice", &[], now);
        attach_embedding(&mut conn, &kept, &spike(1)).unwrap();
        attach_embedding(&mut conn, &archived, &spike(1)).unwrap();
        archive_memory(&conn, &archived, "dedupe", None, now).unwrap();

        let results =
            search_memories(&conn, "u1", Some("p1"), &spike(1), 10, &RetrievalConfig::default(), now).unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
        assert_eq!(ids, vec![kept.as_str()]);
        assert!((results[0].similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn search_respects_owner_and_persona_scope() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let input = MemoryInput::from_source("extraction");
        let other_persona = store_memory(&mut conn, "u1", MemoryType::Project, "kiln build", &input, Some("p2"), now)
            .unwrap()
            .id;
        let other_owner = store_memory(&mut conn, "u2", MemoryType::Project, "kiln build", &input, None, now)
            .unwrap()
            .id;
        let visible = store_memory(&mut conn, "u1", MemoryType::Project, "kiln glaze", &input, Some("p1"), now)
            .unwrap()
            .id;
        for id in [&other_persona, &other_owner, &visible] {
            attach_embedding(&mut conn, id, &spike(7)).unwrap();
        }

        let results =
            search_memories(&conn, "u1", Some("p1"), &spike(7), 10, &RetrievalConfig::default(), now).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.id, visible);
    }

    #[test]
    fn foundation_returns_pinned_oldest_first() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let pinned = MemoryInput {
            source: "seed".into(),
            pinned: true,
            ..Default::default()
        };
        let second = store_memory(&mut conn, "u1", MemoryType::Profile, "b", &pinned, None, now).unwrap().id;
        let first = store_memory(&mut conn, "u1", MemoryType::Profile, "a", &pinned, None, now - Duration::hours(1))
            .unwrap()
            .id;
        store(&mut conn, "not pinned", &[], now);

        let rows = foundation_memories(&conn, "u1", Some("p1"), 20).unwrap();
        let ids: Vec<String> = rows.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn sharing_refs_requires_importance_or_pin() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let important = MemoryInput {
            source: "extraction".into(),
            entity_refs: vec!["person:asha".into()],
            importance: Some(2),
            ..Default::default()
        };
        let hit = store_memory(&mut conn, "u1", MemoryType::People, "Asha lives in Pune", &important, None, now)
            .unwrap()
            .id;
        store(&mut conn, "Asha likes mangoes", &["person:asha"], now);

        let rows =
            memories_sharing_refs(&conn, "u1", None, &["person:asha".into()], &HashSet::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, hit);

        let excluded = HashSet::from([hit]);
        assert!(memories_sharing_refs(&conn, "u1", None, &["person:asha".into()], &excluded)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn count_since_ignores_archived() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let a = store(&mut conn, "one", &[], now - Duration::hours(2));
        store(&mut conn, "two", &[], now);
        archive_memory(&conn, &a, "dedupe", None, now).unwrap();
        assert_eq!(count_active_since(&conn, "u1", None).unwrap(), 1);
        let cutoff = crate::clock::format_ts(now - Duration::hours(1));
        assert_eq!(count_active_since(&conn, "u1", Some(&cutoff)).unwrap(), 1);
    }
}
