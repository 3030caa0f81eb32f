use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::memory::types::MemoryType;

/// Response from [`engine_stats`].
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_memories: u64,
    pub active_memories: u64,
    pub archived_memories: u64,
    pub pinned_memories: u64,
    pub missing_embeddings: u64,
    pub by_type: BTreeMap<String, u64>,
    /// `"{kind}/{status}"` → count.
    pub loops: BTreeMap<String, u64>,
    pub open_sessions: u64,
    pub closed_sessions: u64,
    pub session_summaries: u64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<String>,
}

/// Compute store statistics, optionally restricted to one owner.
///
/// `db_path` is used for file size calculation; pass None for in-memory databases.
pub fn engine_stats(
    conn: &Connection,
    owner_id: Option<&str>,
    db_path: Option<&Path>,
) -> Result<StatsResponse> {
    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, params![owner_id], |row| row.get(0))?;
        Ok(n as u64)
    };

    let total = count("SELECT COUNT(*) FROM memories WHERE ?1 IS NULL OR owner_id = ?1")?;
    let archived = count(
        "SELECT COUNT(*) FROM memories WHERE (?1 IS NULL OR owner_id = ?1) \
         AND json_extract(metadata, '$.status') = 'ARCHIVED'",
    )?;
    let pinned = count(
        "SELECT COUNT(*) FROM memories WHERE (?1 IS NULL OR owner_id = ?1) \
         AND json_extract(metadata, '$.pinned') = 1 \
         AND json_extract(metadata, '$.status') != 'ARCHIVED'",
    )?;
    let missing_embeddings = count(
        "SELECT COUNT(*) FROM memories m WHERE (?1 IS NULL OR m.owner_id = ?1) \
         AND NOT EXISTS (SELECT 1 FROM memories_vec v WHERE v.id = m.id)",
    )?;
    let open_sessions =
        count("SELECT COUNT(*) FROM sessions WHERE (?1 IS NULL OR owner_id = ?1) AND ended_at IS NULL")?;
    let closed_sessions =
        count("SELECT COUNT(*) FROM sessions WHERE (?1 IS NULL OR owner_id = ?1) AND ended_at IS NOT NULL")?;
    let session_summaries =
        count("SELECT COUNT(*) FROM session_summaries WHERE ?1 IS NULL OR owner_id = ?1")?;

    let (oldest, newest) = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM memories WHERE ?1 IS NULL OR owner_id = ?1",
        params![owner_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total_memories: total,
        active_memories: total - archived,
        archived_memories: archived,
        pinned_memories: pinned,
        missing_embeddings,
        by_type: count_by_type(conn, owner_id)?,
        loops: count_loops(conn, owner_id)?,
        open_sessions,
        closed_sessions,
        session_summaries,
        db_size_bytes,
        oldest_memory: oldest,
        newest_memory: newest,
    })
}

/// Active memories by type; every type is present even at zero.
fn count_by_type(conn: &Connection, owner_id: Option<&str>) -> Result<BTreeMap<String, u64>> {
    let mut map: BTreeMap<String, u64> = MemoryType::ALL
        .iter()
        .map(|t| (t.as_str().to_string(), 0))
        .collect();

    let mut stmt = conn.prepare(
        "SELECT type, COUNT(*) FROM memories \
         WHERE (?1 IS NULL OR owner_id = ?1) AND json_extract(metadata, '$.status') != 'ARCHIVED' \
         GROUP BY type",
    )?;
    let rows = stmt
        .query_map(params![owner_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (t, n) in rows {
        map.insert(t, n as u64);
    }
    Ok(map)
}

fn count_loops(conn: &Connection, owner_id: Option<&str>) -> Result<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare(
        "SELECT kind, status, COUNT(*) FROM loops WHERE ?1 IS NULL OR owner_id = ?1 \
         GROUP BY kind, status",
    )?;
    let rows = stmt
        .query_map(params![owner_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(kind, status, n)| (format!("{kind}/{status}"), n as u64))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::{archive_memory, seed_memory, store_memory};
    use crate::memory::types::MemoryInput;
    use chrono::Utc;

    #[test]
    fn empty_database() {
        let conn = db::open_memory_database().unwrap();
        let stats = engine_stats(&conn, None, None).unwrap();
        assert_eq!(stats.total_memories, 0);
        assert_eq!(stats.by_type.len(), 3);
        assert!(stats.loops.is_empty());
        assert!(stats.oldest_memory.is_none());
    }

    #[test]
    fn counts_by_status_type_and_owner() {
        let mut conn = db::open_memory_database().unwrap();
        let now = Utc::now();
        let input = MemoryInput::from_source("extraction");
        let a = store_memory(&mut conn, "u1", MemoryType::Profile, "likes tea", &input, None, now).unwrap();
        store_memory(&mut conn, "u1", MemoryType::Project, "kiln", &input, None, now).unwrap();
        seed_memory(&mut conn, "u1", MemoryType::People, "Asha is my sister", &[], None, now).unwrap();
        store_memory(&mut conn, "u2", MemoryType::Profile, "likes tea", &input, None, now).unwrap();
        archive_memory(&conn, &a.id, "dedupe", None, now).unwrap();

        let stats = engine_stats(&conn, Some("u1"), None).unwrap();
        assert_eq!(stats.total_memories, 3);
        assert_eq!(stats.archived_memories, 1);
        assert_eq!(stats.active_memories, 2);
        assert_eq!(stats.pinned_memories, 1);
        assert_eq!(stats.by_type["PROFILE"], 0);
        assert_eq!(stats.by_type["PEOPLE"], 1);
        assert_eq!(stats.missing_embeddings, 3);

        let all = engine_stats(&conn, None, None).unwrap();
        assert_eq!(all.total_memories, 4);
    }
}
