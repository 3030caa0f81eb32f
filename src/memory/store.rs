//! Write path: key derivation, idempotent upsert/merge, embeddings, archival
//! and audit logging.
//!
//! [`store_memory`] is the single entry point for extracted and seeded facts.
//! It runs inside a transaction: derive the dedupe key, attempt an insert that
//! yields to the `(owner_id, memory_key)` unique index, and on conflict merge
//! metadata into the existing row. Content is never overwritten on merge.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::types::{Memory, MemoryInput, MemoryMetadata, MemoryStatus, MemoryType};
use super::{embedding_to_bytes, memory_from_row, normalize_content, EMBEDDING_DIM, MEMORY_COLUMNS};
use crate::clock::format_ts;
use crate::db::DbHandle;
use crate::entity::canonicalize_entity_refs;
use crate::providers::{embed_or_none, Embedder};

/// Longest normalized-content prefix used as a dedupe identity.
const CONTENT_KEY_CHARS: usize = 120;

/// Result returned from a store operation.
#[derive(Debug, Clone, Serialize)]
pub struct StoreMemoryResult {
    /// UUID of the stored (or merged-into) memory.
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    /// `true` when an existing row with the same key absorbed this write.
    pub merged: bool,
    pub mention_count: u32,
    pub memory_key: String,
}

/// Identity used when no entity ref is present: `content:<normalized>`.
pub fn content_identity(content: &str) -> String {
    let normalized: String = normalize_content(content)
        .chars()
        .take(CONTENT_KEY_CHARS)
        .collect();
    format!("content:{}", normalized.trim_end())
}

/// `{type}|{entityType|none}|{primaryRef}|{factType|fact}` where the primary
/// identity is the first canonical entity ref, else [`content_identity`].
pub fn memory_key(memory_type: MemoryType, content: &str, metadata: &MemoryMetadata) -> String {
    let entity = metadata
        .entity_type()
        .map(|e| e.as_str())
        .unwrap_or("none");
    let primary = metadata
        .entity_refs
        .first()
        .cloned()
        .unwrap_or_else(|| content_identity(content));
    let fact = metadata.fact_type().map(|f| f.as_str()).unwrap_or("fact");
    format!("{memory_type}|{entity}|{primary}|{fact}")
}

/// Normalize caller metadata for a brand-new row: canonical refs, importance
/// clamped to 0..=3 (default 1, forced to 3 when pinned), mention count 1.
pub fn normalize_input(input: &MemoryInput) -> MemoryMetadata {
    let mut importance = input.importance.unwrap_or(1).min(3);
    if input.pinned {
        importance = 3;
    }
    MemoryMetadata {
        source: input.source.clone(),
        subtype: input.subtype,
        entity_refs: canonicalize_entity_refs(&input.entity_refs),
        entity_label: input.entity_label.clone(),
        importance,
        mention_count: 1,
        status: MemoryStatus::Active,
        pinned: input.pinned,
        archived_at: None,
        archive_reason: None,
        folded_from: Vec::new(),
        folded_into: None,
    }
}

/// Merge an incoming write into existing metadata.
///
/// Refs are unioned, importance takes the max, mention count increments and
/// the remaining fields are shallow-merged with incoming values winning. A
/// seeded or folded source is never replaced.
pub fn merge_metadata(existing: &MemoryMetadata, incoming: &MemoryMetadata) -> MemoryMetadata {
    let mut merged = existing.clone();
    merged.entity_refs = canonicalize_entity_refs(
        existing
            .entity_refs
            .iter()
            .chain(incoming.entity_refs.iter()),
    );
    merged.importance = existing.importance.max(incoming.importance).min(3);
    merged.mention_count = existing.mention_count.saturating_add(1);
    merged.pinned = existing.pinned || incoming.pinned;
    if merged.pinned {
        merged.importance = 3;
    }
    if !incoming.source.is_empty() && !existing.is_seeded() && !existing.is_fold() {
        merged.source = incoming.source.clone();
    }
    if incoming.subtype.is_some() {
        merged.subtype = incoming.subtype;
    }
    if incoming.entity_label.is_some() {
        merged.entity_label = incoming.entity_label.clone();
    }
    merged
}

/// Full write path: normalize → key → insert-or-merge → audit log.
pub fn store_memory(
    conn: &mut Connection,
    owner_id: &str,
    memory_type: MemoryType,
    content: &str,
    input: &MemoryInput,
    persona_scope: Option<&str>,
    now: DateTime<Utc>,
) -> Result<StoreMemoryResult> {
    let content = content.trim();
    if content.is_empty() {
        bail!("memory content must not be empty");
    }

    let metadata = normalize_input(input);
    let key = memory_key(memory_type, content, &metadata);
    let now_str = format_ts(now);
    let tx = conn.transaction()?;

    let id = uuid::Uuid::now_v7().to_string();
    let inserted = tx.execute(
        "INSERT INTO memories (id, owner_id, persona_scope, type, content, memory_key, metadata, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
         ON CONFLICT(owner_id, memory_key) DO NOTHING",
        params![
            id,
            owner_id,
            persona_scope,
            memory_type.as_str(),
            content,
            key,
            serde_json::to_string(&metadata)?,
            now_str,
        ],
    )?;

    if inserted == 1 {
        write_audit_log(&tx, "create", &id, Some(&serde_json::json!({"memory_key": key})))?;
        tx.commit()?;
        tracing::debug!(id = %id, memory_key = %key, "memory created");
        return Ok(StoreMemoryResult {
            id,
            memory_type,
            merged: false,
            mention_count: 1,
            memory_key: key,
        });
    }

    let existing = find_by_key(&tx, owner_id, &key)?
        .with_context(|| format!("memory key conflict without a row: {key}"))?;
    let merged = merge_metadata(&existing.metadata, &metadata);
    tx.execute(
        "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(&merged)?, now_str, existing.id],
    )?;
    write_audit_log(
        &tx,
        "merge",
        &existing.id,
        Some(&serde_json::json!({
            "mention_count": merged.mention_count,
            "importance": merged.importance,
        })),
    )?;
    tx.commit()?;

    tracing::debug!(id = %existing.id, memory_key = %key, mentions = merged.mention_count, "memory merged");
    Ok(StoreMemoryResult {
        id: existing.id,
        memory_type,
        merged: true,
        mention_count: merged.mention_count,
        memory_key: key,
    })
}

/// Store an explicitly seeded fact: pinned, importance 3, `source=seed`.
pub fn seed_memory(
    conn: &mut Connection,
    owner_id: &str,
    memory_type: MemoryType,
    content: &str,
    entity_refs: &[String],
    persona_scope: Option<&str>,
    now: DateTime<Utc>,
) -> Result<StoreMemoryResult> {
    let input = MemoryInput {
        source: "seed".into(),
        entity_refs: entity_refs.to_vec(),
        importance: Some(3),
        pinned: true,
        ..Default::default()
    };
    store_memory(conn, owner_id, memory_type, content, &input, persona_scope, now)
}

/// Insert a row with caller-built metadata and key, bypassing merge. Used for
/// curator output whose identity must never collide with its sources.
pub(crate) fn insert_curated(
    conn: &Connection,
    owner_id: &str,
    persona_scope: Option<&str>,
    memory_type: MemoryType,
    content: &str,
    metadata: &MemoryMetadata,
    memory_key: &str,
    id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO memories (id, owner_id, persona_scope, type, content, memory_key, metadata, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            id,
            owner_id,
            persona_scope,
            memory_type.as_str(),
            content,
            memory_key,
            serde_json::to_string(metadata)?,
            format_ts(now),
        ],
    )?;
    write_audit_log(conn, "create", id, Some(&serde_json::json!({"memory_key": memory_key})))?;
    Ok(())
}

fn find_by_key(conn: &Connection, owner_id: &str, key: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.owner_id = ?1 AND m.memory_key = ?2");
    Ok(conn
        .query_row(&sql, params![owner_id, key], memory_from_row)
        .optional()?)
}

pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id = ?1");
    Ok(conn.query_row(&sql, params![id], memory_from_row).optional()?)
}

/// Attach (or replace) the embedding for a memory.
pub fn attach_embedding(conn: &mut Connection, memory_id: &str, embedding: &[f32]) -> Result<()> {
    if embedding.len() != EMBEDDING_DIM {
        bail!(
            "embedding has {} dimensions, expected {EMBEDDING_DIM}",
            embedding.len()
        );
    }
    let tx = conn.transaction()?;
    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM memories WHERE id = ?1)",
        params![memory_id],
        |row| row.get(0),
    )?;
    if !exists {
        bail!("memory not found: {memory_id}");
    }
    tx.execute("DELETE FROM memories_vec WHERE id = ?1", params![memory_id])?;
    tx.execute(
        "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
        params![memory_id, embedding_to_bytes(embedding)],
    )?;
    write_audit_log(&tx, "embed", memory_id, None)?;
    tx.commit()?;
    Ok(())
}

/// Embed `(id, content)` pairs and attach the vectors. Missing or mis-sized
/// vectors are logged and skipped; the rows stay. Returns how many were
/// attached.
pub async fn embed_memories(
    db: &DbHandle,
    embedder: Option<&Arc<dyn Embedder>>,
    limit: Duration,
    items: Vec<(String, String)>,
) -> usize {
    let mut attached = 0;
    for (id, content) in items {
        let Some(vector) = embed_or_none(embedder, &content, limit).await else {
            continue;
        };
        let memory_id = id.clone();
        match db.call(move |conn| attach_embedding(conn, &memory_id, &vector)).await {
            Ok(()) => attached += 1,
            Err(e) => tracing::warn!(memory_id = %id, error = %e, "embedding not attached"),
        }
    }
    attached
}

pub fn has_embedding(conn: &Connection, memory_id: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM memories_vec WHERE id = ?1)",
        params![memory_id],
        |row| row.get(0),
    )?)
}

/// Active memories that never received an embedding, oldest first.
pub fn memories_missing_embeddings(conn: &Connection, limit: usize) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.content FROM memories m \
         WHERE NOT EXISTS (SELECT 1 FROM memories_vec v WHERE v.id = m.id) \
           AND json_extract(m.metadata, '$.status') != 'ARCHIVED' \
         ORDER BY m.created_at LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Flag a memory as archived. Rows are never hard-deleted. Returns `false`
/// when the memory was missing or already archived.
pub fn archive_memory(
    conn: &Connection,
    memory_id: &str,
    reason: &str,
    folded_into: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(memory) = get_memory(conn, memory_id)? else {
        return Ok(false);
    };
    if memory.metadata.is_archived() {
        return Ok(false);
    }
    let now_str = format_ts(now);
    let mut metadata = memory.metadata;
    metadata.status = MemoryStatus::Archived;
    metadata.archived_at = Some(now_str.clone());
    metadata.archive_reason = Some(reason.to_string());
    metadata.folded_into = folded_into.map(str::to_string);

    conn.execute(
        "UPDATE memories SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(&metadata)?, now_str, memory_id],
    )?;
    write_audit_log(
        conn,
        "archive",
        memory_id,
        Some(&serde_json::json!({"reason": reason, "folded_into": folded_into})),
    )?;
    Ok(true)
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = format_ts(crate::clock::now());
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, now],
    )?;
    Ok(())
}
