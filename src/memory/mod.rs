pub mod search;
pub mod stats;
pub mod store;
pub mod types;

use rusqlite::Row;

use types::{Memory, MemoryMetadata};

/// Dimension of stored vectors; fixed by the `memories_vec` table definition.
pub const EMBEDDING_DIM: usize = 384;

const ELLIPSIS: &str = "...";

/// Column list matching [`memory_from_row`], prefixed with the `m.` alias.
pub(crate) const MEMORY_COLUMNS: &str = "m.id, m.owner_id, m.persona_scope, m.type, m.content, \
     m.memory_key, m.metadata, m.created_at, m.updated_at";

/// Map a row selected with [`MEMORY_COLUMNS`] (starting at column 0).
pub(crate) fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let type_str: String = row.get(3)?;
    let memory_type = type_str.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    let metadata_str: String = row.get(6)?;
    let metadata: MemoryMetadata = serde_json::from_str(&metadata_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Memory {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        persona_scope: row.get(2)?,
        memory_type,
        content: row.get(4)?,
        memory_key: row.get(5)?,
        metadata,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Convert an f32 embedding to the little-endian byte layout sqlite-vec expects.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_content(text: &str) -> String {
    let stripped: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate on a char boundary to at most `max_chars`, ending in "..." if
/// truncated.
pub(crate) fn truncate(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return content.chars().take(max_chars).collect();
    }
    let kept: String = content.chars().take(max_chars - ELLIPSIS.len()).collect();
    format!("{}{ELLIPSIS}", kept.trim_end())
}
