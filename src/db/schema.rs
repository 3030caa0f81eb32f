//! SQL DDL for all Hearth tables.
//!
//! Defines `memories`, `memories_vec` (vec0), `memory_log`, `loops`, `sessions`,
//! `session_summaries`, `session_state`, `messages` and `schema_meta`. All DDL
//! uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Durable facts
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    persona_scope TEXT,
    type TEXT NOT NULL CHECK(type IN ('PROFILE','PEOPLE','PROJECT')),
    content TEXT NOT NULL,
    memory_key TEXT,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_owner_key ON memories(owner_id, memory_key);
CREATE INDEX IF NOT EXISTS idx_memories_owner_scope ON memories(owner_id, persona_scope);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(owner_id, created_at);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','merge','archive','fold','embed')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Actionable loops extracted from conversation
CREATE TABLE IF NOT EXISTS loops (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    content TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('COMMITMENT','HABIT','THREAD','FRICTION')),
    status TEXT NOT NULL DEFAULT 'PENDING' CHECK(status IN ('PENDING','COMPLETED')),
    dedupe_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_loops_owner_persona ON loops(owner_id, persona_id, status);

-- Conversation sessions
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,
    ended_at TEXT,
    turn_count INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_open
    ON sessions(owner_id, persona_id) WHERE ended_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_sessions_owner_persona ON sessions(owner_id, persona_id, started_at);

CREATE TABLE IF NOT EXISTS session_summaries (
    session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
    owner_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    summary TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_summaries_owner ON session_summaries(owner_id, persona_id, created_at);

-- Cross-turn mutable state per (owner, persona)
CREATE TABLE IF NOT EXISTS session_state (
    owner_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    rolling_summary TEXT,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (owner_id, persona_id)
);

-- Message log
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    session_id TEXT,
    role TEXT NOT NULL CHECK(role IN ('user','assistant')),
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_owner_persona ON messages(owner_id, persona_id, created_at);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
