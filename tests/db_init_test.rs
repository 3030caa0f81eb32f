use hearth::db;
use hearth::memory::embedding_to_bytes;

fn names(conn: &rusqlite::Connection, kind: &str) -> Vec<String> {
    conn.prepare("SELECT name FROM sqlite_master WHERE type = ?1 ORDER BY name")
        .unwrap()
        .query_map([kind], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn full_schema_creates_all_tables_and_indexes() {
    let conn = db::open_memory_database().unwrap();

    let tables = names(&conn, "table");
    for table in [
        "memories",
        "memory_log",
        "loops",
        "sessions",
        "session_summaries",
        "session_state",
        "messages",
        "schema_meta",
        "memories_vec",
    ] {
        assert!(tables.contains(&table.to_string()), "{table} table missing");
    }

    let indexes = names(&conn, "index");
    for index in [
        "idx_memories_owner_key",
        "idx_loops_owner_persona",
        "idx_loops_pending_signature",
        "idx_sessions_one_open",
        "idx_messages_owner_persona",
    ] {
        assert!(indexes.contains(&index.to_string()), "{index} index missing");
    }

    // vec0 accepts and returns a 384-dim vector
    let embedding: Vec<f32> = (0..384).map(|i| (i as f32) / 384.0).collect();
    conn.execute(
        "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
        rusqlite::params!["test-vec", embedding_to_bytes(&embedding)],
    )
    .unwrap();
    let distance: f64 = conn
        .query_row(
            "SELECT vec_distance_cosine(embedding, ?1) FROM memories_vec WHERE id = 'test-vec'",
            [embedding_to_bytes(&embedding)],
            |r| r.get(0),
        )
        .unwrap();
    assert!(distance.abs() < 1e-5);
}

#[test]
fn check_constraints_reject_unknown_values() {
    let conn = db::open_memory_database().unwrap();

    let bad_type = conn.execute(
        "INSERT INTO memories (id, owner_id, type, content, metadata, created_at, updated_at) \
         VALUES ('m1', 'u1', 'EPISODIC', 'had lunch', '{}', 't', 't')",
        [],
    );
    assert!(bad_type.is_err(), "EPISODIC is not a stored memory type");

    let bad_op = conn.execute(
        "INSERT INTO memory_log (operation, memory_id, created_at) VALUES ('delete', 'm1', 't')",
        [],
    );
    assert!(bad_op.is_err(), "deletion is never logged");

    let bad_kind = conn.execute(
        "INSERT INTO loops (id, owner_id, persona_id, content, kind, dedupe_key, created_at, updated_at) \
         VALUES ('l1', 'u1', 'p1', 'x', 'CHORE', 'x', 't', 't')",
        [],
    );
    assert!(bad_kind.is_err());
}

#[test]
fn one_open_session_per_pair_is_enforced() {
    let conn = db::open_memory_database().unwrap();
    let insert = |id: &str| {
        conn.execute(
            "INSERT INTO sessions (id, owner_id, persona_id, started_at, last_activity_at) \
             VALUES (?1, 'u1', 'p1', 't', 't')",
            [id],
        )
    };
    insert("s1").unwrap();
    assert!(insert("s2").is_err());

    conn.execute("UPDATE sessions SET ended_at = 't' WHERE id = 's1'", []).unwrap();
    insert("s2").unwrap();
}
