mod helpers;

use chrono::{Duration, Utc};
use hearth::config::CuratorConfig;
use hearth::curator::{fold_pass, Curator, SkipReason};
use hearth::db::DbHandle;
use hearth::memory::search::{active_memories, foundation_memories};
use hearth::memory::store::{get_memory, has_embedding, seed_memory, store_memory};
use hearth::memory::types::{MemoryInput, MemoryType};
use hearth::providers::Embedder;
use hearth::session::state::load_state;
use helpers::{count, test_db, FailingEmbedder, WordEmbedder};
use std::sync::Arc;

fn observe(conn: &mut rusqlite::Connection, content: &str, person: &str, at: chrono::DateTime<Utc>) {
    let input = MemoryInput {
        source: "extraction".into(),
        entity_refs: vec![format!("person:{person}")],
        ..Default::default()
    };
    store_memory(conn, "u1", MemoryType::People, content, &input, None, at).unwrap();
}

fn pile(conn: &mut rusqlite::Connection) {
    // distinct refs keep the keys apart, the shared label groups them
    for (i, fact) in ["Priya is my boss", "Priya prefers email", "Priya is strict about deadlines"]
        .iter()
        .enumerate()
    {
        let input = MemoryInput {
            source: "extraction".into(),
            entity_refs: vec![format!("person:priya_{i}")],
            entity_label: Some("Priya".into()),
            ..Default::default()
        };
        store_memory(conn, "u1", MemoryType::People, fact, &input, Some("p1"), Utc::now() - Duration::hours(1)).unwrap();
    }
}

#[tokio::test]
async fn run_folds_archives_and_embeds() {
    let mut conn = test_db();
    pile(&mut conn);
    observe(&mut conn, "Tom fixes bikes", "tom", Utc::now() - Duration::hours(1));
    let before = count(&conn, "SELECT COUNT(*) FROM memories");
    let db = DbHandle::new(conn);
    let embedder: Arc<dyn Embedder> = Arc::new(WordEmbedder);
    let curator = Curator::new(CuratorConfig::default(), Some(embedder), std::time::Duration::from_millis(200));

    let outcome = curator.run(&db, "u1", "p1", Utc::now(), true).await.unwrap();
    assert!(!outcome.skipped);
    assert_eq!(outcome.folds, 1);
    assert_eq!(outcome.archived, 3);

    let (active, total, fold_embedded, state) = db
        .call(|conn| {
            let active = active_memories(conn, "u1")?;
            let total = count(conn, "SELECT COUNT(*) FROM memories");
            let fold = active.iter().find(|m| m.metadata.is_fold()).cloned();
            let embedded = match fold {
                Some(f) => has_embedding(conn, &f.id)?,
                None => false,
            };
            Ok((active, total, embedded, load_state(conn, "u1", "p1")?))
        })
        .await
        .unwrap();

    // nothing is deleted: three sources archived, one fold added
    assert_eq!(total, before + 1);
    assert_eq!(active.len(), 2);
    let fold = active.iter().find(|m| m.metadata.is_fold()).unwrap();
    assert!(fold.content.starts_with("Priya: Priya is my boss"));
    assert_eq!(fold.persona_scope.as_deref(), Some("p1"));
    assert_eq!(fold.metadata.mention_count, 3);
    assert_eq!(fold.metadata.folded_from.len(), 3);
    assert!(fold_embedded);

    assert!(state.state.curator.last_run_at.is_some());
    assert_eq!(state.state.curator.last_memory_count_at_run, 2);
    assert!(state.state.diagnostics.curator.last_success_at.is_some());
}

#[tokio::test]
async fn embedding_failure_keeps_the_fold() {
    let mut conn = test_db();
    pile(&mut conn);
    let db = DbHandle::new(conn);
    let embedder: Arc<dyn Embedder> = Arc::new(FailingEmbedder);
    let curator = Curator::new(CuratorConfig::default(), Some(embedder), std::time::Duration::from_millis(200));

    let outcome = curator.run(&db, "u1", "p1", Utc::now(), true).await.unwrap();
    assert_eq!(outcome.folds, 1);
    let folds = db
        .call(|conn| Ok(count(conn, "SELECT COUNT(*) FROM memories WHERE json_extract(metadata, '$.source') = 'curated_fold'")))
        .await
        .unwrap();
    assert_eq!(folds, 1);
}

#[tokio::test]
async fn auto_trigger_respects_cooldown_then_due_rules() {
    let db = DbHandle::new(test_db());
    let config = CuratorConfig {
        cooldown_secs: 60,
        new_memory_threshold: 2,
        ..Default::default()
    };
    let curator = Curator::new(config, None, std::time::Duration::from_millis(100));
    let t0 = Utc::now();

    assert!(!curator.auto_curate_maybe(&db, "u1", "p1", t0).await.unwrap().skipped);
    let burst = curator.auto_curate_maybe(&db, "u1", "p1", t0 + Duration::seconds(5)).await.unwrap();
    assert_eq!(burst.reason, Some(SkipReason::Cooldown));

    // the cooldown is per pair
    assert!(!curator.auto_curate_maybe(&db, "u1", "p2", t0 + Duration::seconds(5)).await.unwrap().skipped);

    db.call(move |conn| {
        observe(conn, "Lena sings in a choir", "lena", t0 + Duration::seconds(30));
        observe(conn, "Omar coaches football", "omar", t0 + Duration::seconds(31));
        Ok(())
    })
    .await
    .unwrap();
    // enough new memories since the last run makes it due again
    let later = curator.auto_curate_maybe(&db, "u1", "p1", t0 + Duration::seconds(120)).await.unwrap();
    assert!(!later.skipped);
}

#[test]
fn seeded_fact_survives_merges_and_folds() {
    let mut conn = test_db();
    let t0 = Utc::now() - Duration::hours(2);
    let seeded = seed_memory(&mut conn, "u1", MemoryType::People, "Asha is my sister", &["person:asha".into()], None, t0)
        .unwrap()
        .id;
    // extraction restates the same person and merges into the seeded row
    observe(&mut conn, "Asha is my sister", "asha", t0 + Duration::minutes(1));
    for (i, fact) in ["Asha lives in Pune", "Asha teaches maths"].iter().enumerate() {
        let input = MemoryInput {
            source: "extraction".into(),
            entity_refs: vec![format!("person:asha_{i}")],
            entity_label: Some("Asha".into()),
            ..Default::default()
        };
        store_memory(&mut conn, "u1", MemoryType::People, fact, &input, None, t0 + Duration::minutes(2)).unwrap();
    }

    let merged = get_memory(&conn, &seeded).unwrap().unwrap();
    assert_eq!(merged.metadata.mention_count, 2);
    assert_eq!(merged.metadata.source, "seed");
    assert!(merged.metadata.pinned);

    // two foldable rows are below the group minimum once the seed is excluded
    let folds = fold_pass(&conn, "u1", &CuratorConfig::default(), Utc::now()).unwrap();
    assert!(folds.is_empty());
    assert!(!get_memory(&conn, &seeded).unwrap().unwrap().metadata.is_archived());
    assert_eq!(foundation_memories(&conn, "u1", Some("p1"), 20).unwrap().len(), 1);
}
