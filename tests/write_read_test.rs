mod helpers;

use chrono::{Duration, Utc};
use hearth::config::RetrievalConfig;
use hearth::memory::search::{foundation_memories, search_memories};
use hearth::memory::store::{archive_memory, get_memory, seed_memory, store_memory};
use hearth::memory::types::MemoryType;
use helpers::{count, input, insert_embedded, test_db, test_embedding};

#[test]
fn seeded_name_absorbs_a_near_duplicate() {
    let mut conn = test_db();
    let now = Utc::now();

    let seeded = seed_memory(
        &mut conn,
        "u1",
        MemoryType::Profile,
        "Name is Mukesh",
        &["person:mukesh".to_string()],
        None,
        now,
    )
    .unwrap();
    assert!(!seeded.merged);

    let second = store_memory(
        &mut conn,
        "u1",
        MemoryType::Profile,
        "My name is Makesh",
        &input("extraction", &["Person: Mukesh"], Some(2)),
        None,
        now + Duration::minutes(1),
    )
    .unwrap();
    assert!(second.merged);
    assert_eq!(second.id, seeded.id);

    assert_eq!(count(&conn, "SELECT COUNT(*) FROM memories"), 1);
    let memory = get_memory(&conn, &seeded.id).unwrap().unwrap();
    assert_eq!(memory.content, "Name is Mukesh");
    assert_eq!(memory.metadata.entity_refs, vec!["person:mukesh".to_string()]);
    assert_eq!(memory.metadata.importance, 3);
    assert_eq!(memory.metadata.mention_count, 2);
    assert!(memory.metadata.pinned);
}

#[test]
fn merge_unions_refs_and_keeps_the_max_importance() {
    let mut conn = test_db();
    let now = Utc::now();
    let first = store_memory(
        &mut conn,
        "u1",
        MemoryType::People,
        "Asha is my sister",
        &input("extraction", &["person:asha"], Some(2)),
        None,
        now,
    )
    .unwrap();
    // different wording, same entity and type: same key
    store_memory(
        &mut conn,
        "u1",
        MemoryType::People,
        "my sister Asha lives in Pune",
        &input("extraction", &["person:asha", "place:pune"], Some(1)),
        None,
        now,
    )
    .unwrap();

    let memory = get_memory(&conn, &first.id).unwrap().unwrap();
    assert_eq!(
        memory.metadata.entity_refs,
        vec!["person:asha".to_string(), "place:pune".to_string()]
    );
    assert_eq!(memory.metadata.importance, 2);
    assert_eq!(memory.metadata.mention_count, 2);
}

#[test]
fn owners_do_not_share_keys() {
    let mut conn = test_db();
    let now = Utc::now();
    let a = store_memory(&mut conn, "u1", MemoryType::Project, "Building a kiln", &input("extraction", &[], None), None, now).unwrap();
    let b = store_memory(&mut conn, "u2", MemoryType::Project, "Building a kiln", &input("extraction", &[], None), None, now).unwrap();
    assert_ne!(a.id, b.id);
    assert!(!b.merged);
}

#[test]
fn empty_content_is_rejected() {
    let mut conn = test_db();
    let result = store_memory(&mut conn, "u1", MemoryType::Profile, "   ", &input("extraction", &[], None), None, Utc::now());
    assert!(result.is_err());
}

#[test]
fn search_finds_the_closest_embedding_and_skips_archived() {
    let mut conn = test_db();
    let now = Utc::now();
    let kiln = insert_embedded(&mut conn, "u1", MemoryType::Project, "Repairing the kiln", &[], &test_embedding(3), now);
    let garden = insert_embedded(&mut conn, "u1", MemoryType::Project, "Planting tomatoes", &[], &test_embedding(9), now);
    let config = RetrievalConfig::default();

    let results = search_memories(&conn, "u1", Some("p1"), &test_embedding(3), 5, &config, now).unwrap();
    assert_eq!(results[0].memory.id, kiln);
    assert!((results[0].similarity - 1.0).abs() < 1e-4);

    assert!(archive_memory(&conn, &kiln, "dedupe", None, now).unwrap());
    let results = search_memories(&conn, "u1", Some("p1"), &test_embedding(3), 5, &config, now).unwrap();
    assert!(results.iter().all(|r| r.memory.id != kiln));
    assert!(results.iter().any(|r| r.memory.id == garden));

    // archival is a flag, never a delete
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM memories"), 2);
    assert!(!archive_memory(&conn, &kiln, "dedupe", None, now).unwrap());
}

#[test]
fn persona_scope_hides_other_personas() {
    let mut conn = test_db();
    let now = Utc::now();
    let id = store_memory(
        &mut conn,
        "u1",
        MemoryType::Profile,
        "Likes being called captain",
        &input("extraction", &[], None),
        Some("p2"),
        now,
    )
    .unwrap()
    .id;
    hearth::memory::store::attach_embedding(&mut conn, &id, &test_embedding(5)).unwrap();
    let config = RetrievalConfig::default();

    let for_p1 = search_memories(&conn, "u1", Some("p1"), &test_embedding(5), 5, &config, now).unwrap();
    assert!(for_p1.is_empty());
    let for_p2 = search_memories(&conn, "u1", Some("p2"), &test_embedding(5), 5, &config, now).unwrap();
    assert_eq!(for_p2.len(), 1);
}

#[test]
fn foundation_is_pinned_only() {
    let mut conn = test_db();
    let now = Utc::now();
    seed_memory(&mut conn, "u1", MemoryType::Profile, "Works night shifts", &[], None, now).unwrap();
    store_memory(&mut conn, "u1", MemoryType::Profile, "Had pasta", &input("extraction", &[], Some(3)), None, now).unwrap();

    let foundation = foundation_memories(&conn, "u1", Some("p1"), 20).unwrap();
    assert_eq!(foundation.len(), 1);
    assert_eq!(foundation[0].content, "Works night shifts");
}
