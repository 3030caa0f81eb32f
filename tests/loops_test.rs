mod helpers;

use chrono::{Duration, Utc};
use hearth::loops::store::{auto_complete_commitment, pending_loops, recent_wins, write_loops, CompletionRule};
use hearth::loops::{LoopCandidate, LoopKind, LoopStatus};
use helpers::test_db;

fn candidate(kind: LoopKind, content: &str) -> LoopCandidate {
    LoopCandidate {
        kind,
        content: content.to_string(),
        dedupe_key: None,
        confidence: 0.9,
    }
}

#[test]
fn hedged_commitments_become_threads() {
    let mut conn = test_db();
    let now = Utc::now();
    write_loops(
        &mut conn,
        "u1",
        "p1",
        &[
            candidate(LoopKind::Commitment, "I might go for a walk"),
            candidate(LoopKind::Commitment, "I will walk at 7:30am tomorrow"),
        ],
        0.5,
        now,
    )
    .unwrap();

    let threads = pending_loops(&conn, "u1", "p1", Some(LoopKind::Thread)).unwrap();
    let commitments = pending_loops(&conn, "u1", "p1", Some(LoopKind::Commitment)).unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].content, "I might go for a walk");
    assert_eq!(commitments.len(), 1);
    assert_eq!(commitments[0].content, "I will walk at 7:30am tomorrow");
}

#[test]
fn reported_walk_completes_the_commitment() {
    let mut conn = test_db();
    let now = Utc::now();
    write_loops(&mut conn, "u1", "p1", &[candidate(LoopKind::Commitment, "Go for a walk")], 0.5, now).unwrap();

    let later = now + Duration::hours(3);
    // the judge may echo the report back as a commitment; it must not land
    let echo = write_loops(&mut conn, "u1", "p1", &[candidate(LoopKind::Commitment, "I did my walk today")], 0.5, later).unwrap();
    assert!(echo.written.is_empty());

    let (done, rule) = auto_complete_commitment(&conn, "u1", "p1", "I did my walk today", later)
        .unwrap()
        .unwrap();
    assert_eq!(rule, CompletionRule::KeywordMatch);
    assert_eq!(done.status, LoopStatus::Completed);
    assert!(done.completed_at.is_some());

    let wins = recent_wins(&conn, "u1", "p1", later - Duration::hours(48)).unwrap();
    assert_eq!(wins.len(), 1);
    assert_eq!(wins[0].id, done.id);

    let pending_walks: Vec<_> = pending_loops(&conn, "u1", "p1", Some(LoopKind::Commitment))
        .unwrap()
        .into_iter()
        .filter(|l| l.content.to_lowercase().contains("walk"))
        .collect();
    assert!(pending_walks.is_empty());

    // a second report finds nothing left to close
    assert!(auto_complete_commitment(&conn, "u1", "p1", "I did my walk today", later)
        .unwrap()
        .is_none());
}

#[test]
fn ambiguous_keyword_match_completes_nothing() {
    let mut conn = test_db();
    let now = Utc::now();
    write_loops(
        &mut conn,
        "u1",
        "p1",
        &[
            candidate(LoopKind::Commitment, "Walk the dog tonight"),
            candidate(LoopKind::Commitment, "Walk to the store tomorrow"),
        ],
        0.5,
        now,
    )
    .unwrap();
    assert!(auto_complete_commitment(&conn, "u1", "p1", "went for the walk", now).unwrap().is_none());
    assert_eq!(pending_loops(&conn, "u1", "p1", Some(LoopKind::Commitment)).unwrap().len(), 2);
}

#[test]
fn pending_loops_are_per_persona() {
    let mut conn = test_db();
    let now = Utc::now();
    write_loops(&mut conn, "u1", "p1", &[candidate(LoopKind::Friction, "Commute drains me")], 0.5, now).unwrap();
    assert!(pending_loops(&conn, "u1", "p2", None).unwrap().is_empty());
    assert!(pending_loops(&conn, "u2", "p1", None).unwrap().is_empty());
}
