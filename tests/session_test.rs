mod helpers;

use chrono::{Duration, TimeZone, Utc};
use hearth::clock::format_ts;
use hearth::messages::{record_message, Role};
use hearth::session::lifecycle::{
    close_all_stale_sessions, ensure_active_session, open_session, session_messages,
};
use helpers::{count, test_db};

const WINDOW_SECS: i64 = 300;

fn window() -> Duration {
    Duration::seconds(WINDOW_SECS)
}

fn turn(conn: &mut rusqlite::Connection, owner: &str, persona: &str, at: chrono::DateTime<Utc>) -> hearth::session::lifecycle::EnsureOutcome {
    let outcome = ensure_active_session(conn, owner, persona, window(), at).unwrap();
    record_message(conn, owner, persona, Some(&outcome.session.id), Role::User, "hi", at).unwrap();
    outcome
}

#[test]
fn turns_inside_the_window_share_a_session() {
    let mut conn = test_db();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

    let first = turn(&mut conn, "u1", "p1", t0);
    assert!(first.created);
    assert!(first.closed.is_none());

    let second = turn(&mut conn, "u1", "p1", t0 + Duration::seconds(120));
    assert!(!second.created);
    assert_eq!(second.session.id, first.session.id);
    assert_eq!(second.session.turn_count, 2);
    assert_eq!(second.session.last_activity_at, format_ts(t0 + Duration::seconds(120)));
}

#[test]
fn idle_gap_closes_at_last_activity_and_opens_a_new_session() {
    let mut conn = test_db();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    let first = turn(&mut conn, "u1", "p1", t0);
    turn(&mut conn, "u1", "p1", t0 + Duration::seconds(60));

    let later = t0 + Duration::hours(2);
    let next = turn(&mut conn, "u1", "p1", later);
    assert!(next.created);
    assert_ne!(next.session.id, first.session.id);

    let closed = next.closed.unwrap();
    assert_eq!(closed.id, first.session.id);
    // the idle gap is not counted
    assert_eq!(closed.ended_at.as_deref(), Some(format_ts(t0 + Duration::seconds(60)).as_str()));
    assert!(closed.ended_at.as_deref().unwrap() >= closed.started_at.as_str());
}

#[test]
fn exactly_one_open_session_per_pair() {
    let mut conn = test_db();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    let gaps = [10, 400, 30, 30, 900, 5, 301, 299, 1];
    let mut at = t0;
    for gap in gaps {
        at += Duration::seconds(gap);
        turn(&mut conn, "u1", "p1", at);
        turn(&mut conn, "u1", "p2", at);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM sessions WHERE owner_id = 'u1' AND persona_id = 'p1' AND ended_at IS NULL"),
            1
        );
    }
    // every closed session ends no earlier than it started
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM sessions WHERE ended_at < started_at"), 0);
}

#[test]
fn sweep_closes_only_stale_pairs() {
    let mut conn = test_db();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    turn(&mut conn, "u1", "p1", t0);
    turn(&mut conn, "u2", "p1", t0 + Duration::seconds(WINDOW_SECS * 2));

    let now = t0 + Duration::seconds(WINDOW_SECS * 2 + 10);
    let closed = close_all_stale_sessions(&mut conn, window(), now).unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].owner_id, "u1");
    assert!(open_session(&conn, "u1", "p1").unwrap().is_none());
    assert!(open_session(&conn, "u2", "p1").unwrap().is_some());

    // sweeping again is a no-op
    assert!(close_all_stale_sessions(&mut conn, window(), now).unwrap().is_empty());
}

#[test]
fn session_messages_include_the_last_reply() {
    let mut conn = test_db();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    let first = turn(&mut conn, "u1", "p1", t0);
    record_message(&conn, "u1", "p1", Some(&first.session.id), Role::Assistant, "hello!", t0 + Duration::seconds(1)).unwrap();
    let next = turn(&mut conn, "u1", "p1", t0 + Duration::hours(1));

    let closed = next.closed.unwrap();
    let messages = session_messages(&conn, &closed).unwrap();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert!(session_messages(&conn, &next.session).unwrap().iter().all(|m| m.created_at > closed.started_at));
}
