use anyhow::Result;

use hearth::config::HearthConfig;
use hearth::Engine;

/// Close stale sessions, then wait for their summaries and ingest to finish.
pub async fn close_stale(config: HearthConfig) -> Result<()> {
    let engine = Engine::open(config)?;
    let closed = engine.close_stale_sessions().await?;
    if closed.is_empty() {
        println!("No stale sessions.");
        return Ok(());
    }

    for session in &closed {
        println!(
            "  closed {} ({}/{}) {} → {}, {} turn(s)",
            session.id,
            session.owner_id,
            session.persona_id,
            session.started_at,
            session.ended_at.as_deref().unwrap_or("?"),
            session.turn_count,
        );
    }
    println!("Waiting for session summaries...");
    engine.wait_idle().await?;
    println!("Closed {} session(s).", closed.len());
    Ok(())
}
