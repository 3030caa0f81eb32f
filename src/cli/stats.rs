use anyhow::Result;

use hearth::config::HearthConfig;
use hearth::loops::{LoopKind, LoopStatus};
use hearth::memory::types::MemoryType;

/// Display store statistics in the terminal.
pub fn stats(config: &HearthConfig, owner: Option<&str>) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = hearth::db::open_database(&db_path)?;

    let response = hearth::memory::stats::engine_stats(&conn, owner, Some(&db_path))?;

    println!("Hearth Statistics");
    println!("{}", "=".repeat(40));
    println!("  Total memories:      {}", response.total_memories);
    println!("  Active:              {}", response.active_memories);
    println!("  Archived:            {}", response.archived_memories);
    println!("  Pinned:              {}", response.pinned_memories);
    println!("  Missing embeddings:  {}", response.missing_embeddings);
    println!();

    println!("By Type:");
    for t in MemoryType::ALL {
        let count = response.by_type.get(t.as_str()).copied().unwrap_or(0);
        println!("  {:<12} {}", t.as_str(), count);
    }
    println!();

    println!("Loops:");
    for kind in LoopKind::ALL {
        let pending = response
            .loops
            .get(&format!("{}/{}", kind.as_str(), LoopStatus::Pending.as_str()))
            .copied()
            .unwrap_or(0);
        let completed = response
            .loops
            .get(&format!("{}/{}", kind.as_str(), LoopStatus::Completed.as_str()))
            .copied()
            .unwrap_or(0);
        println!("  {:<12} {pending} pending, {completed} completed", kind.as_str());
    }
    println!();

    println!("Sessions:              {} open, {} closed", response.open_sessions, response.closed_sessions);
    println!("Session summaries:     {}", response.session_summaries);
    println!("Database size:         {} bytes", response.db_size_bytes);

    if let Some(ref oldest) = response.oldest_memory {
        println!("Oldest memory:         {oldest}");
    }
    if let Some(ref newest) = response.newest_memory {
        println!("Newest memory:         {newest}");
    }

    Ok(())
}
