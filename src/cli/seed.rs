use anyhow::{anyhow, Result};

use hearth::config::HearthConfig;
use hearth::memory::types::MemoryType;
use hearth::Engine;

/// Store a pinned fact and embed it right away. If the embedding provider is
/// down the fact is still stored and picked up by `backfill`.
pub async fn seed(
    config: HearthConfig,
    owner: &str,
    memory_type: &str,
    content: &str,
    refs: &[String],
    persona: Option<&str>,
) -> Result<()> {
    let memory_type: MemoryType = memory_type.parse().map_err(|e: String| anyhow!(e))?;
    let engine = Engine::open(config)?;

    let (result, embedded) = engine.seed(owner, memory_type, content, refs, persona).await?;
    if result.merged {
        println!("Merged into {} (mentions: {}).", result.id, result.mention_count);
    } else {
        println!("Seeded {} as {}.", result.id, result.memory_type);
    }
    println!("  key: {}", result.memory_key);
    if !embedded {
        println!("  not embedded yet; run `hearth backfill` once the provider is reachable");
    }
    Ok(())
}
