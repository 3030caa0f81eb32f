use anyhow::Result;

use hearth::config::HearthConfig;
use hearth::Engine;

pub async fn curate(config: HearthConfig, owner: &str, persona: &str) -> Result<()> {
    let engine = Engine::open(config)?;
    let outcome = engine.curate_now(owner, persona).await?;
    println!(
        "Curated {owner}/{persona}: {} archived, {} fold(s) in {} ms.",
        outcome.archived, outcome.folds, outcome.elapsed_ms
    );
    Ok(())
}
