use anyhow::Result;

use hearth::config::HearthConfig;
use hearth::context::TranscriptEntry;
use hearth::Engine;

/// Print the context block that would accompany `message` as a fresh turn.
pub async fn context(config: HearthConfig, owner: &str, persona: &str, message: &str, json: bool) -> Result<()> {
    let engine = Engine::open(config)?;
    let transcript = vec![TranscriptEntry::user(message)];
    let payload = engine.build_context(owner, persona, &transcript).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    if payload.is_empty() {
        println!("Nothing to inject for {owner}/{persona}.");
        return Ok(());
    }
    println!("{}", payload.render());
    Ok(())
}
