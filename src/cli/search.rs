use anyhow::{Context, Result};

use hearth::config::HearthConfig;
use hearth::memory::search::search_memories;
use hearth::providers::http::OpenAiClient;
use hearth::providers::Embedder;

/// Run a semantic search from the terminal.
pub async fn search(config: &HearthConfig, owner: &str, persona: &str, query: &str, limit: usize) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = hearth::db::open_database(&db_path)?;

    let client = OpenAiClient::new(&config.providers)?;
    let query_embedding = client
        .embed(query)
        .await
        .context("failed to embed query")?;

    let results = search_memories(
        &conn,
        owner,
        Some(persona),
        &query_embedding,
        limit,
        &config.retrieval,
        hearth::clock::now(),
    )?;

    if results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s)\n", results.len());
    for (i, scored) in results.iter().enumerate() {
        let m = &scored.memory;
        println!(
            "  {}. [{}] {} (score: {:.4}, sim: {:.3}, recency: {:.3}, freq: {:.3})",
            i + 1,
            m.memory_type,
            super::preview(&m.content, 120),
            scored.score,
            scored.similarity,
            scored.recency,
            scored.frequency,
        );
        if !m.metadata.entity_refs.is_empty() {
            println!("     refs: {}", m.metadata.entity_refs.join(", "));
        }
        println!("     id: {}  mentions: {}", m.id, m.metadata.mention_count);
    }

    Ok(())
}
