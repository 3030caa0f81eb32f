//! CLI `backfill` command: embed memories written while the embedding
//! provider was unavailable.

use anyhow::{Context, Result};

use hearth::config::HearthConfig;
use hearth::db;
use hearth::memory::store::{attach_embedding, memories_missing_embeddings};
use hearth::providers::http::OpenAiClient;
use hearth::providers::Embedder;

pub async fn backfill(config: &HearthConfig, limit: usize) -> Result<()> {
    let db_path = config.resolved_db_path();
    let mut conn = db::open_database(&db_path).context("failed to open database")?;

    let client = OpenAiClient::new(&config.providers).context("failed to create embedding client")?;

    let pending = memories_missing_embeddings(&conn, limit)?;
    let total = pending.len();
    if total == 0 {
        println!("Every active memory has an embedding.");
        return Ok(());
    }

    println!("Embedding {total} memories with model '{}'...", config.providers.embedding_model);
    let pb = super::progress_bar(total as u64);

    let mut failed = 0usize;
    for (id, content) in pending {
        match client.embed(&content).await {
            Ok(vector) => {
                if let Err(e) = attach_embedding(&mut conn, &id, &vector) {
                    tracing::warn!(memory_id = %id, error = %e, "embedding rejected");
                    failed += 1;
                }
            }
            Err(e) => {
                tracing::warn!(memory_id = %id, error = %e, "embedding request failed");
                failed += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    db::migrations::set_embedding_model(&conn, &config.providers.embedding_model)?;
    println!("Embedded {} of {total} memories.", total - failed);
    Ok(())
}
