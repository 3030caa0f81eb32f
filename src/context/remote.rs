//! Context from the continuity service, mapped into the local payload shape.

use std::sync::Arc;

use super::{is_session_start, query_of, ContextMemory, ContextPayload, ContextSource, TranscriptEntry};
use crate::config::HearthConfig;
use crate::memory::types::MemoryType;
use crate::providers::{with_timeout, ContinuityClient, ProviderError, RemoteContext, RemoteMemory};

fn map_memories(remote: Vec<RemoteMemory>) -> Vec<ContextMemory> {
    remote
        .into_iter()
        .filter_map(|m| {
            let Ok(memory_type) = m.memory_type.parse::<MemoryType>() else {
                tracing::debug!(memory_type = %m.memory_type, "dropping remote memory of unknown type");
                return None;
            };
            Some(ContextMemory {
                id: m.id,
                memory_type,
                content: m.content,
            })
        })
        .filter(|m| !m.content.trim().is_empty())
        .collect()
}

/// Map a service response and re-apply local caps. An entirely empty
/// response counts as no answer.
pub fn from_remote(remote: RemoteContext, session_start: bool, config: &HearthConfig) -> Option<ContextPayload> {
    let mut payload = ContextPayload {
        foundation: map_memories(remote.foundation),
        relevant: map_memories(remote.relevant),
        entity_cards: remote.entity_cards,
        commitments: remote.commitments,
        threads: remote.threads,
        frictions: remote.frictions,
        habits: remote.habits,
        recent_wins: remote.recent_wins,
        rolling_summary: remote.rolling_summary,
        session_summary: remote.session_summary,
        session_start,
        source: ContextSource::Remote,
    };
    payload.enforce_caps(&config.context);
    (!payload.is_empty()).then_some(payload)
}

pub async fn fetch_remote_context(
    client: &Arc<dyn ContinuityClient>,
    config: &HearthConfig,
    owner_id: &str,
    persona_id: &str,
    transcript: &[TranscriptEntry],
) -> Result<Option<ContextPayload>, ProviderError> {
    let session_start = is_session_start(transcript);
    let request = crate::providers::RemoteContextRequest {
        owner_id: owner_id.to_string(),
        persona_id: persona_id.to_string(),
        query: query_of(transcript).map(str::to_string),
        session_start,
    };
    let remote = with_timeout(
        config.providers.remote_context_timeout(),
        client.fetch_context(&request),
    )
    .await?;
    Ok(remote.and_then(|r| from_remote(r, session_start, config)))
}
