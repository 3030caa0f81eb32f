//! Rolling summary (short, refreshed every few turns) and the summary spine
//! (long-form, fixed four-section digest).

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::config::HearthConfig;
use crate::db::DbHandle;
use crate::memory::truncate;
use crate::messages::{recent_messages, Message};
use crate::providers::{with_timeout, ProviderError, TextClassifier};
use crate::session::state::{load_state, update_state};

/// Messages fed to the rolling summary.
pub const ROLLING_INPUT_MESSAGES: usize = 12;

/// Messages fed to a spine regeneration.
pub const SPINE_INPUT_MESSAGES: usize = 40;

pub const SPINE_SECTIONS: [&str; 4] = ["## Identity", "## Ongoing", "## People", "## Open threads"];

pub const ROLLING_SCHEMA_HINT: &str = "Write a short running digest of this conversation in plain prose, \
at most five sentences. Focus on what the user is dealing with right now. No JSON, no headings.";

pub const SPINE_SCHEMA_HINT: &str = "Maintain a long-form digest of what is known about the user. \
Output exactly these four markdown sections, in order, each with short bullet points:\n\
## Identity\n## Ongoing\n## People\n## Open threads\n\
Do not describe emotions or moods. Do not mention the assistant, this conversation, prompts, \
models or any system behaviour. Only state facts the user has shared.";

fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_rolling_prompt(previous: Option<&str>, messages: &[Message]) -> String {
    let mut prompt = String::new();
    if let Some(previous) = previous.filter(|p| !p.trim().is_empty()) {
        prompt.push_str("Previous digest:\n");
        prompt.push_str(previous.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str("Latest messages:\n");
    prompt.push_str(&transcript(messages));
    prompt
}

pub fn build_spine_prompt(previous: Option<&str>, messages: &[Message]) -> String {
    let mut prompt = String::new();
    if let Some(previous) = previous.filter(|p| !p.trim().is_empty()) {
        prompt.push_str("Current digest, update it:\n");
        prompt.push_str(previous.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str("Conversation:\n");
    prompt.push_str(&transcript(messages));
    prompt
}

/// Accept a spine only when all four sections are present in order.
pub fn validate_spine(raw: &str) -> Option<String> {
    let text = raw.trim();
    let mut cursor = 0;
    for section in SPINE_SECTIONS {
        let at = text[cursor..].find(section)?;
        cursor += at + section.len();
    }
    let start = text.find(SPINE_SECTIONS[0])?;
    Some(text[start..].trim_end().to_string())
}

/// Refresh the rolling summary under `limit`. Attempt, success and error are
/// recorded in diagnostics regardless of outcome. Returns whether a new
/// summary was stored.
pub async fn refresh_rolling_summary(
    db: &DbHandle,
    classifier: Option<&Arc<dyn TextClassifier>>,
    config: &HearthConfig,
    owner_id: &str,
    persona_id: &str,
    limit: Duration,
) -> Result<bool> {
    let (owner, persona) = (owner_id.to_string(), persona_id.to_string());
    let (previous, messages) = db
        .call(move |conn| {
            let state = load_state(conn, &owner, &persona)?;
            let messages = recent_messages(conn, &owner, &persona, ROLLING_INPUT_MESSAGES)?;
            Ok((state.rolling_summary, messages))
        })
        .await?;

    let outcome: Result<String, ProviderError> = match classifier {
        None => Err(ProviderError::Unavailable("no completion provider".into())),
        Some(_) if messages.is_empty() => Err(ProviderError::Malformed("no messages to summarize".into())),
        Some(classifier) => {
            let prompt = build_rolling_prompt(previous.as_deref(), &messages);
            with_timeout(limit, classifier.complete(&prompt, ROLLING_SCHEMA_HINT)).await
        }
    };
    let max_chars = config.extraction.rolling_summary_chars;
    let outcome = outcome.and_then(|text| {
        let text = text.trim();
        if text.is_empty() {
            Err(ProviderError::Malformed("empty rolling summary".into()))
        } else {
            Ok(truncate(text, max_chars))
        }
    });

    if let Err(e) = &outcome {
        tracing::warn!(owner = owner_id, persona = persona_id, error = %e, "rolling summary refresh failed");
    }
    let stored = outcome.is_ok();
    let (owner, persona) = (owner_id.to_string(), persona_id.to_string());
    db.call(move |conn| {
        let now = crate::clock::now();
        update_state(conn, &owner, &persona, now, |s| {
            let log = &mut s.state.diagnostics.rolling_summary;
            log.attempt(now);
            match outcome {
                Ok(summary) => {
                    s.rolling_summary = Some(summary);
                    log.success(now);
                }
                Err(e) => log.failure(now, e.to_string()),
            }
        })?;
        Ok(())
    })
    .await?;
    Ok(stored)
}

/// Regenerate the summary spine. A reply missing any section is rejected and
/// the previous spine is kept. A failure sets a retry backoff in diagnostics
/// and no call is made until it expires. Returns whether a new spine was
/// stored.
pub async fn regenerate_spine(
    db: &DbHandle,
    classifier: Option<&Arc<dyn TextClassifier>>,
    config: &HearthConfig,
    owner_id: &str,
    persona_id: &str,
) -> Result<bool> {
    let Some(classifier) = classifier else {
        return Ok(false);
    };
    let (owner, persona) = (owner_id.to_string(), persona_id.to_string());
    let (previous, messages, log) = db
        .call(move |conn| {
            let state = load_state(conn, &owner, &persona)?;
            let messages = recent_messages(conn, &owner, &persona, SPINE_INPUT_MESSAGES)?;
            Ok((state.state.summary_spine, messages, state.state.diagnostics.summary_spine))
        })
        .await?;
    if messages.is_empty() {
        return Ok(false);
    }
    if log.backing_off(crate::clock::now()) {
        tracing::debug!(
            owner = owner_id,
            persona = persona_id,
            retry_after = log.retry_after.as_deref().unwrap_or_default(),
            "summary spine retry deferred"
        );
        return Ok(false);
    }

    let prompt = build_spine_prompt(previous.as_deref(), &messages);
    let outcome = with_timeout(
        config.providers.completion_timeout(),
        classifier.complete(&prompt, SPINE_SCHEMA_HINT),
    )
    .await
    .and_then(|raw| {
        validate_spine(&raw).ok_or_else(|| ProviderError::Malformed("spine is missing required sections".into()))
    });

    if let Err(e) = &outcome {
        tracing::warn!(owner = owner_id, persona = persona_id, error = %e, "summary spine regeneration failed");
    }
    let stored = outcome.is_ok();
    let (owner, persona) = (owner_id.to_string(), persona_id.to_string());
    let retry = Duration::from_secs(config.extraction.spine_retry_secs);
    let retry_max = Duration::from_secs(config.extraction.spine_retry_max_secs);
    db.call(move |conn| {
        let now = crate::clock::now();
        update_state(conn, &owner, &persona, now, |s| {
            let log = &mut s.state.diagnostics.summary_spine;
            log.attempt(now);
            match outcome {
                Ok(spine) => {
                    s.state.summary_spine = Some(spine);
                    s.state.spine_message_count = 0;
                    log.success(now);
                }
                Err(e) => {
                    log.failure(now, e.to_string());
                    log.back_off(now, retry, retry_max);
                }
            }
        })?;
        Ok(())
    })
    .await?;
    if stored {
        tracing::info!(owner = owner_id, persona = persona_id, "summary spine regenerated");
    }
    Ok(stored)
}
