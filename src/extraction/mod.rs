//! The extraction judge: after each user turn, turn the recent message window
//! into durable memories and loops, then keep the per-pair state and
//! summaries current.
//!
//! Ordering within one run is fixed: memory writes, loop writes, commitment
//! auto-complete, state update, rolling summary, spine. [`run_extraction`]
//! never returns an error; failures are logged and recorded in session
//! diagnostics.

pub mod judge;
pub mod rolling;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::config::HearthConfig;
use crate::db::DbHandle;
use crate::loops::store::{auto_complete_commitment, write_loops, LoopWriteReport};
use crate::memory::store::{embed_memories, store_memory};
use crate::memory::truncate;
use crate::messages::recent_user_messages;
use crate::providers::{with_timeout, Providers};
use crate::session::state::update_state;

pub use judge::{parse_judge_output, sanitize_memories, JudgeOutput, MemoryCandidate};

/// Characters kept in `last_message_preview`.
pub const PREVIEW_CHARS: usize = 80;

/// One user turn handed to the judge.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub owner_id: String,
    pub persona_id: String,
    /// Display name of the persona; PROFILE facts naming it are dropped.
    pub persona_name: Option<String>,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize)]
pub struct ExtractionReport {
    pub window_size: usize,
    pub memories_written: Vec<String>,
    pub memories_merged: usize,
    pub memories_rejected: usize,
    pub embedded: usize,
    pub loops: LoopWriteReport,
    pub completed_loop: Option<String>,
    pub message_count: u64,
    pub rolling_refreshed: bool,
    pub spine_refreshed: bool,
}

/// Run the judge for one turn. Never fails: an error anywhere is logged and
/// stored as the extraction diagnostic, and whatever was written before it
/// stays written.
pub async fn run_extraction(
    db: &DbHandle,
    providers: &Providers,
    config: &Arc<HearthConfig>,
    turn: &TurnInput,
) -> ExtractionReport {
    match extract_turn(db, providers, config, turn).await {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(owner = %turn.owner_id, persona = %turn.persona_id, error = %format!("{e:#}"), "extraction failed");
            let (owner, persona) = (turn.owner_id.clone(), turn.persona_id.clone());
            let message = format!("{e:#}");
            let recorded = db
                .call(move |conn| {
                    let now = crate::clock::now();
                    update_state(conn, &owner, &persona, now, |s| {
                        s.state.diagnostics.extraction.failure(now, message);
                    })?;
                    Ok(())
                })
                .await;
            if let Err(e) = recorded {
                tracing::error!(error = %e, "could not record extraction failure");
            }
            ExtractionReport::default()
        }
    }
}

async fn extract_turn(
    db: &DbHandle,
    providers: &Providers,
    config: &Arc<HearthConfig>,
    turn: &TurnInput,
) -> Result<ExtractionReport> {
    let cfg = &config.extraction;
    let mut report = ExtractionReport::default();

    // 1. window
    let since = turn.at - Duration::minutes(cfg.window_minutes);
    let (owner, persona, fetch) = (turn.owner_id.clone(), turn.persona_id.clone(), cfg.window_fetch);
    let recent = db
        .call(move |conn| recent_user_messages(conn, &owner, &persona, since, fetch))
        .await?;
    let window = judge::build_window(&recent, cfg.window_cap);
    report.window_size = window.len();

    // 2. classify
    let output = match (&providers.classifier, window.is_empty()) {
        (Some(classifier), false) => {
            let prompt = judge::build_extraction_prompt(&window, turn.persona_name.as_deref());
            match with_timeout(
                config.providers.classify_timeout(),
                classifier.complete(&prompt, judge::EXTRACTION_SCHEMA_HINT),
            )
            .await
            {
                Ok(raw) => parse_judge_output(&raw),
                Err(e) => {
                    tracing::warn!(owner = %turn.owner_id, error = %e, "classifier unavailable, nothing extracted");
                    JudgeOutput::default()
                }
            }
        }
        _ => JudgeOutput::default(),
    };

    // 3. sanitize
    let (memories, rejected) = sanitize_memories(
        output.memories,
        &window,
        turn.persona_name.as_deref(),
        cfg.min_confidence,
    );
    report.memories_rejected = rejected;

    // 4. memory writes
    let owner = turn.owner_id.clone();
    let at = turn.at;
    let results = db
        .call(move |conn| {
            let mut results = Vec::with_capacity(memories.len());
            for m in memories {
                let result = store_memory(conn, &owner, m.memory_type, &m.content, &m.input, None, at)?;
                results.push((result, m.content));
            }
            Ok(results)
        })
        .await?;

    let mut created = Vec::new();
    for (result, content) in results {
        if result.merged {
            report.memories_merged += 1;
        } else {
            report.memories_written.push(result.id.clone());
            created.push((result.id, content));
        }
    }
    report.embedded = embed_memories(db, providers.embedder.as_ref(), config.providers.embed_timeout(), created).await;

    // 5-7. loops, then auto-complete against the raw turn
    let (owner, persona) = (turn.owner_id.clone(), turn.persona_id.clone());
    let text = turn.text.clone();
    let min_confidence = cfg.min_confidence;
    let loop_candidates = output.loops;
    let (loops, completed) = db
        .call(move |conn| {
            let report = write_loops(conn, &owner, &persona, &loop_candidates, min_confidence, at)?;
            let completed = auto_complete_commitment(conn, &owner, &persona, &text, at)?;
            Ok((report, completed))
        })
        .await?;
    report.loops = loops;
    report.completed_loop = completed.map(|(l, _)| l.id);

    // 8. state
    let (owner, persona) = (turn.owner_id.clone(), turn.persona_id.clone());
    let preview = truncate(turn.text.trim(), PREVIEW_CHARS);
    let state = db
        .call(move |conn| {
            update_state(conn, &owner, &persona, at, |s| {
                let bag = &mut s.state;
                bag.last_interaction = Some(crate::clock::format_ts(at));
                bag.message_count += 1;
                bag.last_message_preview = Some(preview);
                bag.spine_message_count += 1;
                bag.diagnostics.extraction.attempt(at);
                bag.diagnostics.extraction.success(at);
            })
        })
        .await?;
    report.message_count = state.state.message_count;

    // 9. rolling summary
    let every = cfg.rolling_every.max(1);
    if report.message_count % every == 0 {
        let limit = StdDuration::from_millis(cfg.rolling_timeout_ms);
        report.rolling_refreshed = rolling::refresh_rolling_summary(
            db,
            providers.classifier.as_ref(),
            config,
            &turn.owner_id,
            &turn.persona_id,
            limit,
        )
        .await?;
    }

    // 10. spine
    if state.state.summary_spine.is_none() || state.state.spine_message_count > cfg.spine_threshold {
        report.spine_refreshed = rolling::regenerate_spine(
            db,
            providers.classifier.as_ref(),
            config,
            &turn.owner_id,
            &turn.persona_id,
        )
        .await?;
    }

    tracing::info!(
        owner = %turn.owner_id,
        persona = %turn.persona_id,
        window = report.window_size,
        memories = report.memories_written.len(),
        merged = report.memories_merged,
        loops = report.loops.written.len(),
        completed = report.completed_loop.is_some(),
        "extraction done"
    );
    Ok(report)
}
