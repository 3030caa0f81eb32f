//! Forwarding closed sessions to the continuity service, with tracing of
//! every attempt for alerting.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Instant;

use super::lifecycle::{session_messages, Session};
use super::state::{update_state, ContinuityDiagnostics, IngestTrace};
use crate::clock::{format_ts, parse_ts};
use crate::config::HearthConfig;
use crate::db::DbHandle;
use crate::providers::{with_timeout, ContinuityClient, IngestRequest, IngestWindow, ProviderError};

/// How long a continuity failure keeps the alert raised.
pub const FAILURE_WINDOW_HOURS: i64 = 24;

/// Append a trace and drop failure timestamps older than the alert window.
/// Returns the rolling failure count.
pub fn record_trace(diag: &mut ContinuityDiagnostics, trace: IngestTrace, now: DateTime<Utc>) -> usize {
    let cutoff = now - Duration::hours(FAILURE_WINDOW_HOURS);
    diag.failures
        .retain(|ts| parse_ts(ts).is_some_and(|t| t >= cutoff));
    if !trace.ok {
        diag.failures.push(trace.at.clone());
    }
    diag.last_trace = Some(trace);
    diag.failures.len()
}

/// Send the session's messages to the continuity service. The outcome is
/// traced into session diagnostics whether or not the call succeeds; only
/// storage errors are returned.
pub async fn ingest_session(
    db: DbHandle,
    client: Arc<dyn ContinuityClient>,
    config: Arc<HearthConfig>,
    session: Session,
) -> Result<()> {
    let messages = {
        let session = session.clone();
        db.call(move |conn| session_messages(conn, &session)).await?
    };
    let request = IngestRequest {
        session_id: session.id.clone(),
        owner_id: session.owner_id.clone(),
        persona_id: session.persona_id.clone(),
        messages,
        window: IngestWindow {
            started_at: session.started_at.clone(),
            ended_at: session
                .ended_at
                .clone()
                .unwrap_or_else(|| format_ts(crate::clock::now())),
        },
    };

    let started = Instant::now();
    let result = with_timeout(config.providers.ingest_timeout(), client.ingest(&request)).await;
    let ms = started.elapsed().as_millis() as u64;

    let trace = match &result {
        Ok(ack) => IngestTrace {
            session_id: session.id.clone(),
            status: Some(ack.status),
            ms,
            ok: true,
            error: None,
            at: format_ts(crate::clock::now()),
        },
        Err(e) => IngestTrace {
            session_id: session.id.clone(),
            status: match e {
                ProviderError::Http { status, .. } => Some(*status),
                _ => None,
            },
            ms,
            ok: false,
            error: Some(e.to_string()),
            at: format_ts(crate::clock::now()),
        },
    };

    let owner = session.owner_id.clone();
    let persona = session.persona_id.clone();
    let ok = trace.ok;
    let failures = db
        .call(move |conn| {
            let now = crate::clock::now();
            let mut count = 0;
            update_state(conn, &owner, &persona, now, |s| {
                count = record_trace(&mut s.state.diagnostics.continuity, trace, now);
            })?;
            Ok(count)
        })
        .await?;

    if ok {
        tracing::info!(session_id = %session.id, ms, "session forwarded to continuity");
    } else {
        tracing::warn!(session_id = %session.id, ms, "continuity ingest failed");
    }
    if failures > 0 {
        tracing::warn!(
            owner = %session.owner_id,
            persona = %session.persona_id,
            failures_24h = failures,
            "continuity ingest failures in the last 24h"
        );
    }
    Ok(())
}
