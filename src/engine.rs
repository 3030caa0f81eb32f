//! The per-turn facade.
//!
//! A user turn runs synchronously through session bookkeeping and message
//! logging, then hands the rest to the background graph:
//! extraction → curator trigger, plus ingest and summary for any session the
//! turn closed. Background failures come back over the supervisor channel and
//! are folded into session diagnostics by [`Engine::flush_diagnostics`].

use anyhow::Result;
use chrono::Duration;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::config::HearthConfig;
use crate::context::{build_context, ContextPayload, TranscriptEntry};
use crate::curator::{CurateOutcome, Curator};
use crate::db::{self, DbHandle};
use crate::extraction::{run_extraction, TurnInput};
use crate::memory::store::{embed_memories, get_memory, has_embedding, seed_memory, StoreMemoryResult};
use crate::memory::types::MemoryType;
use crate::messages::{record_message, Role};
use crate::providers::Providers;
use crate::session::ingest::ingest_session;
use crate::session::lifecycle::{close_all_stale_sessions, ensure_active_session, open_session, Session};
use crate::session::state::update_state;
use crate::session::summary::summarize_session;
use crate::tasks::{TaskFailure, TaskSupervisor};

/// What the request path did for one user turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReceipt {
    pub session: Session,
    pub session_created: bool,
    /// Id of a stale session closed on the way in.
    pub closed_session: Option<String>,
    pub message_id: String,
}

pub struct Engine {
    db: DbHandle,
    providers: Providers,
    config: Arc<HearthConfig>,
    curator: Arc<Curator>,
    supervisor: Arc<TaskSupervisor>,
    failures: Mutex<mpsc::UnboundedReceiver<TaskFailure>>,
}

impl Engine {
    pub fn new(conn: Connection, providers: Providers, config: HearthConfig) -> Self {
        let (supervisor, failures) = TaskSupervisor::new(&config.tasks);
        let curator = Curator::new(
            config.curator.clone(),
            providers.embedder.clone(),
            config.providers.embed_timeout(),
        );
        Self {
            db: DbHandle::new(conn),
            providers,
            config: Arc::new(config),
            curator: Arc::new(curator),
            supervisor: Arc::new(supervisor),
            failures: Mutex::new(failures),
        }
    }

    /// Open the configured database and HTTP providers.
    pub fn open(config: HearthConfig) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let conn = db::open_database(&db_path)?;
        tracing::info!(db = %db_path.display(), "database ready");

        match db::migrations::get_embedding_model(&conn)? {
            Some(stored) if stored != config.providers.embedding_model => {
                tracing::warn!(
                    stored = %stored,
                    configured = %config.providers.embedding_model,
                    "embedding model changed, stored vectors may not be comparable"
                );
            }
            Some(_) => {}
            None => db::migrations::set_embedding_model(&conn, &config.providers.embedding_model)?,
        }

        let providers = Providers::from_config(&config.providers)?;
        Ok(Self::new(conn, providers, config))
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn config(&self) -> &Arc<HearthConfig> {
        &self.config
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    fn active_window(&self) -> Duration {
        Duration::seconds(self.config.session.active_window_secs)
    }

    /// Request-path work for a user turn. Returns once the message is logged;
    /// extraction and curation continue in the background.
    pub async fn on_user_turn(&self, owner_id: &str, persona_id: &str, text: &str) -> Result<TurnReceipt> {
        if let Err(e) = self.flush_diagnostics().await {
            tracing::warn!(error = %e, "could not flush background diagnostics");
        }

        let now = crate::clock::now();
        let window = self.active_window();
        let (owner, persona) = (owner_id.to_string(), persona_id.to_string());
        let content = text.to_string();
        let (outcome, message_id) = self
            .db
            .call(move |conn| {
                let outcome = ensure_active_session(conn, &owner, &persona, window, now)?;
                let id = record_message(conn, &owner, &persona, Some(&outcome.session.id), Role::User, &content, now)?;
                Ok((outcome, id))
            })
            .await?;

        let closed_session = outcome.closed.as_ref().map(|s| s.id.clone());
        if let Some(closed) = outcome.closed {
            self.spawn_session_close(closed);
        }

        let db = self.db.clone();
        let providers = self.providers.clone();
        let config = Arc::clone(&self.config);
        let curator = Arc::clone(&self.curator);
        let turn = TurnInput {
            owner_id: owner_id.to_string(),
            persona_id: persona_id.to_string(),
            persona_name: Some(self.config.persona_name(persona_id)),
            text: text.to_string(),
            at: now,
        };
        self.supervisor.submit("extraction", owner_id, persona_id, async move {
            run_extraction(&db, &providers, &config, &turn).await;
            curator
                .auto_curate_maybe(&db, &turn.owner_id, &turn.persona_id, crate::clock::now())
                .await?;
            Ok(())
        });

        Ok(TurnReceipt {
            session: outcome.session,
            session_created: outcome.created,
            closed_session,
            message_id,
        })
    }

    /// Log an assistant reply against the open session, if any.
    pub async fn record_assistant_message(&self, owner_id: &str, persona_id: &str, text: &str) -> Result<String> {
        let (owner, persona) = (owner_id.to_string(), persona_id.to_string());
        let content = text.to_string();
        self.db
            .call(move |conn| {
                let session = open_session(conn, &owner, &persona)?;
                record_message(
                    conn,
                    &owner,
                    &persona,
                    session.as_ref().map(|s| s.id.as_str()),
                    Role::Assistant,
                    &content,
                    crate::clock::now(),
                )
            })
            .await
    }

    /// Context for the next generation. Collaborator failures only make the
    /// payload thinner.
    pub async fn build_context(
        &self,
        owner_id: &str,
        persona_id: &str,
        transcript: &[TranscriptEntry],
    ) -> Result<ContextPayload> {
        build_context(
            &self.db,
            &self.providers,
            &self.config,
            owner_id,
            persona_id,
            transcript,
            crate::clock::now(),
        )
        .await
    }

    /// Store a pinned, importance-3 fact and embed it when the row has no
    /// vector yet. Returns the store result and whether a vector is attached.
    pub async fn seed(
        &self,
        owner_id: &str,
        memory_type: MemoryType,
        content: &str,
        entity_refs: &[String],
        persona_scope: Option<&str>,
    ) -> Result<(StoreMemoryResult, bool)> {
        let (owner, text) = (owner_id.to_string(), content.to_string());
        let (refs, scope) = (entity_refs.to_vec(), persona_scope.map(str::to_string));
        let (result, stored, embedded) = self
            .db
            .call(move |conn| {
                let result = seed_memory(conn, &owner, memory_type, &text, &refs, scope.as_deref(), crate::clock::now())?;
                // a merge keeps the existing row's content
                let stored = get_memory(conn, &result.id)?.map(|m| m.content).unwrap_or(text);
                let embedded = has_embedding(conn, &result.id)?;
                Ok((result, stored, embedded))
            })
            .await?;
        if embedded {
            return Ok((result, true));
        }

        let item = vec![(result.id.clone(), stored)];
        let attached = embed_memories(
            &self.db,
            self.providers.embedder.as_ref(),
            self.config.providers.embed_timeout(),
            item,
        )
        .await;
        Ok((result, attached == 1))
    }

    /// Close every stale session in the store and schedule their side effects.
    pub async fn close_stale_sessions(&self) -> Result<Vec<Session>> {
        let window = self.active_window();
        let now = crate::clock::now();
        let closed = self
            .db
            .call(move |conn| close_all_stale_sessions(conn, window, now))
            .await?;
        for session in &closed {
            self.spawn_session_close(session.clone());
        }
        Ok(closed)
    }

    /// Run the curator for the pair immediately, ignoring cooldown and due-ness.
    pub async fn curate_now(&self, owner_id: &str, persona_id: &str) -> Result<CurateOutcome> {
        self.curator
            .run(&self.db, owner_id, persona_id, crate::clock::now(), true)
            .await
    }

    /// Continuity ingest and session summary for a closed session, each as
    /// its own supervised task.
    fn spawn_session_close(&self, session: Session) {
        let (owner, persona) = (session.owner_id.clone(), session.persona_id.clone());

        if let Some(client) = self.providers.continuity.clone() {
            let db = self.db.clone();
            let config = Arc::clone(&self.config);
            let session = session.clone();
            self.supervisor.submit("continuity_ingest", &owner, &persona, async move {
                ingest_session(db, client, config, session).await
            });
        }

        let db = self.db.clone();
        let classifier = self.providers.classifier.clone();
        let config = Arc::clone(&self.config);
        self.supervisor.submit("session_summary", &owner, &persona, async move {
            summarize_session(db, classifier, config, session).await
        });
    }

    /// Drain reported background failures into each pair's diagnostics.
    /// Returns how many were recorded.
    pub async fn flush_diagnostics(&self) -> Result<usize> {
        let drained: Vec<TaskFailure> = {
            let mut rx = self
                .failures
                .lock()
                .map_err(|e| anyhow::anyhow!("failure channel lock poisoned: {e}"))?;
            let mut drained = Vec::new();
            while let Ok(failure) = rx.try_recv() {
                drained.push(failure);
            }
            drained
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let count = drained.len();
        let mut by_pair: HashMap<(String, String), Vec<TaskFailure>> = HashMap::new();
        for failure in drained {
            by_pair
                .entry((failure.owner_id.clone(), failure.persona_id.clone()))
                .or_default()
                .push(failure);
        }
        self.db
            .call(move |conn| {
                let now = crate::clock::now();
                for ((owner, persona), failures) in by_pair {
                    update_state(conn, &owner, &persona, now, |s| {
                        for failure in failures {
                            s.state.record_background_failure(failure);
                        }
                    })?;
                }
                Ok(())
            })
            .await?;
        Ok(count)
    }

    /// Wait for all background work, then record any failures it reported.
    pub async fn wait_idle(&self) -> Result<()> {
        self.supervisor.wait_idle().await;
        self.flush_diagnostics().await?;
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.supervisor.in_flight()
    }
}
