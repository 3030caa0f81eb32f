//! Memory curation: a deterministic hygiene pass that archives exact
//! duplicates, and a fold pass that consolidates piles of observations about
//! one person into a single memory.
//!
//! Nothing is ever deleted. Both passes only flip `status` to ARCHIVED and
//! record why.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::clock::{format_ts, parse_ts};
use crate::config::CuratorConfig;
use crate::db::DbHandle;
use crate::entity::{canonicalize_entity_refs, parse_entity_key, slugify, EntityType};
use crate::memory::search::{active_memories, count_active_since};
use crate::memory::store::{archive_memory, embed_memories, insert_curated, write_audit_log};
use crate::memory::types::{
    FactType, Memory, MemoryMetadata, MemoryStatus, MemoryType, Subtype, FOLD_SOURCE,
};
use crate::memory::{normalize_content, truncate};
use crate::providers::Embedder;
use crate::session::state::{load_state, update_state, CuratorState};

/// Longest fold content.
pub const FOLD_CONTENT_CHARS: usize = 500;

pub const ARCHIVE_DEDUPE: &str = "dedupe";
pub const ARCHIVE_FOLD: &str = "fold";

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FoldResult {
    pub fold_id: String,
    pub label: String,
    pub content: String,
    pub folded_from: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct CurateRun {
    /// Ids archived as duplicates by the hygiene pass.
    pub deduped: Vec<String>,
    pub folds: Vec<FoldResult>,
}

impl CurateRun {
    pub fn archived_count(&self) -> usize {
        self.deduped.len() + self.folds.iter().map(|f| f.folded_from.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Cooldown,
    NotDue,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CurateOutcome {
    pub skipped: bool,
    pub reason: Option<SkipReason>,
    pub archived: usize,
    pub folds: usize,
    pub elapsed_ms: u64,
}

impl CurateOutcome {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: true,
            reason: Some(reason),
            ..Default::default()
        }
    }
}

// ── Passes ────────────────────────────────────────────────────────────────────

/// Archive all but one member of every `(type, normalized content)` group.
/// The survivor is a pinned or seeded row when one exists, else the newest.
pub fn hygiene_pass(conn: &Connection, owner_id: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut groups: HashMap<(MemoryType, String), Vec<Memory>> = HashMap::new();
    for memory in active_memories(conn, owner_id)? {
        let key = (memory.memory_type, normalize_content(&memory.content));
        groups.entry(key).or_default().push(memory);
    }

    let mut archived = Vec::new();
    for (_, members) in groups.into_iter().filter(|(_, m)| m.len() >= 2) {
        let keep = pick_survivor(&members);
        for m in members.iter().filter(|m| m.id != keep) {
            if archive_memory(conn, &m.id, ARCHIVE_DEDUPE, None, now)? {
                archived.push(m.id.clone());
            }
        }
    }
    if !archived.is_empty() {
        tracing::info!(owner = owner_id, archived = archived.len(), "hygiene pass archived duplicates");
    }
    Ok(archived)
}

fn pick_survivor(members: &[Memory]) -> String {
    let newest = |a: &&Memory, b: &&Memory| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id));
    members
        .iter()
        .filter(|m| m.metadata.pinned || m.metadata.is_seeded())
        .max_by(newest)
        .or_else(|| members.iter().max_by(newest))
        .map(|m| m.id.clone())
        .unwrap_or_default()
}

/// Grouping slug and display label for a PEOPLE memory: the entity label,
/// else the slug of its first `person:` ref.
pub fn fold_label(memory: &Memory) -> Option<(String, String)> {
    if let Some(label) = memory.metadata.entity_label.as_deref() {
        let slug = slugify(label);
        if !slug.is_empty() {
            return Some((slug, label.to_string()));
        }
    }
    memory
        .metadata
        .entity_refs
        .iter()
        .filter_map(|r| parse_entity_key(r))
        .find(|(t, _)| *t == EntityType::Person)
        .map(|(_, slug)| (slug.clone(), display_from_slug(&slug)))
}

fn display_from_slug(slug: &str) -> String {
    slug.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Consolidate PEOPLE groups of at least `fold_min_group` observations into
/// one fold each, up to `max_folds_per_run`.
pub fn fold_pass(
    conn: &Connection,
    owner_id: &str,
    config: &CuratorConfig,
    now: DateTime<Utc>,
) -> Result<Vec<FoldResult>> {
    let mut groups: BTreeMap<String, (String, Vec<Memory>)> = BTreeMap::new();
    for memory in active_memories(conn, owner_id)? {
        if memory.memory_type != MemoryType::People
            || memory.metadata.pinned
            || memory.metadata.is_seeded()
            || memory.metadata.is_fold()
        {
            continue;
        }
        let Some((slug, label)) = fold_label(&memory) else {
            continue;
        };
        groups
            .entry(slug)
            .or_insert_with(|| (label, Vec::new()))
            .1
            .push(memory);
    }

    let mut folds = Vec::new();
    for (slug, (label, members)) in groups {
        if folds.len() >= config.max_folds_per_run {
            break;
        }
        if members.len() < config.fold_min_group.max(2) {
            continue;
        }
        folds.push(write_fold(conn, owner_id, &slug, &label, &members, now)?);
    }
    Ok(folds)
}

fn write_fold(
    conn: &Connection,
    owner_id: &str,
    slug: &str,
    label: &str,
    members: &[Memory],
    now: DateTime<Utc>,
) -> Result<FoldResult> {
    // members arrive oldest first
    let facts: Vec<&str> = members.iter().map(|m| m.content.trim()).collect();
    let content = truncate(&format!("{label}: {}", facts.join("; ")), FOLD_CONTENT_CHARS);

    let refs = canonicalize_entity_refs(members.iter().flat_map(|m| m.metadata.entity_refs.iter()));
    let primary = refs
        .iter()
        .find(|r| r.starts_with("person:"))
        .cloned()
        .unwrap_or_else(|| format!("person:{slug}"));
    let id = uuid::Uuid::now_v7().to_string();
    let key = format!("PEOPLE|person|{primary}|{FOLD_SOURCE}:{id}");

    let first_scope = members[0].persona_scope.clone();
    let scope = members
        .iter()
        .all(|m| m.persona_scope == first_scope)
        .then_some(first_scope)
        .flatten();

    let folded_from: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
    let metadata = MemoryMetadata {
        source: FOLD_SOURCE.to_string(),
        subtype: Some(Subtype {
            entity_type: Some(EntityType::Person),
            fact_type: Some(FactType::Relationship),
        }),
        entity_refs: refs,
        entity_label: Some(label.to_string()),
        importance: 2,
        mention_count: members.iter().map(|m| m.metadata.mention_count).sum::<u32>().max(1),
        status: MemoryStatus::Active,
        pinned: false,
        archived_at: None,
        archive_reason: None,
        folded_from: folded_from.clone(),
        folded_into: None,
    };

    insert_curated(
        conn,
        owner_id,
        scope.as_deref(),
        MemoryType::People,
        &content,
        &metadata,
        &key,
        &id,
        now,
    )?;
    write_audit_log(conn, "fold", &id, Some(&serde_json::json!({"folded_from": folded_from})))?;
    for source in &folded_from {
        archive_memory(conn, source, ARCHIVE_FOLD, Some(&id), now)?;
    }
    tracing::info!(owner = owner_id, fold_id = %id, label, sources = folded_from.len(), "people memories folded");

    Ok(FoldResult {
        fold_id: id,
        label: label.to_string(),
        content,
        folded_from,
    })
}

/// Hygiene then fold, in one transaction.
pub fn curate(conn: &mut Connection, owner_id: &str, config: &CuratorConfig, now: DateTime<Utc>) -> Result<CurateRun> {
    let tx = conn.transaction()?;
    let deduped = hygiene_pass(&tx, owner_id, now)?;
    let folds = fold_pass(&tx, owner_id, config, now)?;
    tx.commit()?;
    Ok(CurateRun { deduped, folds })
}

/// Due after `interval_hours` since the last run, or once
/// `new_memory_threshold` memories arrived since then. A pair that never ran
/// is due.
pub fn is_due(state: &CuratorState, new_since_last_run: u64, config: &CuratorConfig, now: DateTime<Utc>) -> bool {
    let Some(last) = state.last_run_at.as_deref().and_then(parse_ts) else {
        return true;
    };
    now - last >= Duration::hours(config.interval_hours)
        || new_since_last_run >= config.new_memory_threshold.max(0) as u64
}

// ── Auto-trigger ──────────────────────────────────────────────────────────────

/// Schedules curation per `(owner, persona)`.
///
/// The cooldown map is process-local: it suppresses bursts from one process
/// only. `curator.last_run_at` in session state decides due-ness.
pub struct Curator {
    config: CuratorConfig,
    embedder: Option<Arc<dyn Embedder>>,
    embed_timeout: std::time::Duration,
    last_trigger: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl Curator {
    pub fn new(config: CuratorConfig, embedder: Option<Arc<dyn Embedder>>, embed_timeout: std::time::Duration) -> Self {
        Self {
            config,
            embedder,
            embed_timeout,
            last_trigger: Mutex::new(HashMap::new()),
        }
    }

    /// Stamp the pair and report whether the previous stamp is inside the cooldown.
    fn in_cooldown(&self, owner_id: &str, persona_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut map = self
            .last_trigger
            .lock()
            .map_err(|e| anyhow::anyhow!("curator cooldown lock poisoned: {e}"))?;
        let key = (owner_id.to_string(), persona_id.to_string());
        let cooling = map
            .get(&key)
            .is_some_and(|last| now - *last < Duration::seconds(self.config.cooldown_secs));
        if !cooling {
            map.insert(key, now);
        }
        Ok(cooling)
    }

    pub async fn auto_curate_maybe(
        &self,
        db: &DbHandle,
        owner_id: &str,
        persona_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CurateOutcome> {
        if self.in_cooldown(owner_id, persona_id, now)? {
            tracing::debug!(owner = owner_id, persona = persona_id, "curator in cooldown");
            return Ok(CurateOutcome::skipped(SkipReason::Cooldown));
        }
        self.run(db, owner_id, persona_id, now, false).await
    }

    /// Run the passes now, skipping the cooldown. With `force` the due check
    /// is skipped too.
    pub async fn run(
        &self,
        db: &DbHandle,
        owner_id: &str,
        persona_id: &str,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<CurateOutcome> {
        let started = Instant::now();
        let config = self.config.clone();
        let (owner, persona) = (owner_id.to_string(), persona_id.to_string());

        let result = db
            .call(move |conn| {
                let state = load_state(conn, &owner, &persona)?;
                let since = state.state.curator.last_run_at.clone();
                let new_count = count_active_since(conn, &owner, since.as_deref())?;
                if !force && !is_due(&state.state.curator, new_count, &config, now) {
                    return Ok(None);
                }

                let outcome = curate(conn, &owner, &config, now);
                let total = count_active_since(conn, &owner, None)?;
                update_state(conn, &owner, &persona, now, |s| {
                    let log = &mut s.state.diagnostics.curator;
                    log.attempt(now);
                    match &outcome {
                        Ok(_) => {
                            log.success(now);
                            s.state.curator = CuratorState {
                                last_run_at: Some(format_ts(now)),
                                last_memory_count_at_run: total,
                            };
                        }
                        Err(e) => log.failure(now, format!("{e:#}")),
                    }
                })?;
                outcome.map(Some)
            })
            .await
            .context("curator run failed")?;

        let Some(run) = result else {
            tracing::debug!(owner = owner_id, persona = persona_id, "curator not due");
            return Ok(CurateOutcome::skipped(SkipReason::NotDue));
        };

        for fold in &run.folds {
            self.embed_fold(db, fold).await;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > self.config.slow_run_warn_ms {
            tracing::warn!(owner = owner_id, persona = persona_id, elapsed_ms, "curator run was slow");
        }
        let outcome = CurateOutcome {
            skipped: false,
            reason: None,
            archived: run.archived_count(),
            folds: run.folds.len(),
            elapsed_ms,
        };
        tracing::info!(
            owner = owner_id,
            persona = persona_id,
            archived = outcome.archived,
            folds = outcome.folds,
            elapsed_ms,
            "curator ran"
        );
        Ok(outcome)
    }

    async fn embed_fold(&self, db: &DbHandle, fold: &FoldResult) {
        let item = vec![(fold.fold_id.clone(), fold.content.clone())];
        if embed_memories(db, self.embedder.as_ref(), self.embed_timeout, item).await == 0 {
            tracing::debug!(fold_id = %fold.fold_id, "fold stored without an embedding");
        }
    }
}
