//! Memory and context engine for a conversational companion.
//!
//! Hearth turns ongoing conversation into durable, deduplicated memory and
//! assembles a bounded context payload for each new turn. Facts are stored in
//! three types, and actionable items are tracked as loops:
//!
//! | Type | Purpose |
//! |------|---------|
//! | **PROFILE** | Facts about the user |
//! | **PEOPLE** | People in the user's life |
//! | **PROJECT** | Things the user is working on |
//!
//! Loops are COMMITMENT, HABIT, THREAD or FRICTION, and move from PENDING to
//! COMPLETED.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   for vector search over 384-dimension embeddings
//! - **Retrieval**: cosine prefilter, then a blend of similarity, recency and
//!   entity frequency
//! - **Collaborators**: embedding, completion and continuity services behind
//!   traits, each call under its own timeout
//! - **Background work**: extraction, curation and session-close side effects
//!   run as supervised tasks off the request path
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`db`] — SQLite initialization, schema, migrations and health checks
//! - [`entity`] — Entity key normalization and classifier output sanitizers
//! - [`memory`] — Memory store: write/merge path, retrieval, archival, stats
//! - [`loops`] — Loop classification, dedupe, auto-completion and wins
//! - [`messages`] — Conversation message log
//! - [`session`] — Session lifecycle, summaries, continuity ingest, state bag
//! - [`extraction`] — Extraction judge, rolling summary and summary spine
//! - [`curator`] — Hygiene and fold passes with an auto-trigger policy
//! - [`context`] — Context assembly, local and remote
//! - [`providers`] — Collaborator traits and HTTP implementations
//! - [`tasks`] — Supervised background task submission
//! - [`engine`] — Per-turn facade tying the above together

pub mod clock;
pub mod config;
pub mod context;
pub mod curator;
pub mod db;
pub mod engine;
pub mod entity;
pub mod extraction;
pub mod loops;
pub mod memory;
pub mod messages;
pub mod providers;
pub mod session;
pub mod tasks;

pub use engine::{Engine, TurnReceipt};
