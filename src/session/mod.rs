//! Session lifecycle, session summaries, continuity ingest and the per-pair
//! state bag.

pub mod ingest;
pub mod lifecycle;
pub mod state;
pub mod summary;

pub use lifecycle::{ensure_active_session, close_stale_session_if_any, EnsureOutcome, Session};
pub use state::{load_state, update_state, SessionState, StateBag};
pub use summary::{SessionSummary, StoredSummary};
