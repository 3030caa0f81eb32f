use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HearthConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub providers: ProvidersConfig,
    pub retrieval: RetrievalConfig,
    pub extraction: ExtractionConfig,
    pub curator: CuratorConfig,
    pub session: SessionConfig,
    pub context: ContextConfig,
    pub tasks: TasksConfig,
    /// Display names keyed by persona id, e.g. `juniper = "Juniper"`.
    pub personas: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

/// External collaborators: embedding/completion endpoint and the continuity service.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProvidersConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub embedding_model: String,
    pub completion_model: String,
    pub continuity_url: Option<String>,
    pub embed_timeout_ms: u64,
    pub classify_timeout_ms: u64,
    pub completion_timeout_ms: u64,
    pub ingest_timeout_ms: u64,
    pub remote_context_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub candidate_k: usize,
    pub blended_scoring: bool,
    pub half_life_days: f64,
    pub similarity_weight: f64,
    pub recency_weight: f64,
    pub frequency_weight: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionConfig {
    pub window_fetch: usize,
    pub window_minutes: i64,
    pub window_cap: usize,
    pub min_confidence: f64,
    pub rolling_every: u64,
    pub rolling_timeout_ms: u64,
    pub spine_threshold: u64,
    /// First delay after a failed spine regeneration; doubles per failure.
    pub spine_retry_secs: u64,
    pub spine_retry_max_secs: u64,
    pub rolling_summary_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CuratorConfig {
    pub cooldown_secs: i64,
    pub interval_hours: i64,
    pub new_memory_threshold: i64,
    pub fold_min_group: usize,
    pub max_folds_per_run: usize,
    pub slow_run_warn_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub active_window_secs: i64,
    pub summary_list_cap: usize,
    pub summary_item_chars: usize,
    pub one_liner_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContextConfig {
    pub remote_enabled: bool,
    pub foundation_cap: usize,
    pub relevant_cap: usize,
    pub profile_cap: usize,
    pub people_cap: usize,
    pub project_cap: usize,
    pub entity_card_cap: usize,
    pub facts_per_card: usize,
    pub commitment_cap: usize,
    pub thread_cap: usize,
    pub friction_cap: usize,
    pub habit_cap: usize,
    pub wins_window_hours: i64,
    pub rolling_summary_chars: usize,
    pub session_summary_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TasksConfig {
    pub max_concurrent: usize,
    pub task_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_hearth_dir()
            .join("hearth.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            embedding_model: "text-embedding-3-small".into(),
            completion_model: "gpt-4o-mini".into(),
            continuity_url: None,
            embed_timeout_ms: 1200,
            classify_timeout_ms: 8000,
            completion_timeout_ms: 20_000,
            ingest_timeout_ms: 60_000,
            remote_context_timeout_ms: 1500,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: 50,
            blended_scoring: true,
            half_life_days: 14.0,
            similarity_weight: 0.4,
            recency_weight: 0.3,
            frequency_weight: 0.3,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            window_fetch: 6,
            window_minutes: 60,
            window_cap: 4,
            min_confidence: 0.5,
            rolling_every: 4,
            rolling_timeout_ms: 4000,
            spine_threshold: 20,
            spine_retry_secs: 300,
            spine_retry_max_secs: 6 * 3600,
            rolling_summary_chars: 600,
        }
    }
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            interval_hours: 24,
            new_memory_threshold: 25,
            fold_min_group: 3,
            max_folds_per_run: 5,
            slow_run_warn_ms: 5000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            active_window_secs: 300,
            summary_list_cap: 5,
            summary_item_chars: 120,
            one_liner_chars: 200,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            remote_enabled: false,
            foundation_cap: 20,
            relevant_cap: 8,
            profile_cap: 2,
            people_cap: 3,
            project_cap: 3,
            entity_card_cap: 5,
            facts_per_card: 3,
            commitment_cap: 5,
            thread_cap: 3,
            friction_cap: 3,
            habit_cap: 3,
            wins_window_hours: 48,
            rolling_summary_chars: 600,
            session_summary_chars: 800,
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            task_timeout_secs: 90,
        }
    }
}

impl ProvidersConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_millis(self.ingest_timeout_ms)
    }

    pub fn remote_context_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_context_timeout_ms)
    }
}

/// Returns `~/.hearth/`, or `./.hearth` when no home directory is known.
pub fn default_hearth_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hearth")
}

/// Returns the default config file path: `~/.hearth/config.toml`
pub fn default_config_path() -> PathBuf {
    default_hearth_dir().join("config.toml")
}

impl HearthConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            HearthConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("HEARTH_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("HEARTH_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("HEARTH_PROVIDER_URL") {
            self.providers.base_url = val;
        }
        if let Ok(val) = std::env::var("HEARTH_API_KEY") {
            self.providers.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("HEARTH_CONTINUITY_URL") {
            self.providers.continuity_url = Some(val);
        }
    }

    /// Display name of a persona; the id itself when none is configured.
    pub fn persona_name(&self, persona_id: &str) -> String {
        self.personas
            .get(persona_id)
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .unwrap_or(persona_id)
            .to_string()
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
