//! Core memory type definitions.
//!
//! [`MemoryType`] is the three-way fact category, [`MemoryMetadata`] the
//! validated form of the metadata bag persisted as JSON, and [`Memory`] a full
//! row of the `memories` table.

use serde::{Deserialize, Serialize};

use crate::entity::EntityType;

/// Seed-like sources the curator never archives in favour of extracted copies.
pub const SEEDED_SOURCES: [&str; 2] = ["seed", "gospel"];

/// Source recorded on memories synthesized by a curator fold.
pub const FOLD_SOURCE: &str = "curated_fold";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    /// Facts about the user themselves.
    Profile,
    /// People in the user's life.
    People,
    /// Things the user is working on.
    Project,
}

impl MemoryType {
    pub const ALL: [MemoryType; 3] = [Self::Profile, Self::People, Self::Project];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "PROFILE",
            Self::People => "PEOPLE",
            Self::Project => "PROJECT",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROFILE" => Ok(Self::Profile),
            "PEOPLE" => Ok(Self::People),
            "PROJECT" => Ok(Self::Project),
            _ => Err(format!("unknown memory type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Fact,
    Preference,
    Relationship,
    Friction,
    Habit,
}

impl FactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Relationship => "relationship",
            Self::Friction => "friction",
            Self::Habit => "habit",
        }
    }
}

impl std::str::FromStr for FactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fact" => Ok(Self::Fact),
            "preference" => Ok(Self::Preference),
            "relationship" => Ok(Self::Relationship),
            "friction" => Ok(Self::Friction),
            "habit" => Ok(Self::Habit),
            _ => Err(format!("unknown fact type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtype {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_type: Option<FactType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryStatus {
    #[default]
    Active,
    Archived,
}

/// Validated metadata bag, stored as JSON in `memories.metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetadata {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<Subtype>,
    #[serde(default)]
    pub entity_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_label: Option<String>,
    #[serde(default = "default_importance")]
    pub importance: u8,
    #[serde(default = "default_mention_count")]
    pub mention_count: u32,
    #[serde(default)]
    pub status: MemoryStatus,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folded_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folded_into: Option<String>,
}

fn default_importance() -> u8 {
    1
}

fn default_mention_count() -> u32 {
    1
}

impl MemoryMetadata {
    pub fn is_archived(&self) -> bool {
        self.status == MemoryStatus::Archived
    }

    pub fn is_seeded(&self) -> bool {
        SEEDED_SOURCES.contains(&self.source.as_str())
    }

    pub fn is_fold(&self) -> bool {
        self.source == FOLD_SOURCE
    }

    pub fn entity_type(&self) -> Option<EntityType> {
        self.subtype.and_then(|s| s.entity_type)
    }

    pub fn fact_type(&self) -> Option<FactType> {
        self.subtype.and_then(|s| s.fact_type)
    }
}

/// Caller-supplied metadata for a write. Every field is optional except the
/// source; [`crate::memory::store::store_memory`] normalizes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryInput {
    pub source: String,
    pub subtype: Option<Subtype>,
    pub entity_refs: Vec<String>,
    pub entity_label: Option<String>,
    pub importance: Option<u8>,
    pub pinned: bool,
}

impl MemoryInput {
    pub fn from_source(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }
}

/// A row of the `memories` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 primary key.
    pub id: String,
    pub owner_id: String,
    /// `None` means the memory is visible to every persona.
    pub persona_scope: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    /// Dedupe identity; unique per owner when present.
    pub memory_key: Option<String>,
    pub metadata: MemoryMetadata,
    pub created_at: String,
    pub updated_at: String,
}
