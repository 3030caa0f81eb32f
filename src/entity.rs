//! Entity key normalization and sanitizing of loosely-typed classifier output.
//!
//! Entity keys have the canonical form `type:slug` (for example
//! `person:mukesh`). Every ref that reaches storage has been through
//! [`canonicalize_entity_refs`]; anything that does not match the canonical
//! pattern is dropped rather than stored.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::memory::types::{FactType, Subtype};

/// Upper bound on refs carried by one memory.
pub const MAX_ENTITY_REFS: usize = 5;

/// Longest entity label kept from classifier output.
pub const MAX_LABEL_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Place,
    Org,
    Project,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Place => "place",
            Self::Org => "org",
            Self::Project => "project",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Ok(Self::Person),
            "place" => Ok(Self::Place),
            "org" => Ok(Self::Org),
            "project" => Ok(Self::Project),
            _ => Err(format!("unknown entity type: {s}")),
        }
    }
}

fn entity_key_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(person|place|org|project):([a-z0-9_]+)$").expect("valid entity key regex")
    })
}

/// Lowercase, replace everything outside `[a-z0-9]` with `_`, collapse runs and
/// trim separators from both ends.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(ch);
        } else {
            pending_sep = true;
        }
    }
    slug
}

/// `"{type}:{slug}"`, or an empty string when the name has no usable characters.
/// Callers must drop empty keys.
pub fn normalize_entity_key(entity_type: EntityType, name: &str) -> String {
    let slug = slugify(name);
    if slug.is_empty() {
        return String::new();
    }
    format!("{entity_type}:{slug}")
}

/// Strict inverse of [`normalize_entity_key`]: only canonical keys parse.
pub fn parse_entity_key(key: &str) -> Option<(EntityType, String)> {
    let caps = entity_key_pattern().captures(key)?;
    let entity_type = caps.get(1)?.as_str().parse().ok()?;
    Some((entity_type, caps.get(2)?.as_str().to_string()))
}

/// Canonicalize one raw ref such as `"Person: Mukesh K."`. Returns `None` when
/// the type is unknown or the name slugifies to nothing.
pub fn canonicalize_ref(raw: &str) -> Option<String> {
    let (type_part, name_part) = raw.split_once(':')?;
    let entity_type: EntityType = type_part.parse().ok()?;
    let key = normalize_entity_key(entity_type, name_part);
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Normalize every ref, drop invalid ones and exact duplicates, preserving
/// first-seen order and capping at [`MAX_ENTITY_REFS`].
pub fn canonicalize_entity_refs<I, S>(refs: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in refs {
        let Some(key) = canonicalize_ref(raw.as_ref()) else {
            continue;
        };
        if seen.insert(key.clone()) {
            out.push(key);
            if out.len() == MAX_ENTITY_REFS {
                break;
            }
        }
    }
    out
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    obj.get(camel).or_else(|| obj.get(snake))
}

/// Validate a classifier `subtype` object. Invalid fields are dropped; `None`
/// when nothing valid remains.
pub fn sanitize_subtype(value: &Value) -> Option<Subtype> {
    let obj = value.as_object()?;
    let entity_type = field(obj, "entityType", "entity_type")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<EntityType>().ok());
    let fact_type = field(obj, "factType", "fact_type")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<FactType>().ok());

    if entity_type.is_none() && fact_type.is_none() {
        return None;
    }
    Some(Subtype {
        entity_type,
        fact_type,
    })
}

/// Accept only an array of strings; every entry is canonicalized.
pub fn sanitize_entity_refs(value: &Value) -> Vec<String> {
    match value.as_array() {
        Some(items) => canonicalize_entity_refs(items.iter().filter_map(Value::as_str)),
        None => Vec::new(),
    }
}

/// Importance must be an integer in `0..=3` (numeric strings are accepted).
pub fn sanitize_importance(value: &Value) -> Option<u8> {
    let n = match value {
        Value::Number(n) => {
            let f = n.as_f64()?;
            if f.fract() != 0.0 {
                return None;
            }
            f as i64
        }
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (0..=3).contains(&n).then_some(n as u8)
}

/// A short single-line display label, whitespace collapsed.
pub fn sanitize_label(value: &Value) -> Option<String> {
    let raw = value.as_str()?;
    let label = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if label.is_empty() || label.chars().count() > MAX_LABEL_CHARS {
        return None;
    }
    Some(label)
}
