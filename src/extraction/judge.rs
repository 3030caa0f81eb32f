//! The pure half of the extraction judge: message window, classifier prompt,
//! output parsing and sanitization. Nothing here touches storage or the
//! network.

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::entity::{sanitize_entity_refs, sanitize_importance, sanitize_label, sanitize_subtype};
use crate::loops::{LoopCandidate, LoopKind};
use crate::memory::normalize_content;
use crate::memory::types::{MemoryInput, MemoryType};
use crate::messages::Message;

/// Source recorded on memories written by the judge.
pub const EXTRACTION_SOURCE: &str = "extraction";

pub const EXTRACTION_SCHEMA_HINT: &str = "You extract durable facts and actionable loops from a user's recent messages. \
Reply with one JSON object and nothing else:\n\
{\"memories\": [{\"type\": \"PROFILE|PEOPLE|PROJECT\", \"content\": string, \"confidence\": 0..1, \
\"subtype\": {\"entityType\": \"person|place|org|project\", \"factType\": \"fact|preference|relationship|friction|habit\"}, \
\"entityRefs\": [\"person:slug\"], \"entityLabel\": string, \"importance\": 0..3}],\n\
 \"loops\": [{\"kind\": \"COMMITMENT|HABIT|THREAD|FRICTION\", \"content\": string, \"dedupe_key\": \"snake_case\", \"confidence\": 0..1}]}\n\
Only record what the user stated about themselves, people in their life, or their projects. \
Return empty arrays when nothing qualifies.";

/// A sanitized memory proposed by the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCandidate {
    pub memory_type: MemoryType,
    pub content: String,
    pub confidence: f64,
    pub input: MemoryInput,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JudgeOutput {
    pub memories: Vec<MemoryCandidate>,
    pub loops: Vec<LoopCandidate>,
}

/// Why a memory candidate was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    LowConfidence,
    MetaContent,
    PersonaSelfReference,
    UnsupportedRelationship,
}

fn meta_stoplist_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(test(ing)?\s+(message|messages|the|this|app)|this is a test|debug(ging)?|this (app|chat|conversation)|the prompt|prompts?\b|ai\b|language model|system message|the assistant)",
        )
        .expect("valid meta stoplist regex")
    })
}

const RELATIONSHIP_TERMS: &str = r"mother|mom|mum|father|dad|parents?|sister|brother|siblings?|wife|husband|partner|spouse|girlfriend|boyfriend|fianc[eé]e?|best friend|friends?|boss|manager|coworkers?|co-workers?|colleagues?|sons?|daughters?|kids?|child|children|aunt|uncle|cousins?|grandma|grandpa|grandmother|grandfather|roommates?|mentor|neighbou?rs?|therapist";

fn relationship_term_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)\b({RELATIONSHIP_TERMS})\b")).expect("valid relationship regex")
    })
}

fn relationship_cue_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)\b(my|our)\s+(\w+\s+)?({RELATIONSHIP_TERMS})\b"))
            .expect("valid relationship cue regex")
    })
}

/// Dedupe the newest-first user messages, keep the `cap` newest and return
/// them oldest first.
pub fn build_window(newest_first: &[Message], cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut window: Vec<String> = newest_first
        .iter()
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(normalize_content(c)))
        .take(cap)
        .map(str::to_string)
        .collect();
    window.reverse();
    window
}

pub fn build_extraction_prompt(window: &[String], persona_name: Option<&str>) -> String {
    let mut prompt = String::new();
    if let Some(name) = persona_name {
        prompt.push_str(&format!("The assistant is called {name}. Never record facts about the assistant.\n"));
    }
    prompt.push_str("Recent user messages, oldest first:\n");
    for (i, line) in window.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, line));
    }
    prompt
}

fn confidence_of(obj: &serde_json::Map<String, Value>) -> f64 {
    // A candidate without a confidence is taken at face value.
    obj.get("confidence")
        .and_then(Value::as_f64)
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(1.0)
}

fn parse_memory(value: &Value) -> Option<MemoryCandidate> {
    let obj = value.as_object()?;
    let memory_type: MemoryType = obj.get("type")?.as_str()?.parse().ok()?;
    let content = obj.get("content")?.as_str()?.trim();
    if content.is_empty() {
        return None;
    }
    let refs = obj
        .get("entityRefs")
        .or_else(|| obj.get("entity_refs"))
        .map(sanitize_entity_refs)
        .unwrap_or_default();
    let input = MemoryInput {
        source: EXTRACTION_SOURCE.to_string(),
        subtype: obj.get("subtype").and_then(sanitize_subtype),
        entity_refs: refs,
        entity_label: obj
            .get("entityLabel")
            .or_else(|| obj.get("entity_label"))
            .and_then(sanitize_label),
        importance: obj.get("importance").and_then(sanitize_importance),
        pinned: false,
    };
    Some(MemoryCandidate {
        memory_type,
        content: content.to_string(),
        confidence: confidence_of(obj),
        input,
    })
}

fn parse_loop(value: &Value) -> Option<LoopCandidate> {
    let obj = value.as_object()?;
    let content = obj.get("content")?.as_str()?.trim();
    if content.is_empty() {
        return None;
    }
    Some(LoopCandidate {
        kind: LoopKind::parse_or_thread(obj.get("kind").and_then(Value::as_str)),
        content: content.to_string(),
        dedupe_key: obj
            .get("dedupe_key")
            .or_else(|| obj.get("dedupeKey"))
            .and_then(Value::as_str)
            .map(str::to_string),
        confidence: confidence_of(obj),
    })
}

/// Parse classifier output. Any structural failure yields an empty output;
/// individual malformed entries are skipped.
pub fn parse_judge_output(raw: &str) -> JudgeOutput {
    let Some(value) = crate::providers::extract_json(raw) else {
        tracing::warn!("classifier output was not JSON, ignoring");
        return JudgeOutput::default();
    };
    let list = |key: &str| -> Vec<Value> {
        value
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    JudgeOutput {
        memories: list("memories").iter().filter_map(parse_memory).collect(),
        loops: list("loops").iter().filter_map(parse_loop).collect(),
    }
}

pub fn is_meta_content(content: &str) -> bool {
    meta_stoplist_re().is_match(content)
}

pub fn window_has_relationship_cue(window: &[String]) -> bool {
    window.iter().any(|line| relationship_cue_re().is_match(line))
}

/// Decide whether a candidate may be written.
pub fn check_memory(
    candidate: &MemoryCandidate,
    window_has_cue: bool,
    persona_name: Option<&str>,
    min_confidence: f64,
) -> Result<(), Rejection> {
    if candidate.confidence < min_confidence {
        return Err(Rejection::LowConfidence);
    }
    if is_meta_content(&candidate.content) {
        return Err(Rejection::MetaContent);
    }
    if candidate.memory_type == MemoryType::Profile {
        if let Some(name) = persona_name.map(str::trim).filter(|n| n.chars().count() >= 3) {
            if candidate.content.to_lowercase().contains(&name.to_lowercase()) {
                return Err(Rejection::PersonaSelfReference);
            }
        }
    }
    if candidate.memory_type == MemoryType::People
        && !(relationship_term_re().is_match(&candidate.content) && window_has_cue)
    {
        return Err(Rejection::UnsupportedRelationship);
    }
    Ok(())
}

/// Keep the candidates that pass [`check_memory`], logging the rest.
pub fn sanitize_memories(
    candidates: Vec<MemoryCandidate>,
    window: &[String],
    persona_name: Option<&str>,
    min_confidence: f64,
) -> (Vec<MemoryCandidate>, usize) {
    let cue = window_has_relationship_cue(window);
    let mut rejected = 0;
    let kept = candidates
        .into_iter()
        .filter(|c| match check_memory(c, cue, persona_name, min_confidence) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(content = %c.content, ?reason, "memory candidate rejected");
                rejected += 1;
                false
            }
        })
        .collect();
    (kept, rejected)
}
