//! Text heuristics over loop content. Everything here is pure.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use super::LoopKind;
use crate::entity::slugify;
use crate::memory::normalize_content;

fn hedge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(maybe|might|could|wish|hope|hoping|perhaps|if)\b").expect("valid hedge regex")
    })
}

fn timebox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(today|tonight|tomorrow|by|eod|end[ -]of[ -](the[ -])?day)\b|\b\d{1,2}(:\d{2})?\s*(am|pm)\b|\b\d{1,2}:\d{2}\b",
        )
        .expect("valid timebox regex")
    })
}

fn explicit_will_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(i will|i['’]ll|i am going to|i['’]m going to|im going to)\b")
            .expect("valid explicit-will regex")
    })
}

fn completion_report_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(did|done|finished|completed)\b").expect("valid completion regex")
    })
}

fn strict_done_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(done|finished|completed)\b").expect("valid done regex"))
}

fn completion_cue_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(did|done|finished|completed|went|made it)\b").expect("valid cue regex")
    })
}

const KEYWORD_STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "then", "than", "from", "into", "about", "just",
    "today", "tonight", "tomorrow", "yesterday", "morning", "evening", "week", "weekend", "did",
    "done", "finished", "finish", "completed", "complete", "went", "made", "make", "will", "going",
    "get", "got", "have", "had", "has", "was", "were", "are", "been", "some", "more", "finally",
    "really", "also", "again", "out", "our", "your", "you", "she", "his", "her", "they", "them",
    "need", "want", "try", "start", "keep",
];

/// True when a COMMITMENT should be stored as a THREAD: hedged, with no
/// timebox and no explicit statement of will.
pub fn should_downgrade_commitment(content: &str) -> bool {
    hedge_re().is_match(content)
        && !timebox_re().is_match(content)
        && !explicit_will_re().is_match(content)
}

/// Final kind for a candidate after the commitment downgrade.
pub fn effective_kind(kind: LoopKind, content: &str) -> LoopKind {
    if kind == LoopKind::Commitment && should_downgrade_commitment(content) {
        LoopKind::Thread
    } else {
        kind
    }
}

/// Dedupe signature: the classifier key in snake_case when usable, else the
/// normalized content.
pub fn loop_signature(dedupe_key: Option<&str>, content: &str) -> String {
    if let Some(key) = dedupe_key {
        let slug = slugify(key);
        if !slug.is_empty() {
            return slug;
        }
    }
    normalize_content(content)
}

/// Content that reports something already done rather than promising it.
pub fn is_completion_report(content: &str) -> bool {
    completion_report_re().is_match(content)
}

/// The narrow rule: the turn literally says done/finished/completed.
pub fn says_done(text: &str) -> bool {
    strict_done_re().is_match(text)
}

pub fn has_completion_cue(text: &str) -> bool {
    completion_cue_re().is_match(text)
}

fn stem(word: &str) -> String {
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(base) = word.strip_suffix(suffix) {
            if base.len() >= 3 {
                return base.to_string();
            }
        }
    }
    word.to_string()
}

/// Lowercased, lightly stemmed words of three or more letters that are not stopwords.
pub fn salient_keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphabetic())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= 3 && !KEYWORD_STOPWORDS.contains(&w.as_str()))
        .map(|w| stem(&w))
        .collect()
}
