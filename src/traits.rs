//! Keyword-based trait scoring over assistant replies.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trait {
    Empathy,
    SelfAwareness,
    Anxiety,
    Optimism,
    MoodSwings,
    Confidence,
}

impl Trait {
    pub const ALL: [Trait; 6] = [
        Trait::Empathy,
        Trait::SelfAwareness,
        Trait::Anxiety,
        Trait::Optimism,
        Trait::MoodSwings,
        Trait::Confidence,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Trait::Empathy => "Empathy",
            Trait::SelfAwareness => "Self-Awareness",
            Trait::Anxiety => "Anxiety",
            Trait::Optimism => "Optimism",
            Trait::MoodSwings => "Mood Swings",
            Trait::Confidence => "Confidence",
        }
    }

    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Trait::Empathy => &["understand", "empathize", "feel for", "that sounds hard"],
            Trait::SelfAwareness => &["aware", "reflect", "realize"],
            Trait::Anxiety => &["anxious", "worried", "nervous"],
            Trait::Optimism => &["hope", "bright side", "improve"],
            Trait::MoodSwings => &["mixed feelings", "change a lot"],
            Trait::Confidence => &["you can", "strong", "believe in yourself"],
        }
    }

    /// Profile display order for strengths.
    pub const STRENGTHS: [Trait; 4] = [
        Trait::Empathy,
        Trait::Optimism,
        Trait::Confidence,
        Trait::SelfAwareness,
    ];

    pub const GROWTH_AREAS: [Trait; 2] = [Trait::Anxiety, Trait::MoodSwings];
}

impl fmt::Display for Trait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-trait counters. Serialized with the display names as JSON keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitSet {
    #[serde(rename = "Empathy", default)]
    pub empathy: u32,
    #[serde(rename = "Self-Awareness", default)]
    pub self_awareness: u32,
    #[serde(rename = "Anxiety", default)]
    pub anxiety: u32,
    #[serde(rename = "Optimism", default)]
    pub optimism: u32,
    #[serde(rename = "Mood Swings", default)]
    pub mood_swings: u32,
    #[serde(rename = "Confidence", default)]
    pub confidence: u32,
}

impl TraitSet {
    pub fn get(&self, t: Trait) -> u32 {
        match t {
            Trait::Empathy => self.empathy,
            Trait::SelfAwareness => self.self_awareness,
            Trait::Anxiety => self.anxiety,
            Trait::Optimism => self.optimism,
            Trait::MoodSwings => self.mood_swings,
            Trait::Confidence => self.confidence,
        }
    }

    fn slot(&mut self, t: Trait) -> &mut u32 {
        match t {
            Trait::Empathy => &mut self.empathy,
            Trait::SelfAwareness => &mut self.self_awareness,
            Trait::Anxiety => &mut self.anxiety,
            Trait::Optimism => &mut self.optimism,
            Trait::MoodSwings => &mut self.mood_swings,
            Trait::Confidence => &mut self.confidence,
        }
    }

    pub fn increment(&mut self, t: Trait, by: u32) {
        let slot = self.slot(t);
        *slot = slot.saturating_add(by);
    }

    /// Adds every counter of `other` into `self`.
    pub fn accumulate(&mut self, other: &TraitSet) {
        for t in Trait::ALL {
            self.increment(t, other.get(t));
        }
    }

    pub fn total(&self) -> u64 {
        Trait::ALL.into_iter().map(|t| u64::from(self.get(t))).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Trait, u32)> + '_ {
        Trait::ALL.into_iter().map(move |t| (t, self.get(t)))
    }

    /// Traits ordered by score, highest first. Ties keep the canonical order.
    pub fn ranked(&self) -> Vec<(Trait, u32)> {
        let mut ranked: Vec<_> = self.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }
}

struct KeywordPattern {
    trait_: Trait,
    regex: Regex,
}

fn patterns() -> &'static [KeywordPattern] {
    static PATTERNS: OnceLock<Vec<KeywordPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        Trait::ALL
            .into_iter()
            .flat_map(|t| {
                t.keywords().iter().filter_map(move |kw| {
                    let pattern = format!(r"(?i)\b{}\b", regex::escape(kw));
                    match Regex::new(&pattern) {
                        Ok(regex) => Some(KeywordPattern { trait_: t, regex }),
                        Err(e) => {
                            tracing::error!("Invalid trait keyword pattern {:?}: {}", pattern, e);
                            None
                        }
                    }
                })
            })
            .collect()
    })
}

/// Scan one assistant reply and bump counters. Each keyword that appears as a
/// whole word adds 1 to its trait; repeats of the same keyword do not.
pub fn score(text: &str, traits: &mut TraitSet) -> TraitSet {
    let mut delta = TraitSet::default();
    for pattern in patterns() {
        if pattern.regex.is_match(text) {
            delta.increment(pattern.trait_, 1);
        }
    }
    traits.accumulate(&delta);
    delta
}
