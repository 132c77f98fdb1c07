use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::llm_client::{CompletionBackend, CompletionRequest};
use crate::traits::{Trait, TraitSet};

pub const FALLBACK_SUMMARY: &str =
    "Your emotional patterns show interesting depth across our conversations.";

#[derive(Debug, Clone, Serialize)]
pub struct TraitScore {
    pub name: &'static str,
    pub score: u32,
}

impl From<(Trait, u32)> for TraitScore {
    fn from((t, score): (Trait, u32)) -> Self {
        Self {
            name: t.name(),
            score,
        }
    }
}

/// Everything the insights view shows.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub totals: TraitSet,
    pub has_traits: bool,
    pub ranked: Vec<TraitScore>,
    pub strengths: Vec<TraitScore>,
    pub growth_areas: Vec<TraitScore>,
    pub summary: String,
}

impl Profile {
    pub fn new(totals: TraitSet, summary: String) -> Self {
        let scored = |group: &[Trait]| -> Vec<TraitScore> {
            group
                .iter()
                .map(|&t| (t, totals.get(t)))
                .filter(|(_, s)| *s > 0)
                .map(TraitScore::from)
                .collect()
        };
        Self {
            totals,
            has_traits: !totals.is_empty(),
            ranked: totals
                .ranked()
                .into_iter()
                .filter(|(_, s)| *s > 0)
                .map(TraitScore::from)
                .collect(),
            strengths: scored(&Trait::STRENGTHS),
            growth_areas: scored(&Trait::GROWTH_AREAS),
            summary,
        }
    }
}

/// "empathy (3), anxiety (1)" for every trait above zero, highest first.
pub fn traits_text(totals: &TraitSet) -> String {
    totals
        .ranked()
        .into_iter()
        .filter(|(_, score)| *score > 0)
        .map(|(t, score)| format!("{} ({})", t.name().to_lowercase(), score))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn build_summary_prompt(traits_text: &str) -> String {
    format!(
        "Create a 2-3 sentence personalized summary of someone's emotional patterns based on these trait scores:\n\
         {traits_text}\n\n\
         Guidelines:\n\
         - Sound warm and human, like a therapist would\n\
         - Mention specific patterns but don't list numbers\n\
         - Note both strengths and growth areas\n\
         - Keep it concise and insightful\n\
         - Never use phrases like \"based on your data\"\n\
         - Write in second person (\"You tend to...\")\n\n\
         Example good output:\n\
         \"You have a thoughtful way of reflecting on your experiences, though sometimes anxious thoughts come through. I notice you often find hopeful perspectives too.\""
    )
}

pub struct ProfileSummarizer {
    backend: Arc<dyn CompletionBackend>,
    timeout: Duration,
}

impl ProfileSummarizer {
    pub fn new(backend: Arc<dyn CompletionBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Freeform second-person narrative for the totals; the fixed fallback on any failure.
    pub async fn summarize(&self, totals: &TraitSet) -> String {
        let prompt = build_summary_prompt(&traits_text(totals));
        let request = CompletionRequest::prompt(prompt, self.timeout).with_temperature(0.8);
        match self.backend.complete(request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => FALLBACK_SUMMARY.to_string(),
            Err(e) => {
                tracing::warn!("Profile summary failed, using fallback: {}", e);
                FALLBACK_SUMMARY.to_string()
            }
        }
    }

    pub async fn profile(&self, totals: TraitSet) -> Profile {
        let summary = self.summarize(&totals).await;
        Profile::new(totals, summary)
    }
}
