//! Crisis screening for outgoing conversation text.
//!
//! Runs before any network call. A match short-circuits the responder to a
//! fixed safety message so nothing in crisis gets sent to the provider.

/// Phrases that trigger the safety reply. Matched as lowercase substrings.
pub const EMERGENCY_PHRASES: [&str; 3] = ["kill myself", "end it all", "don't want to live"];

pub const SAFETY_MESSAGE: &str = "I hear you're in tremendous pain. You're not alone. Please:

1. Tap the 🆘 Quick Help button for immediate support
2. Consider calling a trusted friend
3. Know this feeling can pass

I'm here to listen too.";

/// Result of screening a conversation window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    /// Safe to forward to the completion endpoint
    Allow,
    /// Crisis language found; carries the matched phrase
    Crisis(&'static str),
}

impl SafetyVerdict {
    pub fn is_crisis(&self) -> bool {
        matches!(self, SafetyVerdict::Crisis(_))
    }
}

/// Screen text for emergency phrases (case-insensitive substring match).
pub fn screen(text: &str) -> SafetyVerdict {
    let normalized = normalize(text);
    for phrase in EMERGENCY_PHRASES {
        if normalized.contains(phrase) {
            tracing::warn!("Emergency phrase detected; returning safety message");
            return SafetyVerdict::Crisis(phrase);
        }
    }
    SafetyVerdict::Allow
}

// Phones and chat UIs often substitute a typographic apostrophe.
fn normalize(text: &str) -> String {
    text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_end_it_all() {
        assert_eq!(
            screen("user: I want to end it all"),
            SafetyVerdict::Crisis("end it all")
        );
    }

    #[test]
    fn test_match_is_case_insensitive() {
        assert!(screen("Sometimes I think I should KILL MYSELF").is_crisis());
    }

    #[test]
    fn test_typographic_apostrophe() {
        assert!(screen("I don\u{2019}t want to live anymore").is_crisis());
    }

    #[test]
    fn test_substring_not_word_bound() {
        // Substring semantics: "pretend it all" still contains the phrase.
        assert!(screen("we pretend it all works").is_crisis());
    }

    #[test]
    fn test_ordinary_text_allowed() {
        assert_eq!(screen("I had a rough day at work"), SafetyVerdict::Allow);
        assert_eq!(screen(""), SafetyVerdict::Allow);
    }

    #[test]
    fn test_safety_message_points_to_help() {
        assert!(SAFETY_MESSAGE.contains("Quick Help"));
        assert!(SAFETY_MESSAGE.contains("not alone"));
    }
}
