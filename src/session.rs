use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::advice::AdviceItem;
use crate::chatlog::ChatRecord;
use crate::llm_client::Message;
use crate::traits::TraitSet;

pub const GREETING: &str = "Hello, I'm here to listen. What would you like to share today?";

/// Per-login conversation context, handed to every handler explicitly.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub username: String,
    pub messages: Vec<Message>,
    pub traits: TraitSet,
    pub advice_points: Vec<AdviceItem>,
    pub autosave_enabled: bool,
    pub last_save_time: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(username: impl Into<String>, autosave_enabled: bool) -> Self {
        Self {
            username: username.into(),
            messages: vec![Message::assistant(GREETING)],
            traits: TraitSet::default(),
            advice_points: Vec::new(),
            autosave_enabled,
            last_save_time: None,
        }
    }

    /// Start over: greeting only, counters zeroed. Collected advice survives.
    pub fn new_chat(&mut self) {
        self.messages = vec![Message::assistant(GREETING)];
        self.traits = TraitSet::default();
    }

    pub fn snapshot(&self, timestamp: String) -> ChatRecord {
        ChatRecord::new(
            timestamp,
            self.messages.clone(),
            self.traits,
            Some(self.advice_points.clone()),
        )
    }

    /// Autosave runs once the chat has more than the greeting and either
    /// nothing was saved yet or `interval` has passed since the last save.
    pub fn autosave_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        if !self.autosave_enabled || self.messages.len() <= 1 {
            return false;
        }
        match self.last_save_time {
            None => true,
            Some(last) => now
                .signed_duration_since(last)
                .to_std()
                .map(|elapsed| elapsed > interval)
                .unwrap_or(false),
        }
    }

    pub fn remove_advice(&mut self, uid: &str) -> Option<AdviceItem> {
        let index = self.advice_points.iter().position(|a| a.uid == uid)?;
        Some(self.advice_points.remove(index))
    }
}

/// Live sessions keyed by the bearer token issued at login. Sessions never expire.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, state: SessionState) -> String {
        let token = Uuid::new_v4().to_string();
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(token.clone(), Arc::new(Mutex::new(state)));
        token
    }

    pub fn get(&self, token: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(token)
            .cloned()
    }

    pub fn remove(&self, token: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(token)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Trait;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn new_session_starts_with_greeting() {
        let session = SessionState::new("alice", true);
        assert_eq!(session.messages, vec![Message::assistant(GREETING)]);
        assert!(session.traits.is_empty());
        assert!(session.last_save_time.is_none());
    }

    #[test]
    fn new_chat_resets_messages_and_traits_but_keeps_advice() {
        let mut session = SessionState::new("alice", true);
        session.messages.push(Message::user("hi"));
        session.traits.increment(Trait::Anxiety, 2);
        session
            .advice_points
            .push(AdviceItem::new("Try resting.", "2024-05-01T10:00:00Z"));

        session.new_chat();

        assert_eq!(session.messages.len(), 1);
        assert!(session.traits.is_empty());
        assert_eq!(session.advice_points.len(), 1);
    }

    #[test]
    fn autosave_due_rules() {
        let now = Utc::now();
        let interval = Duration::from_secs(300);
        let mut session = SessionState::new("alice", true);
        assert!(!session.autosave_due(now, interval), "greeting only");

        session.messages.push(Message::user("hi"));
        assert!(session.autosave_due(now, interval), "never saved");

        session.last_save_time = Some(now - ChronoDuration::seconds(120));
        assert!(!session.autosave_due(now, interval));

        session.last_save_time = Some(now - ChronoDuration::seconds(301));
        assert!(session.autosave_due(now, interval));

        session.last_save_time = Some(now - ChronoDuration::days(2));
        assert!(session.autosave_due(now, interval), "whole days count");

        session.autosave_enabled = false;
        assert!(!session.autosave_due(now, interval));
    }

    #[test]
    fn remove_advice_by_uid() {
        let mut session = SessionState::new("alice", true);
        let item = AdviceItem::new("Try resting.", "2024-05-01T10:00:00Z");
        let uid = item.uid.clone();
        session.advice_points.push(item);

        assert!(session.remove_advice("zzzzzz").is_none());
        assert_eq!(session.remove_advice(&uid).unwrap().text, "Try resting.");
        assert!(session.advice_points.is_empty());
    }

    #[tokio::test]
    async fn registry_issues_distinct_tokens() {
        let registry = SessionRegistry::new();
        let a = registry.create(SessionState::new("alice", true));
        let b = registry.create(SessionState::new("alice", true));
        assert_ne!(a, b);

        let session = registry.get(&a).unwrap();
        assert_eq!(session.lock().await.username, "alice");

        assert!(registry.remove(&a));
        assert!(registry.get(&a).is_none());
        assert!(!registry.remove(&a));
    }
}
