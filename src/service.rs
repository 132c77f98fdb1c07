use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::advice::{group_by_day, now_timestamp, AdviceGroup, AdviceItem, AdviceRefiner};
use crate::chatlog::{AppendOutcome, AppendPolicy, ChatLogStore, ChatRecord};
use crate::config::AppConfig;
use crate::llm_client::{CompletionBackend, Message};
use crate::profile::{Profile, ProfileSummarizer};
use crate::responder::{Reply, Responder};
use crate::session::SessionState;
use crate::traits::{self, TraitSet};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Result of one chat turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub reply: Reply,
    /// Trait increments caused by this reply alone.
    pub traits_delta: TraitSet,
    pub traits: TraitSet,
    pub autosaved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autosave_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    pub index: usize,
    pub label: String,
    pub timestamp: String,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveOutcome {
    pub saved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl From<AppendOutcome> for SaveOutcome {
    fn from(outcome: AppendOutcome) -> Self {
        match outcome {
            AppendOutcome::Appended { index } => Self {
                saved: true,
                index: Some(index),
            },
            AppendOutcome::Unchanged => Self {
                saved: false,
                index: None,
            },
        }
    }
}

/// One handler per user action. Handlers receive the caller's session
/// explicitly and never hold it across requests.
pub struct ChatService {
    backend: Arc<dyn CompletionBackend>,
    responder: Responder,
    summarizer: ProfileSummarizer,
    store: ChatLogStore,
    refine_timeout: Duration,
    autosave_interval: Duration,
    autosave_default: bool,
}

impl ChatService {
    pub fn new(config: &AppConfig, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            responder: Responder::new(
                backend.clone(),
                config.reply_window,
                config.reply_timeout(),
            ),
            summarizer: ProfileSummarizer::new(backend.clone(), config.summary_timeout()),
            store: ChatLogStore::new(&config.userdata_dir),
            refine_timeout: config.refine_timeout(),
            autosave_interval: config.autosave_interval(),
            autosave_default: config.autosave_default,
            backend,
        }
    }

    pub fn new_session(&self, username: &str) -> SessionState {
        SessionState::new(username, self.autosave_default)
    }

    pub async fn send_message(
        &self,
        session: &mut SessionState,
        text: &str,
    ) -> Result<TurnOutcome, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::Invalid("Message cannot be empty".to_string()));
        }
        session.messages.push(Message::user(text));

        let reply = self.responder.respond(&session.messages).await;
        let traits_delta = traits::score(&reply.text, &mut session.traits);
        session.messages.push(Message::assistant(reply.text.clone()));
        session.advice_points.extend(reply.advice.iter().cloned());

        let (autosaved, autosave_error) = match self.autosave(session) {
            Ok(saved) => (saved, None),
            Err(e) => {
                tracing::warn!("Autosave failed for {}: {:#}", session.username, e);
                (false, Some(format!("Autosave failed: {e}")))
            }
        };

        Ok(TurnOutcome {
            reply,
            traits_delta,
            traits: session.traits,
            autosaved,
            autosave_error,
        })
    }

    /// Write a snapshot when autosave is due and the content changed since
    /// the newest stored record. Returns whether a record was written.
    pub fn autosave(&self, session: &mut SessionState) -> anyhow::Result<bool> {
        let now = Utc::now();
        if !session.autosave_due(now, self.autosave_interval) {
            return Ok(false);
        }
        let record = session.snapshot(now_timestamp());
        match self
            .store
            .append_record(&session.username, record, AppendPolicy::SkipIfUnchanged)?
        {
            AppendOutcome::Appended { .. } => {
                session.last_save_time = Some(now);
                Ok(true)
            }
            AppendOutcome::Unchanged => Ok(false),
        }
    }

    /// Manual save: always appends.
    pub fn save_current(&self, session: &mut SessionState) -> Result<SaveOutcome, ServiceError> {
        let record = session.snapshot(now_timestamp());
        let outcome = self
            .store
            .append_record(&session.username, record, AppendPolicy::Always)?;
        session.last_save_time = Some(Utc::now());
        Ok(outcome.into())
    }

    pub fn list_chats(&self, session: &SessionState) -> Vec<ChatSummary> {
        self.store
            .load_records(&session.username)
            .iter()
            .enumerate()
            .map(|(index, record)| ChatSummary {
                index,
                label: record.label(index),
                timestamp: record.timestamp.clone(),
                message_count: record.messages.len(),
            })
            .collect()
    }

    pub fn get_chat(
        &self,
        session: &SessionState,
        index: usize,
    ) -> Result<ChatRecord, ServiceError> {
        self.store
            .get_record(&session.username, index)
            .ok_or_else(|| chat_not_found(index))
    }

    pub fn rename_chat(
        &self,
        session: &SessionState,
        index: usize,
        name: &str,
    ) -> Result<ChatRecord, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::Invalid("Chat name cannot be empty".to_string()));
        }
        self.store
            .rename_record(&session.username, index, name)?
            .ok_or_else(|| chat_not_found(index))
    }

    /// Replace the session's advice with the advice stored on a saved chat.
    pub fn load_chat_advice(
        &self,
        session: &mut SessionState,
        index: usize,
    ) -> Result<Vec<AdviceItem>, ServiceError> {
        let record = self.get_chat(session, index)?;
        let Some(points) = record.advice_points else {
            return Err(ServiceError::NotFound(format!(
                "Chat {} has no saved advice",
                index + 1
            )));
        };
        session.advice_points = points;
        Ok(session.advice_points.clone())
    }

    /// Totals over every saved chat plus the live session.
    pub fn total_traits(&self, session: &SessionState) -> TraitSet {
        let mut totals = self.store.total_traits(&session.username);
        totals.accumulate(&session.traits);
        totals
    }

    pub async fn profile(&self, session: &SessionState) -> Profile {
        self.summarizer.profile(self.total_traits(session)).await
    }

    /// Refine unrefined items with a readable timestamp, then group by day.
    pub async fn advice(&self, session: &mut SessionState) -> Vec<AdviceGroup> {
        let refiner = AdviceRefiner::new(self.backend.as_ref(), self.refine_timeout);
        let rewritten = refiner.refine_all(&mut session.advice_points).await;
        if rewritten > 0 {
            tracing::debug!("Refined {} advice points for {}", rewritten, session.username);
        }
        group_by_day(&session.advice_points)
    }

    pub fn delete_advice(
        &self,
        session: &mut SessionState,
        uid: &str,
    ) -> Result<AdviceItem, ServiceError> {
        session
            .remove_advice(uid)
            .ok_or_else(|| ServiceError::NotFound(format!("No advice with id {uid}")))
    }

    pub fn set_autosave(&self, session: &mut SessionState, enabled: bool) {
        session.autosave_enabled = enabled;
    }

    pub fn new_chat(&self, session: &mut SessionState) {
        session.new_chat();
    }
}

fn chat_not_found(index: usize) -> ServiceError {
    ServiceError::NotFound(format!("No saved chat at index {index}"))
}
