use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::advice::{self, AdviceItem};
use crate::config::ReplyWindow;
use crate::llm_client::{CompletionBackend, CompletionRequest, Message};
use crate::safety::{self, SAFETY_MESSAGE};

pub const FALLBACK_REPLY: &str = "I'm here for you—can you share a bit more?";

/// Number of trailing messages included in the "recent" transcript window.
pub const RECENT_WINDOW: usize = 4;

const THERAPIST_GUIDELINES: &str = "As an empathetic therapist, craft a response that:
- Validates the person's feelings naturally
- Asks thoughtful open-ended questions
- Helps explore thoughts without being directive
- Sounds completely natural without instructions
- Don't describe your tone
- Don't make any visual gestures, just offer a lending ear and advice when asked for
- Add an appropriate emoji for the response also
- Offer tips and advice when asked for";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Completion,
    Safety,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub text: String,
    pub source: ReplySource,
    pub advice: Vec<AdviceItem>,
    /// Non-blocking notice for the UI when the endpoint failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

impl Reply {
    fn safety() -> Self {
        Self {
            text: SAFETY_MESSAGE.to_string(),
            source: ReplySource::Safety,
            advice: Vec::new(),
            notice: None,
        }
    }

    fn fallback(notice: String) -> Self {
        Self {
            text: FALLBACK_REPLY.to_string(),
            source: ReplySource::Fallback,
            advice: Vec::new(),
            notice: Some(notice),
        }
    }
}

/// "role: content" lines for the last `RECENT_WINDOW` messages.
pub fn conversation_window(messages: &[Message]) -> String {
    let start = messages.len().saturating_sub(RECENT_WINDOW);
    messages[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_reply_prompt(convo: &str) -> String {
    format!("{THERAPIST_GUIDELINES}\n\nCurrent conversation:\n{convo}\n\nRespond in 2-3 sentences:")
}

pub struct Responder {
    backend: Arc<dyn CompletionBackend>,
    window: ReplyWindow,
    timeout: Duration,
}

impl Responder {
    pub fn new(backend: Arc<dyn CompletionBackend>, window: ReplyWindow, timeout: Duration) -> Self {
        Self {
            backend,
            window,
            timeout,
        }
    }

    /// Produce the assistant's next turn for `messages` (which already ends
    /// with the user's newest message). Never fails: crisis text gets the
    /// safety message without a network call, endpoint errors get the fallback.
    pub async fn respond(&self, messages: &[Message]) -> Reply {
        let (screened, request) = match self.window {
            ReplyWindow::Recent => {
                let convo = conversation_window(messages);
                let request = CompletionRequest::prompt(build_reply_prompt(&convo), self.timeout);
                (convo, request)
            }
            ReplyWindow::Full => {
                let combined = messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                let mut provider_messages = Vec::with_capacity(messages.len() + 1);
                provider_messages.push(Message::system(format!(
                    "{THERAPIST_GUIDELINES}\n\nRespond in 2-3 sentences."
                )));
                provider_messages.extend_from_slice(messages);
                (combined, CompletionRequest::new(provider_messages, self.timeout))
            }
        };

        if safety::screen(&screened).is_crisis() {
            return Reply::safety();
        }

        match self.backend.complete(request).await {
            Ok(text) if !text.trim().is_empty() => {
                let text = text.trim().to_string();
                let advice = advice::extract(&text);
                tracing::debug!(
                    "Reply received ({} chars, {} advice points)",
                    text.len(),
                    advice.len()
                );
                Reply {
                    text,
                    source: ReplySource::Completion,
                    advice,
                    notice: None,
                }
            }
            Ok(_) => {
                tracing::warn!("Completion endpoint returned an empty reply");
                Reply::fallback("Error getting AI response: empty reply".to_string())
            }
            Err(e) => {
                tracing::warn!("Error getting AI response: {:#}", e);
                Reply::fallback(format!("Error getting AI response: {e}"))
            }
        }
    }
}
