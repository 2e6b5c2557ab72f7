use std::time::Duration;

use lantern_llm::{CancellationToken, GenerateRequest};
use snafu::ResultExt;

use super::coordinator::{CollectedEnding, collect_generation};
use super::error::{ChatResult, GenerationStartSnafu, NoCurrentConversationSnafu};
use super::events::{NotificationLevel, SessionEvent};
use super::message::{Author, MessageId};
use super::session::ChatSession;

pub const SUMMARY_PROMPT: &str =
    "Summarize the conversation so far in two or three sentences. Reply with the summary only.";

impl ChatSession {
    /// Asks the model for a summary of the current conversation.
    ///
    /// Runs to completion or until `deadline`, whichever comes first. The text is
    /// kept as the conversation summary and appended as a display-only message.
    /// Returns `None` when there is no session or nothing came back.
    pub async fn summarize_current(
        &mut self,
        deadline: Duration,
    ) -> ChatResult<Option<MessageId>> {
        self.ensure_idle("summarize")?;
        let Some(conversation_id) = self.store.current_id() else {
            return NoCurrentConversationSnafu { stage: "summarize" }.fail();
        };
        if !self.controller.is_bound_to(conversation_id) {
            tracing::debug!(
                conversation_id = %conversation_id,
                "summary skipped without a session"
            );
            return Ok(None);
        }
        if self.controller.needs_rebuild(conversation_id) {
            self.rebuild_conversation(conversation_id)?;
        }
        let Some(session) = self.controller.session_for(conversation_id) else {
            return Ok(None);
        };

        let cancel = CancellationToken::new();
        let request = GenerateRequest::new(SUMMARY_PROMPT, self.settings.settings().sampling());
        let handle = self
            .engine
            .stream_generate(session, request, cancel.clone())
            .context(GenerationStartSnafu {
                stage: "summarize-stream-generate",
            })?;
        let collected = collect_generation(handle, cancel, deadline).await;

        // The engine absorbed the summary exchange, which the transcript does not replay.
        self.controller.mark_stale(conversation_id);

        if let CollectedEnding::Failed(message) = &collected.ended {
            tracing::warn!(conversation_id = %conversation_id, error = %message, "summary failed");
            self.observers
                .notify(NotificationLevel::Error, format!("summary failed: {message}"));
            return Ok(None);
        }

        let text = collected.text.trim();
        if text.is_empty() {
            self.observers
                .notify(NotificationLevel::Warning, "the model returned an empty summary");
            return Ok(None);
        }
        if collected.ended == CollectedEnding::Cancelled {
            tracing::debug!(conversation_id = %conversation_id, "keeping partial summary");
        }

        let text = text.to_string();
        let message_id = self.store.append(conversation_id, Author::Summary, text.clone());
        if let Some(conversation) = self.store.get_mut(conversation_id) {
            conversation.summary = Some(text);
        }
        if let Some(message_id) = message_id {
            self.observers.emit(SessionEvent::MessageAppended {
                conversation_id,
                message_id,
            });
        }
        Ok(message_id)
    }
}
