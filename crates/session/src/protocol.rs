//! Edit, delete and regenerate on the current conversation.
//!
//! Committed changes to user or assistant turns leave the bound context stale;
//! the next submit rebuilds it from the transcript before generating.

use snafu::ResultExt;

use super::error::{
    ChatResult, GenerationInProgressSnafu, MessageNotFoundSnafu, NoCurrentConversationSnafu,
    NothingToRegenerateSnafu, RegenerateMissingUserTurnSnafu, RegenerateUnsupportedSnafu,
    SessionRebuildSnafu,
};
use super::events::{NotificationLevel, SessionEvent};
use super::message::{ConversationId, Message, MessageId, RegenerateRefusal};
use super::session::{ChatSession, IgnoreReason, SubmitOutcome};

impl ChatSession {
    /// Snapshots the message text and enters editing. Returns `false` if it was
    /// already being edited.
    pub fn begin_edit(&mut self, message_id: MessageId) -> ChatResult<bool> {
        // The message being streamed into cannot be edited until it settles.
        if self
            .coordinator
            .active_target()
            .is_some_and(|target| target.message_id == message_id)
        {
            return GenerationInProgressSnafu { stage: "begin-edit" }.fail();
        }
        self.edit_message(message_id, "begin-edit", Message::begin_edit)
    }

    pub fn set_edit_text(
        &mut self,
        message_id: MessageId,
        text: impl Into<String>,
    ) -> ChatResult<bool> {
        let text = text.into();
        self.edit_message(message_id, "set-edit-text", |message| {
            message.set_edit_text(text)
        })
    }

    /// Commits the draft. Committing a user or assistant turn invalidates the context.
    pub fn save_edit(&mut self, message_id: MessageId) -> ChatResult<bool> {
        self.ensure_idle("save-edit")?;
        let (conversation_id, message) = self.current_message_mut(message_id, "save-edit")?;
        if !message.save_edit() {
            return Ok(false);
        }

        let replayed = message.author.is_replayed();
        if replayed {
            self.controller.mark_stale(conversation_id);
        }
        tracing::debug!(message_id = %message_id, replayed, "edit saved");
        self.observers.emit(SessionEvent::MessageChanged {
            conversation_id,
            message_id,
        });
        Ok(true)
    }

    /// Restores the text captured by `begin_edit`.
    pub fn cancel_edit(&mut self, message_id: MessageId) -> ChatResult<bool> {
        self.edit_message(message_id, "cancel-edit", Message::cancel_edit)
    }

    /// Removes a message from the current conversation and returns it.
    pub fn delete_message(&mut self, message_id: MessageId) -> ChatResult<Message> {
        self.ensure_idle("delete-message")?;
        let conversation_id = self.current_id("delete-message")?;
        let removed = self
            .store
            .get_mut(conversation_id)
            .and_then(|conversation| conversation.remove(message_id));
        let Some(removed) = removed else {
            return MessageNotFoundSnafu {
                stage: "delete-message",
                message_id,
            }
            .fail();
        };

        if removed.author.is_replayed() {
            self.controller.mark_stale(conversation_id);
        }
        self.observers.emit(SessionEvent::MessageRemoved {
            conversation_id,
            message_id,
        });
        Ok(removed)
    }

    /// Truncates back to before a turn and generates it again.
    ///
    /// `None` targets the last message. The context is rebuilt from the truncated
    /// transcript before anything is removed, so a failed rebuild leaves the
    /// transcript untouched.
    pub fn regenerate(&mut self, target: Option<MessageId>) -> ChatResult<SubmitOutcome> {
        self.ensure_idle("regenerate")?;
        let conversation_id = self.current_id("regenerate")?;
        let Some(conversation) = self.store.get(conversation_id) else {
            return NoCurrentConversationSnafu { stage: "regenerate" }.fail();
        };

        let Some(target) = target.or_else(|| conversation.last_message().map(|last| last.id))
        else {
            return NothingToRegenerateSnafu { stage: "regenerate" }.fail();
        };

        let plan = match conversation.regenerate_plan(target) {
            Ok(plan) => plan,
            Err(RegenerateRefusal::NotFound) => {
                return MessageNotFoundSnafu {
                    stage: "regenerate",
                    message_id: target,
                }
                .fail();
            }
            Err(RegenerateRefusal::MissingUserTurn) => {
                return RegenerateMissingUserTurnSnafu {
                    stage: "regenerate",
                    message_id: target,
                }
                .fail();
            }
            Err(RegenerateRefusal::UnsupportedAuthor(author)) => {
                return RegenerateUnsupportedSnafu {
                    stage: "regenerate",
                    message_id: target,
                    author,
                }
                .fail();
            }
        };

        if !self.controller.is_bound_to(conversation_id) {
            tracing::debug!(
                conversation_id = %conversation_id,
                "regenerate ignored without a session"
            );
            return Ok(SubmitOutcome::Ignored(IgnoreReason::NoSession));
        }

        let settings = self.settings.settings();
        let truncated = &conversation.messages()[..plan.keep];
        let report = match self.controller.rebuild(&settings, conversation_id, truncated) {
            Ok(report) => report,
            Err(source) => {
                tracing::error!(error = %source, "rebuild for regenerate failed");
                self.observers.emit(SessionEvent::ContextReleased);
                self.observers.notify(
                    NotificationLevel::Error,
                    format!("context rebuild failed: {source}"),
                );
                return Err(source).context(SessionRebuildSnafu {
                    stage: "regenerate-rebuild",
                    conversation_id,
                });
            }
        };
        if let Some(report) = report {
            self.emit_rebuilt(report);
        }

        let removed = self
            .store
            .get_mut(conversation_id)
            .map(|conversation| conversation.truncate(plan.keep))
            .unwrap_or_default();
        for message in &removed {
            self.observers.emit(SessionEvent::MessageRemoved {
                conversation_id,
                message_id: message.id,
            });
        }
        tracing::debug!(
            conversation_id = %conversation_id,
            removed = removed.len(),
            "transcript truncated for regenerate"
        );

        self.submit(&plan.prompt)
    }

    fn current_id(&self, stage: &'static str) -> ChatResult<ConversationId> {
        match self.store.current_id() {
            Some(conversation_id) => Ok(conversation_id),
            None => NoCurrentConversationSnafu { stage }.fail(),
        }
    }

    fn current_message_mut(
        &mut self,
        message_id: MessageId,
        stage: &'static str,
    ) -> ChatResult<(ConversationId, &mut Message)> {
        let conversation_id = self.current_id(stage)?;
        let message = self
            .store
            .get_mut(conversation_id)
            .and_then(|conversation| conversation.message_mut(message_id));
        match message {
            Some(message) => Ok((conversation_id, message)),
            None => MessageNotFoundSnafu { stage, message_id }.fail(),
        }
    }

    fn edit_message(
        &mut self,
        message_id: MessageId,
        stage: &'static str,
        change: impl FnOnce(&mut Message) -> bool,
    ) -> ChatResult<bool> {
        let (conversation_id, message) = self.current_message_mut(message_id, stage)?;
        let changed = change(message);
        if changed {
            self.observers.emit(SessionEvent::MessageChanged {
                conversation_id,
                message_id,
            });
        }
        Ok(changed)
    }
}
