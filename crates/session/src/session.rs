//! The conversation session engine.
//!
//! [`ChatSession`] composes the store, the controller and the coordinator and is
//! the only thing that mutates transcript state. All commands run on the caller's
//! task; the engine worker feeds fragments back through [`ChatSession::advance`].

use std::path::Path;
use std::sync::Arc;

use lantern_llm::{CancellationToken, GenerateRequest, InferenceEngine};
use snafu::ResultExt;

use super::controller::{RebuildReport, ReplayPlan, SessionController};
use super::coordinator::{
    CANCELLED_MARKER, GenerationCoordinator, GenerationOutcome, GenerationState, GenerationStep,
    GenerationTarget, StartError, error_annotation,
};
use super::error::{
    ChatResult, ConversationNotFoundSnafu, GenerationInProgressSnafu, GenerationStartSnafu,
    ModelLoadSnafu, NoCurrentConversationSnafu, SessionRebuildSnafu, SettingsPersistSnafu,
};
use super::events::{NotificationLevel, Observers, SessionEvent, SessionObserver};
use super::message::{Author, Conversation, ConversationId, MessageId, MessageStatus};
use super::settings::{SessionSettings, SettingsStore};
use super::store::{ConversationStore, Selection};

/// Why a command was accepted but did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No model is loaded or the last rebuild failed.
    NoSession,
    GenerationInProgress,
    NoConversation,
    EmptyPrompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started {
        user_message: MessageId,
        assistant_message: MessageId,
    },
    Ignored(IgnoreReason),
}

impl SubmitOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// Progress of the in-flight generation as seen by a caller pumping it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationProgress {
    Idle,
    Fragment {
        message_id: MessageId,
        text: String,
    },
    Finished(GenerationOutcome),
}

pub struct ChatSession {
    pub(crate) engine: Arc<dyn InferenceEngine>,
    pub(crate) settings: SettingsStore,
    pub(crate) store: ConversationStore,
    pub(crate) controller: SessionController,
    pub(crate) coordinator: GenerationCoordinator,
    pub(crate) observers: Observers,
}

impl ChatSession {
    pub fn new(engine: Arc<dyn InferenceEngine>, settings: SettingsStore) -> Self {
        Self {
            controller: SessionController::new(engine.clone()),
            engine,
            settings,
            store: ConversationStore::new(),
            coordinator: GenerationCoordinator::new(),
            observers: Observers::default(),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.add(observer);
    }

    pub fn settings(&self) -> Arc<SessionSettings> {
        self.settings.settings()
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn conversations(&self) -> &[Conversation] {
        self.store.conversations()
    }

    pub fn current_conversation(&self) -> Option<&Conversation> {
        self.store.current()
    }

    pub fn generation_state(&self) -> &GenerationState {
        self.coordinator.state()
    }

    pub fn is_generating(&self) -> bool {
        self.coordinator.is_generating()
    }

    pub fn has_model(&self) -> bool {
        self.controller.has_model()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.controller.model().map(|model| model.name())
    }

    /// True when `submit` would reach the engine for the current conversation.
    pub fn has_session(&self) -> bool {
        self.store
            .current_id()
            .is_some_and(|id| self.controller.is_bound_to(id))
    }

    /// Loads model weights and binds the current conversation to them.
    pub async fn load_model(&mut self, path: &Path) -> ChatResult<()> {
        self.drain_generation().await;
        let settings = self.settings.settings();

        let released = self.controller.has_model();
        if let Err(source) = self.controller.load_model(path, settings.load_params()).await {
            tracing::error!(path = ?path, error = %source, "failed to load model");
            if released {
                self.observers.emit(SessionEvent::ContextReleased);
            }
            self.observers
                .notify(NotificationLevel::Error, format!("model load failed: {source}"));
            return Err(source).context(ModelLoadSnafu {
                stage: "load-model",
                path: path.to_path_buf(),
            });
        }

        let mut remembered = (*settings).clone();
        remembered.last_model_path = Some(path.to_path_buf());
        if let Err(error) = self.settings.update(remembered) {
            tracing::warn!(error = %error, "failed to remember last model path");
        }

        self.observers.notify(
            NotificationLevel::Info,
            format!("loaded model {}", self.model_name().unwrap_or_default()),
        );
        self.rebuild_current_binding()?;
        Ok(())
    }

    pub async fn unload_model(&mut self) -> bool {
        self.drain_generation().await;
        let unloaded = self.controller.unload();
        if unloaded {
            self.observers.emit(SessionEvent::ContextReleased);
        }
        unloaded
    }

    pub async fn create_conversation(&mut self) -> ChatResult<ConversationId> {
        self.drain_generation().await;
        let conversation_id = self.store.create();
        self.announce_new_conversation(conversation_id)?;
        Ok(conversation_id)
    }

    /// Creates a conversation holding one display-only document message.
    pub async fn import_document(
        &mut self,
        source_path: &Path,
        text: impl Into<String>,
    ) -> ChatResult<ConversationId> {
        self.drain_generation().await;
        let title = source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_path.display().to_string());

        let conversation_id = self.store.create_titled(title);
        let message_id = self.store.append(conversation_id, Author::Document, text);
        if let Some(conversation) = self.store.get_mut(conversation_id) {
            conversation.source_path = Some(source_path.to_path_buf());
        }
        tracing::info!(path = ?source_path, conversation_id = %conversation_id, "imported document");

        self.observers
            .emit(SessionEvent::ConversationCreated { conversation_id });
        if let Some(message_id) = message_id {
            self.observers.emit(SessionEvent::MessageAppended {
                conversation_id,
                message_id,
            });
        }
        self.observers.emit(SessionEvent::ConversationSelected {
            conversation_id: Some(conversation_id),
        });
        self.rebuild_current_binding()?;
        Ok(conversation_id)
    }

    /// Removes a conversation. Only a context bound to it is released; the model stays.
    pub async fn close_conversation(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        if self
            .coordinator
            .active_target()
            .is_some_and(|target| target.conversation_id == conversation_id)
        {
            self.drain_generation().await;
        }

        let Some(closed) = self.store.close(conversation_id) else {
            return ConversationNotFoundSnafu {
                stage: "close-conversation",
                conversation_id,
            }
            .fail();
        };

        if self.controller.is_bound_to(conversation_id) {
            self.controller.release();
            self.observers.emit(SessionEvent::ContextReleased);
        }
        self.observers
            .emit(SessionEvent::ConversationClosed { conversation_id });

        if closed.was_current {
            self.observers.emit(SessionEvent::ConversationSelected {
                conversation_id: self.store.current_id(),
            });
            self.rebuild_current_binding()?;
        }
        Ok(())
    }

    /// Makes `conversation_id` current. Selecting the current conversation is a no-op.
    pub async fn select_conversation(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        match self.store.get(conversation_id) {
            None => {
                return ConversationNotFoundSnafu {
                    stage: "select-conversation",
                    conversation_id,
                }
                .fail();
            }
            Some(_) if self.store.current_id() == Some(conversation_id) => return Ok(()),
            Some(_) => {}
        }

        self.drain_generation().await;
        if self.store.select(conversation_id) == Selection::Changed {
            self.observers.emit(SessionEvent::ConversationSelected {
                conversation_id: Some(conversation_id),
            });
            self.rebuild_current_binding()?;
        }
        Ok(())
    }

    /// Appends a user turn and starts streaming the reply into a pending
    /// assistant message.
    pub fn submit(&mut self, prompt: &str) -> ChatResult<SubmitOutcome> {
        if self.coordinator.is_generating() {
            return Ok(ignored(IgnoreReason::GenerationInProgress));
        }
        if prompt.trim().is_empty() {
            return Ok(ignored(IgnoreReason::EmptyPrompt));
        }
        let Some(conversation_id) = self.store.current_id() else {
            return Ok(ignored(IgnoreReason::NoConversation));
        };
        if !self.controller.is_bound_to(conversation_id) {
            return Ok(ignored(IgnoreReason::NoSession));
        }
        if self.controller.needs_rebuild(conversation_id) {
            self.rebuild_conversation(conversation_id)?;
        }
        let Some(session) = self.controller.session_for(conversation_id) else {
            return Ok(ignored(IgnoreReason::NoSession));
        };

        let Some(user_message) = self.store.append(conversation_id, Author::User, prompt) else {
            return Ok(ignored(IgnoreReason::NoConversation));
        };
        let Some(assistant_message) = self.store.append_placeholder(conversation_id) else {
            return Ok(ignored(IgnoreReason::NoConversation));
        };
        for message_id in [user_message, assistant_message] {
            self.observers.emit(SessionEvent::MessageAppended {
                conversation_id,
                message_id,
            });
        }

        let target = GenerationTarget::new(conversation_id, assistant_message);
        let request = GenerateRequest::new(prompt, self.settings.settings().sampling());

        match self
            .coordinator
            .start(self.engine.as_ref(), session, target, request)
        {
            Ok(()) => {
                self.emit_generation_state();
                Ok(SubmitOutcome::Started {
                    user_message,
                    assistant_message,
                })
            }
            Err(StartError::Rejected(rejection)) => {
                tracing::debug!(rejection = ?rejection, "generation start rejected");
                Ok(ignored(IgnoreReason::GenerationInProgress))
            }
            Err(StartError::Engine(source)) => {
                tracing::error!(error = %source, "failed to start generation");
                let message = source.to_string();
                self.annotate_target(target, &error_annotation(&message), MessageStatus::Failed);
                self.controller.mark_stale(conversation_id);
                self.observers
                    .notify(NotificationLevel::Error, format!("generation failed: {message}"));
                Err(source).context(GenerationStartSnafu {
                    stage: "submit-stream-generate",
                })
            }
        }
    }

    /// Applies the next event of the in-flight generation to the transcript.
    ///
    /// Cancel safe, so it can sit in a `select!` next to an interrupt signal.
    pub async fn advance(&mut self) -> GenerationProgress {
        match self.coordinator.next_step().await {
            GenerationStep::Idle => GenerationProgress::Idle,
            GenerationStep::Fragment { target, text } => {
                if let Some(message) = self
                    .store
                    .get_mut(target.conversation_id)
                    .and_then(|conversation| conversation.message_mut(target.message_id))
                {
                    message.append_fragment(&text);
                }
                self.observers.emit(SessionEvent::MessageChanged {
                    conversation_id: target.conversation_id,
                    message_id: target.message_id,
                });
                GenerationProgress::Fragment {
                    message_id: target.message_id,
                    text,
                }
            }
            GenerationStep::Finished(outcome) => {
                self.apply_outcome(&outcome);
                GenerationProgress::Finished(outcome)
            }
        }
    }

    /// Pumps the in-flight generation until it ends.
    pub async fn finish_generation(&mut self) -> Option<GenerationOutcome> {
        loop {
            match self.advance().await {
                GenerationProgress::Idle => return None,
                GenerationProgress::Fragment { .. } => {}
                GenerationProgress::Finished(outcome) => return Some(outcome),
            }
        }
    }

    /// Asks the in-flight generation to stop. No-op when idle.
    pub fn cancel(&self) -> bool {
        self.coordinator.cancel()
    }

    pub fn cancel_handle(&self) -> Option<CancellationToken> {
        self.coordinator.cancel_handle()
    }

    /// Explicitly rebuilds the context of the current conversation.
    pub fn rebuild_current(&mut self) -> ChatResult<Option<RebuildReport>> {
        self.ensure_idle("rebuild-current")?;
        let Some(conversation_id) = self.store.current_id() else {
            return NoCurrentConversationSnafu {
                stage: "rebuild-current",
            }
            .fail();
        };
        self.rebuild_conversation(conversation_id)
    }

    /// Persists new settings. The bound context picks them up on its next rebuild.
    pub fn update_settings(&mut self, settings: SessionSettings) -> ChatResult<()> {
        self.settings.update(settings).context(SettingsPersistSnafu {
            stage: "update-settings",
        })?;
        self.controller.mark_any_stale();
        Ok(())
    }

    /// Appends a transcript-only note to the current conversation.
    pub fn append_annotation(
        &mut self,
        author: Author,
        text: impl Into<String>,
    ) -> ChatResult<MessageId> {
        self.ensure_idle("append-annotation")?;
        let Some(conversation_id) = self.store.current_id() else {
            return NoCurrentConversationSnafu {
                stage: "append-annotation",
            }
            .fail();
        };
        let Some(message_id) = self.store.append(conversation_id, author, text) else {
            return NoCurrentConversationSnafu {
                stage: "append-annotation",
            }
            .fail();
        };

        if author.is_replayed() {
            self.controller.mark_stale(conversation_id);
        }
        self.observers.emit(SessionEvent::MessageAppended {
            conversation_id,
            message_id,
        });
        Ok(message_id)
    }

    /// Stops any generation and releases the context and the model.
    pub async fn shutdown(&mut self) {
        self.drain_generation().await;
        if self.controller.unload() {
            self.observers.emit(SessionEvent::ContextReleased);
        }
    }

    /// Cancels the in-flight generation and waits for its terminal event.
    pub(crate) async fn drain_generation(&mut self) {
        if self.coordinator.cancel() {
            self.finish_generation().await;
        }
    }

    pub(crate) fn ensure_idle(&self, stage: &'static str) -> ChatResult<()> {
        if self.coordinator.is_generating() {
            return GenerationInProgressSnafu { stage }.fail();
        }
        Ok(())
    }

    pub(crate) fn rebuild_conversation(
        &mut self,
        conversation_id: ConversationId,
    ) -> ChatResult<Option<RebuildReport>> {
        let settings = self.settings.settings();
        let Some(conversation) = self.store.get(conversation_id) else {
            return ConversationNotFoundSnafu {
                stage: "rebuild-conversation",
                conversation_id,
            }
            .fail();
        };

        match self
            .controller
            .rebuild(&settings, conversation_id, conversation.messages())
        {
            Ok(report) => {
                if let Some(report) = report {
                    self.emit_rebuilt(report);
                }
                Ok(report)
            }
            Err(source) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %source,
                    "context rebuild failed"
                );
                self.observers.emit(SessionEvent::ContextReleased);
                self.observers
                    .notify(NotificationLevel::Error, format!("context rebuild failed: {source}"));
                Err(source).context(SessionRebuildSnafu {
                    stage: "rebuild-conversation",
                    conversation_id,
                })
            }
        }
    }

    pub(crate) fn emit_rebuilt(&self, report: RebuildReport) {
        if report.dropped_turns > 0 {
            self.observers.notify(
                NotificationLevel::Warning,
                format!(
                    "history exceeds the context window, {} oldest turns were left out",
                    report.dropped_turns
                ),
            );
        }
        self.observers.emit(SessionEvent::ContextRebuilt {
            conversation_id: report.conversation_id,
            replayed_turns: report.replayed_turns,
            dropped_turns: report.dropped_turns,
        });
    }

    /// Rebinds to whatever is current now, or releases if nothing is.
    pub(crate) fn rebuild_current_binding(&mut self) -> ChatResult<()> {
        match self.store.current_id() {
            Some(conversation_id) => {
                self.rebuild_conversation(conversation_id)?;
            }
            None => {
                if self.controller.release().is_some() {
                    self.observers.emit(SessionEvent::ContextReleased);
                }
            }
        }
        Ok(())
    }

    fn announce_new_conversation(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        self.observers
            .emit(SessionEvent::ConversationCreated { conversation_id });
        self.observers.emit(SessionEvent::ConversationSelected {
            conversation_id: Some(conversation_id),
        });
        self.rebuild_current_binding()
    }

    fn apply_outcome(&mut self, outcome: &GenerationOutcome) {
        let target = outcome.target();
        match outcome {
            GenerationOutcome::Completed(_) => {
                self.annotate_target(target, "", MessageStatus::Done);
            }
            GenerationOutcome::Cancelled(_) => {
                self.annotate_target(target, CANCELLED_MARKER, MessageStatus::Cancelled);
            }
            GenerationOutcome::Failed { message, .. } => {
                self.annotate_target(target, &error_annotation(message), MessageStatus::Failed);
                self.observers
                    .notify(NotificationLevel::Error, format!("generation failed: {message}"));
            }
        }

        self.emit_generation_state();
        if self.coordinator.settle() {
            self.emit_generation_state();
        }

        // A marker or error note is in the transcript but not in the context.
        let diverged = !matches!(outcome, GenerationOutcome::Completed(_));
        self.resync_context(target.conversation_id, diverged);
    }

    /// Rebuilds the bound context when what the engine absorbed no longer matches
    /// a replay of the transcript, or when the history outgrew its budget.
    fn resync_context(&mut self, conversation_id: ConversationId, diverged: bool) {
        if !self.controller.is_bound_to(conversation_id) {
            return;
        }
        let settings = self.settings.settings();
        let overflowing = self
            .store
            .get(conversation_id)
            .is_some_and(|conversation| ReplayPlan::overflows(&settings, conversation.messages()));
        if !diverged && !overflowing {
            return;
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            diverged,
            overflowing,
            "resyncing context with transcript"
        );
        if let Err(error) = self.rebuild_conversation(conversation_id) {
            tracing::warn!(conversation_id = %conversation_id, error = %error, "context resync failed");
        }
    }

    fn annotate_target(&mut self, target: GenerationTarget, suffix: &str, status: MessageStatus) {
        if let Some(message) = self
            .store
            .get_mut(target.conversation_id)
            .and_then(|conversation| conversation.message_mut(target.message_id))
        {
            message.text.push_str(suffix);
            message.status = status;
        }
        self.observers.emit(SessionEvent::MessageChanged {
            conversation_id: target.conversation_id,
            message_id: target.message_id,
        });
    }

    fn emit_generation_state(&self) {
        self.observers.emit(SessionEvent::GenerationStateChanged {
            state: self.coordinator.state().clone(),
        });
    }
}

fn ignored(reason: IgnoreReason) -> SubmitOutcome {
    tracing::debug!(reason = ?reason, "submit ignored");
    SubmitOutcome::Ignored(reason)
}

#[cfg(test)]
mod tests {
    use lantern_llm::{ChatTurn, Role, ScriptedEngine, ScriptedReply};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::error::ChatError;
    use crate::events::ChannelObserver;
    use crate::message::EditState;

    fn new_session(engine: &ScriptedEngine) -> ChatSession {
        ChatSession::new(
            Arc::new(engine.clone()),
            SettingsStore::ephemeral(SessionSettings::default()),
        )
    }

    async fn ready(engine: &ScriptedEngine) -> ChatSession {
        let mut chat = new_session(engine);
        chat.load_model(Path::new("tiny.gguf")).await.unwrap();
        chat.create_conversation().await.unwrap();
        chat
    }

    async fn exchange(
        chat: &mut ChatSession,
        engine: &ScriptedEngine,
        prompt: &str,
        reply: &str,
    ) -> (MessageId, MessageId) {
        engine.push_reply(ScriptedReply::fragments([reply]));
        let SubmitOutcome::Started {
            user_message,
            assistant_message,
        } = chat.submit(prompt).unwrap()
        else {
            panic!("submit of {prompt:?} was ignored");
        };
        chat.finish_generation().await.unwrap();
        (user_message, assistant_message)
    }

    fn transcript(chat: &ChatSession) -> Vec<(Author, String)> {
        chat.current_conversation()
            .unwrap()
            .messages()
            .iter()
            .map(|message| (message.author, message.text.clone()))
            .collect()
    }

    fn drain_events(receiver: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn has_error_notification(events: &[SessionEvent]) -> bool {
        events.iter().any(|event| {
            matches!(
                event,
                SessionEvent::Notification {
                    level: NotificationLevel::Error,
                    ..
                }
            )
        })
    }

    fn live_turns(chat: &ChatSession, engine: &ScriptedEngine) -> Vec<ChatTurn> {
        let conversation_id = chat.store().current_id().unwrap();
        let session_id = chat.controller.bound_session_id(conversation_id).unwrap();
        engine.context_turns(session_id).unwrap()
    }

    /// The live context must equal what a rebuild from the transcript would replay.
    fn assert_in_sync(chat: &ChatSession, engine: &ScriptedEngine) {
        let conversation_id = chat.store().current_id().unwrap();
        assert!(!chat.controller.needs_rebuild(conversation_id));
        assert_eq!(
            live_turns(chat, engine),
            chat.current_conversation().unwrap().replay_turns()
        );
    }

    #[tokio::test]
    async fn rebuild_twice_replays_the_same_history() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        exchange(&mut chat, &engine, "hi", "hello").await;
        exchange(&mut chat, &engine, "how are you", "fine").await;

        chat.rebuild_current().unwrap();
        chat.rebuild_current().unwrap();

        let builds = engine.builds();
        let last = &builds[builds.len() - 1];
        let previous = &builds[builds.len() - 2];
        assert_eq!(last, previous);
        assert_eq!(last.roles(), previous.roles());
        assert_eq!(engine.live_context_count(), 1);
    }

    #[tokio::test]
    async fn rebuilt_history_matches_transcript_after_edits_and_deletes() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let (first_user, _) = exchange(&mut chat, &engine, "one", "first").await;
        let (_, second_reply) = exchange(&mut chat, &engine, "two", "second").await;
        exchange(&mut chat, &engine, "three", "third").await;
        chat.append_annotation(Author::Error, "disk full").unwrap();

        chat.begin_edit(first_user).unwrap();
        chat.set_edit_text(first_user, "one, edited").unwrap();
        chat.save_edit(first_user).unwrap();
        chat.delete_message(second_reply).unwrap();

        chat.rebuild_current().unwrap();
        let build = engine.last_build().unwrap();
        assert_eq!(build.turns, chat.current_conversation().unwrap().replay_turns());
        assert_eq!(
            build.turns,
            vec![
                ChatTurn::user("one, edited"),
                ChatTurn::assistant("first"),
                ChatTurn::user("two"),
                ChatTurn::user("three"),
                ChatTurn::assistant("third"),
            ]
        );
    }

    #[tokio::test]
    async fn submit_while_generating_has_no_effect() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        engine.push_reply(ScriptedReply::stalling(["Once"]));

        assert!(chat.submit("tell me a story").unwrap().is_started());
        assert_eq!(
            chat.submit("and another").unwrap(),
            SubmitOutcome::Ignored(IgnoreReason::GenerationInProgress)
        );
        assert_eq!(chat.current_conversation().unwrap().len(), 2);
        assert_eq!(engine.generations().len(), 1);

        chat.cancel();
        chat.finish_generation().await;
    }

    #[tokio::test]
    async fn cancellation_marks_the_reply_without_an_error() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let (observer, mut events) = ChannelObserver::channel();
        chat.add_observer(Box::new(observer));
        engine.push_reply(ScriptedReply::stalling(["Once", " upon"]));

        let SubmitOutcome::Started {
            assistant_message, ..
        } = chat.submit("tell me a story").unwrap()
        else {
            panic!("submit ignored");
        };
        assert_eq!(
            chat.advance().await,
            GenerationProgress::Fragment {
                message_id: assistant_message,
                text: "Once".to_string(),
            }
        );
        assert!(chat.cancel());
        let outcome = chat.finish_generation().await.unwrap();

        assert!(matches!(outcome, GenerationOutcome::Cancelled(_)));
        assert_eq!(chat.generation_state(), &GenerationState::Idle);
        let reply = chat.current_conversation().unwrap().last_message().unwrap();
        assert!(reply.text.starts_with("Once"));
        assert!(reply.text.ends_with(CANCELLED_MARKER));
        assert_eq!(reply.status, MessageStatus::Cancelled);
        assert!(!has_error_notification(&drain_events(&mut events)));
    }

    #[tokio::test]
    async fn cancel_when_idle_is_a_no_op() {
        let engine = ScriptedEngine::new();
        let chat = ready(&engine).await;
        assert!(!chat.cancel());
        assert!(chat.cancel_handle().is_none());
    }

    #[tokio::test]
    async fn cancelled_edit_restores_text_and_keeps_context() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let (user, _) = exchange(&mut chat, &engine, "A", "reply").await;
        let builds = engine.builds().len();

        assert!(chat.begin_edit(user).unwrap());
        assert!(chat.set_edit_text(user, "B").unwrap());
        assert!(chat.cancel_edit(user).unwrap());

        let message = chat.current_conversation().unwrap().message(user).unwrap();
        assert_eq!(message.text, "A");
        assert_eq!(message.edit_state, EditState::Viewing);

        exchange(&mut chat, &engine, "next", "ok").await;
        assert_eq!(engine.builds().len(), builds);
    }

    #[tokio::test]
    async fn delete_forces_rebuild_from_remaining_transcript() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let (deleted, _) = exchange(&mut chat, &engine, "a", "reply a").await;
        exchange(&mut chat, &engine, "b", "reply b").await;
        let builds = engine.builds().len();

        chat.delete_message(deleted).unwrap();
        assert!(chat.submit("c").unwrap().is_started());
        chat.finish_generation().await;

        assert_eq!(engine.builds().len(), builds + 1);
        let build = engine.last_build().unwrap();
        assert!(!build.turns.contains(&ChatTurn::user("a")));
        assert_eq!(
            build.turns,
            vec![
                ChatTurn::assistant("reply a"),
                ChatTurn::user("b"),
                ChatTurn::assistant("reply b"),
            ]
        );
    }

    #[tokio::test]
    async fn failed_generation_annotates_reply_and_keeps_session() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let (observer, mut events) = ChannelObserver::channel();
        chat.add_observer(Box::new(observer));
        engine.push_reply(ScriptedReply::failing(["partial"], "boom"));

        chat.submit("hi").unwrap();
        let outcome = chat.finish_generation().await.unwrap();
        assert!(matches!(outcome, GenerationOutcome::Failed { .. }));

        let reply = chat.current_conversation().unwrap().last_message().unwrap();
        assert_eq!(reply.text, format!("partial{}", error_annotation("boom")));
        assert_eq!(reply.status, MessageStatus::Failed);
        assert!(has_error_notification(&drain_events(&mut events)));

        let builds = engine.builds().len();
        exchange(&mut chat, &engine, "again", "fine").await;
        assert_eq!(engine.builds().len(), builds);
    }

    #[tokio::test]
    async fn completed_reply_clears_pending_marker() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        engine.push_reply(ScriptedReply::fragments(["Hel", "lo"]));

        let SubmitOutcome::Started {
            assistant_message, ..
        } = chat.submit("hi").unwrap()
        else {
            panic!("submit ignored");
        };
        let pending = chat
            .current_conversation()
            .unwrap()
            .message(assistant_message)
            .unwrap();
        assert!(pending.is_pending());

        chat.finish_generation().await;
        let reply = chat
            .current_conversation()
            .unwrap()
            .message(assistant_message)
            .unwrap();
        assert_eq!(reply.text, "Hello");
        assert_eq!(reply.status, MessageStatus::Done);
        assert_eq!(chat.generation_state(), &GenerationState::Idle);
    }

    #[tokio::test]
    async fn submit_without_model_is_ignored() {
        let engine = ScriptedEngine::new();
        let mut chat = new_session(&engine);
        assert_eq!(
            chat.submit("hi").unwrap(),
            SubmitOutcome::Ignored(IgnoreReason::NoConversation)
        );

        chat.create_conversation().await.unwrap();
        assert_eq!(
            chat.submit("hi").unwrap(),
            SubmitOutcome::Ignored(IgnoreReason::NoSession)
        );
        assert!(chat.current_conversation().unwrap().is_empty());
        assert!(engine.generations().is_empty());
    }

    #[tokio::test]
    async fn blank_prompt_is_ignored() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        assert_eq!(
            chat.submit("   ").unwrap(),
            SubmitOutcome::Ignored(IgnoreReason::EmptyPrompt)
        );
    }

    #[tokio::test]
    async fn failed_rebuild_refuses_submit_until_rebuilt() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;

        engine.fail_next_build("context allocation failed");
        assert!(matches!(
            chat.rebuild_current(),
            Err(ChatError::SessionRebuild { .. })
        ));
        assert!(!chat.has_session());
        assert_eq!(
            chat.submit("hi").unwrap(),
            SubmitOutcome::Ignored(IgnoreReason::NoSession)
        );

        chat.rebuild_current().unwrap();
        assert!(chat.submit("hi").unwrap().is_started());
        chat.finish_generation().await;
    }

    #[tokio::test]
    async fn model_load_failure_leaves_no_session() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;

        engine.fail_next_load("corrupt header");
        let result = chat.load_model(Path::new("broken.gguf")).await;
        assert!(matches!(result, Err(ChatError::ModelLoad { .. })));
        assert!(!chat.has_model());
        assert!(!chat.has_session());
        assert_eq!(engine.live_context_count(), 0);
        assert_eq!(
            chat.submit("hi").unwrap(),
            SubmitOutcome::Ignored(IgnoreReason::NoSession)
        );
    }

    #[tokio::test]
    async fn load_model_remembers_path() {
        let engine = ScriptedEngine::new();
        let chat = ready(&engine).await;
        assert_eq!(
            chat.settings().last_model_path.as_deref(),
            Some(Path::new("tiny.gguf"))
        );
        assert_eq!(chat.model_name(), Some("tiny"));
    }

    #[tokio::test]
    async fn select_rebuilds_only_when_current_changes() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let first = chat.store().current_id().unwrap();
        exchange(&mut chat, &engine, "hi", "hello").await;
        let second = chat.create_conversation().await.unwrap();
        let builds = engine.builds().len();

        chat.select_conversation(second).await.unwrap();
        assert_eq!(engine.builds().len(), builds);

        chat.select_conversation(first).await.unwrap();
        assert_eq!(engine.builds().len(), builds + 1);
        assert_eq!(
            engine.last_build().unwrap().turns,
            vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")]
        );
        assert_eq!(engine.live_context_count(), 1);

        assert!(matches!(
            chat.select_conversation(ConversationId::new(77)).await,
            Err(ChatError::ConversationNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn closing_current_rebinds_first_remaining() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let first = chat.store().current_id().unwrap();
        exchange(&mut chat, &engine, "hi", "hello").await;
        let second = chat.create_conversation().await.unwrap();

        chat.close_conversation(second).await.unwrap();
        assert_eq!(chat.store().current_id(), Some(first));
        assert!(chat.has_session());
        assert_eq!(
            engine.last_build().unwrap().turns,
            vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")]
        );
        assert_eq!(engine.live_context_count(), 1);
    }

    #[tokio::test]
    async fn closing_other_conversation_keeps_bound_context() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let first = chat.store().current_id().unwrap();
        let second = chat.create_conversation().await.unwrap();
        let builds = engine.builds().len();

        chat.close_conversation(first).await.unwrap();
        assert_eq!(chat.store().current_id(), Some(second));
        assert!(chat.has_session());
        assert_eq!(engine.builds().len(), builds);
        assert_eq!(chat.model_name(), Some("tiny"));
    }

    #[tokio::test]
    async fn closing_last_conversation_releases_context_but_keeps_model() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let only = chat.store().current_id().unwrap();

        chat.close_conversation(only).await.unwrap();
        assert_eq!(chat.store().current_id(), None);
        assert_eq!(engine.live_context_count(), 0);
        assert_eq!(engine.loaded_model_count(), 1);
    }

    #[tokio::test]
    async fn switching_conversation_stops_generation_first() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let first = chat.store().current_id().unwrap();
        engine.push_reply(ScriptedReply::stalling(["Once"]));
        chat.submit("tell me a story").unwrap();

        chat.create_conversation().await.unwrap();
        assert!(!chat.is_generating());
        assert_eq!(chat.generation_state(), &GenerationState::Idle);

        let reply = chat.store().get(first).unwrap().last_message().unwrap();
        assert!(reply.text.ends_with(CANCELLED_MARKER));
        assert_eq!(engine.live_context_count(), 1);
    }

    #[tokio::test]
    async fn transcript_mutations_wait_for_generation() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let (user, _) = exchange(&mut chat, &engine, "hi", "hello").await;
        engine.push_reply(ScriptedReply::stalling(["Once"]));
        let SubmitOutcome::Started {
            assistant_message, ..
        } = chat.submit("story").unwrap()
        else {
            panic!("submit ignored");
        };

        assert!(matches!(
            chat.delete_message(user),
            Err(ChatError::GenerationInProgress { .. })
        ));
        assert!(matches!(
            chat.regenerate(None),
            Err(ChatError::GenerationInProgress { .. })
        ));
        assert!(matches!(
            chat.begin_edit(assistant_message),
            Err(ChatError::GenerationInProgress { .. })
        ));
        assert!(matches!(
            chat.rebuild_current(),
            Err(ChatError::GenerationInProgress { .. })
        ));

        chat.cancel();
        chat.finish_generation().await;
        assert!(chat.delete_message(user).is_ok());
    }

    #[tokio::test]
    async fn settings_update_applies_on_next_submit() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        exchange(&mut chat, &engine, "hi", "hello").await;

        let mut settings = (*chat.settings()).clone();
        settings.system_prompt = "Answer like a pirate.".to_string();
        chat.update_settings(settings).unwrap();

        exchange(&mut chat, &engine, "where", "arr").await;
        let build = engine.last_build().unwrap();
        assert_eq!(build.system_prompt, "Answer like a pirate.");
        assert_eq!(
            build.turns,
            vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")]
        );
    }

    #[tokio::test]
    async fn sampling_settings_reach_the_engine() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        exchange(&mut chat, &engine, "hi", "hello").await;

        let call = engine.generations().pop().unwrap();
        assert_eq!(call.request.prompt, "hi");
        assert_eq!(call.request.sampling, chat.settings().sampling());
    }

    #[tokio::test]
    async fn observers_see_append_stream_and_state_changes() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let (observer, mut events) = ChannelObserver::channel();
        chat.add_observer(Box::new(observer));

        let (_, reply) = exchange(&mut chat, &engine, "hi", "hello").await;
        let events = drain_events(&mut events);
        let conversation_id = chat.store().current_id().unwrap();

        assert!(events.contains(&SessionEvent::MessageAppended {
            conversation_id,
            message_id: reply,
        }));
        assert!(events.contains(&SessionEvent::MessageChanged {
            conversation_id,
            message_id: reply,
        }));
        let states = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::GenerationStateChanged { state } => Some(state.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        let target = GenerationTarget::new(conversation_id, reply);
        assert_eq!(
            states,
            vec![
                GenerationState::Generating(target),
                GenerationState::Completed(target),
                GenerationState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn imported_document_is_display_only() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        chat.import_document(Path::new("/tmp/report.pdf"), "quarterly numbers")
            .await
            .unwrap();

        let conversation = chat.current_conversation().unwrap();
        assert_eq!(conversation.title, "report.pdf");
        assert_eq!(
            transcript(&chat),
            vec![(Author::Document, "quarterly numbers".to_string())]
        );
        assert!(engine.last_build().unwrap().turns.is_empty());
    }

    #[tokio::test]
    async fn long_history_is_trimmed_to_the_context_window() {
        let engine = ScriptedEngine::new();
        let settings = SessionSettings {
            context_size: 128,
            max_tokens: 32,
            system_prompt: String::new(),
            ..SessionSettings::default()
        };
        let mut chat = ChatSession::new(
            Arc::new(engine.clone()),
            SettingsStore::ephemeral(settings),
        );
        chat.load_model(Path::new("tiny.gguf")).await.unwrap();
        chat.create_conversation().await.unwrap();
        let (observer, mut events) = ChannelObserver::channel();
        chat.add_observer(Box::new(observer));

        let long = "x".repeat(80);
        for _ in 0..3 {
            exchange(&mut chat, &engine, &long, &long).await;
        }
        chat.rebuild_current().unwrap();

        let build = engine.last_build().unwrap();
        assert!(build.estimated_tokens() <= 96);
        assert_eq!(build.turns.first().map(|turn| turn.role), Some(Role::User));
        assert!(drain_events(&mut events).iter().any(|event| matches!(
            event,
            SessionEvent::ContextRebuilt { dropped_turns, .. } if *dropped_turns > 0
        )));
    }

    #[tokio::test]
    async fn cancelled_reply_is_replayed_as_written() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        engine.push_reply(ScriptedReply::stalling(["Once"]));

        chat.submit("story").unwrap();
        chat.advance().await;
        chat.cancel();
        chat.finish_generation().await;

        assert_in_sync(&chat, &engine);
        assert_eq!(
            live_turns(&chat, &engine),
            vec![
                ChatTurn::user("story"),
                ChatTurn::assistant(format!("Once{CANCELLED_MARKER}")),
            ]
        );
    }

    #[tokio::test]
    async fn abandoned_draft_never_reaches_the_context() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let (user, _) = exchange(&mut chat, &engine, "A", "reply").await;

        chat.begin_edit(user).unwrap();
        chat.set_edit_text(user, "B").unwrap();
        chat.rebuild_current().unwrap();
        assert_eq!(
            engine.last_build().unwrap().turns,
            vec![ChatTurn::user("A"), ChatTurn::assistant("reply")]
        );

        chat.cancel_edit(user).unwrap();
        exchange(&mut chat, &engine, "next", "ok").await;
        assert_in_sync(&chat, &engine);
        assert_eq!(live_turns(&chat, &engine)[0], ChatTurn::user("A"));
    }

    #[tokio::test]
    async fn absorbed_turns_stay_within_the_context_window() {
        let engine = ScriptedEngine::new();
        let settings = SessionSettings {
            context_size: 128,
            max_tokens: 32,
            system_prompt: String::new(),
            ..SessionSettings::default()
        };
        let budget = settings.history_budget();
        let mut chat = ChatSession::new(
            Arc::new(engine.clone()),
            SettingsStore::ephemeral(settings),
        );
        chat.load_model(Path::new("tiny.gguf")).await.unwrap();
        chat.create_conversation().await.unwrap();

        let long = "x".repeat(80);
        for _ in 0..4 {
            exchange(&mut chat, &engine, &long, &long).await;
            let live = live_turns(&chat, &engine);
            assert!(ReplayPlan::estimated_cost("", &live) <= budget);
            assert_eq!(live.first().map(|turn| turn.role), Some(Role::User));
        }
        assert!(engine.builds().len() > 1);
    }

    #[tokio::test]
    async fn live_context_tracks_transcript_through_mixed_turns() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        let conversation_id = chat.store().current_id().unwrap();

        let (first_user, _) = exchange(&mut chat, &engine, "hi", "hello").await;
        assert_in_sync(&chat, &engine);

        engine.push_reply(ScriptedReply::stalling(["Once"]));
        chat.submit("story").unwrap();
        chat.advance().await;
        chat.cancel();
        chat.finish_generation().await;
        assert_in_sync(&chat, &engine);

        engine.push_reply(ScriptedReply::failing(["part"], "boom"));
        let SubmitOutcome::Started {
            assistant_message: failed_reply,
            ..
        } = chat.submit("again").unwrap()
        else {
            panic!("submit ignored");
        };
        chat.finish_generation().await;
        assert_in_sync(&chat, &engine);

        engine.push_reply(ScriptedReply::fragments(["fine", "\nUser: ignored"]));
        chat.submit("stop early").unwrap();
        chat.finish_generation().await;
        assert_in_sync(&chat, &engine);

        chat.begin_edit(first_user).unwrap();
        chat.set_edit_text(first_user, "hey").unwrap();
        assert_in_sync(&chat, &engine);

        chat.save_edit(first_user).unwrap();
        chat.delete_message(failed_reply).unwrap();
        assert!(chat.controller.needs_rebuild(conversation_id));

        exchange(&mut chat, &engine, "last", "done").await;
        assert_in_sync(&chat, &engine);
        assert_eq!(live_turns(&chat, &engine)[0], ChatTurn::user("hey"));
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let engine = ScriptedEngine::new();
        let mut chat = ready(&engine).await;
        engine.push_reply(ScriptedReply::stalling(["Once"]));
        chat.submit("story").unwrap();

        chat.shutdown().await;
        assert!(!chat.is_generating());
        assert_eq!(engine.live_context_count(), 0);
        assert_eq!(engine.loaded_model_count(), 0);
    }
}
