//! Keeps the engine context a faithful derivation of one conversation.
//!
//! The controller owns the loaded model and at most one live context. Every
//! rebuild tears the previous context down explicitly before allocating the
//! next one, and a failed rebuild leaves nothing bound.

use std::path::Path;
use std::sync::Arc;

use lantern_llm::{
    ChatTurn, ContextRequest, EngineResult, InferenceEngine, LoadParams, ModelHandle, Role,
    SessionHandle, TURN_OVERHEAD_TOKENS, estimate_tokens,
};

use super::message::{ConversationId, Message, replay_turns};
use super::settings::SessionSettings;

/// Replayed history after the overflow policy has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayPlan {
    pub turns: Vec<ChatTurn>,
    pub dropped_turns: usize,
}

impl ReplayPlan {
    /// Drops the oldest turns until the estimate fits `budget`.
    ///
    /// The system prompt is always kept. History never starts with an assistant
    /// turn after trimming, so pairs leave together.
    pub fn fit(system_prompt: &str, turns: Vec<ChatTurn>, budget: usize) -> Self {
        let mut cost = Self::estimated_cost(system_prompt, &turns);

        let mut start = 0;
        while cost > budget && start < turns.len() {
            cost -= turns[start].estimated_tokens();
            start += 1;
            while start < turns.len() && turns[start].role == Role::Assistant {
                cost -= turns[start].estimated_tokens();
                start += 1;
            }
        }

        Self {
            turns: turns[start..].to_vec(),
            dropped_turns: start,
        }
    }

    /// Estimated tokens needed to replay `turns` after `system_prompt`.
    pub fn estimated_cost(system_prompt: &str, turns: &[ChatTurn]) -> usize {
        estimate_tokens(system_prompt)
            + TURN_OVERHEAD_TOKENS
            + turns.iter().map(ChatTurn::estimated_tokens).sum::<usize>()
    }

    /// True when replaying `messages` in full would not fit the history budget.
    pub fn overflows(settings: &SessionSettings, messages: &[Message]) -> bool {
        Self::estimated_cost(&settings.system_prompt, &replay_turns(messages))
            > settings.history_budget()
    }
}

/// What one successful rebuild replayed into the new context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildReport {
    pub conversation_id: ConversationId,
    pub session_id: u64,
    pub replayed_turns: usize,
    pub dropped_turns: usize,
}

/// The live context and the conversation it was derived from.
#[derive(Debug)]
struct BoundContext {
    handle: SessionHandle,
    conversation_id: ConversationId,
    /// Set when the transcript changed in a way the engine did not absorb.
    stale: bool,
}

/// Owns the model and the single context bound to one conversation.
pub struct SessionController {
    engine: Arc<dyn InferenceEngine>,
    model: Option<ModelHandle>,
    bound: Option<BoundContext>,
}

impl SessionController {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            model: None,
            bound: None,
        }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    pub fn model(&self) -> Option<&ModelHandle> {
        self.model.as_ref()
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Replaces the loaded model. Any context and the previous weights are torn
    /// down first, so a failed load leaves the controller empty.
    pub async fn load_model(&mut self, path: &Path, params: LoadParams) -> EngineResult<()> {
        self.unload();
        let model = self.engine.load_model(path, params).await?;
        tracing::info!(
            model = %model.name(),
            engine = %self.engine.name(),
            "model loaded"
        );
        self.model = Some(model);
        Ok(())
    }

    /// Releases the context, then the weights. Returns `false` if no model was loaded.
    pub fn unload(&mut self) -> bool {
        self.release();
        match self.model.take() {
            Some(model) => {
                tracing::debug!(model = %model.name(), "unloading model");
                self.engine.unload_model(model);
                true
            }
            None => false,
        }
    }

    /// Releases the bound context, returning the conversation it belonged to.
    pub fn release(&mut self) -> Option<ConversationId> {
        let bound = self.bound.take()?;
        tracing::debug!(
            conversation_id = %bound.conversation_id,
            session_id = bound.handle.id(),
            "releasing context"
        );
        self.engine.release_context(bound.handle);
        Some(bound.conversation_id)
    }

    /// Rebuilds the context from `messages`. Without a model this does nothing.
    pub fn rebuild(
        &mut self,
        settings: &SessionSettings,
        conversation_id: ConversationId,
        messages: &[Message],
    ) -> EngineResult<Option<RebuildReport>> {
        if self.model.is_none() {
            tracing::debug!(conversation_id = %conversation_id, "no model loaded, skipping rebuild");
            return Ok(None);
        }

        self.release();
        let Some(model) = self.model.as_ref() else {
            return Ok(None);
        };

        let plan = ReplayPlan::fit(
            &settings.system_prompt,
            replay_turns(messages),
            settings.history_budget(),
        );
        let replayed_turns = plan.turns.len();
        let request = ContextRequest::new(
            settings.system_prompt.clone(),
            plan.turns,
            settings.context_size,
        );

        let handle = self.engine.build_context(model, request)?;
        let report = RebuildReport {
            conversation_id,
            session_id: handle.id(),
            replayed_turns,
            dropped_turns: plan.dropped_turns,
        };
        tracing::debug!(
            conversation_id = %conversation_id,
            session_id = report.session_id,
            replayed_turns,
            dropped_turns = report.dropped_turns,
            "context rebuilt"
        );

        self.bound = Some(BoundContext {
            handle,
            conversation_id,
            stale: false,
        });
        Ok(Some(report))
    }

    pub fn bound_conversation(&self) -> Option<ConversationId> {
        self.bound.as_ref().map(|bound| bound.conversation_id)
    }

    pub fn is_bound_to(&self, conversation_id: ConversationId) -> bool {
        self.bound_conversation() == Some(conversation_id)
    }

    /// The live context for `conversation_id`, if it is bound and up to date.
    pub fn session_for(&self, conversation_id: ConversationId) -> Option<&SessionHandle> {
        self.bound
            .as_ref()
            .filter(|bound| bound.conversation_id == conversation_id && !bound.stale)
            .map(|bound| &bound.handle)
    }

    /// Flags the context of `conversation_id` as out of date with its transcript.
    pub fn mark_stale(&mut self, conversation_id: ConversationId) -> bool {
        match self.bound.as_mut() {
            Some(bound) if bound.conversation_id == conversation_id => {
                bound.stale = true;
                true
            }
            _ => false,
        }
    }

    /// Flags whatever context is bound, regardless of conversation.
    pub fn mark_any_stale(&mut self) {
        if let Some(bound) = self.bound.as_mut() {
            bound.stale = true;
        }
    }

    /// Id of the live context bound to `conversation_id`, stale or not.
    pub fn bound_session_id(&self, conversation_id: ConversationId) -> Option<u64> {
        self.bound
            .as_ref()
            .filter(|bound| bound.conversation_id == conversation_id)
            .map(|bound| bound.handle.id())
    }

    pub fn needs_rebuild(&self, conversation_id: ConversationId) -> bool {
        self.bound
            .as_ref()
            .is_some_and(|bound| bound.conversation_id == conversation_id && bound.stale)
    }
}

#[cfg(test)]
mod tests {
    use lantern_llm::ScriptedEngine;

    use super::*;
    use crate::message::{Author, MessageId};

    fn messages(entries: &[(Author, &str)]) -> Vec<Message> {
        entries
            .iter()
            .enumerate()
            .map(|(index, (author, text))| {
                Message::new(MessageId::new(index as u64 + 1), *author, *text)
            })
            .collect()
    }

    async fn loaded(engine: &ScriptedEngine) -> SessionController {
        let mut controller = SessionController::new(Arc::new(engine.clone()));
        controller
            .load_model(Path::new("tiny.gguf"), LoadParams::new(4096, 0))
            .await
            .unwrap();
        controller
    }

    #[test]
    fn fit_keeps_everything_under_budget() {
        let turns = vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")];
        let plan = ReplayPlan::fit("sys", turns.clone(), 1_000);
        assert_eq!(plan.turns, turns);
        assert_eq!(plan.dropped_turns, 0);
    }

    #[test]
    fn fit_drops_oldest_pairs_first() {
        let text = "x".repeat(40);
        let turns = (0..3)
            .flat_map(|_| [ChatTurn::user(text.clone()), ChatTurn::assistant(text.clone())])
            .collect::<Vec<_>>();

        // Each turn costs 14, the empty system prompt 4.
        let plan = ReplayPlan::fit("", turns, 48);
        assert_eq!(plan.dropped_turns, 4);
        assert_eq!(
            plan.turns.iter().map(|turn| turn.role).collect::<Vec<_>>(),
            vec![Role::User, Role::Assistant]
        );
    }

    #[test]
    fn fit_never_leaves_a_leading_assistant_turn() {
        let turns = vec![
            ChatTurn::user("x".repeat(40)),
            ChatTurn::assistant("short"),
            ChatTurn::user("next"),
        ];
        let plan = ReplayPlan::fit("", turns, 14);
        assert_eq!(plan.turns, vec![ChatTurn::user("next")]);
        assert_eq!(plan.dropped_turns, 2);
    }

    #[test]
    fn overflow_counts_only_replayed_messages() {
        let settings = SessionSettings {
            context_size: 128,
            max_tokens: 32,
            system_prompt: String::new(),
            ..SessionSettings::default()
        };
        let long = "x".repeat(400);
        assert!(!ReplayPlan::overflows(
            &settings,
            &messages(&[(Author::Document, &long), (Author::User, "hi")])
        ));
        assert!(ReplayPlan::overflows(
            &settings,
            &messages(&[(Author::User, &long), (Author::Assistant, "ok")])
        ));
    }

    #[tokio::test]
    async fn rebuild_without_model_is_a_no_op() {
        let engine = ScriptedEngine::new();
        let mut controller = SessionController::new(Arc::new(engine.clone()));
        let report = controller
            .rebuild(&SessionSettings::default(), ConversationId::new(1), &[])
            .unwrap();

        assert!(report.is_none());
        assert!(engine.builds().is_empty());
        assert_eq!(controller.bound_conversation(), None);
    }

    #[tokio::test]
    async fn rebuild_replays_only_user_and_assistant_after_system_prompt() {
        let engine = ScriptedEngine::new();
        let mut controller = loaded(&engine).await;
        let settings = SessionSettings::default();
        let transcript = messages(&[
            (Author::Document, "imported"),
            (Author::User, "hi"),
            (Author::Assistant, "hello"),
            (Author::Error, "oops"),
            (Author::System, "note"),
        ]);

        let report = controller
            .rebuild(&settings, ConversationId::new(1), &transcript)
            .unwrap()
            .unwrap();

        let build = engine.last_build().unwrap();
        assert_eq!(build.system_prompt, settings.system_prompt);
        assert_eq!(
            build.turns,
            vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")]
        );
        assert_eq!(report.replayed_turns, 2);
        assert!(controller.session_for(ConversationId::new(1)).is_some());
    }

    #[tokio::test]
    async fn rebuild_releases_previous_context() {
        let engine = ScriptedEngine::new();
        let mut controller = loaded(&engine).await;
        let settings = SessionSettings::default();

        controller.rebuild(&settings, ConversationId::new(1), &[]).unwrap();
        controller.rebuild(&settings, ConversationId::new(2), &[]).unwrap();

        assert_eq!(engine.live_context_count(), 1);
        assert_eq!(controller.bound_conversation(), Some(ConversationId::new(2)));
    }

    #[tokio::test]
    async fn failed_rebuild_leaves_nothing_bound() {
        let engine = ScriptedEngine::new();
        let mut controller = loaded(&engine).await;
        let settings = SessionSettings::default();
        controller.rebuild(&settings, ConversationId::new(1), &[]).unwrap();

        engine.fail_next_build("out of memory");
        let result = controller.rebuild(&settings, ConversationId::new(1), &[]);

        assert!(result.is_err());
        assert_eq!(controller.bound_conversation(), None);
        assert_eq!(engine.live_context_count(), 0);
    }

    #[tokio::test]
    async fn stale_context_is_not_handed_out() {
        let engine = ScriptedEngine::new();
        let mut controller = loaded(&engine).await;
        let conversation_id = ConversationId::new(3);
        controller
            .rebuild(&SessionSettings::default(), conversation_id, &[])
            .unwrap();

        assert!(!controller.mark_stale(ConversationId::new(4)));
        assert!(controller.mark_stale(conversation_id));
        assert!(controller.needs_rebuild(conversation_id));
        assert!(controller.session_for(conversation_id).is_none());
    }

    #[tokio::test]
    async fn unload_tears_down_context_and_weights() {
        let engine = ScriptedEngine::new();
        let mut controller = loaded(&engine).await;
        controller
            .rebuild(&SessionSettings::default(), ConversationId::new(1), &[])
            .unwrap();

        assert!(controller.unload());
        assert_eq!(engine.live_context_count(), 0);
        assert_eq!(engine.loaded_model_count(), 0);
        assert!(!controller.unload());
    }
}
