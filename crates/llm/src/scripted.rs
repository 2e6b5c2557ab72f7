//! Deterministic in-process engine.
//!
//! Plays queued replies instead of sampling tokens and records every context
//! build and generation request, so callers can assert exactly what history was
//! replayed. Backs the `--offline` mode of the binary and the session tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use super::engine::{
    BoxFuture, ChatTurn, ContextRequest, FragmentSender, GenerateRequest, GenerationEvent,
    GenerationHandle, InferenceEngine, SessionHandle, make_fragment_stream,
};
use super::error::{
    ContextBuildSnafu, ContextOverflowSnafu, EngineResult, ModelLoadSnafu, UnknownModelSnafu,
    UnknownSessionSnafu,
};
use super::model::{LoadParams, ModelHandle};

pub const SCRIPTED_ENGINE_NAME: &str = "scripted";

/// How a queued reply ends after its fragments have been produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEnding {
    Complete,
    Fail(String),
    /// Keep the generation open until the caller cancels it.
    Stall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedReply {
    pub fragments: Vec<String>,
    pub ending: ReplyEnding,
}

impl ScriptedReply {
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ending: ReplyEnding::Complete,
        }
    }

    pub fn failing<I, S>(fragments: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ending: ReplyEnding::Fail(message.into()),
            ..Self::fragments(fragments)
        }
    }

    pub fn stalling<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ending: ReplyEnding::Stall,
            ..Self::fragments(fragments)
        }
    }

    fn echo(prompt: &str) -> Self {
        let reply = format!("You said: {}", prompt.trim());
        Self::fragments(reply.split_inclusive(' ').map(str::to_string).collect::<Vec<_>>())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateCall {
    pub session_id: u64,
    pub request: GenerateRequest,
}

#[derive(Debug, Clone)]
struct LiveContext {
    system_prompt: String,
    turns: Vec<ChatTurn>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    next_id: u64,
    models: HashSet<u64>,
    contexts: HashMap<u64, LiveContext>,
    builds: Vec<ContextRequest>,
    generations: Vec<GenerateCall>,
    replies: VecDeque<ScriptedReply>,
    fail_next_load: Option<String>,
    fail_next_build: Option<String>,
}

impl ScriptedState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id = self.next_id.saturating_add(1);
        self.next_id
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        self.lock().replies.push_back(reply);
    }

    pub fn fail_next_load(&self, details: impl Into<String>) {
        self.lock().fail_next_load = Some(details.into());
    }

    pub fn fail_next_build(&self, details: impl Into<String>) {
        self.lock().fail_next_build = Some(details.into());
    }

    /// Every context build request in call order.
    pub fn builds(&self) -> Vec<ContextRequest> {
        self.lock().builds.clone()
    }

    pub fn last_build(&self) -> Option<ContextRequest> {
        self.lock().builds.last().cloned()
    }

    pub fn generations(&self) -> Vec<GenerateCall> {
        self.lock().generations.clone()
    }

    pub fn live_context_count(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn loaded_model_count(&self) -> usize {
        self.lock().models.len()
    }

    /// Current history of a live context, including turns absorbed from generations.
    pub fn context_turns(&self, session_id: u64) -> Option<Vec<ChatTurn>> {
        self.lock()
            .contexts
            .get(&session_id)
            .map(|context| context.turns.clone())
    }

    pub fn context_system_prompt(&self, session_id: u64) -> Option<String> {
        self.lock()
            .contexts
            .get(&session_id)
            .map(|context| context.system_prompt.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<ScriptedState>) -> MutexGuard<'_, ScriptedState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        SCRIPTED_ENGINE_NAME
    }

    fn load_model<'a>(
        &'a self,
        path: &'a Path,
        params: LoadParams,
    ) -> BoxFuture<'a, EngineResult<ModelHandle>> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(details) = state.fail_next_load.take() {
                return ModelLoadSnafu {
                    stage: "scripted-load-model",
                    path: path.to_path_buf(),
                    details,
                }
                .fail();
            }

            let id = state.allocate_id();
            state.models.insert(id);
            Ok(ModelHandle::new(id, path, params))
        })
    }

    fn unload_model(&self, model: ModelHandle) {
        self.lock().models.remove(&model.id());
    }

    fn build_context(
        &self,
        model: &ModelHandle,
        request: ContextRequest,
    ) -> EngineResult<SessionHandle> {
        let mut state = self.lock();
        if let Some(details) = state.fail_next_build.take() {
            return ContextBuildSnafu {
                stage: "scripted-build-context",
                details,
            }
            .fail();
        }

        if !state.models.contains(&model.id()) {
            return UnknownModelSnafu {
                stage: "scripted-build-context-model",
                model_id: model.id(),
            }
            .fail();
        }

        let required_tokens = request.estimated_tokens();
        if required_tokens > request.context_size as usize {
            return ContextOverflowSnafu {
                stage: "scripted-build-context-size",
                required_tokens,
                context_size: request.context_size,
            }
            .fail();
        }

        let id = state.allocate_id();
        state.contexts.insert(
            id,
            LiveContext {
                system_prompt: request.system_prompt.clone(),
                turns: request.turns.clone(),
            },
        );
        let context_size = request.context_size;
        state.builds.push(request);
        Ok(SessionHandle::new(id, model.id(), context_size))
    }

    fn release_context(&self, session: SessionHandle) {
        self.lock().contexts.remove(&session.id());
    }

    fn stream_generate(
        &self,
        session: &SessionHandle,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> EngineResult<GenerationHandle> {
        let reply = {
            let mut state = self.lock();
            if !state.contexts.contains_key(&session.id()) {
                return UnknownSessionSnafu {
                    stage: "scripted-stream-generate",
                    session_id: session.id(),
                }
                .fail();
            }

            state.generations.push(GenerateCall {
                session_id: session.id(),
                request: request.clone(),
            });
            state
                .replies
                .pop_front()
                .unwrap_or_else(|| ScriptedReply::echo(&request.prompt))
        };

        let (sender, stream) = make_fragment_stream(cancel.clone());
        let worker = Box::pin(run_scripted_worker(
            self.state.clone(),
            session.id(),
            request,
            reply,
            sender,
            cancel,
        ));

        Ok(GenerationHandle { stream, worker })
    }
}

async fn run_scripted_worker(
    state: Arc<Mutex<ScriptedState>>,
    session_id: u64,
    request: GenerateRequest,
    reply: ScriptedReply,
    sender: FragmentSender,
    cancel: CancellationToken,
) {
    let mut produced = String::new();
    let stops = &request.sampling.stop_sequences;

    let outcome = 'produce: {
        for fragment in reply.fragments {
            if cancel.is_cancelled() {
                break 'produce GenerationEvent::Cancelled;
            }

            let candidate = format!("{produced}{fragment}");
            if let Some(cut) = first_stop_index(&candidate, stops) {
                if cut > produced.len() {
                    let head = candidate[produced.len()..cut].to_string();
                    produced.push_str(&head);
                    sender.fragment(head);
                }
                break 'produce GenerationEvent::Completed;
            }

            produced.push_str(&fragment);
            if !sender.fragment(fragment) {
                break 'produce GenerationEvent::Cancelled;
            }

            // One fragment per scheduling slice, like a real sampler between tokens.
            tokio::task::yield_now().await;
        }

        match reply.ending {
            ReplyEnding::Complete => GenerationEvent::Completed,
            ReplyEnding::Fail(message) => GenerationEvent::Failed(message),
            ReplyEnding::Stall => {
                cancel.cancelled().await;
                GenerationEvent::Cancelled
            }
        }
    };

    if let Some(context) = lock_state(&state).contexts.get_mut(&session_id) {
        context.turns.push(ChatTurn::user(request.prompt));
        context.turns.push(ChatTurn::assistant(produced));
    }

    sender.send(outcome);
}

fn first_stop_index(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|stop| !stop.is_empty())
        .filter_map(|stop| text.find(stop.as_str()))
        .min()
}
