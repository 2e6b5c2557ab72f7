use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::EngineResult;
use super::model::{LoadParams, ModelHandle};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EngineWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Rough per-turn cost of role markers in a chat template.
pub const TURN_OVERHEAD_TOKENS: usize = 4;

/// Estimates the token cost of `text` at roughly four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Role of a replayed history entry. The system instruction travels separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text) + TURN_OVERHEAD_TOKENS
    }
}

/// Everything an engine needs to allocate a context and replay history into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    pub system_prompt: String,
    pub turns: Vec<ChatTurn>,
    pub context_size: u32,
}

impl ContextRequest {
    pub fn new(system_prompt: impl Into<String>, turns: Vec<ChatTurn>, context_size: u32) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            turns,
            context_size,
        }
    }

    pub fn estimated_tokens(&self) -> usize {
        let history = self
            .turns
            .iter()
            .map(ChatTurn::estimated_tokens)
            .sum::<usize>();
        estimate_tokens(&self.system_prompt) + TURN_OVERHEAD_TOKENS + history
    }

    pub fn roles(&self) -> Vec<Role> {
        self.turns.iter().map(|turn| turn.role).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub sampling: SamplingParams,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, sampling: SamplingParams) -> Self {
        Self {
            prompt: prompt.into(),
            sampling,
        }
    }
}

/// Owned handle to one live inference context.
///
/// Not `Clone`: exactly one owner may generate against it, and the context is
/// torn down only when the handle is passed back to `release_context`.
#[derive(Debug, PartialEq, Eq)]
pub struct SessionHandle {
    id: u64,
    model_id: u64,
    context_size: u32,
}

impl SessionHandle {
    pub fn new(id: u64, model_id: u64, context_size: u32) -> Self {
        Self {
            id,
            model_id,
            context_size,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn model_id(&self) -> u64 {
        self.model_id
    }

    pub fn context_size(&self) -> u32 {
        self.context_size
    }
}

/// One item of a generation stream. Exactly one terminal event ends every stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Fragment(String),
    Completed,
    Cancelled,
    Failed(String),
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Fragment(_))
    }
}

/// Producer side of a fragment stream, owned by the engine worker.
#[derive(Debug, Clone)]
pub struct FragmentSender {
    events: mpsc::UnboundedSender<GenerationEvent>,
}

impl FragmentSender {
    /// Returns `false` once the consumer has gone away.
    pub fn send(&self, event: GenerationEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn fragment(&self, text: impl Into<String>) -> bool {
        self.send(GenerationEvent::Fragment(text.into()))
    }
}

/// Consumer side of a lazy, finite, forward-only fragment sequence.
pub struct FragmentStream {
    events: mpsc::UnboundedReceiver<GenerationEvent>,
    cancel: CancellationToken,
}

impl FragmentStream {
    pub async fn recv(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<GenerationEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        // Nobody is listening any more, so the worker should stop producing.
        self.cancel.cancel();
    }
}

/// A started generation: the stream to consume and the worker that feeds it.
///
/// The worker does nothing until it is spawned; token production happens there,
/// off the coordination thread.
pub struct GenerationHandle {
    pub stream: FragmentStream,
    pub worker: EngineWorker,
}

pub fn make_fragment_stream(cancel: CancellationToken) -> (FragmentSender, FragmentStream) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (
        FragmentSender { events: events_tx },
        FragmentStream {
            events: events_rx,
            cancel,
        },
    )
}

/// Contract of an inference backend that owns model weights and contexts.
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    fn load_model<'a>(
        &'a self,
        path: &'a Path,
        params: LoadParams,
    ) -> BoxFuture<'a, EngineResult<ModelHandle>>;

    fn unload_model(&self, model: ModelHandle);

    /// Allocates a fresh context and replays the system prompt followed by `turns`.
    fn build_context(
        &self,
        model: &ModelHandle,
        request: ContextRequest,
    ) -> EngineResult<SessionHandle>;

    fn release_context(&self, session: SessionHandle);

    /// Starts a generation. The engine checks `cancel` between fragments and, on any
    /// terminal outcome, folds the prompt and the produced text into the context.
    fn stream_generate(
        &self,
        session: &SessionHandle,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> EngineResult<GenerationHandle>;
}
