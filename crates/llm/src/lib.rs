use std::sync::Arc;

mod engine;
mod error;
mod model;
mod rig_adapter;
pub mod scripted;

pub use engine::{
    BoxFuture, ChatTurn, ContextRequest, EngineWorker, FragmentSender, FragmentStream,
    GenerateRequest, GenerationEvent, GenerationHandle, InferenceEngine, Role, SamplingParams,
    SessionHandle, TURN_OVERHEAD_TOKENS, estimate_tokens, make_fragment_stream,
};
pub use error::{EngineError, EngineResult};
pub use model::{LoadParams, ModelHandle, UNNAMED_MODEL, model_name_from_path};
pub use rig_adapter::{LOCAL_API_KEY, RIG_ENGINE_NAME, RigEngine, RigEngineConfig};
pub use scripted::{SCRIPTED_ENGINE_NAME, ScriptedEngine, ScriptedReply};
pub use tokio_util::sync::CancellationToken;

/// Which engine implementation backs a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineKind {
    /// OpenAI-compatible local server reached through rig.
    LocalServer(RigEngineConfig),
    /// Deterministic offline engine that echoes prompts.
    Scripted,
}

pub fn create_engine(kind: EngineKind) -> Arc<dyn InferenceEngine> {
    match kind {
        EngineKind::LocalServer(config) => {
            tracing::debug!(endpoint = %config.endpoint, "using local server engine");
            Arc::new(RigEngine::new(config))
        }
        EngineKind::Scripted => {
            tracing::debug!("using scripted offline engine");
            Arc::new(ScriptedEngine::new())
        }
    }
}
