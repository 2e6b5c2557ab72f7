use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use super::engine::{
    BoxFuture, ChatTurn, ContextRequest, FragmentSender, GenerateRequest, GenerationEvent,
    GenerationHandle, InferenceEngine, Role, SamplingParams, SessionHandle, make_fragment_stream,
};
use super::error::{
    CompletionSnafu, ContextOverflowSnafu, EngineError, EngineResult, HttpClientSnafu,
    ModelNotFoundSnafu, UnknownModelSnafu, UnknownSessionSnafu,
};
use super::model::{LoadParams, ModelHandle};

pub const RIG_ENGINE_NAME: &str = "rig-openai-compatible";
/// Local servers ignore the key, but the client refuses to build without one.
pub const LOCAL_API_KEY: &str = "local";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigEngineConfig {
    pub endpoint: String,
    pub api_key: String,
}

impl RigEngineConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into().trim().to_string();
        Self {
            endpoint: endpoint.into().trim().to_string(),
            api_key: if api_key.is_empty() {
                LOCAL_API_KEY.to_string()
            } else {
                api_key
            },
        }
    }
}

/// History kept for one context. The server is stateless per request, so the
/// replayed turns live here and are resent with every generation.
#[derive(Debug, Clone)]
struct ServedContext {
    model_name: String,
    system_prompt: String,
    turns: Vec<ChatTurn>,
}

#[derive(Debug, Default)]
struct RigState {
    next_id: u64,
    models: HashMap<u64, String>,
    contexts: HashMap<u64, ServedContext>,
}

/// Engine backed by an OpenAI-compatible local server such as `llama-server`.
pub struct RigEngine {
    config: RigEngineConfig,
    state: Arc<Mutex<RigState>>,
}

impl RigEngine {
    pub fn new(config: RigEngineConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RigState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RigState> {
        lock_state(&self.state)
    }

    fn build_client(config: &RigEngineConfig) -> EngineResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(turn: &ChatTurn) -> RigMessage {
        match turn.role {
            Role::User => RigMessage::user(turn.text.clone()),
            Role::Assistant => RigMessage::assistant(turn.text.clone()),
        }
    }

    fn sampling_params(sampling: &SamplingParams) -> serde_json::Value {
        serde_json::json!({
            "top_p": sampling.top_p,
            "stop": sampling.stop_sequences,
        })
    }

    async fn open_stream(
        config: &RigEngineConfig,
        context: &ServedContext,
        request: &GenerateRequest,
    ) -> EngineResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(context.model_name.clone());
        let history = context
            .turns
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let mut builder = model
            .completion_request(RigMessage::user(request.prompt.clone()))
            .messages(history)
            .temperature(f64::from(request.sampling.temperature))
            .max_tokens(u64::from(request.sampling.max_tokens))
            .additional_params(Self::sampling_params(&request.sampling));

        if !context.system_prompt.trim().is_empty() {
            builder = builder.preamble(context.system_prompt.clone());
        }

        builder.stream().await.context(CompletionSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<String>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => Some(text.text),
            StreamedAssistantContent::Text(_)
            | StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: RigEngineConfig,
        state: Arc<Mutex<RigState>>,
        session_id: u64,
        context: ServedContext,
        request: GenerateRequest,
        sender: FragmentSender,
        cancel: CancellationToken,
    ) {
        let mut produced = String::new();
        let outcome = match Self::open_stream(&config, &context, &request).await {
            Ok(mut stream) => loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!(session_id, "generation stream cancelled");
                        stream.cancel();
                        break GenerationEvent::Cancelled;
                    }
                    next_item = stream.next() => {
                        match next_item {
                            Some(Ok(item)) => {
                                if let Some(text) = Self::map_stream_item(item) {
                                    produced.push_str(&text);
                                    if !sender.fragment(text) {
                                        break GenerationEvent::Cancelled;
                                    }
                                }
                            }
                            Some(Err(source)) => {
                                let error = EngineError::Completion {
                                    stage: "stream-chunk",
                                    source,
                                };
                                tracing::warn!(
                                    session_id,
                                    error = %error,
                                    "generation stream emitted an error chunk"
                                );
                                break GenerationEvent::Failed(error.to_string());
                            }
                            None => break GenerationEvent::Completed,
                        }
                    }
                }
            },
            Err(error) => {
                tracing::error!(
                    session_id,
                    model = %context.model_name,
                    error = %error,
                    "failed to open generation stream"
                );
                GenerationEvent::Failed(error.to_string())
            }
        };

        // The server keeps no state, so the finished turn is folded into our copy.
        if let Some(served) = lock_state(&state).contexts.get_mut(&session_id) {
            served.turns.push(ChatTurn::user(request.prompt));
            served.turns.push(ChatTurn::assistant(produced));
        }

        sender.send(outcome);
    }
}

fn lock_state(state: &Mutex<RigState>) -> MutexGuard<'_, RigState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InferenceEngine for RigEngine {
    fn name(&self) -> &str {
        RIG_ENGINE_NAME
    }

    fn load_model<'a>(
        &'a self,
        path: &'a Path,
        params: LoadParams,
    ) -> BoxFuture<'a, EngineResult<ModelHandle>> {
        Box::pin(async move {
            if !path.is_file() {
                return ModelNotFoundSnafu {
                    stage: "rig-load-model",
                    path: path.to_path_buf(),
                }
                .fail();
            }

            // Fail early if the endpoint configuration is unusable.
            Self::build_client(&self.config)?;

            let mut state = self.lock();
            state.next_id = state.next_id.saturating_add(1);
            let model = ModelHandle::new(state.next_id, path, params);
            state.models.insert(model.id(), model.name().to_string());

            tracing::info!(
                model = %model.name(),
                endpoint = %self.config.endpoint,
                context_size = params.context_size,
                gpu_layer_count = params.gpu_layer_count,
                "registered model with local server"
            );
            Ok(model)
        })
    }

    fn unload_model(&self, model: ModelHandle) {
        let mut state = self.lock();
        state.models.remove(&model.id());
        let model_name = model.name();
        state
            .contexts
            .retain(|_, served| served.model_name != model_name);
    }

    fn build_context(
        &self,
        model: &ModelHandle,
        request: ContextRequest,
    ) -> EngineResult<SessionHandle> {
        let mut state = self.lock();
        let Some(model_name) = state.models.get(&model.id()).cloned() else {
            return UnknownModelSnafu {
                stage: "rig-build-context",
                model_id: model.id(),
            }
            .fail();
        };

        let required_tokens = request.estimated_tokens();
        if required_tokens > request.context_size as usize {
            return ContextOverflowSnafu {
                stage: "rig-build-context-size",
                required_tokens,
                context_size: request.context_size,
            }
            .fail();
        }

        state.next_id = state.next_id.saturating_add(1);
        let id = state.next_id;
        state.contexts.insert(
            id,
            ServedContext {
                model_name,
                system_prompt: request.system_prompt,
                turns: request.turns,
            },
        );
        Ok(SessionHandle::new(id, model.id(), request.context_size))
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
        let Some(context) = self.lock().contexts.get(&session.id()).cloned() else {
            return UnknownSessionSnafu {
                stage: "rig-stream-generate",
                session_id: session.id(),
            }
            .fail();
        };

        let (sender, stream) = make_fragment_stream(cancel.clone());
        let worker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            self.state.clone(),
            session.id(),
            context,
            request,
            sender,
            cancel,
        ));

        Ok(GenerationHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_api_key_uses_local_placeholder() {
        let config = RigEngineConfig::new(" http://127.0.0.1:8080/v1 ", "  ");
        assert_eq!(config.endpoint, "http://127.0.0.1:8080/v1");
        assert_eq!(config.api_key, LOCAL_API_KEY);
    }

    #[test]
    fn sampling_params_carry_top_p_and_stops() {
        let params = RigEngine::sampling_params(&SamplingParams {
            temperature: 0.2,
            top_p: 0.5,
            max_tokens: 32,
            stop_sequences: vec!["User:".to_string()],
        });
        assert_eq!(params["stop"][0], "User:");
        assert!(params["top_p"].is_number());
    }

    #[tokio::test]
    async fn missing_weights_are_reported() {
        let engine = RigEngine::new(RigEngineConfig::new("http://127.0.0.1:8080/v1", ""));
        let result = engine
            .load_model(
                Path::new("/definitely/not/here.gguf"),
                LoadParams::new(2048, 0),
            )
            .await;
        assert!(matches!(
            result,
            Err(crate::EngineError::ModelNotFound { .. })
        ));
    }
}
