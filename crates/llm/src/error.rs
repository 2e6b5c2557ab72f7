use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("model weights not found at {path:?}"))]
    ModelNotFound {
        stage: &'static str,
        path: PathBuf,
    },
    #[snafu(display("failed to load model from {path:?} on `{stage}`: {details}"))]
    ModelLoad {
        stage: &'static str,
        path: PathBuf,
        details: String,
    },
    #[snafu(display("model handle {model_id} is not loaded"))]
    UnknownModel {
        stage: &'static str,
        model_id: u64,
    },
    #[snafu(display(
        "context needs about {required_tokens} tokens but only {context_size} are available"
    ))]
    ContextOverflow {
        stage: &'static str,
        required_tokens: usize,
        context_size: u32,
    },
    #[snafu(display("failed to build context on `{stage}`: {details}"))]
    ContextBuild {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("session handle {session_id} has no live context"))]
    UnknownSession {
        stage: &'static str,
        session_id: u64,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completion failed on `{stage}`, {source}"))]
    Completion {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
