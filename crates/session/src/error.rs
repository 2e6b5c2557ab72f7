use std::path::PathBuf;

use lantern_llm::EngineError;
use lantern_storage::StorageError;
use snafu::Snafu;

use super::message::{Author, ConversationId, MessageId};
use super::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("failed to load model from {path:?} on `{stage}`: {source}"))]
    ModelLoad {
        stage: &'static str,
        path: PathBuf,
        source: EngineError,
    },
    #[snafu(display("failed to rebuild context for conversation {conversation_id} on `{stage}`: {source}"))]
    SessionRebuild {
        stage: &'static str,
        conversation_id: ConversationId,
        source: EngineError,
    },
    #[snafu(display("failed to start generation on `{stage}`: {source}"))]
    GenerationStart {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("conversation archive failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to persist settings on `{stage}`: {source}"))]
    SettingsPersist {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("a generation is in progress, `{stage}` has to wait"))]
    GenerationInProgress { stage: &'static str },
    #[snafu(display("no conversation is selected for `{stage}`"))]
    NoCurrentConversation { stage: &'static str },
    #[snafu(display("conversation {conversation_id} does not exist"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("message {message_id} is not part of the current conversation"))]
    MessageNotFound {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("the current conversation has no message to regenerate"))]
    NothingToRegenerate { stage: &'static str },
    #[snafu(display("message {message_id} authored by {author:?} cannot be regenerated"))]
    RegenerateUnsupported {
        stage: &'static str,
        message_id: MessageId,
        author: Author,
    },
    #[snafu(display("assistant message {message_id} is not preceded by a user message"))]
    RegenerateMissingUserTurn {
        stage: &'static str,
        message_id: MessageId,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
