//! Conversation session engine for a locally hosted model.
//!
//! The transcript of each conversation is the source of truth. The engine context
//! bound to the current conversation is a disposable cache rebuilt from it.

mod controller;
mod coordinator;
mod error;
mod events;
mod message;
mod protocol;
mod records;
mod session;
mod settings;
mod store;
mod summary;

pub use controller::{RebuildReport, ReplayPlan, SessionController};
pub use coordinator::{
    CANCELLED_MARKER, CollectedEnding, CollectedText, GenerationCoordinator, GenerationOutcome,
    GenerationRejection, GenerationState, GenerationStep, GenerationTarget, GenerationTransition,
    StartError, collect_generation, error_annotation,
};
pub use error::{ChatError, ChatResult};
pub use events::{
    ChannelObserver, NotificationLevel, SessionEvent, SessionObserver, TracingObserver,
};
pub use message::{
    Author, Conversation, ConversationId, EditState, Message, MessageId, MessageStatus,
    RegeneratePlan, RegenerateRefusal,
};
pub use session::{ChatSession, GenerationProgress, IgnoreReason, SubmitOutcome};
pub use settings::{
    DEFAULT_ENDPOINT, DEFAULT_SYSTEM_PROMPT, STOP_SEQUENCES, SessionSettings, SettingsError,
    SettingsResult, SettingsStore,
};
pub use store::{Closed, ConversationStore, Selection};
pub use summary::SUMMARY_PROMPT;
