//! Runs one streaming generation at a time.

use std::time::Duration;

use lantern_llm::{
    CancellationToken, EngineError, FragmentStream, GenerateRequest, GenerationEvent,
    GenerationHandle, InferenceEngine, SessionHandle,
};
use tokio::task::JoinHandle;

use super::message::{ConversationId, MessageId};

/// Appended to an assistant message whose generation was stopped.
pub const CANCELLED_MARKER: &str = "\n[generation stopped]";

/// Appended to an assistant message whose generation failed mid-stream.
pub fn error_annotation(message: &str) -> String {
    format!("\n[error: {message}]")
}

/// Where the fragments of a generation land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationTarget {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

impl GenerationTarget {
    pub const fn new(conversation_id: ConversationId, message_id: MessageId) -> Self {
        Self {
            conversation_id,
            message_id,
        }
    }
}

/// Lifecycle of the single generation a session may run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GenerationState {
    #[default]
    Idle,
    /// Fragments are streaming into the target message.
    Generating(GenerationTarget),
    Completed(GenerationTarget),
    Cancelled(GenerationTarget),
    /// The stream ended with an engine error; `message` is what the user sees.
    Failed {
        target: GenerationTarget,
        message: String,
    },
}

/// Requested change of [`GenerationState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationTransition {
    Start(GenerationTarget),
    Complete(GenerationTarget),
    Cancel(GenerationTarget),
    Fail {
        target: GenerationTarget,
        message: String,
    },
    /// Settles a terminal state back to `Idle`.
    ResetToIdle,
}

/// Why a transition was refused. The state is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationRejection {
    AlreadyGenerating {
        active: GenerationTarget,
        attempted: GenerationTarget,
    },
    NoActiveGeneration,
    TargetMismatch {
        active: GenerationTarget,
        attempted: GenerationTarget,
    },
}

pub type GenerationTransitionResult = Result<GenerationState, GenerationRejection>;

/// Why [`GenerationCoordinator::start`] did not start anything.
#[derive(Debug)]
pub enum StartError {
    Rejected(GenerationRejection),
    Engine(EngineError),
}

impl GenerationState {
    /// Returns the streaming target if and only if the state is `Generating`.
    pub fn active_target(&self) -> Option<GenerationTarget> {
        match self {
            Self::Generating(target) => Some(*target),
            Self::Idle | Self::Completed(_) | Self::Cancelled(_) | Self::Failed { .. } => None,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.active_target().is_some()
    }

    /// Computes the state after `transition` without mutating `self`.
    ///
    /// Only a non-generating state may start, and a terminal transition must name
    /// the active target exactly. `ResetToIdle` is refused mid-stream.
    pub fn apply(&self, transition: GenerationTransition) -> GenerationTransitionResult {
        match transition {
            GenerationTransition::Start(target) => self.apply_start(target),
            GenerationTransition::Complete(target) => {
                self.apply_terminal(target, GenerationState::Completed(target))
            }
            GenerationTransition::Cancel(target) => {
                self.apply_terminal(target, GenerationState::Cancelled(target))
            }
            GenerationTransition::Fail { target, message } => {
                self.apply_terminal(target, GenerationState::Failed { target, message })
            }
            GenerationTransition::ResetToIdle => match self {
                Self::Generating(_) => Err(GenerationRejection::NoActiveGeneration),
                _ => Ok(Self::Idle),
            },
        }
    }

    fn apply_start(&self, target: GenerationTarget) -> GenerationTransitionResult {
        match self {
            Self::Generating(active) => Err(GenerationRejection::AlreadyGenerating {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Completed(_) | Self::Cancelled(_) | Self::Failed { .. } => {
                Ok(Self::Generating(target))
            }
        }
    }

    fn apply_terminal(
        &self,
        target: GenerationTarget,
        next: GenerationState,
    ) -> GenerationTransitionResult {
        match self {
            Self::Generating(active) if *active == target => Ok(next),
            Self::Generating(active) => Err(GenerationRejection::TargetMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Completed(_) | Self::Cancelled(_) | Self::Failed { .. } => {
                Err(GenerationRejection::NoActiveGeneration)
            }
        }
    }
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed(GenerationTarget),
    Cancelled(GenerationTarget),
    Failed {
        target: GenerationTarget,
        message: String,
    },
}

impl GenerationOutcome {
    pub fn target(&self) -> GenerationTarget {
        match self {
            Self::Completed(target) | Self::Cancelled(target) => *target,
            Self::Failed { target, .. } => *target,
        }
    }

    fn transition(&self) -> GenerationTransition {
        match self {
            Self::Completed(target) => GenerationTransition::Complete(*target),
            Self::Cancelled(target) => GenerationTransition::Cancel(*target),
            Self::Failed { target, message } => GenerationTransition::Fail {
                target: *target,
                message: message.clone(),
            },
        }
    }
}

/// One step of consuming the active generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStep {
    Idle,
    Fragment {
        target: GenerationTarget,
        text: String,
    },
    Finished(GenerationOutcome),
}

struct ActiveGeneration {
    target: GenerationTarget,
    cancel: CancellationToken,
    stream: FragmentStream,
    worker: JoinHandle<()>,
}

#[derive(Default)]
pub struct GenerationCoordinator {
    state: GenerationState,
    active: Option<ActiveGeneration>,
}

impl GenerationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn is_generating(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_target(&self) -> Option<GenerationTarget> {
        self.active.as_ref().map(|active| active.target)
    }

    /// Starts streaming into `target`. Rejected while another generation runs;
    /// an engine error leaves the coordinator idle.
    pub fn start(
        &mut self,
        engine: &dyn InferenceEngine,
        session: &SessionHandle,
        target: GenerationTarget,
        request: GenerateRequest,
    ) -> Result<(), StartError> {
        let next_state = self
            .state
            .apply(GenerationTransition::Start(target))
            .map_err(StartError::Rejected)?;
        let cancel = CancellationToken::new();

        let GenerationHandle { stream, worker } = engine
            .stream_generate(session, request, cancel.clone())
            .map_err(StartError::Engine)?;

        self.active = Some(ActiveGeneration {
            target,
            cancel,
            stream,
            worker: tokio::spawn(worker),
        });
        self.state = next_state;
        tracing::debug!(
            conversation_id = %target.conversation_id,
            message_id = %target.message_id,
            "generation started"
        );
        Ok(())
    }

    /// Signals the active generation to stop. No-op when idle.
    pub fn cancel(&self) -> bool {
        match &self.active {
            Some(active) => {
                tracing::debug!(message_id = %active.target.message_id, "cancelling generation");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// A token that cancels the active generation from another task.
    pub fn cancel_handle(&self) -> Option<CancellationToken> {
        self.active.as_ref().map(|active| active.cancel.clone())
    }

    /// Waits for the next event of the active generation.
    ///
    /// Cancel safe: dropping the future before it resolves loses no fragment.
    pub async fn next_step(&mut self) -> GenerationStep {
        let Some(active) = self.active.as_mut() else {
            return GenerationStep::Idle;
        };
        let target = active.target;

        let outcome = match active.stream.recv().await {
            Some(GenerationEvent::Fragment(text)) => {
                return GenerationStep::Fragment { target, text };
            }
            Some(GenerationEvent::Completed) => GenerationOutcome::Completed(target),
            Some(GenerationEvent::Cancelled) => GenerationOutcome::Cancelled(target),
            Some(GenerationEvent::Failed(message)) => GenerationOutcome::Failed { target, message },
            None if active.cancel.is_cancelled() => GenerationOutcome::Cancelled(target),
            None => {
                tracing::warn!(
                    message_id = %target.message_id,
                    "generation worker stopped without a terminal event"
                );
                GenerationOutcome::Failed {
                    target,
                    message: "generation worker stopped unexpectedly".to_string(),
                }
            }
        };

        self.finish(outcome)
    }

    /// Moves a finished generation back to `Idle`.
    pub fn settle(&mut self) -> bool {
        if self.active.is_some() {
            return false;
        }
        match self.state.apply(GenerationTransition::ResetToIdle) {
            Ok(next_state) => {
                let changed = next_state != self.state;
                self.state = next_state;
                changed
            }
            Err(_) => false,
        }
    }

    fn finish(&mut self, outcome: GenerationOutcome) -> GenerationStep {
        if let Some(active) = self.active.take() {
            // The worker sent its terminal event as its last act.
            drop(active.worker);
        }

        match self.state.apply(outcome.transition()) {
            Ok(next_state) => self.state = next_state,
            Err(rejection) => {
                tracing::warn!(rejection = ?rejection, "unexpected generation transition");
            }
        }
        tracing::debug!(outcome = ?outcome, "generation finished");
        GenerationStep::Finished(outcome)
    }
}

/// Text gathered by [`collect_generation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedText {
    pub text: String,
    pub ended: CollectedEnding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectedEnding {
    Completed,
    /// Stopped by the deadline or the token.
    Cancelled,
    Failed(String),
}

/// Drains an auxiliary generation, cancelling it once `deadline` elapses.
pub async fn collect_generation(
    handle: GenerationHandle,
    cancel: CancellationToken,
    deadline: Duration,
) -> CollectedText {
    let GenerationHandle { mut stream, worker } = handle;
    let worker = tokio::spawn(worker);
    let timer = tokio::time::sleep(deadline);
    tokio::pin!(timer);

    let mut text = String::new();
    let ended = loop {
        let event = tokio::select! {
            event = stream.recv() => event,
            () = &mut timer, if !cancel.is_cancelled() => {
                tracing::debug!(deadline = ?deadline, "auxiliary generation hit its deadline");
                cancel.cancel();
                continue;
            }
        };

        match event {
            Some(GenerationEvent::Fragment(fragment)) => text.push_str(&fragment),
            Some(GenerationEvent::Completed) => break CollectedEnding::Completed,
            Some(GenerationEvent::Cancelled) => break CollectedEnding::Cancelled,
            Some(GenerationEvent::Failed(message)) => break CollectedEnding::Failed(message),
            None if cancel.is_cancelled() => break CollectedEnding::Cancelled,
            None => {
                break CollectedEnding::Failed("generation worker stopped unexpectedly".to_string());
            }
        }
    };

    if let Err(error) = worker.await {
        tracing::warn!(error = %error, "auxiliary generation worker panicked");
    }
    CollectedText { text, ended }
}
