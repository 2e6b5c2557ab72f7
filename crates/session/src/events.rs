use tokio::sync::mpsc;

use super::coordinator::GenerationState;
use super::message::{ConversationId, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Change notifications a presentation layer can subscribe to.
///
/// Events describe what already happened to core state; nothing in the core
/// waits on an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConversationCreated {
        conversation_id: ConversationId,
    },
    ConversationClosed {
        conversation_id: ConversationId,
    },
    ConversationSelected {
        conversation_id: Option<ConversationId>,
    },
    MessageAppended {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageRemoved {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ContextRebuilt {
        conversation_id: ConversationId,
        replayed_turns: usize,
        dropped_turns: usize,
    },
    ContextReleased,
    GenerationStateChanged {
        state: GenerationState,
    },
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Forwards events into an unbounded channel.
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl SessionObserver for ChannelObserver {
    fn on_event(&self, event: &SessionEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.sender.send(event.clone());
    }
}

/// Logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Notification { level, message } => {
                tracing::debug!(level = ?level, message = %message, "session notification");
            }
            other => tracing::debug!(event = ?other, "session event"),
        }
    }
}

#[derive(Default)]
pub(crate) struct Observers {
    observers: Vec<Box<dyn SessionObserver>>,
}

impl Observers {
    pub(crate) fn add(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    pub(crate) fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Notification {
            level,
            message: message.into(),
        });
    }
}
