use std::fmt;
use std::path::PathBuf;

use lantern_llm::{ChatTurn, Role};
use lantern_storage::MessageAuthor;

/// Stable identifier for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub u64);

impl ConversationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Stable identifier for one message, unique across all conversations of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Author {
    System,
    User,
    Assistant,
    Document,
    Summary,
    Error,
}

impl Author {
    /// Role under which this author is replayed into a context, if at all.
    ///
    /// Only user and assistant turns form the model's role history; every other
    /// author is a transcript-only annotation.
    pub fn replay_role(self) -> Option<Role> {
        match self {
            Self::User => Some(Role::User),
            Self::Assistant => Some(Role::Assistant),
            Self::System | Self::Document | Self::Summary | Self::Error => None,
        }
    }

    pub fn is_replayed(self) -> bool {
        self.replay_role().is_some()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Document => "document",
            Self::Summary => "summary",
            Self::Error => "error",
        }
    }
}

impl From<MessageAuthor> for Author {
    fn from(value: MessageAuthor) -> Self {
        match value {
            MessageAuthor::System => Self::System,
            MessageAuthor::User => Self::User,
            MessageAuthor::Assistant => Self::Assistant,
            MessageAuthor::Document => Self::Document,
            MessageAuthor::Summary => Self::Summary,
            MessageAuthor::Error => Self::Error,
        }
    }
}

impl From<Author> for MessageAuthor {
    fn from(value: Author) -> Self {
        match value {
            Author::System => Self::System,
            Author::User => Self::User,
            Author::Assistant => Self::Assistant,
            Author::Document => Self::Document,
            Author::Summary => Self::Summary,
            Author::Error => Self::Error,
        }
    }
}

/// Edit lifecycle of one message. `Editing` keeps the text as it was when the
/// edit began, so cancelling loses nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EditState {
    #[default]
    Viewing,
    Editing {
        original: String,
    },
}

/// Streaming lifecycle of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageStatus {
    #[default]
    Done,
    /// Placeholder waiting for its first fragment.
    Pending,
    Streaming,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub author: Author,
    pub text: String,
    pub edit_state: EditState,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(id: MessageId, author: Author, text: impl Into<String>) -> Self {
        Self {
            id,
            author,
            text: text.into(),
            edit_state: EditState::Viewing,
            status: MessageStatus::Done,
        }
    }

    /// Creates the assistant placeholder a generation streams into.
    pub fn placeholder(id: MessageId) -> Self {
        Self {
            status: MessageStatus::Pending,
            ..Self::new(id, Author::Assistant, String::new())
        }
    }

    pub fn is_editing(&self) -> bool {
        matches!(self.edit_state, EditState::Editing { .. })
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    /// Snapshots the current text and enters `Editing`. Already editing is a no-op.
    pub fn begin_edit(&mut self) -> bool {
        if self.is_editing() {
            return false;
        }

        self.edit_state = EditState::Editing {
            original: self.text.clone(),
        };
        true
    }

    /// Replaces the draft text. Only valid while editing.
    pub fn set_edit_text(&mut self, text: impl Into<String>) -> bool {
        if !self.is_editing() {
            return false;
        }

        self.text = text.into();
        true
    }

    /// Commits the draft and drops the snapshot.
    pub fn save_edit(&mut self) -> bool {
        if !self.is_editing() {
            return false;
        }

        self.edit_state = EditState::Viewing;
        true
    }

    /// Restores the snapshot and drops it.
    pub fn cancel_edit(&mut self) -> bool {
        match std::mem::take(&mut self.edit_state) {
            EditState::Editing { original } => {
                self.text = original;
                true
            }
            EditState::Viewing => false,
        }
    }

    /// Appends one streamed fragment. The first fragment clears the pending marker.
    pub fn append_fragment(&mut self, fragment: &str) {
        if self.status == MessageStatus::Pending {
            self.status = MessageStatus::Streaming;
        }
        self.text.push_str(fragment);
    }

    /// Text the conversation has agreed on: the snapshot while an edit is open.
    pub fn committed_text(&self) -> &str {
        match &self.edit_state {
            EditState::Editing { original } => original,
            EditState::Viewing => &self.text,
        }
    }

    /// The engine turn for this message. Drafts are never replayed.
    pub fn replay_turn(&self) -> Option<ChatTurn> {
        self.author
            .replay_role()
            .map(|role| ChatTurn::new(role, self.committed_text()))
    }
}

/// Why a message cannot be regenerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerateRefusal {
    NotFound,
    /// An assistant message whose predecessor is not a user message.
    MissingUserTurn,
    UnsupportedAuthor(Author),
}

/// Truncation computed for a regenerate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegeneratePlan {
    /// Number of leading messages that survive.
    pub keep: usize,
    /// Text of the user turn to resubmit.
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub source_path: Option<PathBuf>,
    pub summary: Option<String>,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            source_path: None,
            summary: None,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn position(&self, message_id: MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.id == message_id)
    }

    pub fn message(&self, message_id: MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: MessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.id == message_id)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn remove(&mut self, message_id: MessageId) -> Option<Message> {
        let index = self.position(message_id)?;
        Some(self.messages.remove(index))
    }

    /// Drops every message from `len` onwards and returns them in order.
    pub fn truncate(&mut self, len: usize) -> Vec<Message> {
        if len >= self.messages.len() {
            return Vec::new();
        }
        self.messages.split_off(len)
    }

    /// The user/assistant subsequence of the transcript, in order.
    pub fn replay_turns(&self) -> Vec<ChatTurn> {
        replay_turns(&self.messages)
    }

    /// Works out how far to truncate and which user turn to resubmit.
    pub fn regenerate_plan(&self, target: MessageId) -> Result<RegeneratePlan, RegenerateRefusal> {
        let index = self.position(target).ok_or(RegenerateRefusal::NotFound)?;
        let message = &self.messages[index];

        match message.author {
            Author::Assistant => {
                let predecessor = index
                    .checked_sub(1)
                    .map(|previous| &self.messages[previous])
                    .filter(|previous| previous.author == Author::User)
                    .ok_or(RegenerateRefusal::MissingUserTurn)?;
                Ok(RegeneratePlan {
                    keep: index - 1,
                    prompt: predecessor.text.clone(),
                })
            }
            Author::User => Ok(RegeneratePlan {
                keep: index,
                prompt: message.text.clone(),
            }),
            other => Err(RegenerateRefusal::UnsupportedAuthor(other)),
        }
    }
}

pub fn replay_turns(messages: &[Message]) -> Vec<ChatTurn> {
    messages.iter().filter_map(Message::replay_turn).collect()
}
