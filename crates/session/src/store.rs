use super::message::{Author, Conversation, ConversationId, Message, MessageId};

/// Result of [`ConversationStore::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    AlreadyCurrent,
    Changed,
    Missing,
}

/// A conversation removed by [`ConversationStore::close`].
#[derive(Debug)]
pub struct Closed {
    pub conversation: Conversation,
    pub was_current: bool,
}

/// Owns every conversation and remembers which one is current.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    current: Option<ConversationId>,
    next_conversation_id: u64,
    next_message_id: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn current_id(&self) -> Option<ConversationId> {
        self.current
    }

    pub fn current(&self) -> Option<&Conversation> {
        self.current.and_then(|id| self.get(id))
    }

    pub fn current_mut(&mut self) -> Option<&mut Conversation> {
        let id = self.current?;
        self.get_mut(id)
    }

    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| conversation.id == id)
    }

    pub fn get_mut(&mut self, id: ConversationId) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|conversation| conversation.id == id)
    }

    /// Appends an empty conversation with a generated title and makes it current.
    pub fn create(&mut self) -> ConversationId {
        let id = self.allocate_conversation_id();
        self.insert_current(Conversation::new(id, default_title(id)))
    }

    pub fn create_titled(&mut self, title: impl Into<String>) -> ConversationId {
        let id = self.allocate_conversation_id();
        self.insert_current(Conversation::new(id, title))
    }

    /// Removes a conversation. If it was current, the first remaining one takes over.
    pub fn close(&mut self, id: ConversationId) -> Option<Closed> {
        let index = self
            .conversations
            .iter()
            .position(|conversation| conversation.id == id)?;
        let conversation = self.conversations.remove(index);
        let was_current = self.current == Some(id);
        if was_current {
            self.current = self.conversations.first().map(|first| first.id);
        }

        Some(Closed {
            conversation,
            was_current,
        })
    }

    pub fn select(&mut self, id: ConversationId) -> Selection {
        if self.current == Some(id) {
            return Selection::AlreadyCurrent;
        }
        if self.get(id).is_none() {
            return Selection::Missing;
        }

        self.current = Some(id);
        Selection::Changed
    }

    pub fn allocate_message_id(&mut self) -> MessageId {
        self.next_message_id = self.next_message_id.saturating_add(1);
        MessageId::new(self.next_message_id)
    }

    /// Appends a finished message to `conversation_id`.
    pub fn append(
        &mut self,
        conversation_id: ConversationId,
        author: Author,
        text: impl Into<String>,
    ) -> Option<MessageId> {
        let message_id = self.allocate_message_id();
        let conversation = self.get_mut(conversation_id)?;
        conversation.push(Message::new(message_id, author, text));
        Some(message_id)
    }

    pub fn append_placeholder(&mut self, conversation_id: ConversationId) -> Option<MessageId> {
        let message_id = self.allocate_message_id();
        let conversation = self.get_mut(conversation_id)?;
        conversation.push(Message::placeholder(message_id));
        Some(message_id)
    }

    /// Drops everything and starts over with `conversations`; the first becomes current.
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
        self.current = self.conversations.first().map(|first| first.id);
    }

    pub fn allocate_conversation_id(&mut self) -> ConversationId {
        self.next_conversation_id = self.next_conversation_id.saturating_add(1);
        ConversationId::new(self.next_conversation_id)
    }

    fn insert_current(&mut self, conversation: Conversation) -> ConversationId {
        let id = conversation.id;
        self.conversations.push(conversation);
        self.current = Some(id);
        id
    }
}

fn default_title(id: ConversationId) -> String {
    format!("Conversation {id}")
}
