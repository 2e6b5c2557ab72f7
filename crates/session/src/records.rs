use lantern_storage::{ConversationArchive, ConversationRecord, MessageRecord};
use snafu::ResultExt;

use super::error::{ChatResult, StorageSnafu};
use super::events::SessionEvent;
use super::message::{Conversation, Message};
use super::session::ChatSession;

impl ChatSession {
    /// Snapshot of every conversation in store order. Messages under edit are
    /// written with their committed text.
    pub fn to_records(&self) -> Vec<ConversationRecord> {
        self.store
            .conversations()
            .iter()
            .map(|conversation| ConversationRecord {
                title: conversation.title.clone(),
                source_path: conversation.source_path.clone(),
                summary: conversation.summary.clone(),
                messages: conversation.messages().iter().map(message_record).collect(),
            })
            .collect()
    }

    /// Replaces all conversations with `records`. The first one becomes current.
    pub async fn restore(&mut self, records: Vec<ConversationRecord>) -> ChatResult<usize> {
        self.drain_generation().await;
        if self.controller.release().is_some() {
            self.observers.emit(SessionEvent::ContextReleased);
        }

        let previous = self
            .store
            .conversations()
            .iter()
            .map(|conversation| conversation.id)
            .collect::<Vec<_>>();

        let conversations = records
            .into_iter()
            .map(|record| {
                let mut conversation =
                    Conversation::new(self.store.allocate_conversation_id(), record.title);
                conversation.source_path = record.source_path;
                conversation.summary = record.summary;
                for message in record.messages {
                    let message_id = self.store.allocate_message_id();
                    conversation.push(Message::new(message_id, message.author.into(), message.text));
                }
                conversation
            })
            .collect::<Vec<_>>();
        let restored = conversations.len();
        let restored_ids = conversations
            .iter()
            .map(|conversation| conversation.id)
            .collect::<Vec<_>>();
        self.store.replace_all(conversations);

        for conversation_id in previous {
            self.observers
                .emit(SessionEvent::ConversationClosed { conversation_id });
        }
        for conversation_id in restored_ids {
            self.observers
                .emit(SessionEvent::ConversationCreated { conversation_id });
        }
        self.observers.emit(SessionEvent::ConversationSelected {
            conversation_id: self.store.current_id(),
        });
        tracing::info!(conversations = restored, "restored conversations");

        self.rebuild_current_binding()?;
        Ok(restored)
    }

    pub fn save_to(&self, archive: &dyn ConversationArchive) -> ChatResult<()> {
        archive
            .save_conversations(&self.to_records())
            .context(StorageSnafu {
                stage: "save-conversations",
            })
    }

    pub async fn load_from(&mut self, archive: &dyn ConversationArchive) -> ChatResult<usize> {
        let records = archive.load_conversations().context(StorageSnafu {
            stage: "load-conversations",
        })?;
        self.restore(records).await
    }
}

fn message_record(message: &Message) -> MessageRecord {
    MessageRecord::new(message.author.into(), message.committed_text())
}
