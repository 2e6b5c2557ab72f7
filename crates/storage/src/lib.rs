pub mod archive;
pub mod error;
pub mod types;

pub use archive::{ARCHIVE_FILE_NAME, JsonArchive};
pub use error::{StorageError, StorageResult};
pub use types::{ARCHIVE_FORMAT_VERSION, ConversationRecord, MessageAuthor, MessageRecord};

/// Round-trips the ordered list of conversations and their `(author, text)` pairs.
pub trait ConversationArchive: Send + Sync {
    fn load_conversations(&self) -> StorageResult<Vec<ConversationRecord>>;
    fn save_conversations(&self, conversations: &[ConversationRecord]) -> StorageResult<()>;
}
