use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Version written into every archive file.
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// Storage-local message author, intentionally decoupled from the session-layer enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageAuthor {
    System,
    User,
    Assistant,
    Document,
    Summary,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub author: MessageAuthor,
    pub text: String,
}

impl MessageRecord {
    pub fn new(author: MessageAuthor, text: impl Into<String>) -> Self {
        Self {
            author,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

impl ConversationRecord {
    pub fn new(title: impl Into<String>, messages: Vec<MessageRecord>) -> Self {
        Self {
            title: title.into(),
            source_path: None,
            summary: None,
            messages,
        }
    }
}

/// On-disk envelope around the ordered conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ArchiveDocument {
    pub version: u32,
    #[serde(default)]
    pub conversations: Vec<ConversationRecord>,
}
