use std::path::{Path, PathBuf};

use snafu::{ResultExt, ensure};

use super::error::{
    CreateArchiveDirectorySnafu, ParseArchiveSnafu, ReadArchiveSnafu, RenameTempFileSnafu,
    SerializeArchiveSnafu, StorageResult, UnsupportedVersionSnafu, WriteArchiveSnafu,
};
use super::types::{ARCHIVE_FORMAT_VERSION, ArchiveDocument, ConversationRecord};
use super::ConversationArchive;

pub const ARCHIVE_FILE_NAME: &str = "conversations.json";

/// Conversation archive kept in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonArchive {
    path: PathBuf,
}

impl JsonArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_directory(directory: &Path) -> Self {
        Self::new(directory.join(ARCHIVE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConversationArchive for JsonArchive {
    fn load_conversations(&self) -> StorageResult<Vec<ConversationRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = ?self.path, "conversation archive not found, starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(source).context(ReadArchiveSnafu {
                    stage: "archive-read",
                    path: self.path.clone(),
                });
            }
        };

        let document: ArchiveDocument =
            serde_json::from_str(&content).context(ParseArchiveSnafu {
                stage: "archive-parse",
                path: self.path.clone(),
            })?;

        ensure!(
            document.version == ARCHIVE_FORMAT_VERSION,
            UnsupportedVersionSnafu {
                stage: "archive-version",
                path: self.path.clone(),
                found: document.version,
            }
        );

        tracing::debug!(
            path = ?self.path,
            conversation_count = document.conversations.len(),
            "loaded conversation archive"
        );
        Ok(document.conversations)
    }

    fn save_conversations(&self, conversations: &[ConversationRecord]) -> StorageResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateArchiveDirectorySnafu {
                stage: "archive-create-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let document = ArchiveDocument {
            version: ARCHIVE_FORMAT_VERSION,
            conversations: conversations.to_vec(),
        };
        let content = serde_json::to_string_pretty(&document).context(SerializeArchiveSnafu {
            stage: "archive-serialize",
        })?;

        // Write-then-rename so a crash never leaves a half-written archive behind.
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteArchiveSnafu {
            stage: "archive-write-temporary",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &self.path).context(RenameTempFileSnafu {
            stage: "archive-rename-temporary",
            from: temp_path,
            to: self.path.clone(),
        })?;

        tracing::info!(
            path = ?self.path,
            conversation_count = conversations.len(),
            "saved conversation archive"
        );
        Ok(())
    }
}
