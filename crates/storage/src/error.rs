use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("failed to create archive directory at {path:?} on `{stage}`: {source}"))]
    CreateArchiveDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read conversation archive from {path:?}: {source}"))]
    ReadArchive {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse conversation archive {path:?}: {source}"))]
    ParseArchive {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("conversation archive {path:?} has unsupported version {found}"))]
    UnsupportedVersion {
        stage: &'static str,
        path: PathBuf,
        found: u32,
    },
    #[snafu(display("failed to serialize conversation archive on `{stage}`: {source}"))]
    SerializeArchive {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write conversation archive at {path:?} on `{stage}`: {source}"))]
    WriteArchive {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace conversation archive from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
