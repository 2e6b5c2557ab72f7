use std::path::PathBuf;

use lantern_session::ChatError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("failed to read input at {stage}"))]
    ReadInput {
        source: std::io::Error,
        stage: &'static str,
    },

    #[snafu(display("failed to read document {} at {stage}", path.display()))]
    ReadDocument {
        path: PathBuf,
        source: std::io::Error,
        stage: &'static str,
    },

    #[snafu(display("failed to save conversations at {stage}"))]
    SaveConversations {
        source: ChatError,
        stage: &'static str,
    },
}

pub type CliResult<T> = Result<T, CliError>;
