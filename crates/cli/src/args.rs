use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments of the lantern chat front-end
#[derive(Debug, Parser)]
#[command(name = "lantern")]
#[command(about = "Chat with a locally hosted language model", long_about = None)]
pub struct CliArgs {
    /// Settings file (defaults to the user config directory)
    #[arg(long, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Conversation archive file (defaults to the user config directory)
    #[arg(long, value_name = "PATH")]
    pub archive: Option<PathBuf>,

    /// GGUF model to load at startup instead of the last used one
    #[arg(long, value_name = "GGUF_PATH")]
    pub model: Option<PathBuf>,

    /// Use the built-in echo engine instead of a local server
    #[arg(long)]
    pub offline: bool,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl CliArgs {
    pub fn default_log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
