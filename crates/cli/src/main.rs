mod args;
mod command;
mod error;
mod repl;

use std::path::PathBuf;

use clap::Parser;
use lantern_llm::{EngineKind, create_engine};
use lantern_session::{ChatSession, SettingsStore, TracingObserver};
use lantern_storage::JsonArchive;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::args::CliArgs;
use crate::error::CliResult;
use crate::repl::Repl;

const OFFLINE_MODEL: &str = "offline.gguf";

#[tokio::main]
async fn main() -> CliResult<()> {
    let args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.default_log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = match &args.settings {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let engine = if args.offline {
        create_engine(EngineKind::Scripted)
    } else {
        create_engine(EngineKind::LocalServer(settings.settings().engine_config()))
    };
    let last_model = settings.settings().last_model_path.clone();

    let mut chat = ChatSession::new(engine, settings);
    chat.add_observer(Box::new(TracingObserver));

    let archive = match &args.archive {
        Some(path) => JsonArchive::new(path.clone()),
        None => JsonArchive::in_directory(&SettingsStore::default_config_dir()),
    };
    match chat.load_from(&archive).await {
        Ok(count) => tracing::info!(count, archive = ?archive.path(), "loaded conversations"),
        Err(error) => tracing::warn!(error = %error, "starting without saved conversations"),
    }
    if chat.conversations().is_empty() {
        if let Err(error) = chat.create_conversation().await {
            tracing::warn!(error = %error, "could not open a conversation");
        }
    }

    let model = args.model.clone().or(last_model).or_else(|| {
        args.offline.then(|| PathBuf::from(OFFLINE_MODEL))
    });

    let mut repl = Repl::new(chat, archive);
    if let Some(model) = model {
        if let Err(message) = repl.load_model(&model).await {
            eprintln!("error: {message}");
        }
    }
    repl.run().await
}
