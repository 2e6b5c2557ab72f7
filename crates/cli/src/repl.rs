use std::io::Write;
use std::path::Path;
use std::time::Duration;

use lantern_session::{
    ChatSession, ConversationId, GenerationOutcome, GenerationProgress, IgnoreReason, MessageId,
    SubmitOutcome,
};
use lantern_storage::JsonArchive;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::command::{self, Command, HELP};
use crate::error::{CliResult, ReadDocumentSnafu, ReadInputSnafu, SaveConversationsSnafu};

const SUMMARY_DEADLINE: Duration = Duration::from_secs(120);

pub struct Repl {
    chat: ChatSession,
    archive: JsonArchive,
}

enum Flow {
    Continue,
    Quit,
}

impl Repl {
    pub fn new(chat: ChatSession, archive: JsonArchive) -> Self {
        Self { chat, archive }
    }

    pub async fn run(mut self) -> CliResult<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("type /help for commands");

        loop {
            prompt();
            let line = tokio::select! {
                line = lines.next_line() => line.context(ReadInputSnafu { stage: "read-line" })?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                break;
            };

            match command::parse(&line) {
                Ok(command) => {
                    if let Flow::Quit = self.execute(command).await {
                        break;
                    }
                }
                Err(error) => eprintln!("{error}"),
            }
        }

        self.close().await
    }

    async fn close(mut self) -> CliResult<()> {
        self.chat.save_to(&self.archive).context(SaveConversationsSnafu {
            stage: "quit",
        })?;
        self.chat.shutdown().await;
        tracing::info!(archive = ?self.archive.path(), "saved conversations");
        Ok(())
    }

    async fn execute(&mut self, command: Command) -> Flow {
        let result = match command {
            Command::Empty => Ok(()),
            Command::Quit => return Flow::Quit,
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Prompt(text) => match self.chat.submit(&text) {
                Ok(outcome) => {
                    self.follow(outcome).await;
                    Ok(())
                }
                Err(error) => Err(error.to_string()),
            },
            Command::Regenerate(position) => self.regenerate(position).await,
            Command::New => self
                .chat
                .create_conversation()
                .await
                .map(|_| self.list())
                .map_err(|error| error.to_string()),
            Command::List => {
                self.list();
                Ok(())
            }
            Command::Select(position) => match self.conversation_at(position) {
                Some(conversation_id) => self
                    .chat
                    .select_conversation(conversation_id)
                    .await
                    .map(|_| self.show())
                    .map_err(|error| error.to_string()),
                None => Err(format!("there is no conversation {position}")),
            },
            Command::Close => match self.chat.current_conversation().map(|c| c.id) {
                Some(conversation_id) => self
                    .chat
                    .close_conversation(conversation_id)
                    .await
                    .map(|_| self.list())
                    .map_err(|error| error.to_string()),
                None => Err("no conversation is open".to_string()),
            },
            Command::Load(path) => self.load_model(&path).await,
            Command::Import(path) => self.import(&path).await,
            Command::Show => {
                self.show();
                Ok(())
            }
            Command::Edit { index, text } => self.edit(index, text),
            Command::Delete(position) => match self.message_at(position) {
                Some(message_id) => self
                    .chat
                    .delete_message(message_id)
                    .map(|_| ())
                    .map_err(|error| error.to_string()),
                None => Err(format!("there is no message {position}")),
            },
            Command::Summary => self.summarize().await,
            Command::System(prompt) => {
                let mut settings = (*self.chat.settings()).clone();
                settings.system_prompt = prompt;
                self.chat
                    .update_settings(settings)
                    .map_err(|error| error.to_string())
            }
        };

        if let Err(message) = result {
            eprintln!("error: {message}");
        }
        Flow::Continue
    }

    pub async fn load_model(&mut self, path: &Path) -> Result<(), String> {
        println!("loading {}", path.display());
        self.chat
            .load_model(path)
            .await
            .map_err(|error| error.to_string())?;
        if let Some(name) = self.chat.model_name() {
            println!("model {name} ready");
        }
        Ok(())
    }

    async fn import(&mut self, path: &Path) -> Result<(), String> {
        let text = std::fs::read_to_string(path)
            .context(ReadDocumentSnafu {
                path,
                stage: "import",
            })
            .map_err(|error| error.to_string())?;
        self.chat
            .import_document(path, text)
            .await
            .map_err(|error| error.to_string())?;
        self.list();
        Ok(())
    }

    fn edit(&mut self, position: usize, text: String) -> Result<(), String> {
        let Some(message_id) = self.message_at(position) else {
            return Err(format!("there is no message {position}"));
        };
        let edited = self
            .chat
            .begin_edit(message_id)
            .and_then(|_| self.chat.set_edit_text(message_id, text))
            .and_then(|_| self.chat.save_edit(message_id));
        match edited {
            Ok(_) => Ok(()),
            Err(error) => {
                let _ = self.chat.cancel_edit(message_id);
                Err(error.to_string())
            }
        }
    }

    async fn regenerate(&mut self, position: Option<usize>) -> Result<(), String> {
        let target = match position {
            Some(position) => match self.message_at(position) {
                Some(message_id) => Some(message_id),
                None => return Err(format!("there is no message {position}")),
            },
            None => None,
        };
        let outcome = self
            .chat
            .regenerate(target)
            .map_err(|error| error.to_string())?;
        self.follow(outcome).await;
        Ok(())
    }

    async fn summarize(&mut self) -> Result<(), String> {
        println!("summarizing...");
        match self.chat.summarize_current(SUMMARY_DEADLINE).await {
            Ok(Some(_)) => {
                if let Some(summary) = self
                    .chat
                    .current_conversation()
                    .and_then(|conversation| conversation.summary.as_deref())
                {
                    println!("summary: {summary}");
                }
                Ok(())
            }
            Ok(None) => Err("no summary was produced".to_string()),
            Err(error) => Err(error.to_string()),
        }
    }

    async fn follow(&mut self, outcome: SubmitOutcome) {
        match outcome {
            SubmitOutcome::Started { .. } => self.stream_reply().await,
            SubmitOutcome::Ignored(reason) => eprintln!("{}", ignored_message(reason)),
        }
    }

    /// Prints fragments as they arrive. Ctrl-C stops the reply, not the program.
    async fn stream_reply(&mut self) {
        let cancel = self.chat.cancel_handle();
        loop {
            let progress = tokio::select! {
                progress = self.chat.advance() => progress,
                _ = tokio::signal::ctrl_c() => {
                    if let Some(cancel) = &cancel {
                        cancel.cancel();
                    }
                    continue;
                }
            };
            match progress {
                GenerationProgress::Fragment { text, .. } => {
                    print!("{text}");
                    flush();
                }
                GenerationProgress::Finished(outcome) => {
                    println!();
                    match outcome {
                        GenerationOutcome::Completed(_) => {}
                        GenerationOutcome::Cancelled(_) => eprintln!("(stopped)"),
                        GenerationOutcome::Failed { message, .. } => {
                            eprintln!("generation failed: {message}")
                        }
                    }
                    return;
                }
                GenerationProgress::Idle => return,
            }
        }
    }

    fn list(&self) {
        let current = self.chat.current_conversation().map(|c| c.id);
        for (index, conversation) in self.chat.conversations().iter().enumerate() {
            let marker = if Some(conversation.id) == current { '*' } else { ' ' };
            println!(
                "{marker} {}. {} ({} messages)",
                index + 1,
                conversation.title,
                conversation.len()
            );
        }
    }

    fn show(&self) {
        let Some(conversation) = self.chat.current_conversation() else {
            println!("no conversation is open");
            return;
        };
        println!("# {}", conversation.title);
        for (index, message) in conversation.messages().iter().enumerate() {
            println!("[{}] {}: {}", index + 1, message.author.label(), message.text);
        }
    }

    fn conversation_at(&self, position: usize) -> Option<ConversationId> {
        self.chat
            .conversations()
            .get(position.checked_sub(1)?)
            .map(|conversation| conversation.id)
    }

    fn message_at(&self, position: usize) -> Option<MessageId> {
        self.chat
            .current_conversation()?
            .messages()
            .get(position.checked_sub(1)?)
            .map(|message| message.id)
    }
}

fn ignored_message(reason: IgnoreReason) -> &'static str {
    match reason {
        IgnoreReason::NoSession => "no model is loaded, use /load PATH",
        IgnoreReason::GenerationInProgress => "a reply is still being generated",
        IgnoreReason::NoConversation => "no conversation is open, use /new",
        IgnoreReason::EmptyPrompt => "nothing to send",
    }
}

fn prompt() {
    print!("> ");
    flush();
}

fn flush() {
    if let Err(error) = std::io::stdout().flush() {
        tracing::debug!(error = %error, "stdout flush failed");
    }
}
