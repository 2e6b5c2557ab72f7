use std::path::PathBuf;

use snafu::Snafu;

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Prompt(String),
    New,
    List,
    Select(usize),
    Close,
    Load(PathBuf),
    Import(PathBuf),
    Show,
    Edit { index: usize, text: String },
    Delete(usize),
    Regenerate(Option<usize>),
    Summary,
    System(String),
    Help,
    Quit,
    Empty,
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    Unknown { name: String },
    #[snafu(display("`/{name}` needs {what}"))]
    MissingArgument { name: &'static str, what: &'static str },
    #[snafu(display("`{value}` is not a position, positions start at 1"))]
    InvalidPosition { value: String },
}

pub const HELP: &str = "\
commands:
  /new              start a conversation
  /list             list conversations
  /select N         switch to conversation N
  /close            close the current conversation
  /load PATH        load GGUF model weights
  /import PATH      open a text file as a new conversation
  /show             print the current transcript
  /edit N TEXT      replace the text of message N
  /delete N         delete message N
  /regen [N]        regenerate message N, or the last one
  /summary          summarize the current conversation
  /system TEXT      change the system prompt
  /quit             save and exit
anything else is sent to the model; Ctrl-C stops a reply";

pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Prompt(line.to_string()));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };

    match name {
        "new" => Ok(Command::New),
        "list" => Ok(Command::List),
        "select" => position(argument, "select").map(Command::Select),
        "close" => Ok(Command::Close),
        "load" => path(argument, "load").map(Command::Load),
        "import" => path(argument, "import").map(Command::Import),
        "show" => Ok(Command::Show),
        "edit" => {
            let (index, text) = argument
                .split_once(char::is_whitespace)
                .map(|(index, text)| (index, text.trim()))
                .unwrap_or((argument, ""));
            let index = position(index, "edit")?;
            if text.is_empty() {
                return MissingArgumentSnafu {
                    name: "edit",
                    what: "the new text",
                }
                .fail();
            }
            Ok(Command::Edit {
                index,
                text: text.to_string(),
            })
        }
        "delete" => position(argument, "delete").map(Command::Delete),
        "regen" if argument.is_empty() => Ok(Command::Regenerate(None)),
        "regen" => position(argument, "regen").map(|index| Command::Regenerate(Some(index))),
        "summary" => Ok(Command::Summary),
        "system" => Ok(Command::System(argument.to_string())),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => UnknownSnafu { name: other }.fail(),
    }
}

fn position(argument: &str, name: &'static str) -> Result<usize, CommandError> {
    if argument.is_empty() {
        return MissingArgumentSnafu {
            name,
            what: "a position",
        }
        .fail();
    }
    match argument.parse::<usize>() {
        Ok(index) if index > 0 => Ok(index),
        _ => InvalidPositionSnafu { value: argument }.fail(),
    }
}

fn path(argument: &str, name: &'static str) -> Result<PathBuf, CommandError> {
    if argument.is_empty() {
        return MissingArgumentSnafu { name, what: "a path" }.fail();
    }
    Ok(PathBuf::from(argument))
}
