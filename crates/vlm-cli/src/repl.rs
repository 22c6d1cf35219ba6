//! Line parsing for the interactive chat.

use std::path::PathBuf;

pub const HELP: &str = "\
Commands:
  <text>                     chat with the model
  /image <path> <question>   ask about an image
  /audio <path> <question>   ask about an audio clip
  /history                   show the conversation
  /clear                     forget the conversation
  /prompt [name]             list templates or switch to one
  /help                      show this help
  /quit                      exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Empty,
    Chat(String),
    Image { path: PathBuf, question: String },
    Audio { path: PathBuf, question: String },
    History,
    Clear,
    Prompt(Option<String>),
    Help,
    Quit,
}

pub fn parse(line: &str) -> Result<ReplCommand, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ReplCommand::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(ReplCommand::Chat(line.to_string()));
    };

    let (command, args) = match rest.split_once(char::is_whitespace) {
        Some((command, args)) => (command, args.trim()),
        None => (rest, ""),
    };

    match command {
        "image" | "img" => {
            let (path, question) = media_args(args, "/image <path> <question>")?;
            Ok(ReplCommand::Image { path, question })
        }
        "audio" => {
            let (path, question) = media_args(args, "/audio <path> <question>")?;
            Ok(ReplCommand::Audio { path, question })
        }
        "history" => Ok(ReplCommand::History),
        "clear" | "reset" => Ok(ReplCommand::Clear),
        "prompt" => Ok(ReplCommand::Prompt(
            Some(args.to_string()).filter(|name| !name.is_empty()),
        )),
        "help" | "?" => Ok(ReplCommand::Help),
        "quit" | "exit" | "q" => Ok(ReplCommand::Quit),
        other => Err(format!("Unknown command '/{other}'. Type /help for commands.")),
    }
}

fn media_args(args: &str, usage: &str) -> Result<(PathBuf, String), String> {
    match args.split_once(char::is_whitespace) {
        Some((path, question)) if !question.trim().is_empty() => {
            Ok((PathBuf::from(path), question.trim().to_string()))
        }
        _ => Err(format!("Usage: {usage}")),
    }
}
