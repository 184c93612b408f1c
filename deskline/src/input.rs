//! Line input from the operator console.
//!
//! Plain text is sent to the open conversation. Lines starting with `/` are
//! commands; `//` escapes a literal leading slash.

use std::path::PathBuf;

use deskline_proto::conversation::{
    ConversationFilter, ConversationId, ConversationStatus, CustomerId, Platform,
};

use crate::engine::Intent;

/// Help text listing the console commands.
pub const HELP: &str = "\
commands:
  /filter <all|active|closed> [platform]   change the conversation list filter
  /more                                    load more conversations
  /select <conversation>                   open a loaded conversation
  /back                                    close the open conversation
  /send <text>                             send text (bare lines are sent too)
  /older                                   load older messages
  /attach <path>                           send a file to the open conversation
  /open <conversation>                     open a conversation once it is listed
  /customer <customer>                     open a customer's conversation once it is listed
  /link <conversation> <customer>          link a conversation to a customer
  /close <conversation>                    close a conversation
  /dismiss                                 hide the current notice
  /help                                    show this help
  /quit                                    exit";

/// A parsed console line.
#[derive(Debug, Clone)]
pub enum Input {
    Intent(Intent),
    /// Read a file from disk and send it.
    Attach(PathBuf),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("unknown command: /{0} (try /help)")]
    UnknownCommand(String),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("not a valid id: {0}")]
    InvalidId(String),

    #[error("{0}")]
    InvalidFilter(String),
}

/// Parse one console line. Blank lines parse to `None`.
///
/// # Errors
///
/// Returns an [`InputError`] for unknown commands or bad arguments.
pub fn parse(line: &str) -> Result<Option<Input>, InputError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    if let Some(literal) = line.strip_prefix("//") {
        return Ok(Some(Input::Intent(Intent::SendText(format!("/{literal}")))));
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Input::Intent(Intent::SendText(line.to_string()))));
    };

    let mut args = command.split_whitespace();
    let name = args.next().unwrap_or_default();
    let input = match name {
        "filter" => Input::Intent(Intent::SetFilter(parse_filter(args.next(), args.next())?)),
        "more" => Input::Intent(Intent::LoadMoreConversations),
        "select" => Input::Intent(Intent::Select(Some(conversation_arg(args.next())?))),
        "back" => Input::Intent(Intent::Select(None)),
        "older" => Input::Intent(Intent::LoadOlderMessages),
        "attach" => {
            let path = command
                .strip_prefix("attach")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or(InputError::MissingArgument("path"))?;
            Input::Attach(PathBuf::from(path))
        }
        "send" => {
            let text = command.strip_prefix("send").unwrap_or_default().trim_start();
            Input::Intent(Intent::SendText(text.to_string()))
        }
        "open" => Input::Intent(Intent::OpenConversation(conversation_arg(args.next())?)),
        "customer" => Input::Intent(Intent::OpenCustomer(CustomerId::new(id_arg(
            args.next(),
            "customer",
        )?))),
        "link" => {
            let conversation = conversation_arg(args.next())?;
            let customer = CustomerId::new(id_arg(args.next(), "customer")?);
            Input::Intent(Intent::LinkCustomer {
                conversation,
                customer,
            })
        }
        "close" => Input::Intent(Intent::CloseConversation(conversation_arg(args.next())?)),
        "dismiss" => Input::Intent(Intent::DismissNotice),
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(InputError::UnknownCommand(other.to_string())),
    };
    Ok(Some(input))
}

fn id_arg(arg: Option<&str>, what: &'static str) -> Result<i64, InputError> {
    let arg = arg.ok_or(InputError::MissingArgument(what))?;
    arg.parse()
        .map_err(|_| InputError::InvalidId(arg.to_string()))
}

fn conversation_arg(arg: Option<&str>) -> Result<ConversationId, InputError> {
    id_arg(arg, "conversation").map(ConversationId::new)
}

fn parse_filter(status: Option<&str>, platform: Option<&str>) -> Result<ConversationFilter, InputError> {
    let status = match status.ok_or(InputError::MissingArgument("status"))? {
        "all" => None,
        "active" => Some(ConversationStatus::Active),
        "closed" => Some(ConversationStatus::Closed),
        other => return Err(InputError::InvalidFilter(format!("unknown status: {other}"))),
    };
    let platform = platform
        .map(str::parse::<Platform>)
        .transpose()
        .map_err(InputError::InvalidFilter)?;
    Ok(ConversationFilter { status, platform })
}
