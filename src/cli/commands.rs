//! Interactive operator commands
//!
//! Lines starting with `:` are commands; anything else is sent as text.
//! A leading `::` escapes a literal colon.

use crate::core::codec::{CodecType, LineEnding};
use std::path::PathBuf;
use thiserror::Error;

/// Help text for interactive mode
pub const HELP: &str = "\
Commands:
  <text>                  send text followed by the line ending
  ::<text>                send text starting with ':'
  :hex <bytes>            send hex bytes, e.g. :hex 41 42 0D
  :open                   connect
  :close                  disconnect
  :load <file>            load a JSON script
  :run                    run the loaded script
  :stop                   stop the running script
  :view hex|text          switch the log view
  :export [dir]           write the log to a file
  :clear                  clear the log
  :show                   print the retained display history
  :timing on|off [ms]     packet timing and threshold
  :max-lines <n>          display cap (0 = unbounded)
  :ending none|cr|lf|crlf line ending for sends
  :stats                  byte counters and state
  :help                   this text
  :quit                   disconnect and exit";

/// A parsed operator line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Send text
    Send(String),
    /// Send hex
    Hex(String),
    /// Connect
    Open,
    /// Disconnect
    Close,
    /// Load a script
    Load(PathBuf),
    /// Run the loaded script
    Run,
    /// Stop the running script
    Stop,
    /// Switch view
    View(CodecType),
    /// Export the log
    Export(Option<PathBuf>),
    /// Clear the log
    Clear,
    /// Print the display history
    Show,
    /// Packet timing
    Timing {
        /// Buffered mode on
        enabled: bool,
        /// New threshold, if given
        threshold_ms: Option<u64>,
    },
    /// Display cap
    MaxLines(usize),
    /// Line ending
    Ending(LineEnding),
    /// Show counters
    Stats,
    /// Show help
    Help,
    /// Exit
    Quit,
}

/// Operator input that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Unknown `:command`
    #[error("Unknown command :{0} (try :help)")]
    Unknown(String),

    /// Required argument missing
    #[error(":{0} needs an argument")]
    MissingArgument(&'static str),

    /// Argument did not parse
    #[error(":{command}: {reason}")]
    InvalidArgument {
        /// Command name
        command: &'static str,
        /// What is wrong
        reason: String,
    },
}

/// Parse one input line
pub fn parse(line: &str) -> Result<OperatorCommand, CommandError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(literal) = line.strip_prefix("::") {
        return Ok(OperatorCommand::Send(format!(":{literal}")));
    }
    let Some(rest) = line.strip_prefix(':') else {
        return Ok(OperatorCommand::Send(line.to_string()));
    };

    let rest = rest.trim();
    let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let args = args.trim();

    let command = match name {
        "hex" => OperatorCommand::Hex(required("hex", args)?.to_string()),
        "open" | "connect" => OperatorCommand::Open,
        "close" | "disconnect" => OperatorCommand::Close,
        "load" => OperatorCommand::Load(PathBuf::from(required("load", args)?)),
        "run" => OperatorCommand::Run,
        "stop" => OperatorCommand::Stop,
        "view" => OperatorCommand::View(invalid("view", required("view", args)?.parse::<CodecType>())?),
        "export" => OperatorCommand::Export((!args.is_empty()).then(|| PathBuf::from(args))),
        "clear" => OperatorCommand::Clear,
        "show" => OperatorCommand::Show,
        "timing" => parse_timing(args)?,
        "max-lines" => OperatorCommand::MaxLines(invalid(
            "max-lines",
            required("max-lines", args)?.parse::<usize>().map_err(|e| format!("{e}")),
        )?),
        "ending" => OperatorCommand::Ending(invalid("ending", required("ending", args)?.parse::<LineEnding>())?),
        "stats" => OperatorCommand::Stats,
        "help" | "?" => OperatorCommand::Help,
        "quit" | "exit" | "q" => OperatorCommand::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(command)
}

fn required<'a>(command: &'static str, args: &'a str) -> Result<&'a str, CommandError> {
    if args.is_empty() {
        Err(CommandError::MissingArgument(command))
    } else {
        Ok(args)
    }
}

fn invalid<T>(command: &'static str, result: Result<T, String>) -> Result<T, CommandError> {
    result.map_err(|reason| CommandError::InvalidArgument { command, reason })
}

fn parse_timing(args: &str) -> Result<OperatorCommand, CommandError> {
    let mut parts = required("timing", args)?.split_whitespace();
    let enabled = match parts.next() {
        Some("on") => true,
        Some("off") => false,
        Some(other) => {
            return Err(CommandError::InvalidArgument {
                command: "timing",
                reason: format!("expected on or off, got {other}"),
            })
        }
        None => return Err(CommandError::MissingArgument("timing")),
    };
    let threshold_ms = parts
        .next()
        .map(|ms| ms.parse::<u64>().map_err(|e| format!("threshold: {e}")))
        .transpose();
    Ok(OperatorCommand::Timing {
        enabled,
        threshold_ms: invalid("timing", threshold_ms)?,
    })
}
