//! Script documents
//!
//! A script is a JSON array. Each element is either a plain string (sent as
//! text with the line terminator) or an object:
//!
//! ```json
//! [
//!   "AT",
//!   { "type": "hex", "data": "01 03 00 00", "preDelay": 20, "postDelay": 250, "times": 3 },
//!   { "data": "PING", "times": -1 }
//! ]
//! ```
//!
//! Delays are milliseconds. `times`: 0 skips, N > 0 repeats N times, -1
//! repeats until stopped. The whole document is validated up front; one bad
//! element rejects all of it.

use super::codec::{decode_hex, LineEnding};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Gap after each write unless the command says otherwise
pub const DEFAULT_POST_DELAY: Duration = Duration::from_millis(100);

/// How often a command is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Never
    Skip,
    /// Exactly once
    Once,
    /// N times (N > 1)
    Times(u32),
    /// Until the run is stopped
    Infinite,
}

impl Repeat {
    /// Map the document's `times` field
    pub fn from_times(times: i64) -> Option<Self> {
        match times {
            -1 => Some(Self::Infinite),
            0 => Some(Self::Skip),
            1 => Some(Self::Once),
            n => u32::try_from(n).ok().map(Self::Times),
        }
    }

    /// Another repetition may follow `done` completed ones
    pub fn allows(&self, done: u64) -> bool {
        match self {
            Self::Skip => false,
            Self::Once => done < 1,
            Self::Times(n) => done < u64::from(*n),
            Self::Infinite => true,
        }
    }
}

/// What a command sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    /// Text; the line terminator is appended at run time
    Literal(String),
    /// Exact bytes
    Framed(Bytes),
}

/// One validated script step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    /// Payload
    pub payload: CommandPayload,
    /// Wait before each write
    pub pre_delay: Duration,
    /// Wait after each write
    pub post_delay: Duration,
    /// Repeat policy
    pub repeat: Repeat,
}

impl ScriptCommand {
    /// Literal command with default timing
    pub fn literal(text: &str) -> Self {
        Self {
            payload: CommandPayload::Literal(text.to_string()),
            pre_delay: Duration::ZERO,
            post_delay: DEFAULT_POST_DELAY,
            repeat: Repeat::Once,
        }
    }

    /// Framed command with default timing
    pub fn framed(data: impl Into<Bytes>) -> Self {
        Self {
            payload: CommandPayload::Framed(data.into()),
            pre_delay: Duration::ZERO,
            post_delay: DEFAULT_POST_DELAY,
            repeat: Repeat::Once,
        }
    }

    /// Set the delays
    #[must_use]
    pub fn delays(mut self, pre: Duration, post: Duration) -> Self {
        self.pre_delay = pre;
        self.post_delay = post;
        self
    }

    /// Set the repeat policy
    #[must_use]
    pub fn repeat(mut self, repeat: Repeat) -> Self {
        self.repeat = repeat;
        self
    }

    /// Bytes put on the wire for one repetition
    pub fn resolve(&self, ending: LineEnding) -> Bytes {
        match &self.payload {
            CommandPayload::Literal(text) => ending.terminate(text.as_bytes()),
            CommandPayload::Framed(data) => data.clone(),
        }
    }
}

/// Document rejected as a whole
#[derive(Debug, Error)]
pub enum ScriptFormatError {
    /// Not valid JSON
    #[error("Invalid JSON file: {0}")]
    Json(#[from] serde_json::Error),

    /// Top level is not an array
    #[error("JSON must be an array of commands")]
    NotAnArray,

    /// An element has the wrong shape
    #[error("Command {index}: {reason}")]
    InvalidCommand {
        /// Zero-based element index
        index: usize,
        /// What is wrong
        reason: String,
    },

    /// File could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// Script path
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommand {
    #[serde(rename = "type")]
    kind: Option<String>,
    data: String,
    pre_delay: Option<f64>,
    post_delay: Option<f64>,
    times: Option<i64>,
}

/// A validated, ready-to-run script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    commands: Vec<ScriptCommand>,
}

impl Script {
    /// Build from already validated commands
    pub fn new(commands: Vec<ScriptCommand>) -> Self {
        Self { commands }
    }

    /// Parse a script document
    pub fn parse(json: &str) -> Result<Self, ScriptFormatError> {
        let document: Value = serde_json::from_str(json)?;
        let Value::Array(elements) = document else {
            return Err(ScriptFormatError::NotAnArray);
        };

        let commands = elements
            .into_iter()
            .enumerate()
            .map(|(index, element)| {
                parse_command(element).map_err(|reason| ScriptFormatError::InvalidCommand { index, reason })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { commands })
    }

    /// Read and parse a script file
    pub fn load(path: &Path) -> Result<Self, ScriptFormatError> {
        let json = std::fs::read_to_string(path).map_err(|source| ScriptFormatError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let script = Self::parse(&json)?;
        tracing::info!("Loaded {} command(s) from {}", script.len(), path.display());
        Ok(script)
    }

    /// Commands in order
    pub fn commands(&self) -> &[ScriptCommand] {
        &self.commands
    }

    /// Number of commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// No commands at all
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

fn parse_command(element: Value) -> Result<ScriptCommand, String> {
    if let Value::String(text) = element {
        return Ok(ScriptCommand::literal(&text));
    }
    if !element.is_object() {
        return Err(format!("expected a string or an object, found {element}"));
    }

    let raw: RawCommand = serde_json::from_value(element).map_err(|e| e.to_string())?;

    let payload = match raw.kind.as_deref() {
        Some("hex") => CommandPayload::Framed(decode_hex(&raw.data).map_err(|e| e.to_string())?),
        None | Some("text" | "ascii") => CommandPayload::Literal(raw.data),
        Some(other) => return Err(format!("unknown type \"{other}\"")),
    };

    let times = raw.times.unwrap_or(1);
    let repeat = Repeat::from_times(times).ok_or_else(|| format!("invalid times {times}"))?;

    Ok(ScriptCommand {
        payload,
        pre_delay: delay(raw.pre_delay, Duration::ZERO, "preDelay")?,
        post_delay: delay(raw.post_delay, DEFAULT_POST_DELAY, "postDelay")?,
        repeat,
    })
}

fn delay(ms: Option<f64>, default: Duration, field: &str) -> Result<Duration, String> {
    match ms {
        None => Ok(default),
        Some(ms) if ms.is_finite() && ms >= 0.0 => {
            Duration::try_from_secs_f64(ms / 1000.0).map_err(|_| format!("{field} {ms} out of range"))
        }
        Some(ms) => Err(format!("invalid {field} {ms}")),
    }
}
