//! Process exit codes
//!
//! Stable codes so shell scripts can tell a missing adapter from a bad
//! script file or an unplugged device.

use crate::config::ConfigError;
use crate::core::script::ScriptFormatError;
use crate::core::sequencer::ScriptError;
use crate::core::transport::ChannelError;
use std::io::ErrorKind;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;
    /// Unclassified failure
    pub const ERROR: u8 = 1;
    /// Bad command line or link settings
    pub const USAGE: u8 = 2;
    /// The device refused to open
    pub const OPEN_FAILED: u8 = 3;
    /// No such port, or no ports at all
    pub const NO_DEVICE: u8 = 4;
    /// Port access denied
    pub const PERMISSION_DENIED: u8 = 5;
    /// A link is already up
    pub const BUSY: u8 = 6;
    /// Device went away mid-session
    pub const DEVICE_LOST: u8 = 7;
    /// No port was chosen
    pub const CANCELLED: u8 = 8;
    /// Script document rejected
    pub const SCRIPT_INVALID: u8 = 10;
    /// Script run aborted
    pub const SCRIPT_FAILED: u8 = 11;
    /// Input file missing
    pub const FILE_NOT_FOUND: u8 = 12;
    /// Settings file unreadable or invalid
    pub const CONFIG_ERROR: u8 = 13;
    /// A bounded wait expired
    pub const TIMEOUT: u8 = 14;
    /// Runtime could not start
    pub const INTERNAL_ERROR: u8 = 70;
}

const TABLE: &[(u8, &str)] = &[
    (ExitCodes::SUCCESS, "Success"),
    (ExitCodes::ERROR, "General error"),
    (ExitCodes::USAGE, "Invalid arguments or link settings"),
    (ExitCodes::OPEN_FAILED, "Port could not be opened"),
    (ExitCodes::NO_DEVICE, "No serial device found"),
    (ExitCodes::PERMISSION_DENIED, "Permission denied"),
    (ExitCodes::BUSY, "Already connected"),
    (ExitCodes::DEVICE_LOST, "Device disconnected"),
    (ExitCodes::CANCELLED, "No port selected"),
    (ExitCodes::SCRIPT_INVALID, "Invalid script document"),
    (ExitCodes::SCRIPT_FAILED, "Script run failed"),
    (ExitCodes::FILE_NOT_FOUND, "File not found"),
    (ExitCodes::CONFIG_ERROR, "Configuration error"),
    (ExitCodes::TIMEOUT, "Timed out"),
    (ExitCodes::INTERNAL_ERROR, "Internal error"),
];

/// Outcome of a CLI invocation
#[derive(Debug)]
pub enum CliResult {
    /// Success, optionally with a summary line
    Success(Option<String>),
    /// Failure with exit code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a summary line
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Numeric exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Summary or error message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Process exit code
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

fn io_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
        ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
        ErrorKind::TimedOut => ExitCodes::TIMEOUT,
        _ => ExitCodes::ERROR,
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        Self::Error(io_code(err.kind()), err.to_string())
    }
}

impl From<ChannelError> for CliResult {
    fn from(err: ChannelError) -> Self {
        let code = match &err {
            ChannelError::SelectionCancelled => ExitCodes::CANCELLED,
            ChannelError::DeviceUnavailable(_) => ExitCodes::NO_DEVICE,
            ChannelError::OpenRejected(_) | ChannelError::NotConnected => ExitCodes::OPEN_FAILED,
            ChannelError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            ChannelError::InvalidConfiguration(_) => ExitCodes::USAGE,
            ChannelError::DeviceLost(_) => ExitCodes::DEVICE_LOST,
            ChannelError::AlreadyConnected => ExitCodes::BUSY,
            ChannelError::Io(e) => io_code(e.kind()),
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ScriptFormatError> for CliResult {
    fn from(err: ScriptFormatError) -> Self {
        let code = match &err {
            ScriptFormatError::Io { source, .. } => io_code(source.kind()),
            _ => ExitCodes::SCRIPT_INVALID,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ScriptError> for CliResult {
    fn from(err: ScriptError) -> Self {
        let code = match &err {
            ScriptError::NotConnected => ExitCodes::OPEN_FAILED,
            ScriptError::Write { source, .. } if source.is_device_lost() => ExitCodes::DEVICE_LOST,
            _ => ExitCodes::SCRIPT_FAILED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::Invalid(_) | ConfigError::ThresholdOutOfRange(_) => ExitCodes::USAGE,
            _ => ExitCodes::CONFIG_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

/// Meaning of an exit code
pub fn exit_code_description(code: u8) -> &'static str {
    TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map_or("Unknown error", |(_, text)| *text)
}

/// Print the exit code table
pub fn print_exit_codes() {
    println!("Exit codes:");
    for (code, text) in TABLE {
        println!("  {code:>3}  {text}");
    }
}
