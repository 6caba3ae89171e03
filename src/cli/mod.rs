//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Interactive operator command parsing

pub mod commands;
pub mod exit_codes;

pub use commands::{parse as parse_command, CommandError, OperatorCommand, HELP};
pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
