//! # PineTerm Core Library
//!
//! An interactive UART terminal core:
//! - Connection lifecycle with guaranteed release of the device handles
//! - Timing-based regrouping of raw reads into packets
//! - Batched hex/text traffic log with bounded display and full export
//! - Cancellable, timed command scripts
//!
//! Devices are reached through the [`ChannelProvider`] contract; serial
//! ports and an in-process loopback device are provided.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pineterm_core::{LinkConfig, Session, SerialProvider};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let session = Session::new(SerialProvider::new());
//!     session.open(LinkConfig::new(115_200).port("/dev/ttyUSB0")).await?;
//!
//!     session.send_text("AT").await?;
//!
//!     let mut batches = session.log().subscribe();
//!     while let Ok(batch) = batches.recv().await {
//!         for entry in batch.iter() {
//!             println!("{} {}: {}", entry.time_label(), entry.direction, entry.hex);
//!         }
//!     }
//!
//!     session.close(false).await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OperatorCommand};
pub use crate::config::AppConfig;
pub use crate::core::codec::{Codec, CodecError, CodecType, LineEnding};
pub use crate::core::logger::{LogAggregator, LogBatch, LogEntry};
pub use crate::core::packet::{Packet, PacketDirection};
pub use crate::core::receiver::{Reassembler, ReceiveSettings};
pub use crate::core::script::{Repeat, Script, ScriptCommand, ScriptFormatError};
pub use crate::core::sequencer::{CommandSequencer, RunOutcome, RunReport, ScriptError};
pub use crate::core::session::{
    LinkStats, LinkWriter, OpenOutcome, SendError, Session, SessionEvent, SessionState,
};
pub use crate::core::transport::{
    ChannelError, ChannelProvider, LinkConfig, LoopbackDevice, SerialFlowControl, SerialParity,
    SerialProvider,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
