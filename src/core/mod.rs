//! Core module containing the main functionality of PineTerm
//!
//! This module provides:
//! - Transport contract with serial and loopback implementations
//! - Session management with state machine
//! - Codec for hex/text rendering
//! - Receive pipeline with timing-based packetization
//! - Log aggregation and export
//! - Script parsing and sequenced playback

pub mod codec;
pub mod logger;
pub mod packet;
pub mod receiver;
pub mod script;
pub mod sequencer;
pub mod session;
pub mod transport;
