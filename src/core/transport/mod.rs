//! Host channel provider contract
//!
//! The core only ever talks to these traits:
//! - [`ChannelProvider`] selects a device
//! - [`Channel`] opens/closes it and hands out the exclusive handles
//! - [`ChannelReader`] / [`ChannelWriter`] move the bytes
//!
//! Handles release on drop. Implementations:
//! - Serial ports through `tokio-serial`
//! - An in-process loopback device for tests and demos

mod loopback;
mod serial;

pub use loopback::{Fault, LoopbackDevice, LoopbackProvider};
pub use serial::{list_ports, PortChooser, SerialChannel, SerialProvider};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Highest bit rate accepted for custom rates
pub const MAX_BAUD_RATE: u32 = 10_000_000;

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

impl std::str::FromStr for SerialFlowControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "hardware" | "hw" | "rtscts" => Ok(Self::Hardware),
            "software" | "sw" | "xonxoff" => Ok(Self::Software),
            other => Err(format!("unknown flow control: {other}")),
        }
    }
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity: {other}")),
        }
    }
}

/// Link framing parameters, snapshotted for the lifetime of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0); `None` asks the chooser
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
    /// Read buffer size hint in bytes
    pub buffer_size: usize,
}

impl LinkConfig {
    /// Create a new link configuration with 8N1 defaults
    pub fn new(baud_rate: u32) -> Self {
        Self {
            port: None,
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
            buffer_size: 8192,
        }
    }

    /// Set port name
    #[must_use]
    pub fn port(mut self, port: &str) -> Self {
        self.port = Some(port.to_string());
        self
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Reject settings no UART accepts
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.baud_rate == 0 || self.baud_rate > MAX_BAUD_RATE {
            return Err(ChannelError::InvalidConfiguration(format!(
                "Invalid baud rate {} (1-{})",
                self.baud_rate, MAX_BAUD_RATE
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ChannelError::InvalidConfiguration(format!(
                "Invalid data bits {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ChannelError::InvalidConfiguration(format!(
                "Invalid stop bits {}",
                self.stop_bits
            )));
        }
        if self.buffer_size == 0 {
            return Err(ChannelError::InvalidConfiguration(
                "Buffer size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new(115_200)
    }
}

impl fmt::Display for LinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} baud ({}{}{} {})",
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits,
            match self.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
                SerialFlowControl::Software => "SW FC",
            }
        )
    }
}

/// Channel error types
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Operator dismissed the device chooser; not a failure
    #[error("No port selected")]
    SelectionCancelled,

    /// No device could be found or selected
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Device refused to open with the requested parameters
    #[error("Open rejected: {0}")]
    OpenRejected(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Device went away while in use
    #[error("Device disconnected: {0}")]
    DeviceLost(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// A link is already open or opening
    #[error("Already connected")]
    AlreadyConnected,
}

impl ChannelError {
    /// Expected cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::SelectionCancelled)
    }

    /// Device loss; the link must be torn down
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let lost = matches!(
            err.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::NotConnected
                | ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionReset
                | ErrorKind::UnexpectedEof
                | ErrorKind::PermissionDenied
        ) || matches!(err.raw_os_error(), Some(5 | 6 | 19));

        if lost {
            Self::DeviceLost(err.to_string())
        } else {
            Self::Io(err)
        }
    }
}

/// Device selection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Pick a device; `SelectionCancelled` when the operator backs out
    async fn request_device(&self, config: &LinkConfig) -> Result<Box<dyn Channel>, ChannelError>;
}

/// A selected device
#[async_trait]
pub trait Channel: Send {
    /// Open with the given framing parameters
    async fn open(&mut self, config: &LinkConfig) -> Result<(), ChannelError>;

    /// Drop whatever input is already buffered from an earlier session
    async fn discard_input(&mut self) -> Result<usize, ChannelError>;

    /// Take the exclusive reader and writer
    fn acquire(&mut self) -> Result<(Box<dyn ChannelReader>, Box<dyn ChannelWriter>), ChannelError>;

    /// Close the device
    async fn close(&mut self) -> Result<(), ChannelError>;

    /// Last-resort release when `close` does not settle
    async fn forget(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Get connection info string
    fn describe(&self) -> String;
}

/// Exclusive read handle. Releases on drop.
#[async_trait]
pub trait ChannelReader: Send {
    /// Next chunk, `None` at end of stream.
    ///
    /// Must be cancellation safe: the receive loop races it against timers.
    async fn read(&mut self) -> Result<Option<Bytes>, ChannelError>;

    /// Abort a pending read
    async fn cancel(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Exclusive write handle. Releases on drop.
#[async_trait]
pub trait ChannelWriter: Send {
    /// Write the whole buffer
    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_baud_bounds() {
        assert!(LinkConfig::new(0).validate().is_err());
        assert!(LinkConfig::new(MAX_BAUD_RATE).validate().is_ok());
        assert!(LinkConfig::new(MAX_BAUD_RATE + 1).validate().is_err());
    }

    #[test]
    fn test_validate_framing() {
        assert!(LinkConfig::new(9600).data_bits(4).validate().is_err());
        assert!(LinkConfig::new(9600).stop_bits(3).validate().is_err());
        assert!(LinkConfig::new(9600).data_bits(7).stop_bits(2).validate().is_ok());
    }

    #[test]
    fn test_display() {
        let config = LinkConfig::new(9600).parity(SerialParity::Even);
        assert_eq!(config.to_string(), "9600 baud (8E1 No FC)");
    }

    #[test]
    fn test_io_classification() {
        let lost: ChannelError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(lost.is_device_lost());

        let transient: ChannelError = std::io::Error::other("framing").into();
        assert!(!transient.is_device_lost());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("E".parse::<SerialParity>().unwrap(), SerialParity::Even);
        assert_eq!("hw".parse::<SerialFlowControl>().unwrap(), SerialFlowControl::Hardware);
        assert!("mark".parse::<SerialParity>().is_err());
    }
}
