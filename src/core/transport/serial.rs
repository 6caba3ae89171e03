//! Serial port transport implementation

use super::{
    Channel, ChannelError, ChannelProvider, ChannelReader, ChannelWriter, LinkConfig,
    SerialFlowControl, SerialParity,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, StopBits};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Operator-facing port chooser. Returning `None` dismisses the selection.
pub type PortChooser = Arc<dyn Fn(&[SerialPortInfo]) -> Option<String> + Send + Sync>;

/// Provides serial channels, either by name or through a chooser
#[derive(Clone, Default)]
pub struct SerialProvider {
    chooser: Option<PortChooser>,
}

impl SerialProvider {
    /// Provider that only opens the port named in the link config
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that asks `chooser` when no port is configured
    pub fn with_chooser(chooser: PortChooser) -> Self {
        Self {
            chooser: Some(chooser),
        }
    }
}

#[async_trait]
impl ChannelProvider for SerialProvider {
    async fn request_device(&self, config: &LinkConfig) -> Result<Box<dyn Channel>, ChannelError> {
        if let Some(port) = &config.port {
            return Ok(Box::new(SerialChannel::new(port)));
        }

        let chooser = self
            .chooser
            .as_ref()
            .ok_or_else(|| ChannelError::DeviceUnavailable("no port configured".to_string()))?;

        let ports = list_ports()?;
        if ports.is_empty() {
            return Err(ChannelError::DeviceUnavailable(
                "no serial ports found".to_string(),
            ));
        }

        let port = chooser(&ports).ok_or(ChannelError::SelectionCancelled)?;
        Ok(Box::new(SerialChannel::new(&port)))
    }
}

/// Serial port channel
pub struct SerialChannel {
    port_name: String,
    stream: Option<SerialStream>,
    buffer_size: usize,
    info: String,
}

impl SerialChannel {
    /// Create an unopened channel for `port_name`
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            stream: None,
            buffer_size: 4096,
            info: port_name.to_string(),
        }
    }

    fn map_open_error(&self, e: &serialport::Error) -> ChannelError {
        match e.kind() {
            serialport::ErrorKind::NoDevice => ChannelError::DeviceUnavailable(self.port_name.clone()),
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                ChannelError::PermissionDenied(self.port_name.clone())
            }
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                ChannelError::DeviceUnavailable(self.port_name.clone())
            }
            _ => ChannelError::OpenRejected(e.to_string()),
        }
    }
}

#[async_trait]
impl Channel for SerialChannel {
    async fn open(&mut self, config: &LinkConfig) -> Result<(), ChannelError> {
        config.validate()?;

        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let stream = serialport::new(&self.port_name, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| self.map_open_error(&e))?;

        self.stream = Some(stream);
        self.buffer_size = config.buffer_size;
        self.info = format!("{} @ {}", self.port_name, config);
        tracing::info!("Opened {}", self.info);
        Ok(())
    }

    async fn discard_input(&mut self) -> Result<usize, ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::NotConnected)?;
        let pending = stream.bytes_to_read().unwrap_or(0) as usize;
        stream
            .clear(ClearBuffer::Input)
            .map_err(|e| ChannelError::Io(std::io::Error::other(e)))?;
        Ok(pending)
    }

    fn acquire(&mut self) -> Result<(Box<dyn ChannelReader>, Box<dyn ChannelWriter>), ChannelError> {
        let stream = self.stream.take().ok_or(ChannelError::NotConnected)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = SerialReader {
            half: read_half,
            buffer: vec![0u8; self.buffer_size],
        };
        let writer = SerialWriter { half: write_half };
        Ok((Box::new(reader), Box::new(writer)))
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        // The port closes once both halves are dropped
        self.stream = None;
        tracing::info!("Closed {}", self.port_name);
        Ok(())
    }

    fn describe(&self) -> String {
        self.info.clone()
    }
}

struct SerialReader {
    half: ReadHalf<SerialStream>,
    buffer: Vec<u8>,
}

#[async_trait]
impl ChannelReader for SerialReader {
    async fn read(&mut self) -> Result<Option<Bytes>, ChannelError> {
        match self.half.read(&mut self.buffer).await {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(Bytes::copy_from_slice(&self.buffer[..n]))),
            Err(e) => Err(e.into()),
        }
    }
}

struct SerialWriter {
    half: WriteHalf<SerialStream>,
}

#[async_trait]
impl ChannelWriter for SerialWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.half.write_all(data).await?;
        self.half.flush().await?;
        Ok(())
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<SerialPortInfo>, ChannelError> {
    serialport::available_ports().map_err(|e| ChannelError::Io(std::io::Error::other(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::{Error, ErrorKind};

    #[test]
    fn test_open_error_mapping() {
        let channel = SerialChannel::new("/dev/ttyUSB7");

        let missing = channel.map_open_error(&Error::new(ErrorKind::NoDevice, "gone"));
        assert!(matches!(missing, ChannelError::DeviceUnavailable(ref port) if port == "/dev/ttyUSB7"));

        let denied = Error::new(ErrorKind::Io(std::io::ErrorKind::PermissionDenied), "denied");
        assert!(matches!(channel.map_open_error(&denied), ChannelError::PermissionDenied(_)));

        let absent = Error::new(ErrorKind::Io(std::io::ErrorKind::NotFound), "no such file");
        assert!(matches!(channel.map_open_error(&absent), ChannelError::DeviceUnavailable(_)));

        let other = channel.map_open_error(&Error::new(ErrorKind::InvalidInput, "bad baud"));
        assert!(matches!(other, ChannelError::OpenRejected(ref msg) if msg.contains("bad baud")));
    }
}
