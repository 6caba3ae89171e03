//! Packet abstraction
//!
//! A packet is the unit handed to the log aggregator: one or more chunks
//! regrouped by the receive pipeline, or one write from a send path.

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Packet direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketDirection {
    /// Received from device
    Rx,
    /// Sent to device
    Tx,
}

impl PacketDirection {
    /// Label used in both views and the export artifact
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rx => "RX",
            Self::Tx => "TX",
        }
    }
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An immutable, never-empty run of bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    direction: PacketDirection,
    timestamp: DateTime<Local>,
    data: Bytes,
}

impl Packet {
    /// Create a packet stamped now. Returns `None` for empty data.
    pub fn new(direction: PacketDirection, data: Bytes) -> Option<Self> {
        Self::at(direction, data, Local::now())
    }

    /// Create a packet with an explicit timestamp
    pub fn at(direction: PacketDirection, data: Bytes, timestamp: DateTime<Local>) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        Some(Self {
            direction,
            timestamp,
            data,
        })
    }

    /// Create RX packet
    pub fn rx(data: impl Into<Bytes>) -> Option<Self> {
        Self::new(PacketDirection::Rx, data.into())
    }

    /// Create TX packet
    pub fn tx(data: impl Into<Bytes>) -> Option<Self> {
        Self::new(PacketDirection::Tx, data.into())
    }

    /// Direction
    pub fn direction(&self) -> PacketDirection {
        self.direction
    }

    /// Timestamp of arrival (RX) or write (TX)
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Payload
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Payload length, always > 0
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_packet_rejected() {
        assert!(Packet::rx(Bytes::new()).is_none());
        assert!(Packet::tx(Vec::<u8>::new()).is_none());
    }

    #[test]
    fn test_packet_accessors() {
        let packet = Packet::tx(&b"AT\r\n"[..]).unwrap();
        assert_eq!(packet.direction(), PacketDirection::Tx);
        assert_eq!(packet.len(), 4);
        assert_eq!(packet.direction().to_string(), "TX");
    }
}
