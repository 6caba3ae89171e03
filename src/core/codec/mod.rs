//! Byte codec
//!
//! Stateless conversions between raw bytes and the two operator views:
//! - Hex: two uppercase digits per byte, single-space separated
//! - Text: printable ASCII passes through, control bytes become glyphs

mod hex;
mod text;

pub use self::hex::HexCodec;
pub use text::{TextCodec, CR_GLYPH, LF_GLYPH, PLACEHOLDER_GLYPH, TAB_GLYPH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Codec type, doubling as the active log view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    /// Hexadecimal view
    #[default]
    Hex,
    /// Display-safe text view
    Text,
}

impl CodecType {
    /// Short name used in export filenames
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hex => "hex",
            Self::Text => "ascii",
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CodecType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hex" => Ok(Self::Hex),
            "text" | "ascii" => Ok(Self::Text),
            other => Err(format!("unknown view: {other}")),
        }
    }
}

/// Terminator appended to manual and scripted sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// Nothing appended
    None,
    /// Carriage return
    Cr,
    /// Line feed
    Lf,
    /// CR LF
    #[default]
    CrLf,
}

impl LineEnding {
    /// Terminator bytes
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Self::None => b"",
            Self::Cr => b"\r",
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }

    /// `data` followed by the terminator
    pub fn terminate(&self, data: &[u8]) -> Bytes {
        let mut out = Vec::with_capacity(data.len() + 2);
        out.extend_from_slice(data);
        out.extend_from_slice(self.bytes());
        Bytes::from(out)
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Cr => "cr",
            Self::Lf => "lf",
            Self::CrLf => "crlf",
        })
    }
}

impl std::str::FromStr for LineEnding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "cr" => Ok(Self::Cr),
            "lf" => Ok(Self::Lf),
            "crlf" => Ok(Self::CrLf),
            other => Err(format!("unknown line ending: {other}")),
        }
    }
}

/// Codec trait for data transformation
pub trait Codec: Send + Sync {
    /// Encode bytes to display string
    fn encode(&self, data: &[u8]) -> String;

    /// Decode operator input to bytes
    fn decode(&self, text: &str) -> Result<Bytes, CodecError>;

    /// Get codec type
    fn codec_type(&self) -> CodecType;
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// No hex tokens at all
    #[error("Invalid HEX input")]
    Empty,

    /// One or more tokens are not exactly two hex digits
    #[error("Invalid HEX pairs: {}", .0.join(", "))]
    InvalidHexTokens(Vec<String>),
}

/// Create a codec from type
pub fn create_codec(codec_type: CodecType) -> Box<dyn Codec> {
    match codec_type {
        CodecType::Hex => Box::new(HexCodec::new()),
        CodecType::Text => Box::new(TextCodec::new()),
    }
}

/// Canonical hex rendering of `data`
pub fn encode_hex(data: &[u8]) -> String {
    HexCodec::new().encode(data)
}

/// Strict, all-or-nothing hex parsing
pub fn decode_hex(text: &str) -> Result<Bytes, CodecError> {
    HexCodec::new().decode(text)
}

/// Display-safe text rendering of `data`
pub fn display_text(data: &[u8]) -> String {
    TextCodec::new().encode(data)
}
