//! Hexadecimal codec

use super::{Codec, CodecError, CodecType};
use bytes::Bytes;
use std::fmt::Write;

/// Hex codec: uppercase pairs, one space between bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct HexCodec;

impl HexCodec {
    /// Create a new hex codec
    pub fn new() -> Self {
        Self
    }

    fn parse_token(token: &str) -> Option<u8> {
        if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u8::from_str_radix(token, 16).ok()
    }
}

impl Codec for HexCodec {
    fn encode(&self, data: &[u8]) -> String {
        let mut output = String::with_capacity(data.len() * 3);
        for (i, byte) in data.iter().enumerate() {
            if i > 0 {
                output.push(' ');
            }
            let _ = write!(output, "{byte:02X}");
        }
        output
    }

    /// Tokens are split on any whitespace. Every bad token is reported, and
    /// nothing is returned unless all of them parse.
    fn decode(&self, text: &str) -> Result<Bytes, CodecError> {
        let mut output = Vec::new();
        let mut invalid = Vec::new();

        for token in text.split_whitespace() {
            match Self::parse_token(token) {
                Some(byte) => output.push(byte),
                None => invalid.push(token.to_string()),
            }
        }

        if !invalid.is_empty() {
            return Err(CodecError::InvalidHexTokens(invalid));
        }
        if output.is_empty() {
            return Err(CodecError::Empty);
        }

        Ok(Bytes::from(output))
    }

    fn codec_type(&self) -> CodecType {
        CodecType::Hex
    }
}
