//! Text codec for display-safe rendering

use super::{Codec, CodecError, CodecType};
use bytes::Bytes;

/// Glyph shown for 0x0A
pub const LF_GLYPH: char = '␊';
/// Glyph shown for 0x0D
pub const CR_GLYPH: char = '␍';
/// Glyph shown for 0x09
pub const TAB_GLYPH: char = '␉';
/// Glyph shown for every other non-printable byte
pub const PLACEHOLDER_GLYPH: char = '·';

/// Text codec
///
/// Encoding maps one byte to exactly one `char`, so the rendering never
/// reflows the terminal. Decoding is the identity over UTF-8: literal
/// operator text is sent as typed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl TextCodec {
    /// Create a new text codec
    pub fn new() -> Self {
        Self
    }

    fn glyph(byte: u8) -> char {
        match byte {
            0x20..=0x7E => byte as char,
            b'\n' => LF_GLYPH,
            b'\r' => CR_GLYPH,
            b'\t' => TAB_GLYPH,
            _ => PLACEHOLDER_GLYPH,
        }
    }
}

impl Codec for TextCodec {
    fn encode(&self, data: &[u8]) -> String {
        data.iter().map(|&b| Self::glyph(b)).collect()
    }

    fn decode(&self, text: &str) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(text.as_bytes()))
    }

    fn codec_type(&self) -> CodecType {
        CodecType::Text
    }
}
