//! Record Compression
//!
//! The low 7 bits of a record's version tag name the codec its payload was
//! written with. Bit 7 is the external-stream flag and is masked off here.

use std::io::{self, Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};

use super::EXTERNAL_STREAM_FLAG;

/// Codec of a stored payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// gzip stream
    Gzip,
    /// zlib (deflate) stream
    #[default]
    Deflate,
    /// stored as-is
    None,
}

impl Compression {
    /// Version tag stored in the record header
    pub const fn tag(self) -> u8 {
        match self {
            Compression::Gzip => 1,
            Compression::Deflate => 2,
            Compression::None => 3,
        }
    }

    /// Codec for a version tag, ignoring the external-stream flag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag & !EXTERNAL_STREAM_FLAG {
            1 => Some(Compression::Gzip),
            2 => Some(Compression::Deflate),
            3 => Some(Compression::None),
            _ => None,
        }
    }

    /// Parse a codec name as accepted on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gzip" => Some(Compression::Gzip),
            "deflate" | "zlib" => Some(Compression::Deflate),
            "none" => Some(Compression::None),
            _ => None,
        }
    }

    /// Encode a whole payload
    pub fn encode(self, payload: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(payload)?;
                encoder.finish()
            }
            Compression::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(payload)?;
                encoder.finish()
            }
            Compression::None => Ok(payload.to_vec()),
        }
    }

    /// Wrap an encoded stream in a decoding reader
    pub fn decoder<'a, R: Read + Send + 'a>(self, encoded: R) -> Box<dyn Read + Send + 'a> {
        match self {
            Compression::Gzip => Box::new(GzDecoder::new(encoded)),
            Compression::Deflate => Box::new(ZlibDecoder::new(encoded)),
            Compression::None => Box::new(encoded),
        }
    }
}
