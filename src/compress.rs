//! Module implement pluggable block compression.
//!
//! Commit log blocks are compressed using one of the [BlockCodec]
//! implementations, identified on disk by [CompressionType].

use std::{convert::TryFrom, fmt, io::Read, result, str::FromStr};

use crate::{Error, Result};

/// Compression type codes are persisted in block headers, codes at and
/// beyond this limit are invalid.
pub const COMPRESSION_TYPE_LIMIT: u8 = 8;

/// Default compression level used by zstd codec.
pub const ZSTD_LEVEL: i32 = 3;
/// Default compression level used by lzma codec.
pub const LZMA_LEVEL: u32 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionType {
    None = 0,
    Zlib = 2,
    Zstd = 6,
    Lzma = 7,
}

impl TryFrom<u8> for CompressionType {
    type Error = Error;

    fn try_from(val: u8) -> Result<CompressionType> {
        match val {
            0 => Ok(CompressionType::None),
            2 => Ok(CompressionType::Zlib),
            6 => Ok(CompressionType::Zstd),
            7 => Ok(CompressionType::Lzma),
            val if val < COMPRESSION_TYPE_LIMIT => {
                err_at!(UnsupportedType, msg: "compression type {}", val)
            }
            val => err_at!(BadHeader, msg: "invalid compression type {}", val),
        }
    }
}

impl FromStr for CompressionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<CompressionType> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "zlib" => Ok(CompressionType::Zlib),
            "zstd" => Ok(CompressionType::Zstd),
            "lzma" => Ok(CompressionType::Lzma),
            _ => err_at!(UnsupportedType, msg: "compressor {:?}", s),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self {
            CompressionType::None => write!(f, "none"),
            CompressionType::Zlib => write!(f, "zlib"),
            CompressionType::Zstd => write!(f, "zstd"),
            CompressionType::Lzma => write!(f, "lzma"),
        }
    }
}

/// Trait to be implemented by block compression codecs.
pub trait BlockCodec: Send + Sync {
    fn to_type(&self) -> CompressionType;

    /// Compress `input` into a new buffer.
    fn deflate(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `input`, `data_length` is the expected uncompressed length.
    fn inflate(&self, input: &[u8], data_length: usize) -> Result<Vec<u8>>;
}

/// Create a codec for compression type `typ`.
pub fn create_block_codec(typ: CompressionType) -> Box<dyn BlockCodec> {
    match typ {
        CompressionType::None => Box::new(NoneCodec),
        CompressionType::Zlib => Box::new(ZlibCodec),
        CompressionType::Zstd => Box::new(ZstdCodec { level: ZSTD_LEVEL }),
        CompressionType::Lzma => Box::new(LzmaCodec { level: LZMA_LEVEL }),
    }
}

fn check_length(typ: CompressionType, data: Vec<u8>, want: usize) -> Result<Vec<u8>> {
    if data.len() == want {
        Ok(data)
    } else {
        err_at!(InflateFail, msg: "{} inflated {} bytes, want {}", typ, data.len(), want)
    }
}

struct NoneCodec;

impl BlockCodec for NoneCodec {
    fn to_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn deflate(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn inflate(&self, input: &[u8], data_length: usize) -> Result<Vec<u8>> {
        check_length(self.to_type(), input.to_vec(), data_length)
    }
}

struct ZlibCodec;

impl BlockCodec for ZlibCodec {
    fn to_type(&self) -> CompressionType {
        CompressionType::Zlib
    }

    fn deflate(&self, input: &[u8]) -> Result<Vec<u8>> {
        use flate2::{read::ZlibEncoder, Compression};

        let mut output = vec![];
        let mut encoder = ZlibEncoder::new(input, Compression::default());
        err_at!(DeflateFail, encoder.read_to_end(&mut output))?;
        Ok(output)
    }

    fn inflate(&self, input: &[u8], data_length: usize) -> Result<Vec<u8>> {
        use flate2::read::ZlibDecoder;

        let mut output = Vec::with_capacity(data_length);
        let mut decoder = ZlibDecoder::new(input);
        err_at!(InflateFail, decoder.read_to_end(&mut output))?;
        check_length(self.to_type(), output, data_length)
    }
}

struct ZstdCodec {
    level: i32,
}

impl BlockCodec for ZstdCodec {
    fn to_type(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn deflate(&self, input: &[u8]) -> Result<Vec<u8>> {
        err_at!(DeflateFail, zstd::stream::encode_all(input, self.level))
    }

    fn inflate(&self, input: &[u8], data_length: usize) -> Result<Vec<u8>> {
        let output = err_at!(InflateFail, zstd::stream::decode_all(input))?;
        check_length(self.to_type(), output, data_length)
    }
}

struct LzmaCodec {
    level: u32,
}

impl BlockCodec for LzmaCodec {
    fn to_type(&self) -> CompressionType {
        CompressionType::Lzma
    }

    fn deflate(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = vec![];
        let mut encoder = xz2::read::XzEncoder::new(input, self.level);
        err_at!(DeflateFail, encoder.read_to_end(&mut output))?;
        Ok(output)
    }

    fn inflate(&self, input: &[u8], data_length: usize) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(data_length);
        let mut decoder = xz2::read::XzDecoder::new(input);
        err_at!(InflateFail, decoder.read_to_end(&mut output))?;
        check_length(self.to_type(), output, data_length)
    }
}

#[cfg(test)]
#[path = "compress_test.rs"]
mod compress_test;
