use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::ConfigError;

/// Compresses a complete request body.
pub type EncodeFn = Arc<dyn Fn(&[u8]) -> io::Result<Vec<u8>> + Send + Sync>;

/// Decompresses a complete request body; the second argument caps the
/// decoded size and the decoder must fail once it would be exceeded.
pub type DecodeFn = Arc<dyn Fn(&[u8], usize) -> io::Result<Vec<u8>> + Send + Sync>;

/// Compression applied to outgoing client request bodies.
///
/// An empty string and `"none"` both parse to [`CompressionType::None`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Zstd,
    Deflate,
    Snappy,
    Lz4,
}

impl CompressionType {
    /// `Content-Encoding` token for this compression.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Deflate => "deflate",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
        }
    }

    #[must_use]
    pub const fn is_compressed(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            "deflate" => Ok(Self::Deflate),
            "snappy" => Ok(Self::Snappy),
            "lz4" => Ok(Self::Lz4),
            other => Err(ConfigError::UnsupportedCompression(other.to_owned())),
        }
    }
}

impl Serialize for CompressionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CompressionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Token -> codec lookup for request body encoding and decoding.
///
/// [`CodecRegistry::default`] carries the built-in codecs. Registering a
/// codec under an existing token replaces the built-in one.
#[derive(Clone)]
pub struct CodecRegistry {
    encoders: HashMap<String, EncodeFn>,
    decoders: HashMap<String, DecodeFn>,
}

impl CodecRegistry {
    /// Registry without any codec.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            encoders: HashMap::new(),
            decoders: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_encoder(mut self, token: impl Into<String>, encoder: EncodeFn) -> Self {
        self.encoders.insert(token.into(), encoder);
        self
    }

    #[must_use]
    pub fn with_decoder(mut self, token: impl Into<String>, decoder: DecodeFn) -> Self {
        self.decoders.insert(token.into(), decoder);
        self
    }

    #[must_use]
    pub fn encoder_for(&self, token: &str) -> Option<&EncodeFn> {
        self.encoders.get(token)
    }

    #[must_use]
    pub fn decoder_for(&self, token: &str) -> Option<&DecodeFn> {
        self.decoders.get(token)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::empty()
            .with_encoder("gzip", Arc::new(encode_gzip))
            .with_encoder("deflate", Arc::new(encode_deflate))
            .with_encoder("zstd", Arc::new(encode_zstd))
            .with_encoder("snappy", Arc::new(encode_snappy))
            .with_encoder("lz4", Arc::new(encode_lz4))
            .with_decoder("gzip", Arc::new(decode_gzip))
            .with_decoder("deflate", Arc::new(decode_deflate))
            .with_decoder("zlib", Arc::new(decode_deflate))
            .with_decoder("zstd", Arc::new(decode_zstd))
            .with_decoder("snappy", Arc::new(decode_snappy))
            .with_decoder("lz4", Arc::new(decode_lz4))
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut encoders: Vec<_> = self.encoders.keys().collect();
        let mut decoders: Vec<_> = self.decoders.keys().collect();
        encoders.sort();
        decoders.sort();
        f.debug_struct("CodecRegistry")
            .field("encoders", &encoders)
            .field("decoders", &decoders)
            .finish()
    }
}

fn encode_gzip(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut writer = GzEncoder::new(Vec::new(), Compression::default());
    writer.write_all(body)?;
    writer.finish()
}

fn encode_deflate(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut writer = ZlibEncoder::new(Vec::new(), Compression::default());
    writer.write_all(body)?;
    writer.finish()
}

fn encode_zstd(body: &[u8]) -> io::Result<Vec<u8>> {
    zstd::stream::encode_all(body, 0)
}

fn encode_snappy(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = snap::write::FrameEncoder::new(&mut out);
        writer.write_all(body)?;
        writer.flush()?;
    }
    Ok(out)
}

fn encode_lz4(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut writer = lz4_flex::frame::FrameEncoder::new(Vec::new());
    writer.write_all(body)?;
    writer.finish().map_err(io::Error::other)
}

fn decode_gzip(body: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(MultiGzDecoder::new(body), limit)
}

fn decode_deflate(body: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(ZlibDecoder::new(body), limit)
}

fn decode_zstd(body: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(zstd::stream::read::Decoder::new(body)?, limit)
}

fn decode_snappy(body: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(snap::read::FrameDecoder::new(body), limit)
}

fn decode_lz4(body: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(lz4_flex::frame::FrameDecoder::new(body), limit)
}

fn read_limited(reader: impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut out = Vec::new();
    reader.take(cap).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decoded body exceeds {limit} bytes"),
        ));
    }
    Ok(out)
}
