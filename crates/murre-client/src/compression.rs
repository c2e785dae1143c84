//! Payload compression codecs.
//!
//! The producer compresses whole payloads (or whole batches) before chunking
//! and encryption; the uncompressed size travels in the message metadata so
//! the consumer side can size its decompression buffer up front.

use std::io::{Read, Write};

use bytes::Bytes;
use murre_protocol::WireCompression;

use crate::config::CompressionType;
use crate::error::{Error, Result};

/// A payload codec. Stateless; the provider hands out shared instances.
pub trait CompressionCodec: Send + Sync {
    fn compression_type(&self) -> CompressionType;

    fn encode(&self, raw: &[u8]) -> Result<Bytes>;

    /// `uncompressed_size` comes from message metadata.
    fn decode(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Bytes>;
}

/// Codec lookup by configured compression type.
pub fn codec_for(kind: CompressionType) -> &'static dyn CompressionCodec {
    match kind {
        CompressionType::None => &NoneCodec,
        CompressionType::Lz4 => &Lz4Codec,
        CompressionType::Zlib => &ZlibCodec,
        CompressionType::Zstd => &ZstdCodec,
        CompressionType::Snappy => &SnappyCodec,
    }
}

/// The wire tag recorded in message metadata for a configured codec.
pub fn wire_compression(kind: CompressionType) -> WireCompression {
    match kind {
        CompressionType::None => WireCompression::None,
        CompressionType::Lz4 => WireCompression::Lz4,
        CompressionType::Zlib => WireCompression::Zlib,
        CompressionType::Zstd => WireCompression::Zstd,
        CompressionType::Snappy => WireCompression::Snappy,
    }
}

struct NoneCodec;

impl CompressionCodec for NoneCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn encode(&self, raw: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(raw))
    }

    fn decode(&self, compressed: &[u8], _uncompressed_size: usize) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(compressed))
    }
}

struct Lz4Codec;

impl CompressionCodec for Lz4Codec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn encode(&self, raw: &[u8]) -> Result<Bytes> {
        Ok(Bytes::from(lz4_flex::block::compress(raw)))
    }

    fn decode(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Bytes> {
        lz4_flex::block::decompress(compressed, uncompressed_size)
            .map(Bytes::from)
            .map_err(|e| Error::Protocol(format!("lz4 decompression failed: {e}")))
    }
}

struct ZlibCodec;

impl CompressionCodec for ZlibCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zlib
    }

    fn encode(&self, raw: &[u8]) -> Result<Bytes> {
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(raw).map_err(|e| Error::Io(e.to_string()))?;
        encoder.finish().map(Bytes::from).map_err(|e| Error::Io(e.to_string()))
    }

    fn decode(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Bytes> {
        let mut out = Vec::with_capacity(uncompressed_size);
        flate2::read::ZlibDecoder::new(compressed)
            .read_to_end(&mut out)
            .map_err(|e| Error::Protocol(format!("zlib decompression failed: {e}")))?;
        Ok(Bytes::from(out))
    }
}

struct ZstdCodec;

impl CompressionCodec for ZstdCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn encode(&self, raw: &[u8]) -> Result<Bytes> {
        zstd::bulk::compress(raw, 0).map(Bytes::from).map_err(|e| Error::Io(e.to_string()))
    }

    fn decode(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Bytes> {
        zstd::bulk::decompress(compressed, uncompressed_size)
            .map(Bytes::from)
            .map_err(|e| Error::Protocol(format!("zstd decompression failed: {e}")))
    }
}

struct SnappyCodec;

impl CompressionCodec for SnappyCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Snappy
    }

    fn encode(&self, raw: &[u8]) -> Result<Bytes> {
        snap::raw::Encoder::new()
            .compress_vec(raw)
            .map(Bytes::from)
            .map_err(|e| Error::Io(e.to_string()))
    }

    fn decode(&self, compressed: &[u8], _uncompressed_size: usize) -> Result<Bytes> {
        snap::raw::Decoder::new()
            .decompress_vec(compressed)
            .map(Bytes::from)
            .map_err(|e| Error::Protocol(format!("snappy decompression failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] =
        b"a highly repetitive payload a highly repetitive payload a highly repetitive payload";

    #[test]
    fn all_codecs_roundtrip() {
        for kind in [
            CompressionType::None,
            CompressionType::Lz4,
            CompressionType::Zlib,
            CompressionType::Zstd,
            CompressionType::Snappy,
        ] {
            let codec = codec_for(kind);
            assert_eq!(codec.compression_type(), kind);
            let encoded = codec.encode(SAMPLE).unwrap();
            let decoded = codec.decode(&encoded, SAMPLE.len()).unwrap();
            assert_eq!(&decoded[..], SAMPLE, "roundtrip failed for {kind:?}");
        }
    }

    #[test]
    fn compressing_codecs_shrink_repetitive_input() {
        for kind in [CompressionType::Lz4, CompressionType::Zlib, CompressionType::Zstd, CompressionType::Snappy]
        {
            let encoded = codec_for(kind).encode(SAMPLE).unwrap();
            assert!(encoded.len() < SAMPLE.len(), "{kind:?} did not compress");
        }
    }

    #[test]
    fn corrupt_input_is_rejected() {
        let garbage = [0xde, 0xad, 0xbe, 0xef];
        assert!(codec_for(CompressionType::Lz4).decode(&garbage, 100).is_err());
        assert!(codec_for(CompressionType::Zlib).decode(&garbage, 100).is_err());
    }
}
