// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Shared compressor for the chunk header, value buckets and transitions.
//!
//! A compressed blob is framed as `varint(uncompressed_len) ++ compressed`,
//! so the decoder can size its output buffer up front. With
//! [`Compression::None`] the blob is the raw bytes with no framing.

use std::io::Write;

use prost::encoding::{decode_varint, encode_varint};

use crate::error::{ChunkResult, TracedChunkError};
use crate::options::Compression;

/// Accumulates uncompressed bytes and flushes them as one compressed blob.
///
/// One instance is reused for every blob of a chunk: reallocating compressor
/// working state per bucket costs more than the size hints it would enable.
pub struct Compressor {
    compression: Compression,
    buf: Vec<u8>,
}

impl Compressor {
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            buf: Vec::new(),
        }
    }

    /// The pending uncompressed bytes. Writing to this adds to the current
    /// blob.
    pub fn writer(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Uncompressed length accumulated so far.
    pub fn written(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Compresses the accumulated bytes into `dest` and resets for the next
    /// blob.
    pub fn encode_and_close(&mut self, dest: &mut Vec<u8>) -> ChunkResult<()> {
        match self.compression {
            Compression::None => dest.extend_from_slice(&self.buf),
            Compression::Zstd(level) => {
                encode_varint(self.buf.len() as u64, dest);
                let mut encoder = zstd::stream::Encoder::new(&mut *dest, level)
                    .map_err(TracedChunkError::compression)?;
                encoder
                    .write_all(&self.buf)
                    .map_err(TracedChunkError::compression)?;
                encoder.finish().map_err(TracedChunkError::compression)?;
            }
        }
        self.buf.clear();
        Ok(())
    }
}

/// Decompresses one blob produced by [`Compressor::encode_and_close`].
pub fn decompress(compression: Compression, mut blob: &[u8]) -> ChunkResult<Vec<u8>> {
    match compression {
        Compression::None => Ok(blob.to_vec()),
        Compression::Zstd(_) => {
            let uncompressed_len = decode_varint(&mut blob)?;
            let mut decoder =
                zstd::stream::Decoder::new(blob).map_err(TracedChunkError::compression)?;
            let mut out = Vec::with_capacity(uncompressed_len.min(1 << 30) as usize);
            std::io::copy(&mut decoder, &mut out).map_err(TracedChunkError::compression)?;
            if out.len() as u64 != uncompressed_len {
                return Err(TracedChunkError::corrupted(format!(
                    "blob decompressed to {} bytes, expected {}",
                    out.len(),
                    uncompressed_len
                )));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_zstd() {
        let mut compressor = Compressor::new(Compression::Zstd(3));
        compressor.writer().extend_from_slice(&[42u8; 10_000]);
        let mut blob = Vec::new();
        compressor.encode_and_close(&mut blob).unwrap();
        assert!(blob.len() < 100);
        assert_eq!(
            decompress(Compression::Zstd(3), &blob).unwrap(),
            vec![42u8; 10_000]
        );
        // The compressor is reusable afterwards.
        assert_eq!(compressor.written(), 0);
    }

    #[test]
    fn test_roundtrip_none() {
        let mut compressor = Compressor::new(Compression::None);
        compressor.writer().extend_from_slice(b"hello");
        let mut blob = Vec::new();
        compressor.encode_and_close(&mut blob).unwrap();
        assert_eq!(blob, b"hello");
        assert_eq!(decompress(Compression::None, &blob).unwrap(), b"hello");
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        let blob = [5u8, 1, 2, 3];
        assert!(decompress(Compression::Zstd(3), &blob).is_err());
    }
}
