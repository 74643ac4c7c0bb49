// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Transposed chunk encoding for record-oriented container files.
//!
//! A chunk holds a batch of records, each either a canonically encoded
//! protobuf message or an opaque byte string. [`TransposeEncoder`] breaks the
//! protobuf records into per-field columns so that similar values compress
//! together, and encodes the structure (the sequence of field tags) as a
//! compact state machine whose transitions cost a few bits each.
//! [`TransposeDecoder`] reconstructs the exact original bytes of every
//! record.

#![deny(unused_must_use)]

mod compress;
mod decode;
mod encode;
mod error;
mod options;
mod wire;


pub use decode::TransposeDecoder;
pub use encode::{EncodedChunk, TransposeEncoder, MAX_RECORDS};
pub use error::{ChunkError, ChunkResult, TracedChunkError};
pub use options::{Compression, EncoderOptions};
