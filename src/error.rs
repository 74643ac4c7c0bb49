// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace as StdBacktrace;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("chunk corrupted: {0}")]
    Corrupted(String),
    #[error("varint decode error: {0}")]
    ProstDecode(#[from] prost::DecodeError),
    #[error("encoder already failed")]
    AlreadyFailed,
}

/// [`ChunkError`] with backtrace.
#[derive(Error)]
#[error("{source:?}\n{backtrace}")]
pub struct TracedChunkError {
    source: ChunkError,
    backtrace: StdBacktrace,
}

impl std::fmt::Debug for TracedChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl From<ChunkError> for TracedChunkError {
    #[inline]
    fn from(source: ChunkError) -> TracedChunkError {
        TracedChunkError {
            source,
            backtrace: StdBacktrace::capture(),
        }
    }
}

impl From<prost::DecodeError> for TracedChunkError {
    #[inline]
    fn from(e: prost::DecodeError) -> TracedChunkError {
        ChunkError::ProstDecode(e).into()
    }
}

impl TracedChunkError {
    pub fn resource_exhausted(what: &'static str) -> Self {
        ChunkError::ResourceExhausted(what).into()
    }

    pub fn compression(message: impl ToString) -> Self {
        ChunkError::Compression(message.to_string()).into()
    }

    pub fn corrupted(message: impl ToString) -> Self {
        ChunkError::Corrupted(message.to_string()).into()
    }

    pub fn already_failed() -> Self {
        ChunkError::AlreadyFailed.into()
    }

    pub fn kind(&self) -> &ChunkError {
        &self.source
    }
}

pub type ChunkResult<T> = std::result::Result<T, TracedChunkError>;
