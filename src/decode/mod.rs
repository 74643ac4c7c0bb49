// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! The transposed chunk decoder.
//!
//! Reconstructs the exact bytes of every record. The tag stream was emitted
//! in reverse ingestion order while value buffers were written backward, so
//! the decoder walks the state machine forward through the transition
//! stream, reads every buffer front to back, and builds records back to
//! front: each visited state contributes one byte chunk, and a completed
//! record is its chunks in reverse. Records come out last-first and are
//! reversed at the end.

use bytes::{Buf, Bytes};
use itertools::Itertools;
use prost::encoding::{decode_varint, encode_varint};

use crate::compress::decompress;
use crate::error::{ChunkResult, TracedChunkError};
use crate::options::Compression;
use crate::wire::{has_subtype, MessageId, Subtype, WireType, MAX_VARINT_INLINE};

/// What the decoder does when it visits a state.
#[derive(Clone, Copy, Debug)]
enum StateKind {
    NoOp,
    NonProto { buffer: usize },
    StartOfMessage,
    StartOfSubmessage,
    EndOfSubmessage { tag: u32 },
    VarintInline { tag: u32, value: u8 },
    VarintBuffered { tag: u32, len: usize, buffer: usize },
    Fixed { tag: u32, len: usize, buffer: usize },
    String { tag: u32, buffer: usize },
    Group { tag: u32 },
}

#[derive(Clone, Copy)]
struct State {
    kind: StateKind,
    /// Transition offsets from this state target `base + offset`.
    base: u32,
    /// The single outgoing transition is taken without consuming stream
    /// bytes; its destination is the state at `base`.
    implicit: bool,
}

/// Decodes chunks produced by [`TransposeEncoder`](crate::TransposeEncoder).
pub struct TransposeDecoder {
    states: Vec<State>,
    buffers: Vec<Bytes>,
    transitions: Bytes,
    first_state: usize,
}

impl TransposeDecoder {
    /// Decodes `num_records` records from a chunk. The record count travels
    /// in the outer container's chunk header.
    pub fn decode(chunk: &[u8], num_records: u64) -> ChunkResult<Vec<Vec<u8>>> {
        let mut decoder = Self::parse(chunk)?;
        decoder.read_records(num_records)
    }

    fn parse(chunk: &[u8]) -> ChunkResult<Self> {
        let (&type_byte, mut rest) = chunk
            .split_first()
            .ok_or_else(|| TracedChunkError::corrupted("empty chunk"))?;
        let compression = match type_byte {
            0 => Compression::None,
            b'z' => Compression::Zstd(0),
            _ => {
                return Err(TracedChunkError::corrupted(format!(
                    "unknown compression type {}",
                    type_byte
                )))
            }
        };
        let header_len = decode_varint(&mut rest)? as usize;
        if header_len > rest.len() {
            return Err(TracedChunkError::corrupted("header length out of range"));
        }
        let (header_blob, data) = rest.split_at(header_len);
        let header = decompress(compression, header_blob)?;
        let mut header = &header[..];

        let num_buckets = read_count(&mut header, "bucket")?;
        let num_buffers = read_count(&mut header, "buffer")?;
        let bucket_lengths: Vec<u64> = (0..num_buckets)
            .map(|_| decode_varint(&mut header))
            .try_collect()?;
        let buffer_lengths: Vec<u64> = (0..num_buffers)
            .map(|_| decode_varint(&mut header))
            .try_collect()?;

        let num_states = read_count(&mut header, "state")?;
        let descriptors: Vec<u64> = (0..num_states)
            .map(|_| decode_varint(&mut header))
            .try_collect()?;
        let bases: Vec<u64> = (0..num_states)
            .map(|_| decode_varint(&mut header))
            .try_collect()?;

        // Side tables: subtype bytes for the states that carry one, then
        // buffer indices for the states that reference a value buffer.
        let num_subtypes = descriptors
            .iter()
            .filter(|&&d| is_plain_tag(d) && has_subtype(d as u32))
            .count();
        if num_subtypes > header.len() {
            return Err(TracedChunkError::corrupted("subtype table out of range"));
        }
        let (subtype_table, mut header) = header.split_at(num_subtypes);
        let mut subtypes = subtype_table.iter().copied();

        let next_buffer_index = |header: &mut &[u8]| -> ChunkResult<usize> {
            let index = decode_varint(header)? as usize;
            if index >= num_buffers {
                return Err(TracedChunkError::corrupted("buffer index out of range"));
            }
            Ok(index)
        };

        let mut states = Vec::with_capacity(num_states);
        for &descriptor in &descriptors {
            let kind = if descriptor == MessageId::NO_OP.0 {
                StateKind::NoOp
            } else if descriptor == MessageId::NON_PROTO.0 {
                StateKind::NonProto {
                    buffer: next_buffer_index(&mut header)?,
                }
            } else if descriptor == MessageId::START_OF_MESSAGE.0 {
                StateKind::StartOfMessage
            } else if descriptor == MessageId::START_OF_SUBMESSAGE.0 {
                StateKind::StartOfSubmessage
            } else if descriptor < 8 {
                return Err(TracedChunkError::corrupted(format!(
                    "invalid tag descriptor {}",
                    descriptor
                )));
            } else {
                let tag = u32::try_from(descriptor).map_err(|_| {
                    TracedChunkError::corrupted("tag descriptor out of range")
                })?;
                match tag & 7 {
                    w if w == WireType::Submessage as u32 => StateKind::EndOfSubmessage {
                        tag: tag
                            - (WireType::Submessage as u32 - WireType::LengthDelimited as u32),
                    },
                    w if w == WireType::Varint as u32 => {
                        let subtype = Subtype(subtypes.next().ok_or_else(|| {
                            TracedChunkError::corrupted("subtype table too short")
                        })?);
                        if subtype <= Subtype(MAX_VARINT_INLINE) {
                            StateKind::VarintInline {
                                tag,
                                value: subtype.0,
                            }
                        } else if subtype <= Subtype::varint_bytes(10) {
                            StateKind::VarintBuffered {
                                tag,
                                len: (subtype.0 - Subtype::VARINT_1.0) as usize + 1,
                                buffer: next_buffer_index(&mut header)?,
                            }
                        } else {
                            return Err(TracedChunkError::corrupted(format!(
                                "invalid varint subtype {}",
                                subtype.0
                            )));
                        }
                    }
                    w if w == WireType::Fixed64 as u32 => StateKind::Fixed {
                        tag,
                        len: 8,
                        buffer: next_buffer_index(&mut header)?,
                    },
                    w if w == WireType::Fixed32 as u32 => StateKind::Fixed {
                        tag,
                        len: 4,
                        buffer: next_buffer_index(&mut header)?,
                    },
                    w if w == WireType::LengthDelimited as u32 => {
                        let subtype = Subtype(subtypes.next().ok_or_else(|| {
                            TracedChunkError::corrupted("subtype table too short")
                        })?);
                        if subtype != Subtype::LENGTH_DELIMITED_STRING {
                            return Err(TracedChunkError::corrupted(format!(
                                "invalid string subtype {}",
                                subtype.0
                            )));
                        }
                        StateKind::String {
                            tag,
                            buffer: next_buffer_index(&mut header)?,
                        }
                    }
                    w if w == WireType::StartGroup as u32
                        || w == WireType::EndGroup as u32 =>
                    {
                        StateKind::Group { tag }
                    }
                    _ => {
                        return Err(TracedChunkError::corrupted(format!(
                            "invalid wire type in descriptor {}",
                            descriptor
                        )))
                    }
                }
            };
            states.push(State {
                kind,
                base: 0,
                implicit: false,
            });
        }
        for (state, &base) in states.iter_mut().zip(&bases) {
            let implicit = base >= num_states as u64;
            let base = if implicit {
                base - num_states as u64
            } else {
                base
            };
            if base >= num_states as u64 {
                return Err(TracedChunkError::corrupted("state base out of range"));
            }
            state.base = base as u32;
            state.implicit = implicit;
        }

        let first_state = decode_varint(&mut header)? as usize;
        if first_state >= num_states {
            return Err(TracedChunkError::corrupted("first state out of range"));
        }

        // Decompress buckets and slice the concatenation into buffers.
        let mut data = data;
        let mut buffer_bytes = Vec::new();
        for &length in &bucket_lengths {
            let length = length as usize;
            if length > data.len() {
                return Err(TracedChunkError::corrupted("bucket length out of range"));
            }
            let (bucket, rest) = data.split_at(length);
            data = rest;
            buffer_bytes.append(&mut decompress(compression, bucket)?);
        }
        if buffer_lengths.iter().sum::<u64>() != buffer_bytes.len() as u64 {
            return Err(TracedChunkError::corrupted(
                "buffer lengths do not add up to bucket contents",
            ));
        }
        let buffer_bytes = Bytes::from(buffer_bytes);
        let mut offset = 0usize;
        let buffers: Vec<Bytes> = buffer_lengths
            .iter()
            .map(|&length| {
                let slice = buffer_bytes.slice(offset..offset + length as usize);
                offset += length as usize;
                slice
            })
            .collect();

        let transitions = Bytes::from(decompress(compression, data)?);

        Ok(Self {
            states,
            buffers,
            transitions,
            first_state,
        })
    }

    fn read_buffer(&mut self, index: usize, len: usize) -> ChunkResult<Bytes> {
        let buffer = &mut self.buffers[index];
        if buffer.remaining() < len {
            return Err(TracedChunkError::corrupted("value buffer exhausted"));
        }
        Ok(buffer.split_to(len))
    }

    fn read_records(&mut self, num_records: u64) -> ChunkResult<Vec<Vec<u8>>> {
        let mut records: Vec<Vec<u8>> = Vec::new();
        if num_records == 0 {
            return Ok(records);
        }

        let mut pos = self.first_state;
        // Chunks of the record being reconstructed, back to front.
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut chunks_len = 0usize;
        // (tag, record size) pushed at every end-of-submessage marker.
        let mut submessage_stack: Vec<(u32, usize)> = Vec::new();
        let mut pending_zeros = 0u8;
        // A malformed chunk could drive the walk in circles; a valid one
        // cannot visit more than a bounded number of states per consumed
        // transition offset.
        let num_states = self.states.len() as u64;
        let step_limit = (4 * self.transitions.len() as u64 + 2 + num_records)
            .saturating_mul(num_states + 2)
            .saturating_add(16);
        let mut steps = 0u64;

        loop {
            steps += 1;
            if steps > step_limit {
                return Err(TracedChunkError::corrupted("transition walk does not end"));
            }
            let state = self.states[pos];
            match state.kind {
                StateKind::NoOp => {}
                StateKind::StartOfMessage => {
                    if !submessage_stack.is_empty() {
                        return Err(TracedChunkError::corrupted(
                            "record ends inside a submessage",
                        ));
                    }
                    let mut record = Vec::with_capacity(chunks_len);
                    for chunk in chunks.drain(..).rev() {
                        record.extend_from_slice(&chunk);
                    }
                    chunks_len = 0;
                    records.push(record);
                }
                StateKind::NonProto { buffer } => {
                    if !chunks.is_empty() || !submessage_stack.is_empty() {
                        return Err(TracedChunkError::corrupted(
                            "non-proto record inside a message",
                        ));
                    }
                    // Record lengths live in the dedicated last buffer.
                    let lengths = self
                        .buffers
                        .last_mut()
                        .ok_or_else(|| TracedChunkError::corrupted("no length buffer"))?;
                    let length = decode_varint(lengths)? as usize;
                    let bytes = self.read_buffer(buffer, length)?;
                    records.push(bytes.to_vec());
                }
                StateKind::StartOfSubmessage => {
                    let (tag, size_at_end) = submessage_stack.pop().ok_or_else(|| {
                        TracedChunkError::corrupted("submessage start without end")
                    })?;
                    let mut chunk = Vec::with_capacity(10);
                    encode_varint(tag as u64, &mut chunk);
                    encode_varint((chunks_len - size_at_end) as u64, &mut chunk);
                    chunks_len += chunk.len();
                    chunks.push(chunk);
                }
                StateKind::EndOfSubmessage { tag } => {
                    submessage_stack.push((tag, chunks_len));
                }
                StateKind::VarintInline { tag, value } => {
                    let mut chunk = Vec::with_capacity(6);
                    encode_varint(tag as u64, &mut chunk);
                    chunk.push(value);
                    chunks_len += chunk.len();
                    chunks.push(chunk);
                }
                StateKind::VarintBuffered { tag, len, buffer } => {
                    let bytes = self.read_buffer(buffer, len)?;
                    let mut chunk = Vec::with_capacity(5 + len);
                    encode_varint(tag as u64, &mut chunk);
                    // Restore the continuation bits.
                    for (i, &byte) in bytes.iter().enumerate() {
                        chunk.push(if i + 1 < len { byte | 0x80 } else { byte });
                    }
                    chunks_len += chunk.len();
                    chunks.push(chunk);
                }
                StateKind::Fixed { tag, len, buffer } => {
                    let bytes = self.read_buffer(buffer, len)?;
                    let mut chunk = Vec::with_capacity(5 + len);
                    encode_varint(tag as u64, &mut chunk);
                    chunk.extend_from_slice(&bytes);
                    chunks_len += chunk.len();
                    chunks.push(chunk);
                }
                StateKind::String { tag, buffer } => {
                    // The buffer holds the original length prefix followed
                    // by the payload; copy both verbatim.
                    let before = self.buffers[buffer].clone();
                    let length = decode_varint(&mut self.buffers[buffer])? as usize;
                    let varint_len = before.remaining() - self.buffers[buffer].remaining();
                    if self.buffers[buffer].remaining() < length {
                        return Err(TracedChunkError::corrupted("string buffer exhausted"));
                    }
                    self.buffers[buffer].advance(length);
                    let mut chunk = Vec::with_capacity(5 + varint_len + length);
                    encode_varint(tag as u64, &mut chunk);
                    chunk.extend_from_slice(&before[..varint_len + length]);
                    chunks_len += chunk.len();
                    chunks.push(chunk);
                }
                StateKind::Group { tag } => {
                    let mut chunk = Vec::with_capacity(5);
                    encode_varint(tag as u64, &mut chunk);
                    chunks_len += chunk.len();
                    chunks.push(chunk);
                }
            }
            if records.len() as u64 == num_records {
                break;
            }

            pos = if state.implicit {
                state.base as usize
            } else {
                let offset = if pending_zeros > 0 {
                    pending_zeros -= 1;
                    0
                } else {
                    if !self.transitions.has_remaining() {
                        return Err(TracedChunkError::corrupted(
                            "transition stream ends before the last record",
                        ));
                    }
                    let byte = self.transitions.get_u8();
                    pending_zeros = byte & 3;
                    byte >> 2
                };
                let next = state.base as u64 + offset as u64;
                if next >= num_states {
                    return Err(TracedChunkError::corrupted("transition target out of range"));
                }
                next as usize
            };
        }

        if !chunks.is_empty() {
            return Err(TracedChunkError::corrupted("partial record left over"));
        }
        records.reverse();
        Ok(records)
    }
}

fn is_plain_tag(descriptor: u64) -> bool {
    // Reserved ids and the submessage wire type carry no subtype byte.
    descriptor >= 8
        && u32::try_from(descriptor).is_ok()
        && (descriptor as u32) & 7 != WireType::Submessage as u32
}

fn read_count(header: &mut &[u8], what: &str) -> ChunkResult<usize> {
    let count = decode_varint(header)? as usize;
    // Every counted element takes at least one header byte, which bounds
    // counts on corrupted input before anything is allocated.
    if count > header.len() {
        return Err(TracedChunkError::corrupted(format!(
            "{} count larger than the header",
            what
        )));
    }
    Ok(count)
}
