// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! The transposed chunk encoder.
//!
//! Chunk layout (varint encoded unless noted otherwise):
//!
//! ```plain
//! | compression type (1B)
//! | compressed header length
//! | compressed header:
//! |   | number of buckets | number of buffers
//! |   | bucket sizes (compressed) | buffer lengths (uncompressed)
//! |   | number of states
//! |   | per-state tag descriptors | per-state base indices
//! |   | subtype bytes | buffer indices       (for the states they apply to)
//! |   | initial state index
//! | buckets: concatenated value buffers, compressed per bucket
//! | transitions (compressed)
//! ```

mod bucket;
mod buffer;
mod header;
mod state_machine;
mod transition;

use std::collections::HashMap;

use prost::encoding::encode_varint;
use smallvec::SmallVec;

use self::buffer::{BackwardBuffer, BufferKind, BufferWithMeta, NUM_BUFFER_KINDS};
use self::state_machine::{build_state_machine, EncodedTagInfo, INVALID_POS};
use crate::compress::Compressor;
use crate::error::{ChunkResult, TracedChunkError};
use crate::options::{Compression, EncoderOptions};
use crate::wire::{
    is_proto_message, MessageId, NodeId, SliceReader, Subtype, WireType, MAX_RECURSION_DEPTH,
    MAX_VARINT_INLINE,
};

/// Maximum number of records per chunk: the outer container stores record
/// counts in 56 bits.
pub const MAX_RECORDS: u64 = (1 << 56) - 1;

/// Transitions are encoded as offsets `0..=MAX_TRANSITION`.
const MAX_TRANSITION: u32 = 63;

/// Minimum number of `a -> b` transitions for `b` to get a state in `a`'s
/// private list.
const MIN_COUNT_FOR_STATE: u64 = 10;

/// A finished chunk together with the numbers the outer container records.
pub struct EncodedChunk {
    pub data: Vec<u8>,
    pub num_records: u64,
    pub decoded_data_size: u64,
}

/// One node of the inferred tag tree.
struct MessageNode {
    /// Message id handed to fields nested under this node.
    message_id: MessageId,
    /// The node's value buffer, assigned on first write. Kind and index into
    /// the encoder's per-kind buffer lists.
    buffer: Option<(BufferKind, usize)>,
    /// Encoded-tag index per subtype.
    encoded_tag_pos: SmallVec<[u32; 4]>,
}

impl MessageNode {
    fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            buffer: None,
            encoded_tag_pos: SmallVec::new(),
        }
    }
}

/// Encodes a batch of records into one transposed chunk.
///
/// Records may be arbitrary bytes: anything that is not a canonically
/// encoded protobuf message is stored separately as an opaque string and
/// reproduced exactly.
pub struct TransposeEncoder {
    compression: Compression,
    bucket_size: u64,
    num_records: u64,
    decoded_data_size: u64,
    compressor: Compressor,
    /// All distinct encoded tags, in interning order.
    tags_list: Vec<EncodedTagInfo>,
    /// The record stream flattened to encoded-tag indices, in ingestion
    /// order. Consumed in reverse when transitions are emitted.
    encoded_tags: Vec<u32>,
    /// Value buffers grouped by kind.
    data: [Vec<BufferWithMeta>; NUM_BUFFER_KINDS],
    /// Open groups; every group start pushes the current message id.
    group_stack: SmallVec<[MessageId; 8]>,
    message_nodes: HashMap<NodeId, MessageNode>,
    nonproto_lengths: BackwardBuffer,
    next_message_id: MessageId,
    healthy: bool,
}

impl TransposeEncoder {
    pub fn new(options: EncoderOptions) -> Self {
        let bucket_size = match options.compression {
            // Without compression, buckets buy nothing.
            Compression::None => u64::MAX,
            _ => options.bucket_size,
        };
        Self {
            compression: options.compression,
            bucket_size,
            num_records: 0,
            decoded_data_size: 0,
            compressor: Compressor::new(options.compression),
            tags_list: Vec::new(),
            encoded_tags: Vec::new(),
            data: Default::default(),
            group_stack: SmallVec::new(),
            message_nodes: HashMap::new(),
            nonproto_lengths: BackwardBuffer::default(),
            next_message_id: MessageId::ROOT.next(),
            healthy: true,
        }
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    /// Adds one record. Works just as well if `record` is a corrupted
    /// protocol message or an arbitrary string.
    pub fn add_record(&mut self, record: &[u8]) -> ChunkResult<()> {
        if !self.healthy {
            return Err(TracedChunkError::already_failed());
        }
        if self.num_records == MAX_RECORDS {
            self.healthy = false;
            return Err(TracedChunkError::resource_exhausted("too many records"));
        }
        let size = record.len() as u64;
        if size > u64::MAX - self.decoded_data_size {
            self.healthy = false;
            return Err(TracedChunkError::resource_exhausted(
                "decoded data size too large",
            ));
        }
        self.num_records += 1;
        self.decoded_data_size += size;
        if is_proto_message(record) {
            let node_id = NodeId::new(MessageId::START_OF_MESSAGE, 0);
            self.node(node_id);
            let etag = self.intern_tag(node_id, Subtype::TRIVIAL);
            self.encoded_tags.push(etag);
            self.add_message(record, MessageId::ROOT, 0);
        } else {
            let node_id = NodeId::new(MessageId::NON_PROTO, 0);
            self.node(node_id);
            let etag = self.intern_tag(node_id, Subtype::TRIVIAL);
            self.encoded_tags.push(etag);
            self.buffer(node_id, BufferKind::NonProto).push(record);
            self.nonproto_lengths.push_varint(size);
        }
        Ok(())
    }

    /// Looks up the node, creating it (and allocating its child message id)
    /// on first encounter.
    fn node(&mut self, node_id: NodeId) -> &mut MessageNode {
        let next_message_id = &mut self.next_message_id;
        self.message_nodes.entry(node_id).or_insert_with(|| {
            let message_id = *next_message_id;
            *next_message_id = next_message_id.next();
            MessageNode::new(message_id)
        })
    }

    /// Returns the encoded-tag index of `(node, subtype)`, interning it if
    /// new.
    fn intern_tag(&mut self, node_id: NodeId, subtype: Subtype) -> u32 {
        let node = self
            .message_nodes
            .get_mut(&node_id)
            .expect("node interned before its tags");
        let index = subtype.index();
        if node.encoded_tag_pos.len() <= index {
            node.encoded_tag_pos.resize(index + 1, INVALID_POS);
        }
        let slot = &mut node.encoded_tag_pos[index];
        if *slot == INVALID_POS {
            *slot = self.tags_list.len() as u32;
            self.tags_list.push(EncodedTagInfo::new(node_id, subtype));
        }
        *slot
    }

    /// The node's backward buffer, assigned to `kind` on first use.
    fn buffer(&mut self, node_id: NodeId, kind: BufferKind) -> &mut BackwardBuffer {
        let node = self
            .message_nodes
            .get_mut(&node_id)
            .expect("node interned before its buffer");
        if node.buffer.is_none() {
            let buffers = &mut self.data[kind as usize];
            buffers.push(BufferWithMeta::new(node_id));
            node.buffer = Some((kind, buffers.len() - 1));
        }
        let (kind, index) = node.buffer.unwrap();
        &mut self.data[kind as usize][index].buffer
    }

    /// Ingests one validated message: appends encoded tags in order and
    /// prepends value bytes to the node buffers.
    fn add_message(&mut self, message: &[u8], parent_message_id: MessageId, depth: u32) {
        let mut parent_message_id = parent_message_id;
        let mut depth = depth;
        let mut reader = SliceReader::new(message);
        while !reader.is_empty() {
            let tag = reader
                .read_canonical_varint32()
                .expect("tag in validated message");
            let node_id = NodeId::new(parent_message_id, tag);
            let message_id = self.node(node_id).message_id;
            match WireType::of_tag(tag).expect("wire type in validated message") {
                WireType::Varint => {
                    let (_, bytes) = reader
                        .read_canonical_varint64()
                        .expect("varint in validated message");
                    if bytes[0] <= MAX_VARINT_INLINE {
                        // Single-byte value 0..=3: carried by the subtype,
                        // no buffer bytes.
                        let etag =
                            self.intern_tag(node_id, Subtype::varint_inline(bytes[0]));
                        self.encoded_tags.push(etag);
                    } else {
                        let etag = self.intern_tag(node_id, Subtype::varint_bytes(bytes.len()));
                        self.encoded_tags.push(etag);
                        // Strip the continuation bits.
                        let masked: SmallVec<[u8; 10]> =
                            bytes.iter().map(|byte| byte & 0x7f).collect();
                        self.buffer(node_id, BufferKind::Varint).push(&masked);
                    }
                }
                WireType::Fixed32 => {
                    let etag = self.intern_tag(node_id, Subtype::TRIVIAL);
                    self.encoded_tags.push(etag);
                    let bytes = reader.read_bytes(4).expect("fixed32 in validated message");
                    self.buffer(node_id, BufferKind::Fixed32).push(bytes);
                }
                WireType::Fixed64 => {
                    let etag = self.intern_tag(node_id, Subtype::TRIVIAL);
                    self.encoded_tags.push(etag);
                    let bytes = reader.read_bytes(8).expect("fixed64 in validated message");
                    self.buffer(node_id, BufferKind::Fixed64).push(bytes);
                }
                WireType::LengthDelimited => {
                    let length_start = reader.pos();
                    let length = reader
                        .read_canonical_varint32()
                        .expect("length in validated message");
                    let value_start = reader.pos();
                    let payload = reader
                        .read_bytes(length as usize)
                        .expect("payload in validated message");
                    // Empty strings stay strings: one node instead of two.
                    if depth < MAX_RECURSION_DEPTH && length != 0 && is_proto_message(payload)
                    {
                        let etag = self.intern_tag(
                            node_id,
                            Subtype::LENGTH_DELIMITED_START_OF_SUBMESSAGE,
                        );
                        self.encoded_tags.push(etag);
                        // The end marker is interned before the body so tag
                        // numbering does not depend on the body's contents.
                        let end_etag = self.intern_tag(
                            node_id,
                            Subtype::LENGTH_DELIMITED_END_OF_SUBMESSAGE,
                        );
                        self.add_message(payload, message_id, depth + 1);
                        self.encoded_tags.push(end_etag);
                    } else {
                        let etag =
                            self.intern_tag(node_id, Subtype::LENGTH_DELIMITED_STRING);
                        self.encoded_tags.push(etag);
                        // Length prefix and payload go to the buffer as one
                        // unit.
                        let raw = &message[length_start..value_start + length as usize];
                        self.buffer(node_id, BufferKind::String).push(raw);
                    }
                }
                WireType::StartGroup => {
                    let etag = self.intern_tag(node_id, Subtype::TRIVIAL);
                    self.encoded_tags.push(etag);
                    self.group_stack.push(parent_message_id);
                    depth += 1;
                    parent_message_id = message_id;
                }
                WireType::EndGroup => {
                    parent_message_id = self
                        .group_stack
                        .pop()
                        .expect("balanced groups in validated message");
                    depth -= 1;
                    // The node was looked up under the pre-pop parent. That
                    // is fine: all the end marker needs is some unique,
                    // consistent node.
                    let etag = self.intern_tag(node_id, Subtype::TRIVIAL);
                    self.encoded_tags.push(etag);
                }
                WireType::Submessage => unreachable!("submessage wire type never parsed"),
            }
        }
    }

    /// The decoder stops when the transition stream runs out, which it can
    /// only notice on an explicit transition. Give the last-decoded tag a
    /// phantom destination so its transitions never become implicit.
    fn add_phantom_destination(&mut self) {
        let Some(&last_decoded) = self.encoded_tags.first() else {
            return;
        };
        let dest_info = &mut self.tags_list[last_decoded as usize].dest_info;
        if dest_info.len() == 1 {
            let first_key = *dest_info.keys().next().unwrap();
            dest_info.entry(first_key + 1).or_default();
            assert_ne!(dest_info.len(), 1, "last state kept a single destination");
        }
    }

    /// Encodes everything added so far and returns the chunk.
    pub fn finish(self) -> ChunkResult<EncodedChunk> {
        self.finish_with_params(MAX_TRANSITION, MIN_COUNT_FOR_STATE)
    }

    pub(crate) fn finish_with_params(
        mut self,
        max_transition: u32,
        min_count_for_state: u64,
    ) -> ChunkResult<EncodedChunk> {
        assert!(max_transition <= 63, "transition offsets must fit 6 bits");
        if !self.healthy {
            return Err(TracedChunkError::already_failed());
        }

        let mut chunk = vec![self.compression.type_byte()];
        let state_machine = build_state_machine(
            &mut self.tags_list,
            &self.encoded_tags,
            max_transition,
            min_count_for_state,
        );
        self.add_phantom_destination();

        let mut header = Vec::new();
        let mut data = Vec::new();
        let buffer_pos = bucket::write_buffers(
            &mut self.data,
            &self.nonproto_lengths,
            self.bucket_size,
            &mut self.compressor,
            &mut header,
            &mut data,
        )?;
        header::write_states(
            &self.tags_list,
            &state_machine,
            &buffer_pos,
            &self.encoded_tags,
            &mut header,
        );
        transition::write_transitions(
            &self.tags_list,
            &self.encoded_tags,
            &state_machine,
            max_transition,
            self.compressor.writer(),
        );
        self.compressor.encode_and_close(&mut data)?;

        // The uncompressed header size is known here, but no size hint is
        // passed: the compressor is shared with buckets and transitions, and
        // reusing it outweighs the hint.
        let mut compressed_header = Vec::new();
        self.compressor.writer().extend_from_slice(&header);
        self.compressor.encode_and_close(&mut compressed_header)?;
        encode_varint(compressed_header.len() as u64, &mut chunk);
        chunk.extend_from_slice(&compressed_header);
        chunk.extend_from_slice(&data);

        tracing::debug!(
            num_records = self.num_records,
            tags = self.tags_list.len(),
            states = state_machine.len(),
            chunk_bytes = chunk.len(),
            "encoded transposed chunk"
        );
        Ok(EncodedChunk {
            data: chunk,
            num_records: self.num_records,
            decoded_data_size: self.decoded_data_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> TransposeEncoder {
        TransposeEncoder::new(EncoderOptions::default_for_test())
    }

    #[test]
    fn test_ingest_buffered_varint() {
        let mut encoder = encoder();
        encoder.add_record(&[0x08, 0x07]).unwrap();
        // Start-of-message marker plus the field tag.
        assert_eq!(encoder.encoded_tags, vec![0, 1]);
        let tag = &encoder.tags_list[1];
        assert_eq!(tag.node_id, NodeId::new(MessageId::ROOT, 0x08));
        assert_eq!(tag.subtype, Subtype::varint_bytes(1));
        let buffers = &encoder.data[BufferKind::Varint as usize];
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].buffer.len(), 1);
    }

    #[test]
    fn test_ingest_inline_varint_writes_no_bytes() {
        let mut encoder = encoder();
        encoder.add_record(&[0x08, 0x03]).unwrap();
        assert_eq!(encoder.tags_list[1].subtype, Subtype::varint_inline(3));
        assert!(encoder.data[BufferKind::Varint as usize].is_empty());
    }

    #[test]
    fn test_ingest_empty_length_delimited_is_string() {
        let mut encoder = encoder();
        encoder.add_record(&[0x0a, 0x00]).unwrap();
        let tag = &encoder.tags_list[1];
        assert_eq!(tag.subtype, Subtype::LENGTH_DELIMITED_STRING);
        let buffers = &encoder.data[BufferKind::String as usize];
        assert_eq!(buffers.len(), 1);
        // Length prefix only.
        assert_eq!(buffers[0].buffer.len(), 1);
    }

    #[test]
    fn test_ingest_submessage_markers() {
        let mut encoder = encoder();
        // field 2 submessage containing field 1 varint 5.
        encoder.add_record(&[0x12, 0x02, 0x08, 0x05]).unwrap();
        // Interning order: start, end, then the inner field.
        assert_eq!(encoder.tags_list.len(), 4);
        assert_eq!(
            encoder.tags_list[1].subtype,
            Subtype::LENGTH_DELIMITED_START_OF_SUBMESSAGE
        );
        assert_eq!(
            encoder.tags_list[2].subtype,
            Subtype::LENGTH_DELIMITED_END_OF_SUBMESSAGE
        );
        // The inner node hangs off the submessage node's message id.
        let outer_node = encoder.tags_list[1].node_id;
        let child_id = encoder.message_nodes[&outer_node].message_id;
        assert_eq!(encoder.tags_list[3].node_id, NodeId::new(child_id, 0x08));
        // Stream order: start, inner, end.
        assert_eq!(encoder.encoded_tags, vec![0, 1, 3, 2]);
    }

    #[test]
    fn test_ingest_group_uses_pre_pop_node_for_end() {
        let mut encoder = encoder();
        // field 1 group containing field 2 varint 1.
        encoder.add_record(&[0x0b, 0x10, 0x01, 0x0c]).unwrap();
        let start_node = encoder.tags_list[1].node_id;
        assert_eq!(start_node, NodeId::new(MessageId::ROOT, 0x0b));
        let group_id = encoder.message_nodes[&start_node].message_id;
        assert_eq!(encoder.tags_list[2].node_id, NodeId::new(group_id, 0x10));
        // The end tag's node keeps the in-group parent.
        assert_eq!(encoder.tags_list[3].node_id, NodeId::new(group_id, 0x0c));
        assert!(encoder.group_stack.is_empty());
    }

    #[test]
    fn test_non_canonical_varint_routed_as_non_proto() {
        let mut encoder = encoder();
        encoder.add_record(&[0x08, 0x87, 0x00]).unwrap();
        assert_eq!(encoder.tags_list.len(), 1);
        assert_eq!(
            encoder.tags_list[0].node_id,
            NodeId::new(MessageId::NON_PROTO, 0)
        );
        let buffers = &encoder.data[BufferKind::NonProto as usize];
        assert_eq!(buffers[0].buffer.len(), 3);
        assert_eq!(encoder.nonproto_lengths.len(), 1);
    }

    #[test]
    fn test_phantom_destination_added_for_single_dest() {
        let mut encoder = encoder();
        for _ in 0..4 {
            encoder.add_record(&[0x08, 0x01]).unwrap();
        }
        let _ = build_state_machine(&mut encoder.tags_list, &encoder.encoded_tags, 63, 10);
        let first = encoder.encoded_tags[0] as usize;
        assert_eq!(encoder.tags_list[first].dest_info.len(), 1);
        encoder.add_phantom_destination();
        assert_eq!(encoder.tags_list[first].dest_info.len(), 2);
    }
}

