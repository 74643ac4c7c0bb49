// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Serializes the state machine into the chunk header.
//!
//! States are written in four blocks: tag descriptors, base indices, then
//! the subtype and buffer-index side tables (only for the states they apply
//! to), followed by the initial state index.

use std::collections::HashMap;

use prost::encoding::encode_varint;

use crate::encode::state_machine::{EncodedTagInfo, StateInfo, INVALID_POS};
use crate::wire::{has_data_buffer, has_subtype, MessageId, NodeId, Subtype, WireType};

pub fn write_states(
    tags: &[EncodedTagInfo],
    state_machine: &[StateInfo],
    buffer_pos: &HashMap<NodeId, u32>,
    encoded_tags: &[u32],
    header: &mut Vec<u8>,
) {
    let mut subtypes: Vec<u8> = Vec::new();
    let mut buffer_indices: Vec<u32> = Vec::new();
    let mut bases: Vec<u32> = Vec::with_capacity(state_machine.len());

    encode_varint(state_machine.len() as u64, header);
    for state in state_machine {
        if state.etag_index == INVALID_POS {
            encode_varint(MessageId::NO_OP.0, header);
            bases.push(state.base);
            continue;
        }
        let etag_info = &tags[state.etag_index as usize];
        let node_id = etag_info.node_id;
        let subtype = etag_info.subtype;
        if node_id.tag != 0 {
            let is_string = WireType::of_tag(node_id.tag) == Some(WireType::LengthDelimited);
            if is_string && subtype == Subtype::LENGTH_DELIMITED_START_OF_SUBMESSAGE {
                encode_varint(MessageId::START_OF_SUBMESSAGE.0, header);
            } else if is_string && subtype == Subtype::LENGTH_DELIMITED_END_OF_SUBMESSAGE {
                // End of submessage is written with the synthetic submessage
                // wire type so the decoder can detect the close without a
                // length.
                let rewritten =
                    node_id.tag + (WireType::Submessage as u32 - WireType::LengthDelimited as u32);
                encode_varint(rewritten as u64, header);
            } else {
                encode_varint(node_id.tag as u64, header);
                if has_subtype(node_id.tag) {
                    subtypes.push(subtype.0);
                }
                if has_data_buffer(node_id.tag, subtype) {
                    let index = buffer_pos
                        .get(&node_id)
                        .unwrap_or_else(|| panic!("no buffer for node {:?}", node_id));
                    buffer_indices.push(*index);
                }
            }
        } else {
            // Root nodes: the non-proto and start-of-message sentinels.
            encode_varint(node_id.parent.0, header);
            if node_id.parent == MessageId::NON_PROTO {
                let index = buffer_pos
                    .get(&NodeId::new(MessageId::NON_PROTO, 0))
                    .expect("no buffer for non-proto records");
                buffer_indices.push(*index);
            } else {
                assert_eq!(
                    node_id.parent,
                    MessageId::START_OF_MESSAGE,
                    "unexpected message id with tag 0"
                );
            }
        }
        if etag_info.base != INVALID_POS {
            // A single outgoing destination makes the transition implicit;
            // signal it by offsetting the base past the state count.
            let implicit = if etag_info.dest_info.len() == 1 {
                state_machine.len() as u32
            } else {
                0
            };
            bases.push(etag_info.base + implicit);
        } else {
            // No outgoing transitions.
            bases.push(0);
        }
    }
    for &base in &bases {
        encode_varint(base as u64, header);
    }
    header.extend_from_slice(&subtypes);
    for &index in &buffer_indices {
        encode_varint(index as u64, header);
    }

    // The decoder starts at the state of the last tag of the stream; find
    // its smallest state index.
    let mut first_tag_pos = 0u32;
    if let Some(&first_tag) = encoded_tags.last() {
        while state_machine[first_tag_pos as usize].etag_index != first_tag {
            first_tag_pos += 1;
        }
    }
    encode_varint(first_tag_pos as u64, header);
}
