// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Protobuf wire-format primitives: tags, wire types, message ids, subtypes,
//! canonical varint reading and the canonical-message validator.
//!
//! The encoder is schema-free. Everything it knows about a record is inferred
//! from the wire bytes, so the only protobuf notion used throughout the crate
//! is the tag: `tag = (field << 3) | wire_type`.

use smallvec::SmallVec;

/// Largest varint value carried inline in the subtype instead of a buffer.
pub const MAX_VARINT_INLINE: u8 = 3;

/// Submessages nested deeper than this are stored as opaque strings.
pub const MAX_RECURSION_DEPTH: u32 = 100;

/// Identifies one message position in the inferred tag tree.
///
/// Values below [`MessageId::ROOT`] are reserved and appear in tag
/// descriptors on the wire; ids for submessage nodes are allocated densely
/// starting right above [`MessageId::ROOT`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const NO_OP: MessageId = MessageId(0);
    pub const NON_PROTO: MessageId = MessageId(1);
    pub const START_OF_MESSAGE: MessageId = MessageId(2);
    pub const START_OF_SUBMESSAGE: MessageId = MessageId(3);
    pub const ROOT: MessageId = MessageId(4);

    pub fn next(self) -> MessageId {
        MessageId(self.0 + 1)
    }
}

/// Identifies one field node in the tag tree: the message it belongs to and
/// its tag. The root node of a (sub)message has `tag == 0`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId {
    pub parent: MessageId,
    pub tag: u32,
}

impl NodeId {
    pub fn new(parent: MessageId, tag: u32) -> Self {
        Self { parent, tag }
    }
}

/// Low three bits of a tag, plus the synthetic `Submessage` type used by
/// end-of-submessage tag descriptors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    StartGroup = 3,
    EndGroup = 4,
    Fixed32 = 5,
    Submessage = 6,
}

impl WireType {
    /// Wire type of a tag as read from input. `Submessage` never appears in
    /// input, only in tag descriptors written by the encoder.
    pub fn of_tag(tag: u32) -> Option<WireType> {
        match tag & 7 {
            0 => Some(WireType::Varint),
            1 => Some(WireType::Fixed64),
            2 => Some(WireType::LengthDelimited),
            3 => Some(WireType::StartGroup),
            4 => Some(WireType::EndGroup),
            5 => Some(WireType::Fixed32),
            _ => None,
        }
    }
}

/// Discriminates cases within one node: how a varint value is stored, or
/// whether a length-delimited field is a string or a submessage boundary.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Subtype(pub u8);

impl Subtype {
    pub const TRIVIAL: Subtype = Subtype(0);
    /// Varint with value 0..=3, carried entirely by the subtype.
    pub const VARINT_INLINE_0: Subtype = Subtype(0);
    /// Varint with N payload bytes in the varint buffer; `VARINT_1 + (N - 1)`.
    pub const VARINT_1: Subtype = Subtype(MAX_VARINT_INLINE + 1);
    pub const LENGTH_DELIMITED_STRING: Subtype = Subtype(0);
    pub const LENGTH_DELIMITED_START_OF_SUBMESSAGE: Subtype = Subtype(1);
    pub const LENGTH_DELIMITED_END_OF_SUBMESSAGE: Subtype = Subtype(2);

    pub fn varint_inline(value: u8) -> Subtype {
        debug_assert!(value <= MAX_VARINT_INLINE);
        Subtype(Self::VARINT_INLINE_0.0 + value)
    }

    pub fn varint_bytes(len: usize) -> Subtype {
        debug_assert!((1..=10).contains(&len));
        Subtype(Self::VARINT_1.0 + (len as u8 - 1))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Whether states for this tag store a subtype byte in the header.
pub fn has_subtype(tag: u32) -> bool {
    matches!(
        WireType::of_tag(tag),
        Some(WireType::Varint) | Some(WireType::LengthDelimited)
    )
}

/// Whether states for this tag reference a value buffer in the header.
pub fn has_data_buffer(tag: u32, subtype: Subtype) -> bool {
    match WireType::of_tag(tag) {
        Some(WireType::Varint) => subtype >= Subtype::VARINT_1,
        Some(WireType::Fixed32) | Some(WireType::Fixed64) => true,
        Some(WireType::LengthDelimited) => subtype == Subtype::LENGTH_DELIMITED_STRING,
        _ => false,
    }
}

/// Positioned reader over a record's bytes.
///
/// Canonical reads reject any varint that does not use the minimum number of
/// bytes, since the encoder must reproduce input byte-for-byte and therefore
/// cannot absorb redundant-continuation encodings into columns.
pub struct SliceReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    pub fn skip(&mut self, n: usize) -> bool {
        if self.bytes.len() - self.pos < n {
            self.pos = self.bytes.len();
            return false;
        }
        self.pos += n;
        true
    }

    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.bytes.len() - self.pos < n {
            return None;
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn read_byte(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    /// Reads a canonically encoded varint that fits in 32 bits.
    pub fn read_canonical_varint32(&mut self) -> Option<u32> {
        let mut value = 0u32;
        for i in 0..5 {
            let byte = self.read_byte()?;
            if i == 4 {
                // Fifth byte: must terminate, be minimal and fit in 32 bits.
                if byte == 0 || byte >= 0x10 {
                    return None;
                }
                return Some(value | ((byte as u32) << 28));
            }
            value |= ((byte & 0x7f) as u32) << (7 * i);
            if byte < 0x80 {
                if i > 0 && byte == 0 {
                    return None;
                }
                return Some(value);
            }
        }
        unreachable!()
    }

    /// Reads a canonically encoded 64-bit varint, returning the value and the
    /// raw bytes it occupied.
    pub fn read_canonical_varint64(&mut self) -> Option<(u64, &'a [u8])> {
        let start = self.pos;
        for i in 0..10 {
            let byte = self.read_byte()?;
            if i == 9 {
                // Tenth byte can only be 1: anything larger overflows, zero
                // is a redundant continuation.
                if byte != 1 {
                    return None;
                }
                break;
            }
            if byte < 0x80 {
                if i > 0 && byte == 0 {
                    return None;
                }
                break;
            }
        }
        let bytes = &self.bytes[start..self.pos];
        let mut value = 0u64;
        for (i, &byte) in bytes.iter().enumerate() {
            value |= ((byte & 0x7f) as u64) << (7 * i);
        }
        Some((value, bytes))
    }
}

/// Returns whether `record` is a valid protocol buffer message in the
/// canonical encoding.
///
/// This distinguishes strings from submessages in the wire format and checks
/// everything ingestion will later rely on. A message with suboptimally
/// encoded varints (such as `0x87 0x00` instead of `0x07`) would parse fine
/// with a regular proto parser, but the output must reproduce the input
/// exactly, so such records are stored as opaque strings instead.
pub fn is_proto_message(record: &[u8]) -> bool {
    let mut reader = SliceReader::new(record);
    // Every started group must be closed by a matching end-group tag.
    let mut started_groups = SmallVec::<[u32; 16]>::new();
    while !reader.is_empty() {
        let Some(tag) = reader.read_canonical_varint32() else {
            return false;
        };
        let field = tag >> 3;
        if field == 0 {
            return false;
        }
        match WireType::of_tag(tag) {
            Some(WireType::Varint) => {
                if reader.read_canonical_varint64().is_none() {
                    return false;
                }
            }
            Some(WireType::Fixed32) => {
                if !reader.skip(4) {
                    return false;
                }
            }
            Some(WireType::Fixed64) => {
                if !reader.skip(8) {
                    return false;
                }
            }
            Some(WireType::LengthDelimited) => {
                let Some(length) = reader.read_canonical_varint32() else {
                    return false;
                };
                if !reader.skip(length as usize) {
                    return false;
                }
            }
            Some(WireType::StartGroup) => started_groups.push(field),
            Some(WireType::EndGroup) => {
                if started_groups.pop() != Some(field) {
                    return false;
                }
            }
            _ => return false,
        }
    }
    started_groups.is_empty()
}
