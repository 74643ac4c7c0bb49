// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Packs the per-node value buffers into size-bounded compression buckets.
//!
//! Buffers are concatenated kind by kind, each kind sorted largest first so
//! that big columns compress on their own and small ones share a bucket.
//! Bucket boundaries never split a buffer.

use std::collections::HashMap;

use prost::encoding::encode_varint;

use crate::compress::Compressor;
use crate::encode::buffer::{BackwardBuffer, BufferWithMeta, NUM_BUFFER_KINDS};
use crate::error::ChunkResult;
use crate::wire::NodeId;

struct BucketPacker<'a> {
    compressor: &'a mut Compressor,
    dest: &'a mut Vec<u8>,
    bucket_size: u64,
    bucket_lengths: Vec<u64>,
    buffer_lengths: Vec<u64>,
}

impl BucketPacker<'_> {
    /// Appends one buffer to the current bucket, flushing the bucket first
    /// when forced or when the buffer would push it past `bucket_size`.
    fn add(&mut self, force_new_bucket: bool, buffer: &BackwardBuffer) -> ChunkResult<()> {
        self.buffer_lengths.push(buffer.len() as u64);
        if (force_new_bucket || self.compressor.written() + buffer.len() as u64 > self.bucket_size)
            && self.compressor.written() > 0
        {
            self.flush_bucket()?;
        }
        buffer.write_to(self.compressor.writer());
        Ok(())
    }

    fn flush_bucket(&mut self) -> ChunkResult<()> {
        let pos_before = self.dest.len();
        self.compressor.encode_and_close(self.dest)?;
        self.bucket_lengths.push((self.dest.len() - pos_before) as u64);
        Ok(())
    }
}

/// Writes all value buffers, compressed in buckets, to `dest`, and the
/// bucket/buffer length tables to `header`. Returns the dense buffer index
/// assigned to each node.
pub fn write_buffers(
    data: &mut [Vec<BufferWithMeta>; NUM_BUFFER_KINDS],
    nonproto_lengths: &BackwardBuffer,
    bucket_size: u64,
    compressor: &mut Compressor,
    header: &mut Vec<u8>,
    dest: &mut Vec<u8>,
) -> ChunkResult<HashMap<NodeId, u32>> {
    for buffers in data.iter_mut() {
        buffers.sort_by(|a, b| {
            b.buffer
                .len()
                .cmp(&a.buffer.len())
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
    }

    let mut packer = BucketPacker {
        compressor,
        dest,
        bucket_size,
        bucket_lengths: Vec::new(),
        buffer_lengths: Vec::new(),
    };
    let mut buffer_pos = HashMap::new();
    for buffers in data.iter() {
        for (i, buffer) in buffers.iter().enumerate() {
            // The first buffer of each kind starts a new bucket.
            packer.add(i == 0, &buffer.buffer)?;
            let index = buffer_pos.len() as u32;
            let previous = buffer_pos.insert(buffer.node_id, index);
            assert!(previous.is_none(), "node already has a buffer assigned");
        }
    }
    if !nonproto_lengths.is_empty() {
        // The lengths of non-proto records are the last buffer and always
        // compress on their own. It needs no buffer index: the decoder finds
        // it by position.
        packer.add(true, nonproto_lengths)?;
    }
    if packer.compressor.written() > 0 {
        packer.flush_bucket()?;
    }

    encode_varint(packer.bucket_lengths.len() as u64, header);
    encode_varint(packer.buffer_lengths.len() as u64, header);
    for &length in &packer.bucket_lengths {
        encode_varint(length, header);
    }
    for &length in &packer.buffer_lengths {
        encode_varint(length, header);
    }
    Ok(buffer_pos)
}

#[cfg(test)]
mod tests {
    use prost::encoding::decode_varint;

    use super::*;
    use crate::encode::buffer::BufferKind;
    use crate::options::Compression;
    use crate::wire::MessageId;

    fn buffer(node_tag: u32, contents: &[u8]) -> BufferWithMeta {
        let mut buffer = BufferWithMeta::new(NodeId::new(MessageId::ROOT, node_tag));
        buffer.buffer.push(contents);
        buffer
    }

    fn parse_tables(header: &[u8]) -> (Vec<u64>, Vec<u64>) {
        let mut buf = header;
        let num_buckets = decode_varint(&mut buf).unwrap();
        let num_buffers = decode_varint(&mut buf).unwrap();
        let buckets = (0..num_buckets)
            .map(|_| decode_varint(&mut buf).unwrap())
            .collect();
        let buffers = (0..num_buffers)
            .map(|_| decode_varint(&mut buf).unwrap())
            .collect();
        (buckets, buffers)
    }

    #[test]
    fn test_sort_and_bucket_bounds() {
        let mut data: [Vec<BufferWithMeta>; NUM_BUFFER_KINDS] = Default::default();
        data[BufferKind::Varint as usize] = vec![
            buffer(0x10, &[1; 4]),
            buffer(0x08, &[2; 9]),
            buffer(0x18, &[3; 9]),
        ];
        data[BufferKind::String as usize] = vec![buffer(0x22, &[4; 30])];

        let mut compressor = Compressor::new(Compression::None);
        let mut header = Vec::new();
        let mut dest = Vec::new();
        let buffer_pos = write_buffers(
            &mut data,
            &BackwardBuffer::default(),
            14,
            &mut compressor,
            &mut header,
            &mut dest,
        )
        .unwrap();

        let (buckets, buffers) = parse_tables(&header);
        // Within the varint kind: length descending, tag ascending tiebreak.
        assert_eq!(buffers, vec![9, 9, 4, 30]);
        assert_eq!(buffer_pos[&NodeId::new(MessageId::ROOT, 0x08)], 0);
        assert_eq!(buffer_pos[&NodeId::new(MessageId::ROOT, 0x18)], 1);
        assert_eq!(buffer_pos[&NodeId::new(MessageId::ROOT, 0x10)], 2);
        assert_eq!(buffer_pos[&NodeId::new(MessageId::ROOT, 0x22)], 3);
        // Bucket size 14: the two 9-byte buffers cannot share, the 4-byte
        // one joins the second; the string kind starts its own bucket even
        // though it exceeds the bucket size on its own.
        assert_eq!(buckets, vec![9, 13, 30]);
        assert_eq!(dest.len(), 9 + 13 + 30);
    }

    #[test]
    fn test_nonproto_lengths_last_and_alone() {
        let mut data: [Vec<BufferWithMeta>; NUM_BUFFER_KINDS] = Default::default();
        let mut records = BufferWithMeta::new(NodeId::new(MessageId::NON_PROTO, 0));
        records.buffer.push(b"hello");
        records.buffer.push(b"world!");
        data[BufferKind::NonProto as usize] = vec![records];
        let mut nonproto_lengths = BackwardBuffer::default();
        nonproto_lengths.push_varint(5);
        nonproto_lengths.push_varint(6);

        let mut compressor = Compressor::new(Compression::None);
        let mut header = Vec::new();
        let mut dest = Vec::new();
        write_buffers(
            &mut data,
            &nonproto_lengths,
            1 << 20,
            &mut compressor,
            &mut header,
            &mut dest,
        )
        .unwrap();

        let (buckets, buffers) = parse_tables(&header);
        assert_eq!(buffers, vec![11, 2]);
        assert_eq!(buckets, vec![11, 2]);
        // Backward writers: the record prepended last comes out first.
        assert_eq!(dest, b"world!hello\x06\x05");
    }
}
