// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Emits the compressed transition stream by walking the encoded-tag
//! sequence in reverse through the state machine.
//!
//! A transition byte on the wire is `(offset << 2) | run_length`, where
//! `run_length` counts up to three following zero-offset transitions packed
//! into the same byte.

use smallvec::SmallVec;

use super::state_machine::{EncodedTagInfo, StateInfo, INVALID_POS};

/// Byte emitter with zero-run compaction. Holds at most one pending byte; a
/// zero offset is absorbed into the pending byte while its run count has
/// room, anything else flushes it.
pub struct TransitionWriter<'a> {
    dest: &'a mut Vec<u8>,
    pending: Option<u8>,
}

impl<'a> TransitionWriter<'a> {
    pub fn new(dest: &'a mut Vec<u8>) -> Self {
        Self {
            dest,
            pending: None,
        }
    }

    pub fn put(&mut self, offset: u8) {
        if offset == 0 {
            if let Some(pending) = &mut self.pending {
                if (*pending & 3) < 3 {
                    *pending += 1;
                    return;
                }
            }
        }
        if let Some(pending) = self.pending.take() {
            self.dest.push(pending);
        }
        self.pending = Some(offset << 2);
    }

    pub fn finish(mut self) {
        if let Some(pending) = self.pending.take() {
            self.dest.push(pending);
        }
    }
}

/// Pushes the hop offsets that lead from `current_base` to `pos`, walking up
/// the canonical-source chain while `pos` is not reachable in one byte.
/// Hops are collected deepest-first; emit them in reverse.
fn collect_hops(
    hops: &mut SmallVec<[u8; 32]>,
    state_machine: &[StateInfo],
    mut pos: u32,
    current_base: u32,
    max_transition: u32,
) {
    hops.clear();
    debug_assert_ne!(current_base, INVALID_POS);
    debug_assert!((pos as usize) < state_machine.len());
    while current_base > pos || pos - current_base > max_transition {
        let cs = state_machine[pos as usize].canonical_source;
        assert!(
            (cs as usize) < state_machine.len()
                && state_machine[cs as usize].base <= pos
                && pos - state_machine[cs as usize].base <= max_transition,
            "state {} not reachable from its canonical source",
            pos
        );
        hops.push((pos - state_machine[cs as usize].base) as u8);
        pos = cs;
    }
    hops.push((pos - current_base) as u8);
}

/// Walks `encoded_tags` in reverse and writes every transition into `dest`.
pub fn write_transitions(
    tags: &[EncodedTagInfo],
    encoded_tags: &[u32],
    state_machine: &[StateInfo],
    max_transition: u32,
    dest: &mut Vec<u8>,
) {
    if encoded_tags.is_empty() {
        return;
    }
    let mut writer = TransitionWriter::new(dest);
    let mut hops = SmallVec::new();
    let mut prev_etag = *encoded_tags.last().unwrap();
    let mut current_base = tags[prev_etag as usize].base;
    for i in (1..encoded_tags.len()).rev() {
        let tag = encoded_tags[i - 1];
        if tags[prev_etag as usize].dest_info.len() != 1 {
            // A transition can be served three ways: from the previous tag's
            // private list; from the public list directly when the previous
            // tag has no private list; or through the private no-op that
            // routes into the public list.
            let mut pos = tags[prev_etag as usize].dest_info[&tag].pos;
            if pos == INVALID_POS {
                pos = tags[prev_etag as usize].public_list_noop_pos;
                if pos != INVALID_POS {
                    // Route to the no-op first; its base is in the public
                    // list.
                    collect_hops(&mut hops, state_machine, pos, current_base, max_transition);
                    for &offset in hops.iter().rev() {
                        writer.put(offset);
                    }
                    current_base = state_machine[pos as usize].base;
                }
                pos = tags[tag as usize].state_machine_pos;
            }
            collect_hops(&mut hops, state_machine, pos, current_base, max_transition);
            for &offset in hops.iter().rev() {
                writer.put(offset);
            }
        } else {
            // Implicit transition: the single destination sits at the base.
            debug_assert_eq!(
                state_machine[tags[prev_etag as usize].base as usize].etag_index,
                tag,
                "implicit transition goes to a wrong tag"
            );
        }
        prev_etag = tag;
        current_base = tags[prev_etag as usize].base;
    }
    writer.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(offsets: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = TransitionWriter::new(&mut out);
        for &offset in offsets {
            writer.put(offset);
        }
        writer.finish();
        out
    }

    #[test]
    fn test_zero_run_compaction() {
        assert_eq!(emit(&[]), vec![]);
        assert_eq!(emit(&[5]), vec![5 << 2]);
        // A nonzero offset absorbs following zeros, up to three.
        assert_eq!(emit(&[5, 0, 0]), vec![(5 << 2) | 2]);
        assert_eq!(emit(&[5, 0, 0, 0, 0]), vec![(5 << 2) | 3, 0]);
        // A pending zero byte absorbs zeros too.
        assert_eq!(emit(&[0, 0, 0, 0]), vec![3]);
        assert_eq!(emit(&[0, 0, 0, 0, 0]), vec![3, 0]);
        // A nonzero offset flushes whatever is pending.
        assert_eq!(emit(&[0, 7]), vec![0, 7 << 2]);
        assert_eq!(emit(&[5, 0, 7, 0]), vec![(5 << 2) | 1, (7 << 2) | 1]);
    }
}
