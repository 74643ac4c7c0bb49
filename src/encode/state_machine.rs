// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Builds the transition state machine over the encoded-tag stream.
//!
//! Each encoded tag that is a frequent destination of some origin tag gets a
//! state in that origin's *private list*; every tag with remaining incoming
//! transitions gets a state in the shared *public list*. A list longer than
//! `max_transition + 1` is split into blocks connected by no-op routing
//! states, so that any state is reachable from its list's base through a
//! short chain of single-byte transitions.

use std::collections::{BTreeMap, BinaryHeap};

use crate::wire::{NodeId, Subtype};

pub const INVALID_POS: u32 = u32::MAX;

/// Marks a destination as selected for the origin's private list before the
/// list is laid out and real positions are known.
const IN_LIST_POS: u32 = 0;

/// Where transitions from one origin to one destination go.
#[derive(Clone, Copy, Debug)]
pub struct DestInfo {
    /// Position of the destination's state in the origin's private list, or
    /// `INVALID_POS` if the transition is served by the public list.
    pub pos: u32,
    /// Number of transitions from the origin to this destination.
    pub num_transitions: u64,
}

impl Default for DestInfo {
    fn default() -> Self {
        Self {
            pos: INVALID_POS,
            num_transitions: 0,
        }
    }
}

/// Everything the encoder tracks per distinct encoded tag.
pub struct EncodedTagInfo {
    pub node_id: NodeId,
    pub subtype: Subtype,
    /// All destinations reachable from this tag. Ordered so that selection
    /// and base computation are deterministic.
    pub dest_info: BTreeMap<u32, DestInfo>,
    /// Incoming transitions not yet claimed by some origin's private list.
    pub num_incoming_transitions: u64,
    /// Position of this tag's state in the public list.
    pub state_machine_pos: u32,
    /// Position of the no-op in this tag's private list that routes to the
    /// public list.
    pub public_list_noop_pos: u32,
    /// Start of this tag's outgoing transition block. Transitions from this
    /// tag can only target states `[base, base + max_transition]`.
    pub base: u32,
}

impl EncodedTagInfo {
    pub fn new(node_id: NodeId, subtype: Subtype) -> Self {
        Self {
            node_id,
            subtype,
            dest_info: BTreeMap::new(),
            num_incoming_transitions: 0,
            state_machine_pos: INVALID_POS,
            public_list_noop_pos: INVALID_POS,
            base: INVALID_POS,
        }
    }
}

/// One state of the final machine.
#[derive(Clone, Copy, Debug)]
pub struct StateInfo {
    /// Index of the encoded tag this state represents; `INVALID_POS` for
    /// no-op states.
    pub etag_index: u32,
    /// Start of the block this state's outgoing transitions target, or
    /// `INVALID_POS` if not assigned (yet).
    pub base: u32,
    /// The no-op above this state in the routing tree; `INVALID_POS` at the
    /// root block of a list.
    pub canonical_source: u32,
}

impl StateInfo {
    fn no_op(base: u32) -> Self {
        Self {
            etag_index: INVALID_POS,
            base,
            canonical_source: INVALID_POS,
        }
    }

    fn for_tag(etag_index: u32) -> Self {
        Self {
            etag_index,
            base: INVALID_POS,
            canonical_source: INVALID_POS,
        }
    }
}

/// Orders destinations for block layout: lightest popped first, so that the
/// heaviest destinations end up at the lowest offsets of the bottom block.
/// The index tie-break keeps the layout reproducible.
#[derive(PartialEq, Eq)]
struct QueueEntry {
    dest_index: u32,
    num_transitions: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .num_transitions
            .cmp(&self.num_transitions)
            .then_with(|| self.dest_index.cmp(&other.dest_index))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Number of no-op routing states a list of `num_states` items needs.
fn num_noop_states(num_states: u32, max_transition: u32) -> u32 {
    if num_states <= max_transition + 1 {
        0
    } else {
        (num_states - 2) / max_transition
    }
}

/// Counts transitions `a -> b` over the reversed encoded-tag stream and the
/// incoming-transition totals per tag.
fn collect_transition_statistics(tags: &mut [EncodedTagInfo], encoded_tags: &[u32]) {
    let mut prev = *encoded_tags.last().unwrap();
    for i in (1..encoded_tags.len()).rev() {
        let pos = encoded_tags[i - 1];
        tags[prev as usize]
            .dest_info
            .entry(pos)
            .or_default()
            .num_transitions += 1;
        tags[pos as usize].num_incoming_transitions += 1;
        prev = pos;
    }

    // The decoder enters at the last element of the stream; make sure that
    // tag gets a state even if nothing transitions into it.
    let first_state = *encoded_tags.last().unwrap();
    if tags[first_state as usize].num_incoming_transitions == 0 {
        tags[first_state as usize].num_incoming_transitions = 1;
    }
}

/// Builds the state machine. On return every destination that got a private
/// state has its `pos` set, every tag with outgoing transitions its `base`,
/// and every tag in the public list its `state_machine_pos`.
pub fn build_state_machine(
    tags: &mut [EncodedTagInfo],
    encoded_tags: &[u32],
    max_transition: u32,
    min_count_for_state: u64,
) -> Vec<StateInfo> {
    let mut state_machine: Vec<StateInfo> = Vec::new();
    if encoded_tags.is_empty() {
        state_machine.push(StateInfo {
            etag_index: INVALID_POS,
            base: 0,
            canonical_source: INVALID_POS,
        });
        return state_machine;
    }

    collect_transition_statistics(tags, encoded_tags);

    // Select destinations for private lists, subtracting their transitions
    // so that public-list sizing reflects only the remaining demand.
    for tag_id in 0..tags.len() {
        let marked: Vec<(u32, u64)> = tags[tag_id]
            .dest_info
            .iter()
            .filter(|(_, dest)| dest.num_transitions >= min_count_for_state)
            .map(|(&dest_index, dest)| (dest_index, dest.num_transitions))
            .collect();
        for (dest_index, num_transitions) in marked {
            tags[dest_index as usize].num_incoming_transitions -= num_transitions;
            tags[tag_id].dest_info.get_mut(&dest_index).unwrap().pos = IN_LIST_POS;
        }
    }

    let mut tag_priority: BinaryHeap<QueueEntry> = BinaryHeap::new();
    // (tag index, state index) of each no-op whose base lies in the public
    // list; their bases are assigned at the very end.
    let mut public_list_noops: Vec<(u32, u32)> = Vec::new();
    // Base index of each no-op created while laying out the current list.
    let mut noop_base: Vec<u32> = Vec::new();

    // Private lists.
    for tag_id in 0..tags.len() as u32 {
        let dests: Vec<(u32, u64, u32)> = tags[tag_id as usize]
            .dest_info
            .iter()
            .map(|(&dest_index, dest)| (dest_index, dest.num_transitions, dest.pos))
            .collect();
        let sz = dests.len() as u32;
        let mut excluded_state = None;
        let mut num_excluded_transitions = 0u64;
        for (dest_index, num_transitions, pos) in dests {
            // Selected above, or every transition into the destination comes
            // from this origin anyway.
            if pos == IN_LIST_POS
                || num_transitions == tags[dest_index as usize].num_incoming_transitions
            {
                if pos != IN_LIST_POS {
                    tags[dest_index as usize].num_incoming_transitions -= num_transitions;
                }
                tag_priority.push(QueueEntry {
                    dest_index,
                    num_transitions,
                });
            } else {
                num_excluded_transitions += num_transitions;
                excluded_state = Some(QueueEntry {
                    dest_index,
                    num_transitions,
                });
            }
        }
        let mut num_states = tag_priority.len() as u32;
        if num_states == 0 {
            // No private list for this tag.
            continue;
        }
        if num_states + 1 == sz {
            // A single destination would spill to the public list: placing
            // it privately is cheaper than the no-op it would need.
            let excluded = excluded_state.take().unwrap();
            tags[excluded.dest_index as usize].num_incoming_transitions -=
                excluded.num_transitions;
            tag_priority.push(excluded);
            num_states += 1;
        }
        if num_states != sz {
            // The remaining destinations are served via the public list
            // behind a no-op, weighted by everything it will carry.
            tag_priority.push(QueueEntry {
                dest_index: INVALID_POS,
                num_transitions: num_excluded_transitions,
            });
            num_states += 1;
        }

        tags[tag_id as usize].base = state_machine.len() as u32;
        num_states += num_noop_states(num_states, max_transition);
        // States are laid out back to front in blocks; all blocks except the
        // first-created one hold `max_transition + 1` states.
        let mut prev_state = state_machine.len() as u32 + num_states;
        state_machine.resize(prev_state as usize, StateInfo::no_op(INVALID_POS));
        let mut block_size = (num_states - 1) % (max_transition + 1) + 1;
        noop_base.clear();
        loop {
            // The block's total weight becomes the weight of the no-op that
            // will serve it from a lower block.
            let mut total_block_weight = 0u64;
            for _ in 0..block_size {
                let entry = tag_priority.pop().expect("layout ran out of queued states");
                total_block_weight += entry.num_transitions;
                prev_state -= 1;
                if entry.dest_index == INVALID_POS {
                    // No-op that goes to the public list.
                    state_machine[prev_state as usize] = StateInfo::no_op(INVALID_POS);
                    tags[tag_id as usize].public_list_noop_pos = prev_state;
                    public_list_noops.push((tag_id, prev_state));
                } else if entry.dest_index as usize >= tags.len() {
                    // No-op serving a previously created block.
                    let base = noop_base[entry.dest_index as usize - tags.len()];
                    state_machine[prev_state as usize] = StateInfo::no_op(base);
                    for j in 0..=max_transition {
                        let Some(state) = state_machine.get_mut((base + j) as usize) else {
                            break;
                        };
                        state.canonical_source = prev_state;
                    }
                } else {
                    state_machine[prev_state as usize] = StateInfo::for_tag(entry.dest_index);
                    tags[tag_id as usize]
                        .dest_info
                        .get_mut(&entry.dest_index)
                        .unwrap()
                        .pos = prev_state;
                }
            }
            if tag_priority.is_empty() {
                break;
            }
            tag_priority.push(QueueEntry {
                dest_index: (tags.len() + noop_base.len()) as u32,
                num_transitions: total_block_weight,
            });
            noop_base.push(prev_state);
            block_size = max_transition + 1;
        }
    }

    let public_list_base = state_machine.len() as u32;

    // Public list: every tag with remaining incoming transitions.
    for tag_id in 0..tags.len() as u32 {
        let num_incoming = tags[tag_id as usize].num_incoming_transitions;
        if num_incoming != 0 {
            tag_priority.push(QueueEntry {
                dest_index: tag_id,
                num_transitions: num_incoming,
            });
        }
    }
    let mut num_states = tag_priority.len() as u32;
    if num_states > 0 {
        num_states += num_noop_states(num_states, max_transition);
        // Blocks are created in reverse order, which guarantees that no-op
        // transitions into a child block always increase the state index;
        // the base-index computation below relies on this.
        let mut prev_state = state_machine.len() as u32 + num_states;
        state_machine.resize(prev_state as usize, StateInfo::no_op(INVALID_POS));
        let mut block_size = (num_states - 1) % (max_transition + 1) + 1;
        noop_base.clear();
        loop {
            let mut total_block_weight = 0u64;
            for _ in 0..block_size {
                let entry = tag_priority.pop().expect("layout ran out of queued states");
                total_block_weight += entry.num_transitions;
                prev_state -= 1;
                if entry.dest_index as usize >= tags.len() {
                    let base = noop_base[entry.dest_index as usize - tags.len()];
                    state_machine[prev_state as usize] = StateInfo::no_op(base);
                    for j in 0..=max_transition {
                        let Some(state) = state_machine.get_mut((base + j) as usize) else {
                            break;
                        };
                        state.canonical_source = prev_state;
                    }
                } else {
                    state_machine[prev_state as usize] = StateInfo::for_tag(entry.dest_index);
                    tags[entry.dest_index as usize].state_machine_pos = prev_state;
                }
            }
            if tag_priority.is_empty() {
                break;
            }
            tag_priority.push(QueueEntry {
                dest_index: (tags.len() + noop_base.len()) as u32,
                num_transitions: total_block_weight,
            });
            noop_base.push(prev_state);
            block_size = max_transition + 1;
        }
    }

    compute_base_indices(
        max_transition,
        public_list_base,
        &public_list_noops,
        tags,
        &mut state_machine,
    );

    state_machine
}

/// Finds the tightest base from which every target position is reachable,
/// walking up through canonical sources: a target above the window is
/// replaced by its canonical source, a target below the current base moves
/// the base to an ancestor block. Returns the smallest position used in any
/// transition, which becomes the base.
fn covering_base(
    targets: impl Iterator<Item = u32>,
    public_list_base: u32,
    max_transition: u32,
    state_machine: &[StateInfo],
) -> u32 {
    let mut base = INVALID_POS;
    let mut min_pos = INVALID_POS;
    for mut pos in targets {
        debug_assert_ne!(pos, INVALID_POS);
        while base > pos || pos - base > max_transition {
            if base > pos {
                let cs = if base == INVALID_POS {
                    state_machine[pos as usize].canonical_source
                } else {
                    let cs = state_machine[base as usize].canonical_source;
                    assert_ne!(cs, INVALID_POS, "base {} not reachable", base);
                    // Transitions to previously processed targets will pass
                    // through this no-op.
                    min_pos = min_pos.min(cs);
                    state_machine[cs as usize].canonical_source
                };
                base = if cs == INVALID_POS {
                    // Already in the first block of the public list.
                    public_list_base
                } else {
                    state_machine[cs as usize].base
                };
            } else {
                let cs = state_machine[pos as usize].canonical_source;
                debug_assert!(
                    (cs as usize) < state_machine.len()
                        && state_machine[cs as usize].base <= pos
                        && pos - state_machine[cs as usize].base <= max_transition,
                    "state {} not reachable from its canonical source",
                    pos
                );
                pos = cs;
            }
        }
        min_pos = min_pos.min(pos);
    }
    min_pos
}

/// Assigns `base` to public-list no-ops and to tags without a private list.
///
/// Setting everything to `public_list_base` would be valid, but most tags
/// only target a few destinations, so a base deeper in the routing tree
/// saves transition bytes.
fn compute_base_indices(
    max_transition: u32,
    public_list_base: u32,
    public_list_noops: &[(u32, u32)],
    tags: &mut [EncodedTagInfo],
    state_machine: &mut [StateInfo],
) {
    for &(tag_index, state_index) in public_list_noops {
        let targets: Vec<u32> = tags[tag_index as usize]
            .dest_info
            .iter()
            .filter(|(_, dest)| dest.pos == INVALID_POS)
            .map(|(&dest_index, _)| tags[dest_index as usize].state_machine_pos)
            .collect();
        let min_pos = covering_base(
            targets.into_iter(),
            public_list_base,
            max_transition,
            state_machine,
        );
        assert_ne!(
            min_pos, INVALID_POS,
            "public no-op without outgoing transitions"
        );
        state_machine[state_index as usize].base = min_pos;
    }

    for tag_id in 0..tags.len() {
        if tags[tag_id].base != INVALID_POS {
            continue;
        }
        let targets: Vec<u32> = tags[tag_id]
            .dest_info
            .iter()
            .filter(|(_, dest)| dest.pos == INVALID_POS)
            .map(|(&dest_index, _)| tags[dest_index as usize].state_machine_pos)
            .collect();
        let min_pos = covering_base(
            targets.into_iter(),
            public_list_base,
            max_transition,
            state_machine,
        );
        if min_pos != INVALID_POS {
            tags[tag_id].base = min_pos;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::wire::MessageId;

    use super::*;

    fn make_tags(n: u32) -> Vec<EncodedTagInfo> {
        (0..n)
            .map(|i| {
                EncodedTagInfo::new(
                    NodeId::new(MessageId::ROOT, (i + 1) << 3),
                    Subtype::TRIVIAL,
                )
            })
            .collect()
    }

    /// Every state with a canonical source must be reachable from it in one
    /// byte, and the source must sit below the state.
    fn check_canonical_sources(state_machine: &[StateInfo], max_transition: u32) {
        for (i, state) in state_machine.iter().enumerate() {
            if state.canonical_source == INVALID_POS {
                continue;
            }
            let cs = state.canonical_source as usize;
            assert!(cs < state_machine.len());
            assert!(cs < i, "canonical source must precede its block");
            let base = state_machine[cs].base;
            assert!(base as usize <= i);
            assert!(i as u32 - base <= max_transition);
        }
    }

    #[test]
    fn test_empty_stream_single_state() {
        let mut tags = make_tags(0);
        let machine = build_state_machine(&mut tags, &[], 63, 10);
        assert_eq!(machine.len(), 1);
        assert_eq!(machine[0].etag_index, INVALID_POS);
        assert_eq!(machine[0].base, 0);
    }

    #[test]
    fn test_hot_pair_private_lists() {
        // 0 and 1 alternate 100 times; both directions are hot.
        let mut tags = make_tags(2);
        let stream: Vec<u32> = (0..200).map(|i| i % 2).collect();
        let machine = build_state_machine(&mut tags, &stream, 63, 10);

        // Both tags own a one-state private list; nothing remains public.
        assert_eq!(machine.len(), 2);
        assert_ne!(tags[0].base, INVALID_POS);
        assert_ne!(tags[1].base, INVALID_POS);
        assert_eq!(tags[0].dest_info[&1].pos, tags[0].base);
        assert_eq!(tags[1].dest_info[&0].pos, tags[1].base);
        assert_eq!(machine[tags[0].base as usize].etag_index, 1);
        assert_eq!(machine[tags[1].base as usize].etag_index, 0);
        check_canonical_sources(&machine, 63);
    }

    #[test]
    fn test_wide_fanout_gets_noop_tree() {
        // Tag 0 fans out to 69 destinations, each visited once; every
        // destination's transitions all come from tag 0, so they are all
        // placed privately and the list needs a routing no-op.
        let mut tags = make_tags(71);
        let mut stream = Vec::new();
        for k in 1..=70u32 {
            stream.push(0);
            stream.push(k);
        }
        let machine = build_state_machine(&mut tags, &stream, 63, 10);

        // 69 private states + 1 no-op, then tag 0 and tag 70 in the public
        // list (70 never became anyone's destination; it is the decoder's
        // entry state).
        assert_eq!(tags[0].base, 0);
        assert_eq!(machine.len(), 72);
        assert_eq!(tags[0].public_list_noop_pos, INVALID_POS);
        assert_ne!(tags[0].state_machine_pos, INVALID_POS);
        assert_ne!(tags[70].state_machine_pos, INVALID_POS);
        let num_noops = machine
            .iter()
            .filter(|s| s.etag_index == INVALID_POS)
            .count();
        assert_eq!(num_noops, 1);
        check_canonical_sources(&machine, 63);

        // Destinations 1..=69 all have private positions, and the heaviest
        // block starts at the tag's base.
        for k in 1..=69u32 {
            let pos = tags[0].dest_info[&k].pos;
            assert_ne!(pos, INVALID_POS);
        }
        // Tags 1..=70 have no private list but their base covers tag 0's
        // public state in one transition.
        for k in 1..=70usize {
            let base = tags[k].base;
            assert_ne!(base, INVALID_POS);
            let target = tags[0].state_machine_pos;
            assert!(base <= target && target - base <= 63);
        }
    }

    #[test]
    fn test_spill_to_public_creates_noop() {
        // Tag 0 transitions to tags 1 and 2 often (private), and to tags
        // 3..=6 rarely; 3..=6 also receive transitions from tag 7, so they
        // cannot be claimed privately and must spill behind a no-op.
        let mut tags = make_tags(8);
        let mut stream = Vec::new();
        for _ in 0..20 {
            stream.push(0);
            stream.push(1);
            stream.push(0);
            stream.push(2);
        }
        for k in 3..=6u32 {
            stream.push(0);
            stream.push(k);
            stream.push(7);
            stream.push(k);
        }
        let machine = build_state_machine(&mut tags, &stream, 63, 10);

        assert_ne!(tags[0].base, INVALID_POS);
        assert_ne!(
            tags[0].public_list_noop_pos,
            INVALID_POS,
            "spilled destinations must route through a no-op"
        );
        let noop = &machine[tags[0].public_list_noop_pos as usize];
        assert_eq!(noop.etag_index, INVALID_POS);
        assert_ne!(noop.base, INVALID_POS);
        // The spilled destinations are reachable from the no-op's base.
        for k in 3..=6u32 {
            assert_eq!(tags[0].dest_info[&k].pos, INVALID_POS);
            let target = tags[k as usize].state_machine_pos;
            assert_ne!(target, INVALID_POS);
            assert!(noop.base <= target && target - noop.base <= 63);
        }
        check_canonical_sources(&machine, 63);
    }

    #[test]
    fn test_single_spill_included_privately() {
        // Tag 0 has two hot destinations and exactly one cold one; the cold
        // one is pulled into the private list instead of a no-op.
        let mut tags = make_tags(5);
        let mut stream = Vec::new();
        for _ in 0..15 {
            stream.push(0);
            stream.push(1);
            stream.push(0);
            stream.push(2);
        }
        // One cold destination, also fed by tag 4 so it is not fully owned.
        stream.push(0);
        stream.push(3);
        stream.push(4);
        stream.push(3);
        let machine = build_state_machine(&mut tags, &stream, 63, 10);

        assert_eq!(tags[0].public_list_noop_pos, INVALID_POS);
        assert_ne!(tags[0].dest_info[&3].pos, INVALID_POS);
        check_canonical_sources(&machine, 63);
    }

    #[test]
    fn test_heaviest_destination_at_base() {
        // Tag 0 goes to tag 1 far more often than to tag 2; tag 1's state
        // must sit at offset zero of tag 0's private list.
        let mut tags = make_tags(3);
        let mut stream = Vec::new();
        for _ in 0..50 {
            stream.push(0);
            stream.push(1);
        }
        for _ in 0..12 {
            stream.push(0);
            stream.push(2);
        }
        let _ = build_state_machine(&mut tags, &stream, 63, 10);
        assert_eq!(tags[0].dest_info[&1].pos, tags[0].base);
        assert_eq!(tags[0].dest_info[&2].pos, tags[0].base + 1);
    }
}
