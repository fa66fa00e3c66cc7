//! Per-slot free-list reconstruction.
//!
//! Each slot of a magazine's free list is walked on its own, with its own
//! visited set, so a cycle or a dangling pointer in one slot never stops the
//! others from being read.

use hashbrown::{HashMap, HashSet};
use log::{debug, warn};
use serde::Serialize;

use crate::{
    decode::{decode_with, ComplexZone, FreeNode, FreeNodeContext, Magazine},
    error::DecodeError,
    inspect::CancelToken,
    layout::{SizeClass, SizeClassLayout, StructLayout},
    serialize::serde_addr,
    source::MemorySource,
    util::num::aligned_to,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FreeBlock {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub msize: u64,
    /// The slot the allocator filed this block under.
    pub slot: usize,
    #[serde(with = "serde_addr")]
    pub previous: u64,
    #[serde(with = "serde_addr")]
    pub next: u64,
}

impl FreeBlock {
    pub fn size(&self, quantum: u64) -> u64 {
        self.msize * quantum
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSide {
    Previous,
    Next,
}

/// Something wrong with one slot's chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum SlotFault {
    /// `from` links back to `to`, already on this chain. The walk stops there.
    Cycle {
        #[serde(with = "serde_addr")]
        from: u64,
        #[serde(with = "serde_addr")]
        to: u64,
    },
    /// `to` cannot be decoded as a free node.
    Dangling {
        #[serde(with = "serde_addr")]
        from: u64,
        #[serde(with = "serde_addr")]
        to: u64,
        error: DecodeError,
    },
    /// `to` is not quantum aligned.
    Misaligned {
        #[serde(with = "serde_addr")]
        from: u64,
        #[serde(with = "serde_addr")]
        to: u64,
    },
    BadChecksum {
        #[serde(with = "serde_addr")]
        node: u64,
        side: LinkSide,
    },
    /// The block's size belongs in another slot (or is zero).
    SizeMismatch {
        #[serde(with = "serde_addr")]
        node: u64,
        msize: u64,
        expected_slot: usize,
    },
    /// `previous` of `node` is not the node before it on the chain.
    BackLink {
        #[serde(with = "serde_addr")]
        node: u64,
        #[serde(with = "serde_addr")]
        found: u64,
        #[serde(with = "serde_addr")]
        expected: u64,
    },
    /// The chain is longer than the class could possibly hold.
    Unterminated { bound: usize },
    /// `mag_bitmap` disagrees with whether the slot has a head.
    OccupancyMismatch { bitmap_set: bool },
    /// `node` is also on slot `other`.
    CrossLinked {
        #[serde(with = "serde_addr")]
        node: u64,
        other: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Intact,
    CorruptFreeList,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FreeSlot {
    pub index: usize,
    #[serde(with = "serde_addr")]
    pub head: u64,
    /// In chain order from the head.
    pub blocks: Vec<FreeBlock>,
    pub faults: Vec<SlotFault>,
}

impl FreeSlot {
    pub fn status(&self) -> SlotStatus {
        if self.faults.is_empty() {
            SlotStatus::Intact
        } else {
            SlotStatus::CorruptFreeList
        }
    }

    pub fn addresses(&self) -> Vec<u64> {
        self.blocks.iter().map(|b| b.address).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FreeListGraph {
    #[serde(with = "serde_addr")]
    pub magazine: u64,
    pub class: SizeClass,
    pub quantum: u64,
    pub slots: Vec<FreeSlot>,
    /// Address-adjacent free blocks the allocator should have merged.
    pub uncoalesced: Vec<(u64, u64)>,
    /// Free blocks that overlap each other.
    pub overlapping: Vec<(u64, u64)>,
    /// False if the walk was cancelled before every slot was read.
    pub complete: bool,
}

impl FreeListGraph {
    /// The free block containing `address`.
    pub fn find(&self, address: u64) -> Option<&FreeBlock> {
        self.blocks()
            .find(|b| address >= b.address && address - b.address < b.size(self.quantum))
    }

    pub fn blocks(&self) -> impl Iterator<Item = &FreeBlock> + '_ {
        self.slots.iter().flat_map(|s| s.blocks.iter())
    }

    pub fn slot(&self, index: usize) -> Option<&FreeSlot> {
        self.slots.get(index)
    }

    pub fn is_intact(&self) -> bool {
        self.slots.iter().all(|s| s.status() == SlotStatus::Intact)
    }
}

/// Walk every free-list slot of `magazine`, a `class` magazine of `zone`.
pub fn reconstruct<S>(
    source: &S,
    layout: &StructLayout,
    zone: &ComplexZone,
    magazine: &Magazine,
    cancel: &CancelToken,
) -> FreeListGraph
where
    S: MemorySource + ?Sized,
{
    let class = magazine.class;
    let geometry = layout.size_class(class);
    let quantum = geometry.quantum();
    let slots = magazine.free_heads.len();
    let regions = zone.magazine_set(class).num_regions.max(1);
    let bound = (regions.saturating_mul(geometry.region_quanta) as usize).min(layout.limits.max_free_chain);

    let mut graph = FreeListGraph {
        magazine: magazine.address,
        class,
        quantum,
        slots: Vec::with_capacity(slots),
        uncoalesced: Vec::new(),
        overlapping: Vec::new(),
        complete: true,
    };
    // every node seen so far, with its slot
    let mut seen: HashMap<u64, usize> = HashMap::new();

    for (index, &head) in magazine.free_heads.iter().enumerate() {
        if cancel.is_cancelled() {
            graph.complete = false;
            break;
        }
        let mut slot = FreeSlot {
            index,
            head,
            blocks: Vec::new(),
            faults: Vec::new(),
        };
        let bitmap_set = magazine.slot_bitmap.get(index).copied().unwrap_or(false);
        if bitmap_set != (head != 0) {
            slot.faults.push(SlotFault::OccupancyMismatch { bitmap_set });
        }
        let cx = FreeNodeContext {
            cookie: zone.cookie,
            unit: layout.free_node.implicit_unit_msize && index == 0,
        };
        let cancelled = walk_slot(source, layout, geometry, &cx, slots, bound, &mut slot, &mut seen, cancel);
        if slot.status() == SlotStatus::CorruptFreeList {
            warn!(
                "{class} magazine {} slot {index}: free list possibly corrupt: {:?}",
                magazine.index, slot.faults
            );
        }
        graph.slots.push(slot);
        if cancelled {
            graph.complete = false;
            break;
        }
    }

    let mut all: Vec<(u64, u64)> = graph
        .blocks()
        .map(|b| (b.address, b.address.saturating_add(b.size(quantum))))
        .collect();
    all.sort_unstable();
    all.dedup();
    // compare each block with the one reaching furthest before it
    let mut reach: Option<(u64, u64)> = None;
    for &(b, b_end) in &all {
        if let Some((a, a_end)) = reach {
            if a_end > b {
                graph.overlapping.push((a, b));
            } else if a_end == b {
                graph.uncoalesced.push((a, b));
            }
        }
        if reach.map_or(true, |(_, end)| b_end > end) {
            reach = Some((b, b_end));
        }
    }
    debug!(
        "{class} magazine {}: {} free blocks",
        magazine.index,
        graph.blocks().count()
    );
    graph
}

/// Follow one chain. Returns true if cancelled part way.
#[allow(clippy::too_many_arguments)]
fn walk_slot<S>(
    source: &S,
    layout: &StructLayout,
    geometry: &SizeClassLayout,
    cx: &FreeNodeContext,
    slots: usize,
    bound: usize,
    slot: &mut FreeSlot,
    seen: &mut HashMap<u64, usize>,
    cancel: &CancelToken,
) -> bool
where
    S: MemorySource + ?Sized,
{
    let quantum = geometry.quantum();
    let mut visited = HashSet::new();
    let mut previous = 0;
    let mut current = slot.head;
    while current != 0 {
        if cancel.is_cancelled() {
            return true;
        }
        if !aligned_to(current, quantum) {
            slot.faults.push(SlotFault::Misaligned {
                from: previous,
                to: current,
            });
            break;
        }
        if !visited.insert(current) {
            slot.faults.push(SlotFault::Cycle {
                from: previous,
                to: current,
            });
            break;
        }
        if slot.blocks.len() >= bound {
            slot.faults.push(SlotFault::Unterminated { bound });
            break;
        }
        let node: FreeNode = match decode_with(source, layout, current, cx) {
            Ok(node) => node,
            Err(error) => {
                slot.faults.push(SlotFault::Dangling {
                    from: previous,
                    to: current,
                    error,
                });
                break;
            }
        };

        if !node.previous.checksum_ok {
            slot.faults.push(SlotFault::BadChecksum {
                node: current,
                side: LinkSide::Previous,
            });
        }
        if node.previous.pointer != previous {
            slot.faults.push(SlotFault::BackLink {
                node: current,
                found: node.previous.pointer,
                expected: previous,
            });
        }
        let expected_slot = geometry.slot_for(node.msize, slots);
        if node.msize == 0 || expected_slot != slot.index {
            slot.faults.push(SlotFault::SizeMismatch {
                node: current,
                msize: node.msize,
                expected_slot,
            });
        }
        if let Some(&other) = seen.get(&current) {
            if other != slot.index {
                slot.faults.push(SlotFault::CrossLinked {
                    node: current,
                    other,
                });
            }
        } else {
            seen.insert(current, slot.index);
        }
        slot.blocks.push(FreeBlock {
            address: current,
            msize: node.msize,
            slot: slot.index,
            previous: node.previous.pointer,
            next: node.next.pointer,
        });

        if !node.next.checksum_ok && !node.next.is_null() {
            slot.faults.push(SlotFault::BadChecksum {
                node: current,
                side: LinkSide::Next,
            });
            break;
        }
        previous = current;
        current = node.next.pointer;
    }
    false
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        decode::{decode, MagazineContext},
        layout::{layout_for, Architecture},
        source::Snapshot,
        synth::{HeapImage, ZoneHandle},
    };

    fn layout() -> &'static StructLayout {
        layout_for(Architecture::X86_64, 8).unwrap()
    }

    /// One tiny magazine with blocks of msize 3 at `chain` on slot 2. `tweak`
    /// gets to damage the image before it is frozen.
    fn reconstruct_chain(chain: &[u64], tweak: impl FnOnce(&mut HeapImage, &ZoneHandle)) -> FreeListGraph {
        let layout = layout();
        let mut image = HeapImage::new(layout);
        let zone = image.zone(0x10_0000, None);
        image.magazines(&zone, SizeClass::Tiny, 1, 0x30_0000);
        let region = image.region(SizeClass::Tiny, 0x20_0000, 0);
        image.link_regions(&zone, SizeClass::Tiny, 0, &[region]);
        let blocks: Vec<(u64, u64)> = chain.iter().map(|&a| (a, 3)).collect();
        image.free_chain(&zone, SizeClass::Tiny, 0, 2, &blocks);
        tweak(&mut image, &zone);
        let at = image.magazine_address(&zone, SizeClass::Tiny, 0);
        reconstruct_from(&image.finish(), zone, at, &CancelToken::new())
    }

    fn reconstruct_from(snapshot: &Snapshot, zone: ZoneHandle, magazine: u64, cancel: &CancelToken) -> FreeListGraph {
        let layout = layout();
        let cz: ComplexZone = decode(snapshot, layout, zone.complex).unwrap();
        let cx = MagazineContext {
            class: SizeClass::Tiny,
            index: 0,
            slots: cz.free_slots(layout, SizeClass::Tiny),
        };
        let magazine: Magazine = decode_with(snapshot, layout, magazine, &cx).unwrap();
        reconstruct(snapshot, layout, &cz, &magazine, cancel)
    }

    #[test]
    fn three_node_chain_in_order() {
        let chain = [0x20_0100, 0x20_0040, 0x20_0400];
        let graph = reconstruct_chain(&chain, |_, _| {});

        assert!(graph.complete);
        assert_eq!(graph.slots.len(), 64);
        assert_eq!(graph.slots[2].addresses(), chain.to_vec());
        assert_eq!(graph.slots[2].faults, vec![]);
        assert!(graph.is_intact());
        assert_eq!(graph.find(0x20_0045).map(|b| b.address), Some(0x20_0040));
        assert_eq!(graph.find(0x20_0070), None);
        assert_eq!(graph.uncoalesced, vec![]);
    }

    #[test]
    fn cycles_truncate_the_walk() {
        let chain = [0x20_0100, 0x20_0040, 0x20_0400];
        let graph = reconstruct_chain(&chain, |image, zone| image.set_free_next(zone, 0x20_0400, 0x20_0100));

        let slot = &graph.slots[2];
        assert_eq!(slot.addresses(), chain.to_vec());
        assert_eq!(slot.status(), SlotStatus::CorruptFreeList);
        assert!(slot.faults.contains(&SlotFault::Cycle {
            from: 0x20_0400,
            to: 0x20_0100
        }));
        // the other slots are unaffected
        assert!(graph.slots.iter().filter(|s| s.index != 2).all(|s| s.faults.is_empty()));
    }

    #[test]
    fn dangling_links_only_poison_their_slot() {
        let graph = reconstruct_chain(&[0x20_0100], |image, zone| {
            image.set_free_next(zone, 0x20_0100, 0x9990_0000);
            image.free_chain(zone, SizeClass::Tiny, 0, 0, &[(0x20_0800, 1)]);
        });

        let slot = &graph.slots[2];
        assert_eq!(slot.addresses(), vec![0x20_0100]);
        assert!(matches!(
            slot.faults.as_slice(),
            [SlotFault::Dangling { from: 0x20_0100, to: 0x9990_0000, .. }]
        ));
        assert_eq!(graph.slots[0].addresses(), vec![0x20_0800]);
        assert_eq!(graph.slots[0].status(), SlotStatus::Intact);
    }

    #[test]
    fn forged_links_fail_the_checksum() {
        let graph = reconstruct_chain(&[0x20_0100, 0x20_0200], |image, _| {
            // a plain pointer where an encoded one belongs
            image.set_free_next_raw(0x20_0100, 0x20_0310);
        });
        let slot = &graph.slots[2];
        assert_eq!(slot.addresses(), vec![0x20_0100]);
        assert!(slot.faults.contains(&SlotFault::BadChecksum {
            node: 0x20_0100,
            side: LinkSide::Next
        }));
    }

    #[test]
    fn adjacent_free_blocks_are_reported() {
        // msize 3 at 0x200100 ends at 0x200130
        let graph = reconstruct_chain(&[0x20_0100, 0x20_0130], |_, _| {});
        assert_eq!(graph.uncoalesced, vec![(0x20_0100, 0x20_0130)]);
        assert_eq!(graph.overlapping, vec![]);
    }

    #[test]
    fn cancelled_walks_are_incomplete() {
        let layout = layout();
        let mut image = HeapImage::new(layout);
        let zone = image.zone(0x10_0000, None);
        let at = image.magazines(&zone, SizeClass::Tiny, 1, 0x30_0000);
        image.free_chain(&zone, SizeClass::Tiny, 0, 2, &[(0x20_0100, 3)]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let graph = reconstruct_from(&image.finish(), zone, at, &cancel);
        assert!(!graph.complete);
        assert!(graph.slots.is_empty());
    }

    #[test]
    fn long_blocks_overlap_every_block_they_cover() {
        // msize 10 at 0x200100 runs to 0x2001a0, past both msize 3 blocks
        let graph = reconstruct_chain(&[0x20_0120, 0x20_0160], |image, zone| {
            image.free_chain(zone, SizeClass::Tiny, 0, 9, &[(0x20_0100, 10)]);
        });
        assert_eq!(
            graph.overlapping,
            vec![(0x20_0100, 0x20_0120), (0x20_0100, 0x20_0160)]
        );
        assert_eq!(graph.uncoalesced, vec![]);
    }

    #[test]
    fn blocks_in_the_wrong_slot_are_flagged() {
        let graph = reconstruct_chain(&[], |image, zone| {
            image.free_chain(zone, SizeClass::Tiny, 0, 2, &[(0x20_0100, 5)]);
        });
        let slot = &graph.slots[2];
        assert_eq!(slot.addresses(), vec![0x20_0100]);
        assert_eq!(
            slot.faults,
            vec![SlotFault::SizeMismatch {
                node: 0x20_0100,
                msize: 5,
                expected_slot: 4
            }]
        );
    }

    #[test]
    fn a_node_on_two_slots_is_cross_linked() {
        let graph = reconstruct_chain(&[0x20_0100], |image, zone| {
            image.free_chain(zone, SizeClass::Tiny, 0, 3, &[(0x20_0100, 3)]);
        });
        assert_eq!(graph.slots[2].status(), SlotStatus::Intact);
        let slot = &graph.slots[3];
        assert_eq!(slot.addresses(), vec![0x20_0100]);
        assert!(slot.faults.contains(&SlotFault::CrossLinked {
            node: 0x20_0100,
            other: 2
        }));
        assert!(slot.faults.contains(&SlotFault::SizeMismatch {
            node: 0x20_0100,
            msize: 3,
            expected_slot: 2
        }));
    }

    #[test]
    fn slot_bitmap_must_agree_with_the_heads() {
        let graph = reconstruct_chain(&[0x20_0100], |image, zone| {
            image.set_slot_bit(zone, SizeClass::Tiny, 0, 2, false);
            image.set_slot_bit(zone, SizeClass::Tiny, 0, 5, true);
        });
        // the chain is still read
        assert_eq!(graph.slots[2].addresses(), vec![0x20_0100]);
        assert_eq!(
            graph.slots[2].faults,
            vec![SlotFault::OccupancyMismatch { bitmap_set: false }]
        );
        assert_eq!(
            graph.slots[5].faults,
            vec![SlotFault::OccupancyMismatch { bitmap_set: true }]
        );
        assert!(graph.slots[5].blocks.is_empty());
    }
}
