use serde::Serialize;

use super::{le_words, Decode, StructBytes};
use crate::{
    error::StructKind,
    layout::{SizeClass, StructLayout},
    serialize::serde_addr,
    Outcome,
};

/// What the decoder needs to know about a magazine beyond the layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MagazineContext {
    pub class: SizeClass,
    /// -1 for the depot.
    pub index: i32,
    /// Free-list slots in use (see [`ComplexZone::free_slots`]).
    ///
    /// [`ComplexZone::free_slots`]: crate::decode::ComplexZone::free_slots
    pub slots: usize,
}

/// The single block held back by a magazine for quick reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ReuseCache {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub msize: u64,
    #[serde(with = "serde_addr")]
    pub region: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Magazine {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub class: SizeClass,
    pub index: i32,
    pub reuse: Option<ReuseCache>,
    /// Free-list head per slot, null for empty slots.
    pub free_heads: Vec<u64>,
    /// The allocator's own idea of which slots are non-empty.
    pub slot_bitmap: Vec<bool>,
    pub bytes_free_at_end: u64,
    pub bytes_free_at_start: u64,
    #[serde(with = "serde_addr")]
    pub last_region: u64,
    pub num_objects: u64,
    pub num_bytes_in_objects: u64,
    pub num_bytes_in_magazine: u64,
    pub recirculation_entries: u32,
    /// Trailer address of the first region in the list.
    #[serde(with = "serde_addr")]
    pub first_node: u64,
    #[serde(with = "serde_addr")]
    pub last_node: u64,
}

impl Magazine {
    pub fn is_depot(&self) -> bool {
        self.index == -1
    }

    /// Untouched bytes at either end of the last region, as
    /// `(start, end)` spans.
    pub fn untouched_spans(&self, layout: &StructLayout) -> [std::ops::Range<u64>; 2] {
        let span = layout.size_class(self.class).span();
        let base = self.last_region;
        let end = match base.checked_add(span) {
            Some(end) if base != 0 => end,
            _ => return [0..0, 0..0],
        };
        [
            base..base + self.bytes_free_at_start.min(span),
            end - self.bytes_free_at_end.min(span)..end,
        ]
    }
}

impl Decode for Magazine {
    type Context = MagazineContext;
    const KIND: StructKind = StructKind::Magazine;

    fn size(layout: &StructLayout, _: &MagazineContext) -> usize {
        layout.magazine.size
    }

    fn decode_from(b: &StructBytes<'_>, layout: &StructLayout, cx: &MagazineContext) -> Outcome<Self> {
        let m = &layout.magazine;
        let geometry = layout.size_class(cx.class);
        let quantum = geometry.quantum();

        let last_free = b.u64(m.last_free)?;
        let reuse = match last_free & !(quantum - 1) {
            0 => None,
            address => Some(ReuseCache {
                address,
                msize: last_free & (quantum - 1),
                region: b.u64(m.last_free_region)?,
            }),
        };

        if cx.slots > layout.free_list_capacity() {
            return Err(b.malformed(format!("{} free-list slots do not fit", cx.slots)));
        }
        let heads = b.slice(m.free_list)?;
        let free_heads = heads
            .chunks_exact(layout.pointer_size)
            .take(cx.slots)
            .map(|p| u64::from_le_bytes(p.try_into().unwrap_or_default()))
            .collect();
        let slot_bitmap = le_words(b.slice(m.bitmap)?)
            .flat_map(|w| (0..32).map(move |bit| w & (1 << bit) != 0))
            .take(cx.slots)
            .collect();

        let bytes_free_at_end = b.u64(m.bytes_free_at_end)?;
        let bytes_free_at_start = b.u64(m.bytes_free_at_start)?;
        if bytes_free_at_start.saturating_add(bytes_free_at_end) > geometry.span() {
            return Err(b.malformed(format!(
                "{bytes_free_at_start:#x} + {bytes_free_at_end:#x} untouched bytes exceed a region"
            )));
        }

        Ok(Magazine {
            address: b.address(),
            class: cx.class,
            index: cx.index,
            reuse,
            free_heads,
            slot_bitmap,
            bytes_free_at_end,
            bytes_free_at_start,
            last_region: b.u64(m.last_region)?,
            num_objects: b.u64(m.num_objects)?,
            num_bytes_in_objects: b.u64(m.num_bytes_in_objects)?,
            num_bytes_in_magazine: b.u64(m.num_bytes_in_magazine)?,
            recirculation_entries: b.u32(m.recirculation_entries)?,
            first_node: b.u64(m.first_node)?,
            last_node: b.u64(m.last_node)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decode::decode_with,
        layout::{layout_for, Architecture},
        source::Snapshot,
    };

    fn magazine_bytes(layout: &StructLayout) -> Vec<u8> {
        vec![0; layout.magazine.size]
    }

    fn put(bytes: &mut [u8], offset: usize, value: u64) {
        bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn reuse_cache_unpacks_pointer_and_msize() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let m = &layout.magazine;
        let mut bytes = magazine_bytes(layout);
        put(&mut bytes, m.last_free.offset, 0x7000_1230 | 3);
        put(&mut bytes, m.last_free_region.offset, 0x7000_0000);
        put(&mut bytes, m.free_list.offset + 2 * 8, 0x7000_2000);
        bytes[m.bitmap.offset] = 0b100;

        let mut snapshot = Snapshot::new();
        snapshot.store(0x4000, bytes);
        let cx = MagazineContext {
            class: SizeClass::Tiny,
            index: 0,
            slots: 64,
        };
        let mag: Magazine = decode_with(&snapshot, layout, 0x4000, &cx).unwrap();
        assert_eq!(
            mag.reuse,
            Some(ReuseCache {
                address: 0x7000_1230,
                msize: 3,
                region: 0x7000_0000
            })
        );
        assert_eq!(mag.free_heads.len(), 64);
        assert_eq!(mag.free_heads[2], 0x7000_2000);
        let set: Vec<usize> = (0..64).filter(|&i| mag.slot_bitmap[i]).collect();
        assert_eq!(set, vec![2]);
        assert!(!mag.is_depot());
    }

    #[test]
    fn oversized_untouched_space_is_malformed() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let mut bytes = magazine_bytes(layout);
        put(&mut bytes, layout.magazine.bytes_free_at_end.offset, 0x10_0000);
        let mut snapshot = Snapshot::new();
        snapshot.store(0x4000, bytes);
        let cx = MagazineContext {
            class: SizeClass::Tiny,
            index: -1,
            slots: 64,
        };
        let e = decode_with::<Magazine, _>(&snapshot, layout, 0x4000, &cx).unwrap_err();
        assert_eq!(e.kind(), StructKind::Magazine);
        assert!(!e.is_unreadable());
    }

    #[test]
    fn untouched_spans_stay_inside_the_last_region() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let span = layout.tiny.span();
        let cx = MagazineContext {
            class: SizeClass::Tiny,
            index: 0,
            slots: 64,
        };
        let decode_at = |last_region: u64| {
            let mut bytes = magazine_bytes(layout);
            put(&mut bytes, layout.magazine.bytes_free_at_start.offset, 0x40);
            put(&mut bytes, layout.magazine.bytes_free_at_end.offset, 0x100);
            put(&mut bytes, layout.magazine.last_region.offset, last_region);
            let mut snapshot = Snapshot::new();
            snapshot.store(0x4000, bytes);
            decode_with::<Magazine, _>(&snapshot, layout, 0x4000, &cx).unwrap()
        };

        let mag = decode_at(0x100_0000);
        assert_eq!(
            mag.untouched_spans(layout),
            [0x100_0000..0x100_0040, 0x100_0000 + span - 0x100..0x100_0000 + span]
        );
        // a region that would wrap the address space has no untouched space
        let mag = decode_at(u64::MAX - 0xfff);
        assert!(mag.untouched_spans(layout).iter().all(|s| s.is_empty()));
    }
}
