//! Hand-built heap images.
//!
//! [`HeapImage`] writes allocator structures into a [`Snapshot`] exactly as
//! the [`StructLayout`] describes them, so the decoder can be exercised
//! without a live allocator. Nothing here validates what it writes: building
//! broken heaps on purpose is the point.

use crate::{
    decode::{encode_link, LargeEntry},
    heap::bitmap::Granule,
    layout::{MetadataFormat, SizeClass, SizeClassLayout, StructLayout},
    source::{MemorySource, Snapshot},
};

/// Where [`HeapImage::zone`] put things.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneHandle {
    pub address: u64,
    pub complex: u64,
}

pub struct HeapImage<'l> {
    layout: &'l StructLayout,
    snapshot: Snapshot,
    cookie: u64,
}

/// `base` with tiny regions of `quanta` quanta described by a packed bitmap,
/// one bit per quantum with set meaning in use. Small enough to place by hand.
pub fn compact_layout(base: &StructLayout, quanta: u64) -> StructLayout {
    let mut layout = base.clone();
    let tiny = &base.tiny;
    layout.tiny = SizeClassLayout {
        slot_bias: tiny.slot_bias,
        slot_divisor: tiny.slot_divisor,
        ..SizeClassLayout::with_geometry(
            tiny.quantum_shift,
            quanta,
            tiny.free_slots,
            MetadataFormat::Packed {
                set_means_in_use: true,
            },
            base.trailer.size,
        )
    };
    layout
}

impl<'l> HeapImage<'l> {
    pub const DEFAULT_COOKIE: u64 = 0x5a5a_1234_dead_beef;

    pub fn new(layout: &'l StructLayout) -> Self {
        Self {
            layout,
            snapshot: Snapshot::new(),
            cookie: Self::DEFAULT_COOKIE,
        }
    }

    /// Cookie written into zones created after this call.
    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn layout(&self) -> &'l StructLayout {
        self.layout
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn finish(self) -> Snapshot {
        self.snapshot
    }

    fn put(&mut self, address: u64, bytes: &[u8]) {
        self.snapshot.store(address, bytes.to_vec());
    }

    fn put_u64(&mut self, address: u64, value: u64) {
        self.snapshot.store_u64(address, value);
    }

    fn put_u32(&mut self, address: u64, value: u32) {
        self.put(address, &value.to_le_bytes());
    }

    /// Unmapped reads as zero; this only reads back what was written.
    fn get_u64(&self, address: u64) -> u64 {
        self.snapshot.read_u64(address).unwrap_or(0)
    }

    fn zeroes(&mut self, address: u64, len: usize) {
        self.put(address, &vec![0; len]);
    }

    fn complex_field(&self, zone: &ZoneHandle, offset: usize) -> u64 {
        zone.complex + offset as u64
    }

    /// Point the variable at `at` to a null-terminated array of `zones`,
    /// placed right after it.
    pub fn registry(&mut self, at: u64, zones: &[u64]) {
        let array = at + 0x10;
        self.put_u64(at, array);
        for (i, &zone) in zones.iter().chain([&0]).enumerate() {
            self.put_u64(array + i as u64 * 8, zone);
        }
    }

    /// A zone header and an empty complex zone. The name, if any, goes just
    /// past the header.
    pub fn zone(&mut self, address: u64, name: Option<&str>) -> ZoneHandle {
        let l = self.layout;
        let complex = address + l.zone.complex_offset;
        self.zeroes(address, l.zone.size);
        self.put_u32(address + l.zone.version.offset as u64, l.version);
        if let Some(name) = name {
            let at = address + l.zone.size as u64;
            let mut bytes = name.as_bytes().to_vec();
            bytes.push(0);
            self.put(at, &bytes);
            self.put_u64(address + l.zone.name.offset as u64, at);
        }
        self.zeroes(complex, l.complex_zone.size);
        let handle = ZoneHandle { address, complex };
        self.put_u64(self.complex_field(&handle, l.complex_zone.cookie.offset), self.cookie);
        handle
    }

    /// Make `helper` the helper zone of `zone`.
    pub fn helper(&mut self, zone: &ZoneHandle, helper: &ZoneHandle) {
        let at = self.complex_field(zone, self.layout.complex_zone.helper_zone.offset);
        self.put_u64(at, helper.complex);
    }

    /// Give `zone` `count` zeroed `class` magazines plus the depot, all
    /// starting at `at` (where the depot goes). Returns the address of
    /// magazine 0.
    pub fn magazines(&mut self, zone: &ZoneHandle, class: SizeClass, count: u32, at: u64) -> u64 {
        let l = self.layout;
        let size = l.magazine.size as u64;
        let first = if l.magazine.depot_before_array { at + size } else { at };
        self.zeroes(at, (size * (u64::from(count) + 1)) as usize);
        let set = l.magazine_set(class);
        self.put_u32(self.complex_field(zone, set.num_magazines.offset), count);
        self.put_u64(self.complex_field(zone, set.magazines.offset), first);
        first
    }

    pub fn magazine_address(&self, zone: &ZoneHandle, class: SizeClass, index: i32) -> u64 {
        let l = self.layout;
        let first = self.get_u64(self.complex_field(zone, l.magazine_set(class).magazines.offset));
        first.wrapping_add_signed(i64::from(index) * l.magazine.size as i64)
    }

    pub fn set_num_regions(&mut self, zone: &ZoneHandle, class: SizeClass, n: u64) {
        let at = self.complex_field(zone, self.layout.magazine_set(class).num_regions.offset);
        self.put_u64(at, n);
    }

    /// An unlinked region at `base` owned by magazine `mag_index`, with all
    /// metadata zeroed.
    pub fn region(&mut self, class: SizeClass, base: u64, mag_index: i32) -> u64 {
        let l = self.layout;
        let g = l.size_class(class);
        let trailer = base + g.trailer_offset;
        self.zeroes(trailer, l.trailer.size);
        self.put(trailer + l.trailer.mag_index.offset as u64, &mag_index.to_le_bytes());
        self.zeroes(base + g.metadata_offset, g.metadata_size as usize);
        base
    }

    /// Chain `regions` (base addresses) into the region list of magazine
    /// `index`, in order, and count them in the zone.
    pub fn link_regions(&mut self, zone: &ZoneHandle, class: SizeClass, index: i32, regions: &[u64]) {
        let l = self.layout;
        let offset = l.size_class(class).trailer_offset;
        let trailers: Vec<u64> = regions.iter().map(|r| r + offset).collect();
        for (i, &t) in trailers.iter().enumerate() {
            let previous = if i == 0 { 0 } else { trailers[i - 1] };
            let next = trailers.get(i + 1).copied().unwrap_or(0);
            self.put_u64(t + l.trailer.previous.offset as u64, previous);
            self.put_u64(t + l.trailer.next.offset as u64, next);
        }
        let mag = self.magazine_address(zone, class, index);
        let first = trailers.first().copied().unwrap_or(0);
        let last = trailers.last().copied().unwrap_or(0);
        self.put_u64(mag + l.magazine.first_node.offset as u64, first);
        self.put_u64(mag + l.magazine.last_node.offset as u64, last);
        let counted = self.get_u64(self.complex_field(zone, l.magazine_set(class).num_regions.offset));
        self.set_num_regions(zone, class, counted + regions.len() as u64);
    }

    /// Overwrite the `next` link of the trailer at `trailer`.
    pub fn set_region_next(&mut self, trailer: u64, next: u64) {
        self.put_u64(trailer + self.layout.trailer.next.offset as u64, next);
    }

    /// Write free nodes at `blocks` (address, msize) as the chain of `slot`
    /// of magazine `index`, and set the slot's head and bitmap bit.
    pub fn free_chain(
        &mut self,
        zone: &ZoneHandle,
        class: SizeClass,
        index: i32,
        slot: usize,
        blocks: &[(u64, u64)],
    ) {
        let l = self.layout;
        let n = &l.free_node;
        let cookie = self.zone_cookie(zone);
        for (i, &(address, msize)) in blocks.iter().enumerate() {
            let previous = if i == 0 { 0 } else { blocks[i - 1].0 };
            let next = blocks.get(i + 1).map_or(0, |b| b.0);
            self.put_u64(address + n.previous.offset as u64, encode_link(previous, n.link_encoding, cookie));
            self.put_u64(address + n.next.offset as u64, encode_link(next, n.link_encoding, cookie));
            if !(n.implicit_unit_msize && slot == 0) {
                self.put(address + n.msize.offset as u64, &(msize as u16).to_le_bytes());
            }
        }
        let mag = self.magazine_address(zone, class, index);
        let head = blocks.first().map_or(0, |b| b.0);
        self.put_u64(mag + (l.magazine.free_list.offset + slot * l.pointer_size) as u64, head);
        self.set_slot_bit(zone, class, index, slot, head != 0);
    }

    /// Set or clear the `mag_bitmap` bit of `slot` in magazine `index`,
    /// leaving the head alone.
    pub fn set_slot_bit(&mut self, zone: &ZoneHandle, class: SizeClass, index: i32, slot: usize, set: bool) {
        let mag = self.magazine_address(zone, class, index);
        let word = mag + (self.layout.magazine.bitmap.offset + slot / 32 * 4) as u64;
        let bits = self.snapshot.read_u32(word).unwrap_or(0);
        let bits = if set {
            bits | 1 << (slot % 32)
        } else {
            bits & !(1 << (slot % 32))
        };
        self.put_u32(word, bits);
    }

    /// Overwrite the `next` link of the free node at `node`, encoded with the
    /// zone's cookie.
    pub fn set_free_next(&mut self, zone: &ZoneHandle, node: u64, next: u64) {
        let n = &self.layout.free_node;
        let raw = encode_link(next, n.link_encoding, self.zone_cookie(zone));
        self.put_u64(node + n.next.offset as u64, raw);
    }

    /// Overwrite the `next` link of the free node at `node` as is.
    pub fn set_free_next_raw(&mut self, node: u64, raw: u64) {
        self.put_u64(node + self.layout.free_node.next.offset as u64, raw);
    }

    fn zone_cookie(&self, zone: &ZoneHandle) -> u64 {
        self.get_u64(self.complex_field(zone, self.layout.complex_zone.cookie.offset))
    }

    /// Describe `msize` quanta from quantum `start` of the region at `base` as
    /// one block in the given state.
    pub fn mark(&mut self, class: SizeClass, base: u64, start: u64, msize: u64, state: Granule) {
        let g = self.layout.size_class(class);
        let meta = base + g.metadata_offset;
        let mut bytes = self
            .snapshot
            .read(meta, g.metadata_size as usize)
            .unwrap_or_else(|_| vec![0; g.metadata_size as usize]);
        let in_use = state == Granule::InUse;
        let set_bit = |bytes: &mut [u8], word: u64, i: u64, on: bool| {
            let byte = (word * 4 + (i % 32) / 8) as usize;
            let mask = 1u8 << (i % 8);
            if on {
                bytes[byte] |= mask;
            } else {
                bytes[byte] &= !mask;
            }
        };
        match g.metadata {
            MetadataFormat::Packed { set_means_in_use } => {
                for i in start..start + msize {
                    set_bit(&mut bytes, i / 32, i, in_use == set_means_in_use);
                }
            }
            MetadataFormat::HeaderInuse => {
                for i in start..start + msize {
                    let pair = i / 32 * 2;
                    set_bit(&mut bytes, pair, i, i == start);
                    set_bit(&mut bytes, pair + 1, i, i == start && in_use);
                }
            }
            MetadataFormat::MsizeTable => {
                for i in start..start + msize {
                    let entry: u16 = if i == start {
                        msize as u16 | if in_use { 0 } else { 0x8000 }
                    } else {
                        0
                    };
                    let at = i as usize * 2;
                    bytes[at..at + 2].copy_from_slice(&entry.to_le_bytes());
                }
            }
        }
        self.put(meta, &bytes);
    }

    /// Put the block at `address` in magazine `index`'s reuse cache.
    pub fn reuse_cache(&mut self, zone: &ZoneHandle, class: SizeClass, index: i32, address: u64, msize: u64, region: u64) {
        let l = self.layout;
        let mag = self.magazine_address(zone, class, index);
        self.put_u64(mag + l.magazine.last_free.offset as u64, address | msize);
        self.put_u64(mag + l.magazine.last_free_region.offset as u64, region);
    }

    /// Make `region` magazine `index`'s last region, with untouched space at
    /// both ends.
    pub fn last_region(
        &mut self,
        zone: &ZoneHandle,
        class: SizeClass,
        index: i32,
        region: u64,
        free_at_start: u64,
        free_at_end: u64,
    ) {
        let l = self.layout;
        let m = &l.magazine;
        let mag = self.magazine_address(zone, class, index);
        self.put_u64(mag + m.last_region.offset as u64, region);
        self.put_u64(mag + m.bytes_free_at_start.offset as u64, free_at_start);
        self.put_u64(mag + m.bytes_free_at_end.offset as u64, free_at_end);
    }

    fn write_large_entry(&mut self, at: u64, entry: &LargeEntry) {
        let e = &self.layout.large_entry;
        self.zeroes(at, e.size);
        self.put_u64(at + e.address.offset as u64, entry.address);
        self.put_u64(at + e.length.offset as u64, entry.size);
        self.put_u32(at + e.did_madvise_reusable.offset as u64, entry.did_madvise_reusable as u32);
    }

    /// The large table of `zone`, stored at `at`.
    pub fn large_entries(&mut self, zone: &ZoneHandle, at: u64, entries: &[LargeEntry]) {
        let l = self.layout;
        let large = &l.complex_zone.large;
        for (i, entry) in entries.iter().enumerate() {
            self.write_large_entry(at + (i * l.large_entry.size) as u64, entry);
        }
        self.put_u64(self.complex_field(zone, large.entries.offset), at);
        self.put_u32(self.complex_field(zone, large.num_entries.offset), entries.len() as u32);
        self.put_u32(self.complex_field(zone, large.num_in_use.offset), entries.len() as u32);
        let bytes: u64 = entries.iter().map(|e| e.size).sum();
        self.put_u64(self.complex_field(zone, large.bytes_in_use.offset), bytes);
    }

    /// Entry `slot` of the death-row cache.
    pub fn cache_large(&mut self, zone: &ZoneHandle, slot: usize, entry: &LargeEntry) {
        let l = self.layout;
        let at = self.complex_field(zone, l.complex_zone.large.cache.offset + slot * l.large_entry.size);
        self.write_large_entry(at, entry);
    }

    /// A region hash generation at `at` whose table (right after it) lists
    /// `regions`, made current for `class`.
    pub fn hash_regions(&mut self, zone: &ZoneHandle, class: SizeClass, at: u64, regions: &[u64]) {
        let l = self.layout;
        let g = &l.region_generation;
        let table = at + g.size as u64;
        // leave an empty slot and a tombstone in the table
        let slots: Vec<u64> = [0, u64::MAX].into_iter().chain(regions.iter().copied()).collect();
        self.zeroes(at, g.size);
        self.put_u64(at + g.num_regions_allocated.offset as u64, slots.len() as u64);
        self.put_u64(at + g.hashed_regions.offset as u64, table);
        self.put_u64(at + g.nextgen.offset as u64, at);
        for (i, r) in slots.iter().enumerate() {
            self.put_u64(table + i as u64 * 8, *r);
        }
        let field = self.complex_field(zone, l.magazine_set(class).region_generation.offset);
        self.put_u64(field, at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decode::{decode, ComplexZone},
        layout::{layout_for, Architecture},
    };

    #[test]
    fn compact_layout_is_valid() {
        let base = layout_for(Architecture::X86_64, 8).unwrap();
        let layout = compact_layout(base, 256);
        assert_eq!(layout.validate(), Ok(()));
        assert_eq!(layout.tiny.span(), 0x1000);
        assert_eq!(layout.tiny.trailer_offset, 0x1000);
    }

    #[test]
    fn zones_written_here_decode() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let mut image = HeapImage::new(layout).with_cookie(0x1234);
        let zone = image.zone(0x10_0000, Some("scratch"));
        let first = image.magazines(&zone, SizeClass::Small, 2, 0x30_0000);
        let snapshot = image.finish();

        let cz: ComplexZone = decode(&snapshot, layout, zone.complex).unwrap();
        assert_eq!(cz.cookie, 0x1234);
        assert_eq!(cz.small.num_magazines, 2);
        assert_eq!(cz.small.magazines, first);
        assert_eq!(first, 0x30_0000 + layout.magazine.size as u64);
        assert_eq!(cz.tiny.num_magazines, 0);
    }
}
