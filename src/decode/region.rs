use std::ops::Range;

use serde::Serialize;

use super::{Decode, StructBytes};
use crate::{
    error::{DecodeError, StructKind},
    layout::{SizeClass, StructLayout},
    serialize::serde_addr,
    source::MemorySource,
    util::num::span,
    Outcome,
};

/// `region_trailer_t`, decoded at its own address. `previous` and `next` are
/// trailer addresses of the neighbouring regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RegionTrailer {
    #[serde(with = "serde_addr")]
    pub address: u64,
    #[serde(with = "serde_addr")]
    pub previous: u64,
    #[serde(with = "serde_addr")]
    pub next: u64,
    pub recirc_suitable: bool,
    pub pinned_to_depot: i32,
    pub bytes_used: u32,
    pub mag_index: i32,
}

impl Decode for RegionTrailer {
    type Context = SizeClass;
    const KIND: StructKind = StructKind::RegionTrailer;

    fn size(layout: &StructLayout, _: &SizeClass) -> usize {
        layout.trailer.size
    }

    fn decode_from(b: &StructBytes<'_>, layout: &StructLayout, class: &SizeClass) -> Outcome<Self> {
        let t = &layout.trailer;
        let bytes_used = b.u32(t.bytes_used)?;
        if u64::from(bytes_used) > layout.size_class(*class).span() {
            return Err(b.malformed(format!(
                "{bytes_used:#x} bytes used in a {class} region"
            )));
        }
        let mag_index = b.i32(t.mag_index)?;
        if mag_index < -1 || mag_index >= layout.magazine.max_count as i32 {
            return Err(b.malformed(format!("magazine index {mag_index}")));
        }
        Ok(RegionTrailer {
            address: b.address(),
            previous: b.u64(t.previous)?,
            next: b.u64(t.next)?,
            recirc_suitable: b.u32(t.recirc_suitable)? != 0,
            pinned_to_depot: b.i32(t.pinned_to_depot)?,
            bytes_used,
            mag_index,
        })
    }
}

/// A region and its trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Region {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub class: SizeClass,
    pub quantum: u64,
    pub quanta: u64,
    pub trailer: RegionTrailer,
}

impl Region {
    /// Decode the region starting at `address`.
    pub fn read<S>(source: &S, layout: &StructLayout, class: SizeClass, address: u64) -> Outcome<Region>
    where
        S: MemorySource + ?Sized,
    {
        let geometry = layout.size_class(class);
        let trailer = address
            .checked_add(geometry.trailer_offset)
            .ok_or_else(|| DecodeError::malformed(StructKind::RegionTrailer, address, "region wraps"))?;
        Self::from_trailer(source, layout, class, trailer)
    }

    /// Decode the region whose trailer is at `trailer`, as found on region
    /// lists.
    pub fn from_trailer<S>(source: &S, layout: &StructLayout, class: SizeClass, trailer: u64) -> Outcome<Region>
    where
        S: MemorySource + ?Sized,
    {
        let geometry = layout.size_class(class);
        let address = trailer
            .checked_sub(geometry.trailer_offset)
            .ok_or_else(|| DecodeError::malformed(StructKind::RegionTrailer, trailer, "no room for a region before it"))?;
        let trailer: RegionTrailer = super::decode_with(source, layout, trailer, &class)?;
        Ok(Region {
            address,
            class,
            quantum: geometry.quantum(),
            quanta: geometry.region_quanta,
            trailer,
        })
    }

    /// The allocatable part of the region.
    pub fn span(&self) -> Range<u64> {
        span(self.address, self.quanta * self.quantum)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.span().contains(&address)
    }

    /// Index of the quantum containing `address`, if it is in this region.
    pub fn granule_of(&self, address: u64) -> Option<u64> {
        self.contains(address)
            .then(|| (address - self.address) / self.quantum)
    }

    pub fn granule_address(&self, index: u64) -> u64 {
        self.address + index * self.quantum
    }

    /// The raw occupancy metadata.
    pub fn read_metadata<S>(&self, source: &S, layout: &StructLayout) -> Outcome<Vec<u8>>
    where
        S: MemorySource + ?Sized,
    {
        let geometry = layout.size_class(self.class);
        let at = self.address + geometry.metadata_offset;
        source
            .read(at, geometry.metadata_size as usize)
            .map_err(|e| DecodeError::unreadable(StructKind::RegionMetadata, at, e))
    }
}

/// `region_hash_generation_t`: an open-addressed table of region pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RegionGeneration {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub num_regions_allocated: u64,
    pub shift: u64,
    #[serde(with = "serde_addr")]
    pub hashed_regions: u64,
    #[serde(with = "serde_addr")]
    pub nextgen: u64,
}

/// Table slots holding these are not regions.
const HASH_EMPTY: u64 = 0;
const HASH_DEALLOCATED: u64 = u64::MAX;

impl Decode for RegionGeneration {
    type Context = ();
    const KIND: StructKind = StructKind::RegionGeneration;

    fn size(layout: &StructLayout, _: &()) -> usize {
        layout.region_generation.size
    }

    fn decode_from(b: &StructBytes<'_>, layout: &StructLayout, _: &()) -> Outcome<Self> {
        let g = &layout.region_generation;
        let num_regions_allocated = b.u64(g.num_regions_allocated)?;
        if num_regions_allocated > layout.limits.max_regions {
            return Err(b.malformed(format!("{num_regions_allocated} hash slots")));
        }
        Ok(RegionGeneration {
            address: b.address(),
            num_regions_allocated,
            shift: b.u64(g.shift)?,
            hashed_regions: b.u64(g.hashed_regions)?,
            nextgen: b.u64(g.nextgen)?,
        })
    }
}

impl RegionGeneration {
    /// Region base addresses in table order.
    pub fn regions<S>(&self, source: &S, layout: &StructLayout) -> Outcome<Vec<u64>>
    where
        S: MemorySource + ?Sized,
    {
        if self.hashed_regions == 0 {
            return Ok(Vec::new());
        }
        let bytes = source
            .read(self.hashed_regions, self.num_regions_allocated as usize * layout.pointer_size)
            .map_err(|e| DecodeError::unreadable(StructKind::RegionGeneration, self.hashed_regions, e))?;
        Ok(bytes
            .chunks_exact(8)
            .map(|p| u64::from_le_bytes(p.try_into().unwrap_or_default()))
            .filter(|&r| r != HASH_EMPTY && r != HASH_DEALLOCATED)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::{layout_for, Architecture},
        source::Snapshot,
    };

    fn trailer(layout: &StructLayout, bytes_used: u32, mag_index: i32) -> Vec<u8> {
        let t = &layout.trailer;
        let mut bytes = vec![0; t.size];
        bytes[t.next.offset..t.next.offset + 8].copy_from_slice(&0xdead_0000u64.to_le_bytes());
        bytes[t.bytes_used.offset..t.bytes_used.offset + 4].copy_from_slice(&bytes_used.to_le_bytes());
        bytes[t.mag_index.offset..t.mag_index.offset + 4].copy_from_slice(&mag_index.to_le_bytes());
        bytes
    }

    #[test]
    fn region_and_trailer_addresses_agree() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let base = 0x10_0000;
        let mut snapshot = Snapshot::new();
        snapshot.store(base + layout.tiny.trailer_offset, trailer(layout, 0x40, -1));

        let region = Region::read(&snapshot, layout, SizeClass::Tiny, base).unwrap();
        assert_eq!(region.trailer.address, 0x1f_c080);
        assert_eq!(region.trailer.next, 0xdead_0000);
        assert_eq!(region.trailer.mag_index, -1);
        assert_eq!(
            Region::from_trailer(&snapshot, layout, SizeClass::Tiny, 0x1f_c080).unwrap(),
            region
        );
        assert_eq!(region.granule_of(base + 0x35), Some(3));
        assert_eq!(region.granule_of(base + 0xfc080), None);
    }

    #[test]
    fn impossible_trailers_are_malformed() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let base = 0x10_0000;
        let mut snapshot = Snapshot::new();
        snapshot.store(base + layout.tiny.trailer_offset, trailer(layout, 0x10_0000, 0));
        assert!(Region::read(&snapshot, layout, SizeClass::Tiny, base).is_err());

        snapshot.store(base + layout.tiny.trailer_offset, trailer(layout, 0, 40));
        let e = Region::read(&snapshot, layout, SizeClass::Tiny, base).unwrap_err();
        assert_eq!(e.to_string(), "region trailer at 0x1fc080 is malformed: magazine index 40");
    }
}
