use log::warn;
use serde::Serialize;

use super::{Decode, StructBytes};
use crate::{
    error::{DecodeError, StructKind},
    layout::{MagazineSetFields, SizeClass, StructLayout},
    serialize::serde_addr,
    source::MemorySource,
    Outcome,
};

/// The basic zone header. `complex` is where the complex zone starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Zone {
    #[serde(with = "serde_addr")]
    pub address: u64,
    #[serde(with = "serde_addr")]
    pub name_address: u64,
    /// Absent when there is no name pointer or it cannot be read.
    pub name: Option<String>,
    pub version: u32,
    #[serde(with = "serde_addr")]
    pub introspect: u64,
    #[serde(with = "serde_addr")]
    pub complex: u64,
}

impl Decode for Zone {
    type Context = ();
    const KIND: StructKind = StructKind::Zone;

    fn size(layout: &StructLayout, _: &()) -> usize {
        layout.zone.size
    }

    fn decode_from(b: &StructBytes<'_>, layout: &StructLayout, _: &()) -> Outcome<Self> {
        let z = &layout.zone;
        Ok(Zone {
            address: b.address(),
            name_address: b.u64(z.name)?,
            name: None,
            version: b.u32(z.version)?,
            introspect: b.u64(z.introspect)?,
            complex: b.address() + z.complex_offset,
        })
    }
}

impl Zone {
    /// Decode the zone header and its name.
    pub fn read<S>(source: &S, layout: &StructLayout, address: u64) -> Outcome<Zone>
    where
        S: MemorySource + ?Sized,
    {
        let mut zone: Zone = super::decode(source, layout, address)?;
        if zone.name_address != 0 {
            match source.read_cstring(zone.name_address, layout.limits.max_zone_name) {
                Ok(name) => zone.name = Some(name),
                Err(e) => warn!("zone at {address:#x}: name unreadable: {e}"),
            }
        }
        Ok(zone)
    }
}

/// Follow the zone registry (a pointer to a null-terminated array of zone
/// pointers) and return the zone addresses in registry order.
pub fn zone_addresses<S>(source: &S, layout: &StructLayout, registry: u64) -> Outcome<Vec<u64>>
where
    S: MemorySource + ?Sized,
{
    let unreadable = |at, e| DecodeError::unreadable(StructKind::ZoneRegistry, at, e);
    let array = source.read_u64(registry).map_err(|e| unreadable(registry, e))?;
    if array == 0 {
        return Ok(Vec::new());
    }
    let mut zones = Vec::new();
    for i in 0..=layout.limits.max_zones {
        let slot = array + (i * layout.pointer_size) as u64;
        let zone = source.read_u64(slot).map_err(|e| unreadable(slot, e))?;
        if zone == 0 {
            return Ok(zones);
        }
        zones.push(zone);
    }
    Err(DecodeError::malformed(
        StructKind::ZoneRegistry,
        array,
        format!("no terminator within {} entries", layout.limits.max_zones),
    ))
}

/// One size class worth of a complex zone: its region bookkeeping and where
/// its magazines live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MagazineSet {
    pub class: SizeClass,
    pub num_regions: u64,
    #[serde(with = "serde_addr")]
    pub region_generation: u64,
    /// Not counting the depot.
    pub num_magazines: u32,
    /// Address of magazine 0.
    #[serde(with = "serde_addr")]
    pub magazines: u64,
}

impl MagazineSet {
    fn decode(b: &StructBytes<'_>, layout: &StructLayout, class: SizeClass) -> Outcome<Self> {
        let fields: &MagazineSetFields = layout.magazine_set(class);
        let num_regions = b.u64(fields.num_regions)?;
        if num_regions > layout.limits.max_regions {
            return Err(b.malformed(format!("{num_regions} {class} regions")));
        }
        let num_magazines = b.i32(fields.num_magazines)?;
        let max = layout.magazine.max_count.min(layout.limits.max_magazines as u32);
        let num_magazines = match u32::try_from(num_magazines) {
            Ok(n) if n <= max => n,
            _ => {
                return Err(b.malformed(format!(
                    "{num_magazines} {class} magazines, at most {max} allowed"
                )))
            }
        };
        let magazines = b.u64(fields.magazines)?;
        if magazines == 0 && num_magazines > 0 {
            return Err(b.malformed(format!("{num_magazines} {class} magazines at null")));
        }
        Ok(MagazineSet {
            class,
            num_regions,
            region_generation: b.u64(fields.region_generation)?,
            num_magazines,
            magazines,
        })
    }

    /// Magazine indices, depot (-1) first.
    pub fn indices(&self, layout: &StructLayout) -> std::ops::Range<i32> {
        let first = if layout.magazine.depot_before_array { -1 } else { 0 };
        first..self.num_magazines as i32
    }

    pub fn magazine_address(&self, layout: &StructLayout, index: i32) -> u64 {
        let offset = i64::from(index) * layout.magazine.size as i64;
        self.magazines.wrapping_add_signed(offset)
    }
}

/// `large_entry_t`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct LargeEntry {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub size: u64,
    pub did_madvise_reusable: bool,
}

impl LargeEntry {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size
    }

    pub fn is_empty(&self) -> bool {
        self.address == 0
    }
}

impl Decode for LargeEntry {
    type Context = ();
    const KIND: StructKind = StructKind::LargeEntry;

    fn size(layout: &StructLayout, _: &()) -> usize {
        layout.large_entry.size
    }

    fn decode_from(b: &StructBytes<'_>, layout: &StructLayout, _: &()) -> Outcome<Self> {
        let e = &layout.large_entry;
        Ok(LargeEntry {
            address: b.u64(e.address)?,
            size: b.u64(e.length)?,
            did_madvise_reusable: b.u32(e.did_madvise_reusable)? != 0,
        })
    }
}

/// The large-allocation bookkeeping of a complex zone. `cache` is the
/// death-row cache of recently freed large blocks, kept inline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LargeTable {
    pub num_in_use: u32,
    pub num_entries: u32,
    #[serde(with = "serde_addr")]
    pub entries: u64,
    pub bytes_in_use: u64,
    pub cache_newest: i32,
    pub cache_oldest: i32,
    pub cache: Vec<LargeEntry>,
}

/// `szone_t`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComplexZone {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub debug_flags: u32,
    pub tiny: MagazineSet,
    pub small: MagazineSet,
    pub num_small_slots: u32,
    pub large: LargeTable,
    pub large_threshold: u32,
    pub cookie: u64,
    #[serde(with = "serde_addr")]
    pub helper_zone: u64,
}

impl ComplexZone {
    pub fn magazine_set(&self, class: SizeClass) -> &MagazineSet {
        match class {
            SizeClass::Tiny => &self.tiny,
            SizeClass::Small => &self.small,
        }
    }

    /// Free-list slots used by `class` magazines of this zone. Small zones may
    /// override the layout's count.
    pub fn free_slots(&self, layout: &StructLayout, class: SizeClass) -> usize {
        let default = layout.size_class(class).free_slots;
        match class {
            SizeClass::Small
                if self.num_small_slots != 0
                    && self.num_small_slots as usize <= layout.free_list_capacity() =>
            {
                self.num_small_slots as usize
            }
            _ => default,
        }
    }
}

impl Decode for ComplexZone {
    type Context = ();
    const KIND: StructKind = StructKind::ComplexZone;

    fn size(layout: &StructLayout, _: &()) -> usize {
        layout.complex_zone.size
    }

    fn decode_from(b: &StructBytes<'_>, layout: &StructLayout, _: &()) -> Outcome<Self> {
        let cz = &layout.complex_zone;
        let num_entries = b.u32(cz.large.num_entries)?;
        if num_entries as usize > layout.limits.max_large_entries {
            return Err(b.malformed(format!("{num_entries} large entries")));
        }
        let cache_len = cz.large.cache.size / layout.large_entry.size;
        let mut cache = Vec::with_capacity(cache_len);
        for i in 0..cache_len {
            let entry = b.element(cz.large.cache, layout.large_entry.size, i, StructKind::LargeEntry)?;
            cache.push(LargeEntry::decode_from(&entry, layout, &())?);
        }
        let cache_newest = b.i32(cz.large.cache_newest)?;
        let cache_oldest = b.i32(cz.large.cache_oldest)?;
        for index in [cache_newest, cache_oldest] {
            if usize::try_from(index).map_or(true, |i| i >= cache_len) {
                return Err(b.malformed(format!("large cache index {index} out of range")));
            }
        }
        Ok(ComplexZone {
            address: b.address(),
            debug_flags: b.u32(cz.debug_flags)?,
            tiny: MagazineSet::decode(b, layout, SizeClass::Tiny)?,
            small: MagazineSet::decode(b, layout, SizeClass::Small)?,
            num_small_slots: b.u32(cz.num_small_slots)?,
            large: LargeTable {
                num_in_use: b.u32(cz.large.num_in_use)?,
                num_entries,
                entries: b.u64(cz.large.entries)?,
                bytes_in_use: b.u64(cz.large.bytes_in_use)?,
                cache_newest,
                cache_oldest,
                cache,
            },
            large_threshold: b.u32(cz.large_threshold)?,
            cookie: b.u64(cz.cookie)?,
            helper_zone: b.u64(cz.helper_zone)?,
        })
    }
}

/// Entries of the large table that are in use.
pub fn large_entries<S>(source: &S, layout: &StructLayout, table: &LargeTable) -> Outcome<Vec<LargeEntry>>
where
    S: MemorySource + ?Sized,
{
    if table.entries == 0 || table.num_entries == 0 {
        return Ok(Vec::new());
    }
    let size = layout.large_entry.size;
    let bytes = source
        .read(table.entries, table.num_entries as usize * size)
        .map_err(|e| DecodeError::unreadable(StructKind::LargeEntry, table.entries, e))?;
    let view = StructBytes::new(StructKind::LargeEntry, table.entries, &bytes);
    let whole = crate::layout::Field::new(0, bytes.len());
    let mut entries = Vec::new();
    for i in 0..table.num_entries as usize {
        let entry = LargeEntry::decode_from(&view.element(whole, size, i, StructKind::LargeEntry)?, layout, &())?;
        if !entry.is_empty() {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::{layout_for, Architecture},
        synth::HeapImage,
    };

    #[test]
    fn zone_header_and_name_decode() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let mut image = HeapImage::new(layout);
        let zone = image.zone(0x10_0000, Some("DefaultMallocZone"));
        let snapshot = image.finish();

        let decoded = Zone::read(&snapshot, layout, zone.address).unwrap();
        assert_eq!(decoded.name.as_deref(), Some("DefaultMallocZone"));
        assert_eq!(decoded.version, 8);
        assert_eq!(decoded.complex, 0x10_1000);
    }

    #[test]
    fn registry_needs_a_terminator() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let mut image = HeapImage::new(layout);
        image.registry(0x9000, &[0x10_0000, 0x20_0000]);
        let mut snapshot = image.finish();
        assert_eq!(
            zone_addresses(&snapshot, layout, 0x9000).unwrap(),
            vec![0x10_0000, 0x20_0000]
        );

        // overwrite the terminator and everything after it
        let array = snapshot.read_u64(0x9000).unwrap();
        for i in 2..=layout.limits.max_zones as u64 + 1 {
            snapshot.store_u64(array + i * 8, 0x30_0000);
        }
        assert!(matches!(
            zone_addresses(&snapshot, layout, 0x9000),
            Err(DecodeError::Malformed { kind: StructKind::ZoneRegistry, .. })
        ));
    }

    #[test]
    fn impossible_magazine_counts_are_malformed() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let mut image = HeapImage::new(layout);
        let zone = image.zone(0x10_0000, None);
        image.magazines(&zone, SizeClass::Tiny, 1, 0x30_0000);
        let mut snapshot = image.finish();
        let count = zone.complex + layout.complex_zone.tiny.num_magazines.offset as u64;

        snapshot.store(count, (-3i32).to_le_bytes().to_vec());
        let e = super::super::decode::<ComplexZone, _>(&snapshot, layout, zone.complex).unwrap_err();
        assert_eq!(e.kind(), StructKind::ComplexZone);
        assert!(e.to_string().contains("-3 tiny magazines"));

        snapshot.store(count, 33i32.to_le_bytes().to_vec());
        assert!(super::super::decode::<ComplexZone, _>(&snapshot, layout, zone.complex).is_err());

        snapshot.store(count, 2i32.to_le_bytes().to_vec());
        let cz = super::super::decode::<ComplexZone, _>(&snapshot, layout, zone.complex).unwrap();
        assert_eq!(cz.tiny.indices(layout), -1..2);
        assert_eq!(
            cz.tiny.magazine_address(layout, -1),
            cz.tiny.magazines - layout.magazine.size as u64
        );
    }
}
