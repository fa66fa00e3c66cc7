//! Byte layouts of the allocator structures, per architecture and allocator
//! version.
//!
//! A [`StructLayout`] is plain data. The decoder never hard-codes an offset;
//! everything it reads is looked up here, so supporting another allocator
//! build is a matter of adding a layout (see [`LayoutCatalog::load_file`]).

mod catalog;

pub use catalog::{layout_for, LayoutCatalog};

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::num::log2ceil;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86_64,
    Aarch64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Aarch64 => "aarch64",
        })
    }
}

impl FromStr for Architecture {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "x86-64" | "amd64" => Ok(Architecture::X86_64),
            "aarch64" | "arm64" => Ok(Architecture::Aarch64),
            _ => Err(LayoutError::UnknownArchitecture(s.to_owned())),
        }
    }
}

/// The two magazine-backed size classes. Large allocations are tracked in a
/// table instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Tiny,
    Small,
}

impl SizeClass {
    pub const ALL: [SizeClass; 2] = [SizeClass::Tiny, SizeClass::Small];
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SizeClass::Tiny => "tiny",
            SizeClass::Small => "small",
        })
    }
}

/// `size` bytes at `offset` from the start of the containing structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub offset: usize,
    pub size: usize,
}

impl Field {
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// One past the last byte, or `None` if that does not fit in a `usize`.
    pub const fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.size)
    }
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{structure}: fields `{first}` and `{second}` overlap")]
    Overlap {
        structure: &'static str,
        first: &'static str,
        second: &'static str,
    },
    #[error("{structure}: field `{field}` ends at {end:#x}, past the struct size {size:#x}")]
    OutOfBounds {
        structure: &'static str,
        field: &'static str,
        end: usize,
        size: usize,
    },
    #[error("{structure}: field `{field}` is {size} bytes, expected a multiple of {unit}")]
    BadWidth {
        structure: &'static str,
        field: &'static str,
        size: usize,
        unit: usize,
    },
    #[error("{class} regions: {reason}")]
    BadGeometry { class: SizeClass, reason: String },
    #[error("only 8-byte pointers are supported, got {0}")]
    UnsupportedPointerSize(usize),
    #[error("unknown architecture `{0}`")]
    UnknownArchitecture(String),
}

/// The basic zone header (`malloc_zone_t`). The complex zone starts
/// `complex_offset` bytes after it (one target page).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneLayout {
    pub size: usize,
    pub name: Field,
    pub introspect: Field,
    pub version: Field,
    pub complex_offset: u64,
}

/// Per size class fields of the complex zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagazineSetFields {
    pub num_regions: Field,
    /// Pointer to the current region hash generation.
    pub region_generation: Field,
    /// Signed. The depot is not counted.
    pub num_magazines: Field,
    /// Points at magazine 0.
    pub magazines: Field,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargeTableFields {
    pub num_in_use: Field,
    pub num_entries: Field,
    pub entries: Field,
    pub bytes_in_use: Field,
    pub cache_newest: Field,
    pub cache_oldest: Field,
    /// The death-row cache, an inline array of large entries.
    pub cache: Field,
}

/// `szone_t`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexZoneLayout {
    pub size: usize,
    pub debug_flags: Field,
    pub tiny: MagazineSetFields,
    pub small: MagazineSetFields,
    pub num_small_slots: Field,
    pub large: LargeTableFields,
    pub large_threshold: Field,
    pub cookie: Field,
    pub helper_zone: Field,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagazineLayout {
    pub size: usize,
    /// Reuse cache: block pointer with the msize in the low quantum bits.
    pub last_free: Field,
    pub last_free_region: Field,
    /// Array of free-list head pointers.
    pub free_list: Field,
    /// One bit per free-list slot, set when the slot is non-empty.
    pub bitmap: Field,
    pub bytes_free_at_end: Field,
    pub bytes_free_at_start: Field,
    pub last_region: Field,
    pub num_objects: Field,
    pub num_bytes_in_objects: Field,
    pub num_bytes_in_magazine: Field,
    pub recirculation_entries: Field,
    /// Trailer address of the first region in this magazine's list.
    pub first_node: Field,
    pub last_node: Field,
    /// Most magazines a complex zone may have, depot excluded.
    pub max_count: u32,
    /// Whether the depot magazine (index -1) sits just before magazine 0.
    pub depot_before_array: bool,
}

/// `region_trailer_t`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailerLayout {
    pub size: usize,
    pub previous: Field,
    pub next: Field,
    pub recirc_suitable: Field,
    pub pinned_to_depot: Field,
    pub bytes_used: Field,
    pub mag_index: Field,
}

/// How `previous`/`next` are stored inside free blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkEncoding {
    Plain,
    /// The pointer ORed with a 4-bit checksum of `pointer ^ cookie`, then
    /// rotated right by `rotate` bits.
    Checksummed { rotate: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeNodeLayout {
    pub size: usize,
    pub previous: Field,
    pub next: Field,
    pub msize: Field,
    pub link_encoding: LinkEncoding,
    /// Single-quantum blocks are too small to hold `msize`; a node on slot 0
    /// is then one quantum long by definition.
    pub implicit_unit_msize: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargeEntryLayout {
    pub size: usize,
    pub address: Field,
    pub length: Field,
    pub did_madvise_reusable: Field,
}

/// `region_hash_generation_t`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionGenerationLayout {
    pub size: usize,
    pub num_regions_allocated: Field,
    pub shift: Field,
    pub hashed_regions: Field,
    pub nextgen: Field,
}

/// Encoding of a region's occupancy metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum MetadataFormat {
    /// One bit per quantum in little-endian 32-bit words, least significant
    /// bit first. `set_means_in_use` gives the polarity.
    Packed { set_means_in_use: bool },
    /// 32-bit `(header, inuse)` word pairs, 32 quanta per pair. A header bit
    /// starts a block; the in-use bit at the start gives its state.
    HeaderInuse,
    /// One 16-bit entry per quantum. At a block start the low 15 bits hold the
    /// msize and bit 15 is set if the block is free.
    MsizeTable,
}

impl MetadataFormat {
    /// Bytes of metadata describing `quanta` quanta.
    pub fn bytes_for(&self, quanta: u64) -> u64 {
        match self {
            MetadataFormat::Packed { .. } => quanta.div_ceil(32) * 4,
            MetadataFormat::HeaderInuse => quanta.div_ceil(32) * 8,
            MetadataFormat::MsizeTable => quanta * 2,
        }
    }
}

/// Geometry of one size class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassLayout {
    pub quantum_shift: u32,
    /// Allocatable quanta per region.
    pub region_quanta: u64,
    /// Free-list slots in use for this class.
    pub free_slots: usize,
    /// `slot = min((msize - slot_bias) / slot_divisor, free_slots - 1)`
    pub slot_bias: u64,
    pub slot_divisor: u64,
    pub metadata: MetadataFormat,
    /// Offsets from the region base.
    pub trailer_offset: u64,
    pub metadata_offset: u64,
    pub metadata_size: u64,
    /// Address space reserved per region.
    pub region_size: u64,
}

impl SizeClassLayout {
    /// Lay out a region as blocks, trailer, metadata, rounded up to a power of
    /// two.
    pub fn with_geometry(
        quantum_shift: u32,
        region_quanta: u64,
        free_slots: usize,
        metadata: MetadataFormat,
        trailer_size: usize,
    ) -> Self {
        let trailer_offset = region_quanta << quantum_shift;
        let metadata_offset = trailer_offset + trailer_size as u64;
        let metadata_size = metadata.bytes_for(region_quanta);
        Self {
            quantum_shift,
            region_quanta,
            free_slots,
            slot_bias: 1,
            slot_divisor: 1,
            metadata,
            trailer_offset,
            metadata_offset,
            metadata_size,
            region_size: 1 << log2ceil(metadata_offset + metadata_size),
        }
    }

    pub const fn quantum(&self) -> u64 {
        1 << self.quantum_shift
    }

    /// Bytes of allocatable space per region.
    pub const fn span(&self) -> u64 {
        self.region_quanta << self.quantum_shift
    }

    /// The free-list slot the allocator files a block of `msize` quanta under,
    /// given `slots` slots.
    pub fn slot_for(&self, msize: u64, slots: usize) -> usize {
        let divisor = self.slot_divisor.max(1);
        let slot = msize.saturating_sub(self.slot_bias) / divisor;
        slot.min(slots.saturating_sub(1) as u64) as usize
    }

    fn validate(&self, class: SizeClass, trailer_size: usize) -> Result<(), LayoutError> {
        let bad = |reason: String| Err(LayoutError::BadGeometry { class, reason });
        if self.quantum_shift == 0 || self.quantum_shift >= 32 {
            return bad(format!("quantum shift {} is out of range", self.quantum_shift));
        }
        if self.region_quanta == 0 || self.region_quanta > 1 << 24 {
            return bad(format!("{} quanta per region", self.region_quanta));
        }
        if self.free_slots == 0 || self.slot_divisor == 0 {
            return bad("no free-list slots".into());
        }
        if self.trailer_offset < self.span() {
            return bad(format!(
                "trailer at {:#x} inside the block area",
                self.trailer_offset
            ));
        }
        let trailer_end = self.trailer_offset.checked_add(trailer_size as u64);
        if trailer_end.map_or(true, |end| self.metadata_offset < end) {
            return bad(format!(
                "metadata at {:#x} overlaps the trailer",
                self.metadata_offset
            ));
        }
        let needed = self.metadata.bytes_for(self.region_quanta);
        if self.metadata_size != needed {
            return bad(format!(
                "metadata is {:#x} bytes, {:#x} needed",
                self.metadata_size, needed
            ));
        }
        let metadata_end = self.metadata_offset.checked_add(self.metadata_size);
        if metadata_end.map_or(true, |end| end > self.region_size) {
            return bad(format!(
                "region size {:#x} is too small for its metadata",
                self.region_size
            ));
        }
        Ok(())
    }
}

/// Upper bounds used to reject garbage before trusting it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_zones: usize,
    pub max_magazines: usize,
    pub max_regions: u64,
    pub max_free_chain: usize,
    pub max_large_entries: usize,
    pub max_zone_name: usize,
    pub max_helper_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_zones: 64,
            max_magazines: 256,
            max_regions: 1 << 20,
            max_free_chain: 1 << 22,
            max_large_entries: 1 << 16,
            max_zone_name: 256,
            max_helper_depth: 8,
        }
    }
}

/// Everything the decoder needs to interpret one allocator build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructLayout {
    pub arch: Architecture,
    pub version: u32,
    pub pointer_size: usize,
    pub zone: ZoneLayout,
    pub complex_zone: ComplexZoneLayout,
    pub magazine: MagazineLayout,
    pub trailer: TrailerLayout,
    pub free_node: FreeNodeLayout,
    pub large_entry: LargeEntryLayout,
    pub region_generation: RegionGenerationLayout,
    pub tiny: SizeClassLayout,
    pub small: SizeClassLayout,
    #[serde(default)]
    pub limits: Limits,
}

type FieldList = Vec<(&'static str, Field, usize)>;

impl StructLayout {
    pub fn size_class(&self, class: SizeClass) -> &SizeClassLayout {
        match class {
            SizeClass::Tiny => &self.tiny,
            SizeClass::Small => &self.small,
        }
    }

    pub fn magazine_set(&self, class: SizeClass) -> &MagazineSetFields {
        match class {
            SizeClass::Tiny => &self.complex_zone.tiny,
            SizeClass::Small => &self.complex_zone.small,
        }
    }

    /// Number of head pointers the magazine's free-list array can hold.
    pub fn free_list_capacity(&self) -> usize {
        self.magazine.free_list.size / self.pointer_size
    }

    /// Check that every field lies inside its structure, that no two fields
    /// overlap and that the region geometry adds up.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.pointer_size != 8 {
            return Err(LayoutError::UnsupportedPointerSize(self.pointer_size));
        }
        let p = self.pointer_size;
        let zone = &self.zone;
        check_struct(
            "zone",
            zone.size,
            vec![
                ("zone_name", zone.name, p),
                ("introspect", zone.introspect, p),
                ("version", zone.version, 4),
            ],
        )?;

        let cz = &self.complex_zone;
        let mut fields: FieldList = vec![
            ("debug_flags", cz.debug_flags, 4),
            ("num_small_slots", cz.num_small_slots, 4),
            ("num_large_objects_in_use", cz.large.num_in_use, 4),
            ("num_large_entries", cz.large.num_entries, 4),
            ("large_entries", cz.large.entries, p),
            ("num_bytes_in_large_objects", cz.large.bytes_in_use, 8),
            ("large_entry_cache_newest", cz.large.cache_newest, 4),
            ("large_entry_cache_oldest", cz.large.cache_oldest, 4),
            ("large_entry_cache", cz.large.cache, self.large_entry.size),
            ("large_threshold", cz.large_threshold, 4),
            ("cookie", cz.cookie, 8),
            ("helper_zone", cz.helper_zone, p),
        ];
        for (set, names) in [
            (&cz.tiny, ["num_tiny_regions", "tiny_region_generation", "num_tiny_magazines", "tiny_magazines"]),
            (&cz.small, ["num_small_regions", "small_region_generation", "num_small_magazines", "small_magazines"]),
        ] {
            fields.extend([
                (names[0], set.num_regions, 8),
                (names[1], set.region_generation, p),
                (names[2], set.num_magazines, 4),
                (names[3], set.magazines, p),
            ]);
        }
        check_struct("complex zone", cz.size, fields)?;

        let m = &self.magazine;
        check_struct(
            "magazine",
            m.size,
            vec![
                ("mag_last_free", m.last_free, p),
                ("mag_last_free_rgn", m.last_free_region, p),
                ("mag_free_list", m.free_list, p),
                ("mag_bitmap", m.bitmap, 4),
                ("mag_bytes_free_at_end", m.bytes_free_at_end, 8),
                ("mag_bytes_free_at_start", m.bytes_free_at_start, 8),
                ("mag_last_region", m.last_region, p),
                ("mag_num_objects", m.num_objects, 8),
                ("mag_num_bytes_in_objects", m.num_bytes_in_objects, 8),
                ("num_bytes_in_magazine", m.num_bytes_in_magazine, 8),
                ("recirculation_entries", m.recirculation_entries, 4),
                ("firstNode", m.first_node, p),
                ("lastNode", m.last_node, p),
            ],
        )?;
        if m.bitmap.size * 8 < self.free_list_capacity() {
            return Err(LayoutError::BadWidth {
                structure: "magazine",
                field: "mag_bitmap",
                size: m.bitmap.size,
                unit: self.free_list_capacity().div_ceil(8),
            });
        }

        let t = &self.trailer;
        check_struct(
            "region trailer",
            t.size,
            vec![
                ("previous", t.previous, p),
                ("next", t.next, p),
                ("recirc_suitable", t.recirc_suitable, 4),
                ("pinned_to_depot", t.pinned_to_depot, 4),
                ("bytes_used", t.bytes_used, 4),
                ("mag_index", t.mag_index, 4),
            ],
        )?;

        let n = &self.free_node;
        check_struct(
            "free node",
            n.size,
            vec![
                ("previous", n.previous, p),
                ("next", n.next, p),
                ("msize", n.msize, 2),
            ],
        )?;

        let e = &self.large_entry;
        check_struct(
            "large entry",
            e.size,
            vec![
                ("address", e.address, p),
                ("size", e.length, 8),
                ("did_madvise_reusable", e.did_madvise_reusable, 4),
            ],
        )?;

        let g = &self.region_generation;
        check_struct(
            "region hash generation",
            g.size,
            vec![
                ("num_regions_allocated", g.num_regions_allocated, 8),
                ("num_regions_allocated_shift", g.shift, 8),
                ("hashed_regions", g.hashed_regions, p),
                ("nextgen", g.nextgen, p),
            ],
        )?;

        for class in SizeClass::ALL {
            let geometry = self.size_class(class);
            geometry.validate(class, t.size)?;
            if geometry.free_slots > self.free_list_capacity() {
                return Err(LayoutError::BadGeometry {
                    class,
                    reason: format!(
                        "{} slots but room for {} heads",
                        geometry.free_slots,
                        self.free_list_capacity()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Fields must be inside `size`, a whole number of `unit`s and disjoint.
fn check_struct(structure: &'static str, size: usize, mut fields: FieldList) -> Result<(), LayoutError> {
    for &(field, f, unit) in &fields {
        if f.size == 0 || unit == 0 || f.size % unit != 0 {
            return Err(LayoutError::BadWidth {
                structure,
                field,
                size: f.size,
                unit,
            });
        }
        match f.end() {
            Some(end) if end <= size => {}
            end => {
                return Err(LayoutError::OutOfBounds {
                    structure,
                    field,
                    end: end.unwrap_or(usize::MAX),
                    size,
                })
            }
        }
    }
    fields.sort_by_key(|&(_, f, _)| f.offset);
    for pair in fields.windows(2) {
        let (first, a, _) = pair[0];
        let (second, b, _) = pair[1];
        if a.end().map_or(true, |end| end > b.offset) {
            return Err(LayoutError::Overlap {
                structure,
                first,
                second,
            });
        }
    }
    Ok(())
}
