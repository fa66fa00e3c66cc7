use std::{collections::BTreeMap, fs::File, io::Read, path::Path};

use log::debug;
use once_cell::sync::Lazy;

use super::{
    Architecture, ComplexZoneLayout, Field, FreeNodeLayout, LargeEntryLayout, LargeTableFields,
    LayoutError, Limits, LinkEncoding, MagazineLayout, MagazineSetFields, MetadataFormat,
    RegionGenerationLayout, SizeClassLayout, StructLayout, TrailerLayout, ZoneLayout,
};
use crate::error::{FromFileError, InspectError};

static BUILTIN: Lazy<LayoutCatalog> = Lazy::new(|| {
    let mut catalog = LayoutCatalog::empty();
    for (arch, page) in [(Architecture::X86_64, 0x1000), (Architecture::Aarch64, 0x4000)] {
        // the builtin tables are fixed; a failure here is a bug caught by the
        // catalog tests
        if let Err(e) = catalog.insert(szone_v8(arch, page)) {
            log::error!("builtin {arch} layout rejected: {e}");
        }
    }
    catalog
});

/// All known layouts, keyed by `(architecture, allocator version)`. The
/// engine never guesses: anything not in here is unsupported.
#[derive(Clone, Debug, Default)]
pub struct LayoutCatalog {
    layouts: BTreeMap<(Architecture, u32), StructLayout>,
}

/// Look `(arch, version)` up in the builtin catalog.
pub fn layout_for(arch: Architecture, version: u32) -> Result<&'static StructLayout, InspectError> {
    LayoutCatalog::builtin().layout_for(arch, version)
}

impl LayoutCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> &'static LayoutCatalog {
        &BUILTIN
    }

    /// Validate `layout` and add it, replacing any entry for the same
    /// architecture and version.
    pub fn insert(&mut self, layout: StructLayout) -> Result<(), LayoutError> {
        layout.validate()?;
        debug!("layout for {} version {} added", layout.arch, layout.version);
        self.layouts.insert((layout.arch, layout.version), layout);
        Ok(())
    }

    pub fn layout_for(&self, arch: Architecture, version: u32) -> Result<&StructLayout, InspectError> {
        self.layouts
            .get(&(arch, version))
            .ok_or(InspectError::UnsupportedAllocatorVersion { arch, version })
    }

    pub fn iter(&self) -> impl Iterator<Item = &StructLayout> {
        self.layouts.values()
    }

    /// Add the layouts from a JSON file holding an array of [`StructLayout`]s.
    /// Nothing is added unless every layout in the file is valid. Returns the
    /// number of layouts read.
    pub fn load_file<P>(&mut self, path: P) -> Result<usize, FromFileError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let layouts: Vec<StructLayout> = serde_json::from_str(&buf)?;
        for layout in &layouts {
            layout.validate()?;
        }
        let n = layouts.len();
        for layout in layouts {
            self.layouts.insert((layout.arch, layout.version), layout);
        }
        Ok(n)
    }
}

/// Version 8 `szone_t` for LP64 targets. Only the page size, and so the
/// distance from the basic zone to the complex zone, differs between
/// architectures.
fn szone_v8(arch: Architecture, page: u64) -> StructLayout {
    let trailer = TrailerLayout {
        size: 0x20,
        previous: Field::new(0x0, 8),
        next: Field::new(0x8, 8),
        recirc_suitable: Field::new(0x10, 4),
        pinned_to_depot: Field::new(0x14, 4),
        bytes_used: Field::new(0x18, 4),
        mag_index: Field::new(0x1c, 4),
    };
    let large_entry = LargeEntryLayout {
        size: 0x18,
        address: Field::new(0x0, 8),
        length: Field::new(0x8, 8),
        did_madvise_reusable: Field::new(0x10, 4),
    };
    StructLayout {
        arch,
        version: 8,
        pointer_size: 8,
        zone: ZoneLayout {
            size: 0x88,
            name: Field::new(0x48, 8),
            introspect: Field::new(0x60, 8),
            version: Field::new(0x68, 4),
            complex_offset: page,
        },
        complex_zone: ComplexZoneLayout {
            size: 0x878,
            debug_flags: Field::new(0x8, 4),
            tiny: MagazineSetFields {
                num_regions: Field::new(0x90, 8),
                region_generation: Field::new(0xa0, 8),
                num_magazines: Field::new(0xe8, 4),
                magazines: Field::new(0xf8, 8),
            },
            small: MagazineSetFields {
                num_regions: Field::new(0x190, 8),
                region_generation: Field::new(0x1a0, 8),
                num_magazines: Field::new(0x1ec, 4),
                magazines: Field::new(0x1f8, 8),
            },
            num_small_slots: Field::new(0x1e8, 4),
            large: LargeTableFields {
                num_in_use: Field::new(0x290, 4),
                num_entries: Field::new(0x294, 4),
                entries: Field::new(0x298, 8),
                bytes_in_use: Field::new(0x2a0, 8),
                cache_newest: Field::new(0x2a8, 4),
                cache_oldest: Field::new(0x2ac, 4),
                cache: Field::new(0x2b0, 16 * large_entry.size),
            },
            large_threshold: Field::new(0x454, 4),
            cookie: Field::new(0x460, 8),
            helper_zone: Field::new(0x868, 8),
        },
        magazine: MagazineLayout {
            size: 0xa00,
            last_free: Field::new(0x18, 8),
            last_free_region: Field::new(0x20, 8),
            free_list: Field::new(0x28, 256 * 8),
            bitmap: Field::new(0x828, 0x20),
            bytes_free_at_end: Field::new(0x848, 8),
            bytes_free_at_start: Field::new(0x850, 8),
            last_region: Field::new(0x858, 8),
            num_objects: Field::new(0x860, 8),
            num_bytes_in_objects: Field::new(0x868, 8),
            num_bytes_in_magazine: Field::new(0x870, 8),
            recirculation_entries: Field::new(0x878, 4),
            first_node: Field::new(0x880, 8),
            last_node: Field::new(0x888, 8),
            max_count: 32,
            depot_before_array: true,
        },
        free_node: FreeNodeLayout {
            size: 0x12,
            previous: Field::new(0x0, 8),
            next: Field::new(0x8, 8),
            msize: Field::new(0x10, 2),
            link_encoding: LinkEncoding::Checksummed { rotate: 4 },
            implicit_unit_msize: true,
        },
        region_generation: RegionGenerationLayout {
            size: 0x20,
            num_regions_allocated: Field::new(0x0, 8),
            shift: Field::new(0x8, 8),
            hashed_regions: Field::new(0x10, 8),
            nextgen: Field::new(0x18, 8),
        },
        tiny: SizeClassLayout::with_geometry(4, 64520, 64, MetadataFormat::HeaderInuse, trailer.size),
        small: SizeClassLayout::with_geometry(9, 16320, 256, MetadataFormat::MsizeTable, trailer.size),
        trailer,
        large_entry,
        limits: Limits::default(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn every_builtin_layout_is_valid() {
        let catalog = LayoutCatalog::builtin();
        assert_eq!(catalog.iter().count(), 2);
        for layout in catalog.iter() {
            assert_eq!(layout.validate(), Ok(()));
        }
        assert_eq!(
            catalog
                .layout_for(Architecture::Aarch64, 8)
                .unwrap()
                .zone
                .complex_offset,
            0x4000
        );
    }

    #[test]
    fn unknown_versions_are_unsupported() {
        assert!(matches!(
            layout_for(Architecture::X86_64, 9),
            Err(InspectError::UnsupportedAllocatorVersion {
                arch: Architecture::X86_64,
                version: 9
            })
        ));
    }

    #[test]
    fn layouts_load_from_json() {
        let mut v9 = layout_for(Architecture::X86_64, 8).unwrap().clone();
        v9.version = 9;
        v9.free_node.link_encoding = LinkEncoding::Plain;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&serde_json::to_vec(&[&v9]).unwrap()).unwrap();

        let mut catalog = LayoutCatalog::builtin().clone();
        assert_eq!(catalog.load_file(file.path()).unwrap(), 1);
        assert_eq!(catalog.layout_for(Architecture::X86_64, 9).unwrap(), &v9);

        // one bad entry poisons the whole file
        let mut broken = v9.clone();
        broken.version = 10;
        broken.zone.version = Field::new(0x84, 8);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&serde_json::to_vec(&[&v9, &broken]).unwrap()).unwrap();
        assert!(matches!(
            catalog.load_file(file.path()),
            Err(FromFileError::Layout(LayoutError::OutOfBounds { .. }))
        ));
        assert!(catalog.layout_for(Architecture::X86_64, 10).is_err());
    }
}
