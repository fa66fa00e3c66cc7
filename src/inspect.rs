//! The query API.
//!
//! An [`Inspector`] holds nothing but a source, a layout and a cancel flag.
//! Every query reads what it needs through a fresh page cache that is dropped
//! when the query returns, so two queries never see each other's reads.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use hashbrown::HashSet;
use log::{debug, warn};

use crate::{
    decode::{
        self, decode, decode_with, zone_addresses, ComplexZone, LargeEntry, Magazine, MagazineContext, Region,
        RegionGeneration, Zone,
    },
    error::InspectError,
    graph::HeapGraph,
    heap::{
        bitmap::{self, RegionBitmap},
        free_list::{self, FreeListGraph},
        resolve::{self, Resolution, ResolveReport},
        ring::{self, RegionRing, RingFault},
    },
    layout::{Architecture, LayoutCatalog, SizeClass, StructLayout},
    source::{CachedSource, MemorySource},
    Outcome,
};

/// Shared flag that stops walks in progress. Clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct Inspector<'a> {
    source: &'a dyn MemorySource,
    layout: &'a StructLayout,
    cancel: CancelToken,
}

impl<'a> Inspector<'a> {
    pub fn new(source: &'a dyn MemorySource, layout: &'a StructLayout) -> Self {
        Self {
            source,
            layout,
            cancel: CancelToken::new(),
        }
    }

    /// Use the layout `catalog` has for `arch` and `version`.
    pub fn for_target(
        source: &'a dyn MemorySource,
        catalog: &'a LayoutCatalog,
        arch: Architecture,
        version: u32,
    ) -> Result<Self, InspectError> {
        Ok(Self::new(source, catalog.layout_for(arch, version)?))
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn layout(&self) -> &'a StructLayout {
        self.layout
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn cached(&self) -> CachedSource<'a> {
        CachedSource::new(self.source)
    }

    /// Every zone in the registry whose pointer is stored at `registry`.
    pub fn zones(&self, registry: u64) -> Result<Vec<Outcome<Zone>>, InspectError> {
        let source = self.cached();
        let addresses = zone_addresses(&source, self.layout, registry)?;
        debug!("{} zones in the registry at {registry:#x}", addresses.len());
        Ok(addresses
            .into_iter()
            .map(|address| Zone::read(&source, self.layout, address))
            .collect())
    }

    /// The zone at `address`, which must be of the layout's version.
    pub fn zone(&self, address: u64) -> Result<Zone, InspectError> {
        let zone = Zone::read(&self.cached(), self.layout, address)?;
        self.check_version(&zone)?;
        Ok(zone)
    }

    fn check_version(&self, zone: &Zone) -> Result<(), InspectError> {
        if zone.version != self.layout.version {
            return Err(InspectError::UnsupportedAllocatorVersion {
                arch: self.layout.arch,
                version: zone.version,
            });
        }
        Ok(())
    }

    /// The zone's own complex zone followed by its helper zones.
    ///
    /// The helper chain stops at the first helper that cannot be decoded, a
    /// repeat, or the depth limit.
    pub fn complex_zones(&self, zone: &Zone) -> Result<Vec<ComplexZone>, InspectError> {
        self.check_version(zone)?;
        complex_zone_chain(&self.cached(), self.layout, zone)
    }

    /// The `class` magazines of `zone`, depot first. Empty if the zone has no
    /// magazine array.
    pub fn magazines(&self, zone: &ComplexZone, class: SizeClass) -> Vec<Outcome<Magazine>> {
        let source = self.cached();
        let set = zone.magazine_set(class);
        if set.magazines == 0 {
            return Vec::new();
        }
        set.indices(self.layout)
            .map(|index| {
                let cx = MagazineContext {
                    class,
                    index,
                    slots: zone.free_slots(self.layout, class),
                };
                decode_with(&source, self.layout, set.magazine_address(self.layout, index), &cx)
            })
            .collect()
    }

    pub fn free_list(&self, zone: &ComplexZone, magazine: &Magazine) -> FreeListGraph {
        free_list::reconstruct(&self.cached(), self.layout, zone, magazine, &self.cancel)
    }

    pub fn region_ring(&self, zone: &ComplexZone, magazine: &Magazine) -> RegionRing {
        ring::walk(&self.cached(), self.layout, zone, magazine, &self.cancel)
    }

    /// Every `class` region of `zone` found on a region list, in the hash
    /// table or as a magazine's last region, by address. Regions that could
    /// not be read are errors.
    pub fn regions(&self, zone: &ComplexZone, class: SizeClass) -> Vec<Outcome<Region>> {
        let source = self.cached();
        let mut found: Vec<Outcome<Region>> = Vec::new();
        let mut seen = HashSet::new();
        let mut last_regions = Vec::new();
        for magazine in self.magazines(zone, class) {
            let magazine = match magazine {
                Ok(m) => m,
                Err(e) => {
                    found.push(Err(e));
                    continue;
                }
            };
            if magazine.last_region != 0 {
                last_regions.push(magazine.last_region);
            }
            let ring = ring::walk(&source, self.layout, zone, &magazine, &self.cancel);
            for region in ring.regions {
                if seen.insert(region.address) {
                    found.push(Ok(region));
                }
            }
            for fault in ring.faults {
                if let RingFault::Dangling { error, .. } = fault {
                    found.push(Err(error));
                }
            }
        }
        let set = zone.magazine_set(class);
        if set.region_generation != 0 {
            let hashed = decode::<RegionGeneration, _>(&source, self.layout, set.region_generation)
                .and_then(|g| g.regions(&source, self.layout));
            match hashed {
                Ok(bases) => {
                    for base in bases {
                        if seen.insert(base) {
                            found.push(Region::read(&source, self.layout, class, base));
                        }
                    }
                }
                Err(e) => found.push(Err(e)),
            }
        }
        // a last region may not be linked or hashed yet
        for base in last_regions {
            if seen.insert(base) {
                found.push(Region::read(&source, self.layout, class, base));
            }
        }
        found.sort_by_key(|r| r.as_ref().map_or(u64::MAX, |r| r.address));
        found
    }

    pub fn region(&self, class: SizeClass, address: u64) -> Outcome<Region> {
        Region::read(&self.cached(), self.layout, class, address)
    }

    pub fn bitmap(&self, region: &Region) -> Outcome<RegionBitmap> {
        bitmap::decode(&self.cached(), self.layout, region)
    }

    /// Live large allocations; see [`ComplexZone::large`] for the cache.
    pub fn large_entries(&self, zone: &ComplexZone) -> Outcome<Vec<LargeEntry>> {
        decode::large_entries(&self.cached(), self.layout, &zone.large)
    }

    pub fn resolve(&self, zone: &Zone, address: u64) -> Result<Resolution, InspectError> {
        Ok(self.resolve_report(zone, address)?.resolution)
    }

    /// [`Inspector::resolve`] along with what was skipped on the way.
    pub fn resolve_report(&self, zone: &Zone, address: u64) -> Result<ResolveReport, InspectError> {
        self.check_version(zone)?;
        let source = self.cached();
        let zones = complex_zone_chain(&source, self.layout, zone)?;
        resolve::resolve(&source, self.layout, &zones, address, &self.cancel)
    }

    /// Everything reachable from `zone`, eagerly.
    pub fn graph(&self, zone: &Zone) -> Result<HeapGraph, InspectError> {
        self.check_version(zone)?;
        let source = self.cached();
        let zones = complex_zone_chain(&source, self.layout, zone)?;
        Ok(HeapGraph::build(&source, self.layout, zone, &zones, &self.cancel))
    }
}

fn complex_zone_chain<S>(source: &S, layout: &StructLayout, zone: &Zone) -> Result<Vec<ComplexZone>, InspectError>
where
    S: MemorySource + ?Sized,
{
    let first: ComplexZone = decode(source, layout, zone.complex)?;
    let mut seen = HashSet::new();
    seen.insert(first.address);
    let mut next = first.helper_zone;
    let mut chain = vec![first];
    while next != 0 {
        if chain.len() > layout.limits.max_helper_depth {
            warn!("zone at {:#x}: helper chain longer than {}", zone.address, layout.limits.max_helper_depth);
            break;
        }
        if !seen.insert(next) {
            warn!("zone at {:#x}: helper chain loops at {next:#x}", zone.address);
            break;
        }
        match decode::<ComplexZone, _>(source, layout, next) {
            Ok(helper) => {
                next = helper.helper_zone;
                chain.push(helper);
            }
            Err(e) => {
                warn!("zone at {:#x}: helper zone skipped: {e}", zone.address);
                break;
            }
        }
    }
    Ok(chain)
}
