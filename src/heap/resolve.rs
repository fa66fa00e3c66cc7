//! Address to block.
//!
//! The owning region is looked for on every magazine's region list first,
//! then in the region hash table. What the metadata says about the block is
//! checked against the magazine's free list, reuse cache and untouched space;
//! when they disagree the block is reported corrupt, never guessed at.

use log::{debug, warn};
use serde::Serialize;

use super::{
    bitmap::{self, Granule},
    free_list::{self, FreeBlock},
    ring::{self, RingFault},
};
use crate::{
    decode::{self, decode, decode_with, ComplexZone, Magazine, MagazineContext, Region, RegionGeneration},
    error::{DecodeError, InspectError},
    inspect::CancelToken,
    layout::{SizeClass, StructLayout},
    serialize::serde_addr,
    source::MemorySource,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Free,
    InUse,
    Corrupt,
}

/// What a classification was based on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Evidence {
    Metadata { state: Granule, exact: bool },
    FreeList { slot: usize },
    ReuseCache,
    /// Never-allocated space at either end of the last region.
    Untouched,
    LargeEntry,
    LargeCache,
}

/// Why a block is reported corrupt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "discrepancy", rename_all = "snake_case")]
pub enum Discrepancy {
    /// The metadata says free but no free list holds the block.
    FreeButNotListed,
    /// A free list holds a block the metadata says is in use.
    ListedButInUse,
    /// The block is in the reuse cache and on a free list.
    CachedAndListed,
    /// Untouched space is on a free list.
    UntouchedButListed,
    /// The free block and the metadata's block disagree on bounds.
    ExtentMismatch { listed_msize: u64, metadata_msize: u64 },
    /// No block header covers the quantum.
    NoBlockHeader,
    Metadata { error: DecodeError },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Block {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub size: u64,
    pub state: BlockState,
    /// None for large allocations.
    pub class: Option<SizeClass>,
    #[serde(with = "serde_addr::option")]
    pub region: Option<u64>,
    pub magazine: Option<i32>,
    pub evidence: Vec<Evidence>,
    pub discrepancies: Vec<Discrepancy>,
}

impl Block {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "blocks", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(Block),
    NotFound,
    /// More than one magazine claims the address.
    Ambiguous(Vec<Block>),
}

impl Resolution {
    pub fn block(&self) -> Option<&Block> {
        match self {
            Resolution::Resolved(block) => Some(block),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub resolution: Resolution,
    /// Structures that could not be read along the way.
    pub skipped: Vec<DecodeError>,
    /// Faults on the region lists searched.
    pub ring_faults: Vec<RingFault>,
}

struct Candidate<'z> {
    zone: &'z ComplexZone,
    region: Region,
    magazine: Magazine,
}

/// Find and classify the block containing `address` among `zones`, a zone's
/// complex zones in search order.
pub fn resolve<S>(
    source: &S,
    layout: &StructLayout,
    zones: &[ComplexZone],
    address: u64,
    cancel: &CancelToken,
) -> Result<ResolveReport, InspectError>
where
    S: MemorySource + ?Sized,
{
    let mut report = ResolveReport {
        address,
        resolution: Resolution::NotFound,
        skipped: Vec::new(),
        ring_faults: Vec::new(),
    };

    let mut candidates = search_rings(source, layout, zones, address, cancel, &mut report)?;
    if candidates.is_empty() {
        candidates = search_hash_tables(source, layout, zones, address, &mut report);
    }
    // one region can sit on a list and be the last region of the same magazine
    candidates.sort_by_key(|c| (c.region.address, c.magazine.address));
    candidates.dedup_by(|a, b| a.region.address == b.region.address && a.magazine.address == b.magazine.address);

    let mut blocks = Vec::with_capacity(candidates.len());
    for c in &candidates {
        blocks.push(classify(source, layout, c, address, cancel)?);
    }
    report.resolution = match blocks.len() {
        0 => resolve_large(source, layout, zones, address, &mut report),
        1 => Resolution::Resolved(blocks.remove(0)),
        _ => {
            warn!("{address:#x} is claimed by {} magazines", blocks.len());
            Resolution::Ambiguous(blocks)
        }
    };
    debug!("{address:#x}: {:?}", report.resolution);
    Ok(report)
}

fn magazine_of<S>(
    source: &S,
    layout: &StructLayout,
    zone: &ComplexZone,
    class: SizeClass,
    index: i32,
) -> Result<Magazine, DecodeError>
where
    S: MemorySource + ?Sized,
{
    let cx = MagazineContext {
        class,
        index,
        slots: zone.free_slots(layout, class),
    };
    decode_with(source, layout, zone.magazine_set(class).magazine_address(layout, index), &cx)
}

fn search_rings<'z, S>(
    source: &S,
    layout: &StructLayout,
    zones: &'z [ComplexZone],
    address: u64,
    cancel: &CancelToken,
    report: &mut ResolveReport,
) -> Result<Vec<Candidate<'z>>, InspectError>
where
    S: MemorySource + ?Sized,
{
    let mut found = Vec::new();
    for zone in zones {
        for class in SizeClass::ALL {
            let set = zone.magazine_set(class);
            if set.magazines == 0 {
                continue;
            }
            for index in set.indices(layout) {
                if cancel.is_cancelled() {
                    return Err(InspectError::Cancelled);
                }
                let magazine = match magazine_of(source, layout, zone, class, index) {
                    Ok(m) => m,
                    Err(e) => {
                        report.skipped.push(e);
                        continue;
                    }
                };
                let ring = ring::walk(source, layout, zone, &magazine, cancel);
                if !ring.complete {
                    return Err(InspectError::Cancelled);
                }
                let mut region = ring.find(address).copied();
                report.ring_faults.extend(ring.faults);
                let span = layout.size_class(class).span();
                let base = magazine.last_region;
                if region.is_none() && base != 0 && address >= base && address - base < span {
                    match Region::read(source, layout, class, base) {
                        Ok(r) => region = Some(r),
                        Err(e) => report.skipped.push(e),
                    }
                }
                if let Some(region) = region {
                    found.push(Candidate { zone, region, magazine });
                }
            }
        }
    }
    Ok(found)
}

fn search_hash_tables<'z, S>(
    source: &S,
    layout: &StructLayout,
    zones: &'z [ComplexZone],
    address: u64,
    report: &mut ResolveReport,
) -> Vec<Candidate<'z>>
where
    S: MemorySource + ?Sized,
{
    let mut found = Vec::new();
    for zone in zones {
        for class in SizeClass::ALL {
            let set = zone.magazine_set(class);
            if set.region_generation == 0 {
                continue;
            }
            let regions = decode::<RegionGeneration, _>(source, layout, set.region_generation)
                .and_then(|g| g.regions(source, layout));
            let regions = match regions {
                Ok(r) => r,
                Err(e) => {
                    report.skipped.push(e);
                    continue;
                }
            };
            let span = layout.size_class(class).span();
            for base in regions.into_iter().filter(|&b| address >= b && address - b < span) {
                let candidate = Region::read(source, layout, class, base).and_then(|region| {
                    let index = region.trailer.mag_index;
                    let magazine = magazine_of(source, layout, zone, class, index)?;
                    Ok(Candidate { zone, region, magazine })
                });
                match candidate {
                    Ok(c) => {
                        debug!("{address:#x}: found {class} region {base:#x} through the hash table");
                        found.push(c)
                    }
                    Err(e) => report.skipped.push(e),
                }
            }
        }
    }
    found
}

fn classify<S>(
    source: &S,
    layout: &StructLayout,
    c: &Candidate<'_>,
    address: u64,
    cancel: &CancelToken,
) -> Result<Block, InspectError>
where
    S: MemorySource + ?Sized,
{
    let Candidate { zone, region, magazine } = c;
    let quantum = region.quantum;
    let mut block = Block {
        address,
        size: quantum,
        state: BlockState::Corrupt,
        class: Some(region.class),
        region: Some(region.address),
        magazine: Some(magazine.index),
        evidence: Vec::new(),
        discrepancies: Vec::new(),
    };

    let free = free_list::reconstruct(source, layout, zone, magazine, cancel);
    if !free.complete {
        return Err(InspectError::Cancelled);
    }
    let listed: Option<FreeBlock> = free.find(address).copied();
    if let Some(b) = &listed {
        block.evidence.push(Evidence::FreeList { slot: b.slot });
        block.address = b.address;
        block.size = b.size(quantum);
    }

    if magazine.last_region == region.address {
        let untouched = magazine.untouched_spans(layout).into_iter().find(|s| s.contains(&address));
        if let Some(span) = untouched {
            block.evidence.push(Evidence::Untouched);
            if listed.is_some() {
                block.discrepancies.push(Discrepancy::UntouchedButListed);
            } else {
                block.address = span.start;
                block.size = span.end - span.start;
                block.state = BlockState::Free;
            }
            return Ok(block);
        }
    }

    let granule = match region.granule_of(address) {
        Some(g) => g,
        // past the allocatable span, in the trailer or metadata
        None => {
            block.discrepancies.push(Discrepancy::NoBlockHeader);
            return Ok(block);
        }
    };
    let bitmap = match bitmap::decode(source, layout, region) {
        Ok(b) => b,
        Err(error) => {
            block.discrepancies.push(Discrepancy::Metadata { error });
            return Ok(block);
        }
    };
    let Some(extent) = bitmap.extent_at(granule) else {
        block.discrepancies.push(Discrepancy::NoBlockHeader);
        return Ok(block);
    };
    block.evidence.push(Evidence::Metadata {
        state: extent.state,
        exact: bitmap.exact,
    });
    if bitmap.is_anomalous(granule) {
        block.discrepancies.push(Discrepancy::NoBlockHeader);
    }

    let reuse = magazine.reuse.filter(|r| address >= r.address && address - r.address < r.msize.max(1) * quantum);
    if let Some(r) = &reuse {
        block.evidence.push(Evidence::ReuseCache);
        if listed.is_none() {
            block.address = r.address;
            block.size = r.msize.max(1) * quantum;
        }
    }
    if listed.is_none() && reuse.is_none() {
        block.address = region.granule_address(extent.start);
        block.size = extent.msize * quantum;
    }

    let state = match (extent.state, &listed, reuse.is_some()) {
        (Granule::Free, Some(b), _) => {
            if bitmap.exact && (region.granule_of(b.address) != Some(extent.start) || b.msize != extent.msize) {
                block.discrepancies.push(Discrepancy::ExtentMismatch {
                    listed_msize: b.msize,
                    metadata_msize: extent.msize,
                });
            }
            if reuse.is_some() {
                block.discrepancies.push(Discrepancy::CachedAndListed);
            }
            BlockState::Free
        }
        (Granule::Free, None, true) => BlockState::Free,
        (Granule::Free, None, false) => {
            block.discrepancies.push(Discrepancy::FreeButNotListed);
            BlockState::Free
        }
        (Granule::InUse, Some(_), cached) => {
            block.discrepancies.push(Discrepancy::ListedButInUse);
            if cached {
                block.discrepancies.push(Discrepancy::CachedAndListed);
            }
            BlockState::Free
        }
        // the reuse cache holds its block marked in use
        (Granule::InUse, None, true) => BlockState::Free,
        (Granule::InUse, None, false) => BlockState::InUse,
    };
    block.state = if block.discrepancies.is_empty() {
        state
    } else {
        warn!(
            "{} block at {:#x} possibly corrupt: {:?}",
            region.class, block.address, block.discrepancies
        );
        BlockState::Corrupt
    };
    Ok(block)
}

fn resolve_large<S>(
    source: &S,
    layout: &StructLayout,
    zones: &[ComplexZone],
    address: u64,
    report: &mut ResolveReport,
) -> Resolution
where
    S: MemorySource + ?Sized,
{
    let large = |address, size, state, evidence| Block {
        address,
        size,
        state,
        class: None,
        region: None,
        magazine: None,
        evidence: vec![evidence],
        discrepancies: Vec::new(),
    };
    for zone in zones {
        match decode::large_entries(source, layout, &zone.large) {
            Ok(entries) => {
                if let Some(e) = entries.iter().find(|e| e.contains(address)) {
                    return Resolution::Resolved(large(e.address, e.size, BlockState::InUse, Evidence::LargeEntry));
                }
            }
            Err(e) => report.skipped.push(e),
        }
        if let Some(e) = zone.large.cache.iter().find(|e| !e.is_empty() && e.contains(address)) {
            return Resolution::Resolved(large(e.address, e.size, BlockState::Free, Evidence::LargeCache));
        }
    }
    Resolution::NotFound
}
