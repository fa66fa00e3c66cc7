//! A magazine's list of regions, walked through the trailers.

use hashbrown::HashSet;
use log::{trace, warn};
use serde::Serialize;

use crate::{
    decode::{ComplexZone, Magazine, Region},
    error::DecodeError,
    inspect::CancelToken,
    layout::{SizeClass, StructLayout},
    serialize::serde_addr,
    source::MemorySource,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RingStatus {
    Closed,
    CorruptRegionRing,
}

/// Addresses here are trailer addresses, as the links hold them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum RingFault {
    /// `from` links to `to`, seen earlier and not the head.
    Cycle {
        #[serde(with = "serde_addr")]
        from: u64,
        #[serde(with = "serde_addr")]
        to: u64,
    },
    /// The list ended at `at` but the magazine says it ends at
    /// `expected_last`.
    Open {
        #[serde(with = "serde_addr")]
        at: u64,
        #[serde(with = "serde_addr")]
        expected_last: u64,
    },
    /// More regions than the size class has.
    TooLong { bound: usize },
    Dangling {
        #[serde(with = "serde_addr")]
        from: u64,
        #[serde(with = "serde_addr")]
        to: u64,
        error: DecodeError,
    },
    /// The trailer names another magazine as its owner.
    ForeignRegion {
        #[serde(with = "serde_addr")]
        region: u64,
        mag_index: i32,
    },
    BackLink {
        #[serde(with = "serde_addr")]
        trailer: u64,
        #[serde(with = "serde_addr")]
        found: u64,
        #[serde(with = "serde_addr")]
        expected: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegionRing {
    #[serde(with = "serde_addr")]
    pub magazine: u64,
    pub class: SizeClass,
    pub index: i32,
    /// In list order, up to the first fault that stopped the walk.
    pub regions: Vec<Region>,
    pub faults: Vec<RingFault>,
    pub complete: bool,
}

impl RegionRing {
    pub fn status(&self) -> RingStatus {
        if self.faults.is_empty() {
            RingStatus::Closed
        } else {
            RingStatus::CorruptRegionRing
        }
    }

    /// The region whose span contains `address`.
    pub fn find(&self, address: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(address))
    }
}

/// Walk the regions of `magazine`, from `first_node` along `next` links.
///
/// The list is closed when it ends in a null link at `last_node`, or links
/// from `last_node` back to the head. It may hold at most one more region
/// than the zone counts for the class.
pub fn walk<S>(
    source: &S,
    layout: &StructLayout,
    zone: &ComplexZone,
    magazine: &Magazine,
    cancel: &CancelToken,
) -> RegionRing
where
    S: MemorySource + ?Sized,
{
    let class = magazine.class;
    let bound = (zone.magazine_set(class).num_regions as usize)
        .min(layout.limits.max_regions as usize)
        .saturating_add(1);
    let mut ring = RegionRing {
        magazine: magazine.address,
        class,
        index: magazine.index,
        regions: Vec::new(),
        faults: Vec::new(),
        complete: true,
    };

    let mut visited = HashSet::new();
    let mut previous = 0;
    let mut current = magazine.first_node;
    let mut looped = false;
    while current != 0 {
        if cancel.is_cancelled() {
            ring.complete = false;
            return ring;
        }
        if !visited.insert(current) {
            if current == magazine.first_node && previous == magazine.last_node {
                looped = true;
            } else {
                ring.faults.push(RingFault::Cycle {
                    from: previous,
                    to: current,
                });
            }
            break;
        }
        if ring.regions.len() >= bound {
            ring.faults.push(RingFault::TooLong { bound });
            break;
        }
        let region = match Region::from_trailer(source, layout, class, current) {
            Ok(region) => region,
            Err(error) => {
                ring.faults.push(RingFault::Dangling {
                    from: previous,
                    to: current,
                    error,
                });
                break;
            }
        };
        trace!("{class} magazine {}: region {:#x}", magazine.index, region.address);
        let t = &region.trailer;
        // the head's back link is null, or the tail on a looped list
        let back_ok = t.previous == previous || (previous == 0 && t.previous == magazine.last_node);
        if !back_ok {
            ring.faults.push(RingFault::BackLink {
                trailer: current,
                found: t.previous,
                expected: previous,
            });
        }
        if t.mag_index != magazine.index {
            ring.faults.push(RingFault::ForeignRegion {
                region: region.address,
                mag_index: t.mag_index,
            });
        }
        ring.regions.push(region);
        previous = current;
        current = t.next;
    }

    let stopped_early = ring
        .faults
        .iter()
        .any(|f| matches!(f, RingFault::Cycle { .. } | RingFault::TooLong { .. } | RingFault::Dangling { .. }));
    if !looped && !stopped_early && previous != magazine.last_node {
        ring.faults.push(RingFault::Open {
            at: previous,
            expected_last: magazine.last_node,
        });
    }
    if ring.status() == RingStatus::CorruptRegionRing {
        warn!(
            "{class} magazine {}: region list possibly corrupt: {:?}",
            magazine.index, ring.faults
        );
    }
    ring
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        decode::{decode, decode_with, MagazineContext},
        layout::{layout_for, Architecture},
        synth::{HeapImage, ZoneHandle},
    };

    const BASES: [u64; 3] = [0x100_0000, 0x120_0000, 0x140_0000];

    fn walk_tiny(tweak: impl FnOnce(&mut HeapImage, &ZoneHandle)) -> RegionRing {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let mut image = HeapImage::new(layout);
        let zone = image.zone(0x10_0000, None);
        image.magazines(&zone, SizeClass::Tiny, 1, 0x30_0000);
        for base in BASES {
            image.region(SizeClass::Tiny, base, 0);
        }
        image.link_regions(&zone, SizeClass::Tiny, 0, &BASES);
        tweak(&mut image, &zone);
        let at = image.magazine_address(&zone, SizeClass::Tiny, 0);
        let snapshot = image.finish();

        let cz: ComplexZone = decode(&snapshot, layout, zone.complex).unwrap();
        let cx = MagazineContext {
            class: SizeClass::Tiny,
            index: 0,
            slots: 64,
        };
        let magazine: Magazine = decode_with(&snapshot, layout, at, &cx).unwrap();
        walk(&snapshot, layout, &cz, &magazine, &CancelToken::new())
    }

    fn trailer(base: u64) -> u64 {
        base + layout_for(Architecture::X86_64, 8).unwrap().tiny.trailer_offset
    }

    #[test]
    fn null_terminated_list_is_closed() {
        let ring = walk_tiny(|_, _| {});
        assert_eq!(ring.status(), RingStatus::Closed);
        assert_eq!(
            ring.regions.iter().map(|r| r.address).collect::<Vec<_>>(),
            BASES.to_vec()
        );
        assert_eq!(ring.find(0x120_0040).map(|r| r.address), Some(0x120_0000));
        assert!(ring.complete);
    }

    #[test]
    fn looping_back_to_the_head_is_closed() {
        let ring = walk_tiny(|image, _| image.set_region_next(trailer(BASES[2]), trailer(BASES[0])));
        assert_eq!(ring.faults, vec![]);
        assert_eq!(ring.regions.len(), 3);
    }

    #[test]
    fn cycles_into_the_middle_are_corrupt() {
        let ring = walk_tiny(|image, _| image.set_region_next(trailer(BASES[2]), trailer(BASES[1])));
        assert_eq!(ring.status(), RingStatus::CorruptRegionRing);
        assert_eq!(
            ring.faults,
            vec![RingFault::Cycle {
                from: trailer(BASES[2]),
                to: trailer(BASES[1])
            }]
        );
        assert_eq!(ring.regions.len(), 3);
    }

    #[test]
    fn lists_that_stop_short_are_open() {
        let ring = walk_tiny(|image, _| image.set_region_next(trailer(BASES[1]), 0));
        assert_eq!(
            ring.faults,
            vec![RingFault::Open {
                at: trailer(BASES[1]),
                expected_last: trailer(BASES[2])
            }]
        );
    }

    #[test]
    fn lists_longer_than_the_region_count_are_cut() {
        let ring = walk_tiny(|image, zone| {
            image.set_num_regions(zone, SizeClass::Tiny, 1);
        });
        assert_eq!(ring.regions.len(), 2);
        assert!(ring.faults.contains(&RingFault::TooLong { bound: 2 }));
    }

    #[test]
    fn regions_owned_elsewhere_are_flagged() {
        let ring = walk_tiny(|image, _| {
            image.region(SizeClass::Tiny, BASES[1], 3);
        });
        // rewriting the trailer also cut the links after it
        assert!(ring.faults.contains(&RingFault::ForeignRegion {
            region: BASES[1],
            mag_index: 3
        }));
        assert!(ring.faults.iter().any(|f| matches!(f, RingFault::BackLink { .. })));
    }
}
