//! Region occupancy metadata to per-quantum state.

use serde::Serialize;

use crate::{
    decode::{le_words, Region},
    error::{DecodeError, StructKind},
    layout::{MetadataFormat, StructLayout},
    source::MemorySource,
    Outcome,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granule {
    Free,
    InUse,
}

/// A run of quanta the metadata describes as one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct BlockExtent {
    /// Index of the first quantum.
    pub start: u64,
    pub msize: u64,
    pub state: Granule,
}

impl BlockExtent {
    pub fn end(&self) -> u64 {
        self.start + self.msize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Quanta not covered by any block header.
    NoBlockHeader,
    /// A block claims to run past the end of the region.
    PastRegionEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Anomaly {
    pub start: u64,
    pub len: u64,
    pub kind: AnomalyKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegionBitmap {
    pub granules: Vec<Granule>,
    /// Sorted, covering every quantum exactly once.
    pub extents: Vec<BlockExtent>,
    /// Whether `extents` are the allocator's blocks. A packed bitmap has no
    /// block boundaries, so its extents are runs of equal state instead.
    pub exact: bool,
    pub anomalies: Vec<Anomaly>,
}

impl RegionBitmap {
    /// Unpack `bytes` of `format` metadata describing `quanta` quanta.
    /// `address` is only used to label errors.
    pub fn unpack(format: MetadataFormat, bytes: &[u8], quanta: u64, address: u64) -> Outcome<RegionBitmap> {
        let expected = format.bytes_for(quanta);
        if bytes.len() as u64 != expected {
            return Err(DecodeError::malformed(
                StructKind::RegionMetadata,
                address,
                format!("{:#x} bytes of metadata, {expected:#x} expected", bytes.len()),
            ));
        }
        let mut out = RegionBitmap {
            granules: Vec::with_capacity(quanta as usize),
            extents: Vec::new(),
            exact: true,
            anomalies: Vec::new(),
        };
        match format {
            MetadataFormat::Packed { set_means_in_use } => {
                out.exact = false;
                let bits = le_words(bytes).flat_map(|w| (0..32).map(move |bit| w & (1 << bit) != 0));
                for set in bits.take(quanta as usize) {
                    out.push_run(if set == set_means_in_use {
                        Granule::InUse
                    } else {
                        Granule::Free
                    });
                }
            }
            MetadataFormat::HeaderInuse => {
                let words: Vec<u32> = le_words(bytes).collect();
                let bit = |word: usize, i: u64| words[(i / 32) as usize * 2 + word] & (1 << (i % 32)) != 0;
                let header = |i| bit(0, i);
                let mut index = 0;
                while index < quanta {
                    let next = (index + 1..quanta).find(|&i| header(i)).unwrap_or(quanta);
                    if header(index) {
                        let state = if bit(1, index) {
                            Granule::InUse
                        } else {
                            Granule::Free
                        };
                        out.push_block(index, next - index, state);
                    } else {
                        out.push_anomaly(index, next - index, AnomalyKind::NoBlockHeader);
                    }
                    index = next;
                }
            }
            MetadataFormat::MsizeTable => {
                let table: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|e| u16::from_le_bytes([e[0], e[1]]))
                    .collect();
                let mut index = 0;
                while index < quanta {
                    let entry = table[index as usize];
                    let msize = u64::from(entry & 0x7fff);
                    if msize == 0 {
                        let next = (index + 1..quanta)
                            .find(|&i| table[i as usize] & 0x7fff != 0)
                            .unwrap_or(quanta);
                        out.push_anomaly(index, next - index, AnomalyKind::NoBlockHeader);
                        index = next;
                        continue;
                    }
                    let state = if entry & 0x8000 != 0 {
                        Granule::Free
                    } else {
                        Granule::InUse
                    };
                    let msize = if index + msize > quanta {
                        out.anomalies.push(Anomaly {
                            start: index,
                            len: index + msize - quanta,
                            kind: AnomalyKind::PastRegionEnd,
                        });
                        quanta - index
                    } else {
                        msize
                    };
                    out.push_block(index, msize, state);
                    index += msize;
                }
            }
        }
        Ok(out)
    }

    fn push_block(&mut self, start: u64, msize: u64, state: Granule) {
        self.granules.extend(std::iter::repeat(state).take(msize as usize));
        self.extents.push(BlockExtent { start, msize, state });
    }

    /// Unclaimed quanta count as free.
    fn push_anomaly(&mut self, start: u64, len: u64, kind: AnomalyKind) {
        self.anomalies.push(Anomaly { start, len, kind });
        self.push_block(start, len, Granule::Free);
    }

    /// Extend the last extent if it has the same state.
    fn push_run(&mut self, state: Granule) {
        let start = self.granules.len() as u64;
        self.granules.push(state);
        match self.extents.last_mut() {
            Some(last) if last.state == state => last.msize += 1,
            _ => self.extents.push(BlockExtent {
                start,
                msize: 1,
                state,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.granules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granules.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<Granule> {
        self.granules.get(index as usize).copied()
    }

    /// The extent containing quantum `index`.
    pub fn extent_at(&self, index: u64) -> Option<BlockExtent> {
        let i = self.extents.partition_point(|e| e.end() <= index);
        self.extents.get(i).copied().filter(|e| e.start <= index)
    }

    /// Whether quantum `index` is covered by an anomaly.
    pub fn is_anomalous(&self, index: u64) -> bool {
        self.anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::NoBlockHeader && (a.start..a.start + a.len).contains(&index))
    }
}

/// Read and unpack the metadata of `region`.
pub fn decode<S>(source: &S, layout: &StructLayout, region: &Region) -> Outcome<RegionBitmap>
where
    S: MemorySource + ?Sized,
{
    let geometry = layout.size_class(region.class);
    let bytes = region.read_metadata(source, layout)?;
    RegionBitmap::unpack(
        geometry.metadata,
        &bytes,
        region.quanta,
        region.address + geometry.metadata_offset,
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    const PACKED: MetadataFormat = MetadataFormat::Packed {
        set_means_in_use: true,
    };

    #[test]
    fn packed_bits_match_pattern() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for quanta in [1u64, 31, 32, 33, 256, 1000] {
            let pattern: Vec<bool> = (0..quanta).map(|_| rng.gen()).collect();
            let mut bytes = vec![0u8; PACKED.bytes_for(quanta) as usize];
            for (i, &set) in pattern.iter().enumerate() {
                if set {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            let bitmap = RegionBitmap::unpack(PACKED, &bytes, quanta, 0).unwrap();
            assert_eq!(bitmap.len() as u64, quanta);
            let expected: Vec<Granule> = pattern
                .iter()
                .map(|&set| if set { Granule::InUse } else { Granule::Free })
                .collect();
            assert_eq!(bitmap.granules, expected);
            assert!(!bitmap.exact);
            assert_eq!(bitmap.extents.iter().map(|e| e.msize).sum::<u64>(), quanta);
        }
    }

    #[test]
    fn packed_polarity_is_configurable() {
        let inverted = MetadataFormat::Packed {
            set_means_in_use: false,
        };
        let bitmap = RegionBitmap::unpack(inverted, &[0b10, 0, 0, 0], 3, 0).unwrap();
        assert_eq!(
            bitmap.granules,
            vec![Granule::InUse, Granule::Free, Granule::InUse]
        );
    }

    #[test]
    fn metadata_of_the_wrong_length_is_malformed() {
        let too_long = vec![0u8; 64];
        let e = RegionBitmap::unpack(PACKED, &too_long, 256, 0x2020).unwrap_err();
        assert_eq!(e.kind(), StructKind::RegionMetadata);
        assert_eq!(e.address(), 0x2020);
        assert!(RegionBitmap::unpack(PACKED, &[0; 4], 256, 0).is_err());
    }

    #[test]
    fn header_inuse_pairs_give_block_extents() {
        // blocks at 0 (3 quanta, in use), 3 (2 quanta, free), 5 (rest, in use)
        let header: u32 = 0b101001;
        let inuse: u32 = 0b100001;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&header.to_le_bytes());
        bytes.extend_from_slice(&inuse.to_le_bytes());
        let bitmap = RegionBitmap::unpack(MetadataFormat::HeaderInuse, &bytes, 8, 0).unwrap();
        assert_eq!(
            bitmap.extents,
            vec![
                BlockExtent { start: 0, msize: 3, state: Granule::InUse },
                BlockExtent { start: 3, msize: 2, state: Granule::Free },
                BlockExtent { start: 5, msize: 3, state: Granule::InUse },
            ]
        );
        assert_eq!(bitmap.extent_at(4), Some(bitmap.extents[1]));
        assert_eq!(bitmap.extent_at(8), None);
        assert!(bitmap.anomalies.is_empty());
    }

    #[test]
    fn quanta_before_the_first_header_are_anomalies() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0b100u32.to_le_bytes());
        bytes.extend_from_slice(&0b100u32.to_le_bytes());
        let bitmap = RegionBitmap::unpack(MetadataFormat::HeaderInuse, &bytes, 4, 0).unwrap();
        assert_eq!(
            bitmap.anomalies,
            vec![Anomaly { start: 0, len: 2, kind: AnomalyKind::NoBlockHeader }]
        );
        assert_eq!(bitmap.get(0), Some(Granule::Free));
        assert_eq!(bitmap.get(2), Some(Granule::InUse));
        assert!(bitmap.is_anomalous(1));
        assert!(!bitmap.is_anomalous(2));
    }

    #[test]
    fn msize_table_walks_block_by_block() {
        let mut table = [0u16; 6];
        table[0] = 2;
        table[2] = 0x8000 | 1;
        table[3] = 5; // runs two quanta past the end
        let bytes: Vec<u8> = table.iter().flat_map(|e| e.to_le_bytes()).collect();
        let bitmap = RegionBitmap::unpack(MetadataFormat::MsizeTable, &bytes, 6, 0).unwrap();
        assert_eq!(
            bitmap.granules,
            vec![
                Granule::InUse,
                Granule::InUse,
                Granule::Free,
                Granule::InUse,
                Granule::InUse,
                Granule::InUse
            ]
        );
        assert_eq!(
            bitmap.anomalies,
            vec![Anomaly { start: 3, len: 2, kind: AnomalyKind::PastRegionEnd }]
        );
        assert_eq!(bitmap.extent_at(5).map(|e| e.msize), Some(3));
    }
}
