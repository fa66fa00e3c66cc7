use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Read, Write},
    ops::Range,
    path::Path,
};

use log::debug;
use serde::{Deserialize, Serialize};

use super::{checked_end, MemorySource, SourceKind};
use crate::{
    error::{FromFileError, UnreadableMemory},
    serialize::{serde_addr, serde_hex},
};

/// A captured, immutable image of (part of) an address space. Any address
/// not inside a stored segment is unmapped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Start address to bytes. Segments never overlap or touch; [`store`]
    /// merges them.
    ///
    /// [`store`]: Snapshot::store
    segments: BTreeMap<u64, Vec<u8>>,
}

/// One mapped span of a [`Snapshot`], as it appears in the JSON file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(with = "serde_addr")]
    pub address: u64,
    #[serde(with = "serde_hex")]
    pub bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    segments: Vec<Segment>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `address`. Bytes already stored in the same span are
    /// overwritten; overlapping and adjacent segments are merged.
    ///
    /// # Panics
    /// - If `address + bytes.len()` overflows the address space
    pub fn store(&mut self, address: u64, bytes: Vec<u8>) {
        let end = address
            .checked_add(bytes.len() as u64)
            .unwrap_or_else(|| panic!("segment at {address:#x} wraps the address space"));
        if bytes.is_empty() {
            return;
        }

        let touching: Vec<u64> = self
            .segments
            .range(..=end)
            .rev()
            .take_while(|(&start, seg)| start + seg.len() as u64 >= address)
            .map(|(&start, _)| start)
            .collect();
        if touching.is_empty() {
            self.segments.insert(address, bytes);
            return;
        }

        let mut lo = address;
        let mut hi = end;
        let mut old = Vec::with_capacity(touching.len());
        for start in touching {
            if let Some(seg) = self.segments.remove(&start) {
                lo = lo.min(start);
                hi = hi.max(start + seg.len() as u64);
                old.push((start, seg));
            }
        }
        let mut merged = vec![0; (hi - lo) as usize];
        for (start, seg) in old {
            let at = (start - lo) as usize;
            merged[at..at + seg.len()].copy_from_slice(&seg);
        }
        let at = (address - lo) as usize;
        merged[at..at + bytes.len()].copy_from_slice(&bytes);
        self.segments.insert(lo, merged);
    }

    /// Store a little-endian `u64`.
    pub fn store_u64(&mut self, address: u64, value: u64) {
        self.store(address, value.to_le_bytes().to_vec());
    }

    /// Copy `ranges` out of another source. Pages that cannot be read are
    /// left unmapped in the result.
    pub fn capture<S, I>(source: &S, ranges: I) -> Snapshot
    where
        S: MemorySource + ?Sized,
        I: IntoIterator<Item = Range<u64>>,
    {
        const CHUNK: u64 = 0x1000;
        let mut snapshot = Snapshot::new();
        for range in ranges {
            let mut at = range.start;
            while at < range.end {
                let next = (at - at % CHUNK).saturating_add(CHUNK).min(range.end);
                match source.read(at, (next - at) as usize) {
                    Ok(bytes) => snapshot.store(at, bytes),
                    Err(e) => debug!("snapshot capture skipped: {e}"),
                }
                at = next;
            }
        }
        snapshot
    }

    pub fn segments(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.segments
            .iter()
            .map(|(&start, seg)| start..start + seg.len() as u64)
    }

    pub fn is_mapped(&self, address: u64) -> bool {
        self.segment_containing(address).is_some()
    }

    fn segment_containing(&self, address: u64) -> Option<(u64, &[u8])> {
        let (&start, seg) = self.segments.range(..=address).next_back()?;
        (address < start + seg.len() as u64).then_some((start, seg.as_slice()))
    }

    pub fn write_to_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path>,
    {
        let out = SnapshotFile {
            segments: self
                .segments
                .iter()
                .map(|(&address, bytes)| Segment {
                    address,
                    bytes: bytes.clone(),
                })
                .collect(),
        };
        let mut file = File::create(path)?;
        file.write_all(&serde_json::to_vec(&out)?)?;
        Ok(())
    }

    /// Load a snapshot written by [`write_to_file`](Snapshot::write_to_file)
    /// (or by hand).
    pub fn from_file<P>(path: P) -> Result<Self, FromFileError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let parsed: SnapshotFile = serde_json::from_str(&buf)?;
        let mut snapshot = Snapshot::new();
        for Segment { address, bytes } in parsed.segments {
            if address.checked_add(bytes.len() as u64).is_none() {
                return Err(FromFileError::WrappingSegment { address });
            }
            snapshot.store(address, bytes);
        }
        Ok(snapshot)
    }
}

impl MemorySource for Snapshot {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), UnreadableMemory> {
        let unreadable = UnreadableMemory::new(address, buf.len());
        checked_end(address, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let at = address + done as u64;
            let (start, seg) = self.segment_containing(at).ok_or(unreadable)?;
            let from = (at - start) as usize;
            let n = (seg.len() - from).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&seg[from..from + n]);
            done += n;
        }
        Ok(())
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn store_merges_touching_segments() {
        let mut snapshot = Snapshot::new();
        snapshot.store(0x1000, vec![1; 0x10]);
        snapshot.store(0x1020, vec![3; 0x10]);
        assert_eq!(snapshot.segments().count(), 2);

        snapshot.store(0x1010, vec![2; 0x10]);
        assert_eq!(snapshot.segments().collect::<Vec<_>>(), vec![0x1000..0x1030]);
        assert_eq!(snapshot.read(0x100f, 3).unwrap(), vec![1, 2, 2]);
        assert_eq!(snapshot.read(0x102f, 1).unwrap(), vec![3]);
    }

    #[test]
    fn later_stores_overwrite() {
        let mut snapshot = Snapshot::new();
        snapshot.store(0x1000, vec![0; 0x20]);
        snapshot.store_u64(0x1008, 0xdead_beef);
        assert_eq!(snapshot.read_u64(0x1008).unwrap(), 0xdead_beef);
        assert_eq!(snapshot.read_u64(0x1000).unwrap(), 0);
        assert_eq!(snapshot.segments().count(), 1);
    }

    #[test]
    fn reads_never_cross_a_hole() {
        let mut snapshot = Snapshot::new();
        snapshot.store(0x1000, vec![0xaa; 0x10]);
        snapshot.store(0x1020, vec![0xbb; 0x10]);
        assert_eq!(
            snapshot.read(0x1008, 0x20),
            Err(UnreadableMemory::new(0x1008, 0x20))
        );
        assert_eq!(
            snapshot.read(u64::MAX - 2, 8),
            Err(UnreadableMemory::new(u64::MAX - 2, 8))
        );
        assert!(snapshot.read(0x1010, 0).is_ok());
    }

    #[test]
    fn capture_keeps_only_readable_pages() {
        let mut original = Snapshot::new();
        original.store(0x1000, vec![7; 0x1000]);
        original.store(0x3000, vec![9; 0x800]);

        let copy = Snapshot::capture(&original, [0x1800..0x3400]);
        assert_eq!(
            copy.segments().collect::<Vec<_>>(),
            vec![0x1800..0x2000, 0x3000..0x3400]
        );

        let copy = Snapshot::capture(&original, [0x1000..0x2000, 0x3000..0x3800]);
        assert_eq!(copy, original);
    }
}
