use std::cell::RefCell;

use hashbrown::HashMap;

use super::{checked_end, MemorySource, SourceKind};
use crate::error::UnreadableMemory;

const LINE: u64 = 0x1000;

/// Page cache in front of another source. Build one per query and drop it at
/// the end; it is never invalidated.
///
/// A line that cannot be read in full is remembered as missing, and reads
/// touching it are forwarded to the inner source as-is so that partially
/// mapped pages still work.
pub struct CachedSource<'a> {
    inner: &'a dyn MemorySource,
    lines: RefCell<HashMap<u64, Option<Box<[u8]>>>>,
}

impl<'a> CachedSource<'a> {
    pub fn new(inner: &'a dyn MemorySource) -> Self {
        Self {
            inner,
            lines: RefCell::new(HashMap::new()),
        }
    }

    /// Copy from cached lines, or return `false` if some line is missing.
    fn read_cached(&self, address: u64, buf: &mut [u8]) -> bool {
        let mut lines = self.lines.borrow_mut();
        let mut done = 0;
        while done < buf.len() {
            let at = address + done as u64;
            let base = at - at % LINE;
            let line = lines.entry(base).or_insert_with(|| {
                let mut line = vec![0; LINE as usize].into_boxed_slice();
                self.inner.read_into(base, &mut line).ok().map(|()| line)
            });
            let Some(line) = line else {
                return false;
            };
            let from = (at - base) as usize;
            let n = (LINE as usize - from).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&line[from..from + n]);
            done += n;
        }
        true
    }
}

impl MemorySource for CachedSource<'_> {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), UnreadableMemory> {
        checked_end(address, buf.len())?;
        // the last line may end exactly at u64::MAX + 1
        if address.checked_add(buf.len() as u64 + LINE).is_none() {
            return self.inner.read_into(address, buf);
        }
        if self.read_cached(address, buf) {
            Ok(())
        } else {
            self.inner.read_into(address, buf)
        }
    }

    fn kind(&self) -> SourceKind {
        self.inner.kind()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::source::Snapshot;

    struct Counting {
        snapshot: Snapshot,
        reads: Cell<usize>,
    }

    impl MemorySource for Counting {
        fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), UnreadableMemory> {
            self.reads.set(self.reads.get() + 1);
            self.snapshot.read_into(address, buf)
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Live
        }
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let mut snapshot = Snapshot::new();
        snapshot.store(0x1000, (0..=255).cycle().take(0x2000).collect());
        let counting = Counting {
            snapshot,
            reads: Cell::new(0),
        };
        let cached = CachedSource::new(&counting);

        assert_eq!(cached.read_u64(0x1008).unwrap(), counting.snapshot.read_u64(0x1008).unwrap());
        assert_eq!(cached.read_u32(0x1100).unwrap(), counting.snapshot.read_u32(0x1100).unwrap());
        assert_eq!(counting.reads.get(), 1);

        // straddles two lines
        assert_eq!(cached.read(0x1ffc, 8).unwrap(), counting.snapshot.read(0x1ffc, 8).unwrap());
        assert_eq!(counting.reads.get(), 2);
        assert_eq!(cached.kind(), SourceKind::Live);
    }

    #[test]
    fn partially_mapped_pages_fall_back_to_exact_reads() {
        let mut snapshot = Snapshot::new();
        snapshot.store(0x1010, vec![5; 0x20]);
        let cached = CachedSource::new(&snapshot);

        assert_eq!(cached.read(0x1018, 8).unwrap(), vec![5; 8]);
        assert_eq!(
            cached.read(0x1028, 0x10),
            Err(UnreadableMemory::new(0x1028, 0x10))
        );
        assert!(cached.read_u64(0x5000).is_err());
    }
}
