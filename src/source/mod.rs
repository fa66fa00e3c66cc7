//! Byte access to an inspected address space.
//!
//! Everything the engine knows about the inspected heap goes through
//! [`MemorySource::read_into`]. A source either produces every requested byte
//! or fails with [`UnreadableMemory`]. Sources never zero-fill and never
//! retry; whether to retry (after stopping the process again, say) is up to
//! the caller.

mod cache;
mod snapshot;

pub use cache::CachedSource;
pub use snapshot::{Segment, Snapshot};

use serde::Serialize;

use crate::error::UnreadableMemory;

/// Whether reads can observe concurrent mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A running (or stopped) process. Two reads may observe different
    /// instants if the process runs in between.
    Live,
    /// An immutable capture. Repeated reads always agree.
    Snapshot,
}

pub trait MemorySource {
    /// Fill `buf` with the bytes at `address..address + buf.len()`.
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), UnreadableMemory>;

    fn kind(&self) -> SourceKind;

    /// Read `length` bytes at `address`.
    fn read(&self, address: u64, length: usize) -> Result<Vec<u8>, UnreadableMemory> {
        let mut buf = vec![0; length];
        self.read_into(address, &mut buf)?;
        Ok(buf)
    }

    /// Read a little-endian `u64`.
    fn read_u64(&self, address: u64) -> Result<u64, UnreadableMemory> {
        let mut buf = [0; 8];
        self.read_into(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a little-endian `u32`.
    fn read_u32(&self, address: u64) -> Result<u32, UnreadableMemory> {
        let mut buf = [0; 4];
        self.read_into(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a NUL-terminated string of at most `max_len` bytes. The string is
    /// read in small pieces, and a piece that is only partly mapped is read
    /// again byte by byte, so a name right before unmapped memory can still
    /// be read. Only a failure on the first byte is an error; anything later
    /// just ends the string.
    fn read_cstring(&self, address: u64, max_len: usize) -> Result<String, UnreadableMemory> {
        const PIECE: u64 = 32;
        let mut out = Vec::new();
        let mut cursor = address;
        while out.len() < max_len {
            let room = (PIECE - cursor % PIECE).min((max_len - out.len()) as u64) as usize;
            let mut piece = vec![0; room];
            let short = match self.read_into(cursor, &mut piece) {
                Ok(()) => false,
                Err(e) => {
                    let mapped = (0..room)
                        .take_while(|&i| self.read_into(cursor + i as u64, &mut piece[i..=i]).is_ok())
                        .count();
                    if out.is_empty() && mapped == 0 {
                        return Err(e);
                    }
                    piece.truncate(mapped);
                    true
                }
            };
            if let Some(nul) = piece.iter().position(|&b| b == 0) {
                out.extend_from_slice(&piece[..nul]);
                break;
            }
            out.extend_from_slice(&piece);
            if short {
                break;
            }
            cursor = match cursor.checked_add(room as u64) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

impl<S> MemorySource for &S
where
    S: MemorySource + ?Sized,
{
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), UnreadableMemory> {
        (**self).read_into(address, buf)
    }

    fn kind(&self) -> SourceKind {
        (**self).kind()
    }
}

impl<S> MemorySource for Box<S>
where
    S: MemorySource + ?Sized,
{
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), UnreadableMemory> {
        (**self).read_into(address, buf)
    }

    fn kind(&self) -> SourceKind {
        (**self).kind()
    }
}

/// Check that `address..address + len` does not wrap.
pub(crate) fn checked_end(address: u64, len: usize) -> Result<u64, UnreadableMemory> {
    address
        .checked_add(len as u64)
        .ok_or(UnreadableMemory::new(address, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstring_stops_at_nul_and_at_unmapped_memory() {
        let mut snapshot = Snapshot::new();
        snapshot.store(0x1000, b"DefaultMallocZone\0garbage".to_vec());
        assert_eq!(
            snapshot.read_cstring(0x1000, 256).unwrap(),
            "DefaultMallocZone"
        );

        // the NUL is mapped but the rest of its 32-byte piece is not
        snapshot.store(0x3000, b"tiny\0".to_vec());
        assert_eq!(snapshot.read_cstring(0x3000, 256).unwrap(), "tiny");
        snapshot.store(0x4010, b"szone".to_vec());
        assert_eq!(snapshot.read_cstring(0x4010, 256).unwrap(), "szone");

        // runs into the end of the mapping without a NUL
        snapshot.store(0x2000 - 4, b"abcd".to_vec());
        assert_eq!(snapshot.read_cstring(0x2000 - 4, 256).unwrap(), "abcd");

        assert_eq!(
            snapshot.read_cstring(0x9000, 16),
            Err(UnreadableMemory::new(0x9000, 16))
        );
    }

    #[test]
    fn integers_are_little_endian() {
        let mut snapshot = Snapshot::new();
        snapshot.store(0x10, vec![0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0x80]);
        assert_eq!(snapshot.read_u32(0x10).unwrap(), 0x1234_5678);
        assert_eq!(snapshot.read_u64(0x10).unwrap(), 0x8000_0000_1234_5678);
    }
}
