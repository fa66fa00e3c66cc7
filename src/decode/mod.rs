//! Typed views of allocator structures.
//!
//! Every structure is read in one piece, then picked apart field by field
//! with offsets from the [`StructLayout`]. Values that cannot be right (a
//! negative magazine count, a region that claims more bytes than it has) are
//! rejected as [`DecodeError::Malformed`] so that random memory is not
//! mistaken for a header.

pub mod free_node;
pub mod magazine;
pub mod region;
pub mod zone;

pub use free_node::{encode_link, FreeNode, FreeNodeContext, Link};
pub use magazine::{Magazine, MagazineContext, ReuseCache};
pub use region::{Region, RegionGeneration, RegionTrailer};
pub use zone::{large_entries, zone_addresses, ComplexZone, LargeEntry, LargeTable, MagazineSet, Zone};

use bytemuck::Pod;

use crate::{
    error::{DecodeError, StructKind},
    layout::{Field, StructLayout},
    source::MemorySource,
    Outcome,
};

/// A structure that can be decoded from its bytes.
pub trait Decode: Sized {
    /// Extra information the layout alone does not give (size class, cookie).
    type Context;

    const KIND: StructKind;

    /// Bytes to read.
    fn size(layout: &StructLayout, cx: &Self::Context) -> usize;

    fn decode_from(bytes: &StructBytes<'_>, layout: &StructLayout, cx: &Self::Context) -> Outcome<Self>;
}

/// Read and decode a `T` at `address`.
pub fn decode<T, S>(source: &S, layout: &StructLayout, address: u64) -> Outcome<T>
where
    T: Decode<Context = ()>,
    S: MemorySource + ?Sized,
{
    decode_with(source, layout, address, &())
}

pub fn decode_with<T, S>(source: &S, layout: &StructLayout, address: u64, cx: &T::Context) -> Outcome<T>
where
    T: Decode,
    S: MemorySource + ?Sized,
{
    if address == 0 {
        return Err(DecodeError::malformed(T::KIND, address, "null pointer"));
    }
    let size = T::size(layout, cx);
    let bytes = source
        .read(address, size)
        .map_err(|e| DecodeError::unreadable(T::KIND, address, e))?;
    T::decode_from(&StructBytes::new(T::KIND, address, &bytes), layout, cx)
}

/// Integers stored little-endian in the inspected memory.
pub trait LeInt: Pod {
    fn from_le(self) -> Self;
}

macro_rules! le_int {
    ($($t:ty),*) => {
        $(impl LeInt for $t {
            fn from_le(self) -> Self {
                <$t>::from_le(self)
            }
        })*
    };
}

le_int!(u16, u32, u64, i32);

/// The raw bytes of one structure, with the kind and address used to label
/// errors.
pub struct StructBytes<'a> {
    kind: StructKind,
    address: u64,
    bytes: &'a [u8],
}

impl<'a> StructBytes<'a> {
    pub fn new(kind: StructKind, address: u64, bytes: &'a [u8]) -> Self {
        Self {
            kind,
            address,
            bytes,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn kind(&self) -> StructKind {
        self.kind
    }

    pub fn malformed(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::malformed(self.kind, self.address, reason)
    }

    /// The first `size_of::<T>()` bytes of `field`.
    pub fn get<T: LeInt>(&self, field: Field) -> Outcome<T> {
        let end = field.offset + std::mem::size_of::<T>();
        self.bytes
            .get(field.offset..end)
            .map(|b| bytemuck::pod_read_unaligned::<T>(b).from_le())
            .ok_or_else(|| {
                self.malformed(format!(
                    "field at +{:#x} lies outside the {:#x} bytes read",
                    field.offset,
                    self.bytes.len()
                ))
            })
    }

    pub fn u64(&self, field: Field) -> Outcome<u64> {
        self.get(field)
    }

    pub fn u32(&self, field: Field) -> Outcome<u32> {
        self.get(field)
    }

    pub fn i32(&self, field: Field) -> Outcome<i32> {
        self.get(field)
    }

    pub fn u16(&self, field: Field) -> Outcome<u16> {
        self.get(field)
    }

    pub fn slice(&self, field: Field) -> Outcome<&'a [u8]> {
        field.end().and_then(|end| self.bytes.get(field.offset..end)).ok_or_else(|| {
            self.malformed(format!(
                "field at +{:#x} lies outside the {:#x} bytes read",
                field.offset,
                self.bytes.len()
            ))
        })
    }

    /// A view of an embedded structure of `size` bytes at element `index` of
    /// the inline array `field`.
    pub fn element(&self, field: Field, size: usize, index: usize, kind: StructKind) -> Outcome<StructBytes<'a>> {
        let offset = field.offset + index * size;
        if (index + 1) * size > field.size {
            return Err(self.malformed(format!("element {index} is past the end of its array")));
        }
        let bytes = self.slice(Field::new(offset, size))?;
        Ok(StructBytes::new(kind, self.address + offset as u64, bytes))
    }
}

/// Little-endian `u32` words.
pub(crate) fn le_words(bytes: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnreadableMemory;
    use crate::layout::{layout_for, Architecture};
    use crate::source::Snapshot;

    #[test]
    fn fields_are_read_unaligned_and_little_endian() {
        let bytes = [0xff, 0x01, 0x02, 0x03, 0x04, 0xfe, 0xff, 0xff, 0xff];
        let view = StructBytes::new(StructKind::Zone, 0x10, &bytes);
        assert_eq!(view.u32(Field::new(1, 4)).unwrap(), 0x0403_0201);
        assert_eq!(view.i32(Field::new(5, 4)).unwrap(), -2);
        assert_eq!(view.u16(Field::new(0, 2)).unwrap(), 0x01ff);
        assert_eq!(
            view.u64(Field::new(4, 8)),
            Err(DecodeError::malformed(
                StructKind::Zone,
                0x10,
                "field at +0x4 lies outside the 0x9 bytes read"
            ))
        );
    }

    #[test]
    fn short_reads_name_the_structure() {
        let layout = layout_for(Architecture::X86_64, 8).unwrap();
        let mut snapshot = Snapshot::new();
        // only half a large entry is mapped
        snapshot.store(0x5000, vec![0; 0xc]);
        let e = decode::<LargeEntry, _>(&snapshot, layout, 0x5000).unwrap_err();
        assert_eq!(
            e,
            DecodeError::unreadable(
                StructKind::LargeEntry,
                0x5000,
                UnreadableMemory::new(0x5000, 0x18)
            )
        );
        assert!(decode::<LargeEntry, _>(&snapshot, layout, 0).is_err());
    }
}
