//! Error kinds surfaced by the engine.
//!
//! [`UnreadableMemory`] comes straight out of a [`MemorySource`]. The
//! decoder wraps it (or a failed sanity bound) into a [`DecodeError`] that
//! names the structure and address being decoded. Queries on the
//! [`Inspector`] return [`InspectError`], which only fails the whole query for
//! root structures; leaf failures travel inside results as
//! [`Outcome`](crate::Outcome) values and annotations.
//!
//! [`MemorySource`]: crate::source::MemorySource
//! [`Inspector`]: crate::inspect::Inspector

use std::{fmt, io};

use serde::Serialize;
use thiserror::Error;

use crate::{layout::Architecture, serialize::serde_addr};

/// A byte range that the source could not produce.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[error("cannot read {length:#x} bytes at {address:#x}")]
pub struct UnreadableMemory {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub length: usize,
}

impl UnreadableMemory {
    pub const fn new(address: u64, length: usize) -> Self {
        Self { address, length }
    }
}

/// Which allocator structure was being decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StructKind {
    ZoneRegistry,
    Zone,
    ZoneName,
    ComplexZone,
    Magazine,
    RegionTrailer,
    RegionMetadata,
    RegionGeneration,
    FreeNode,
    LargeEntry,
}

impl fmt::Display for StructKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StructKind::ZoneRegistry => "zone registry",
            StructKind::Zone => "zone",
            StructKind::ZoneName => "zone name",
            StructKind::ComplexZone => "complex zone",
            StructKind::Magazine => "magazine",
            StructKind::RegionTrailer => "region trailer",
            StructKind::RegionMetadata => "region metadata",
            StructKind::RegionGeneration => "region hash generation",
            StructKind::FreeNode => "free node",
            StructKind::LargeEntry => "large entry",
        })
    }
}

#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum DecodeError {
    #[error("{kind} at {address:#x}: {source}")]
    Unreadable {
        kind: StructKind,
        #[serde(with = "serde_addr")]
        address: u64,
        source: UnreadableMemory,
    },
    #[error("{kind} at {address:#x} is malformed: {reason}")]
    Malformed {
        kind: StructKind,
        #[serde(with = "serde_addr")]
        address: u64,
        reason: String,
    },
}

impl DecodeError {
    pub fn unreadable(kind: StructKind, address: u64, source: UnreadableMemory) -> Self {
        Self::Unreadable {
            kind,
            address,
            source,
        }
    }

    pub fn malformed(kind: StructKind, address: u64, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            address,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> StructKind {
        match self {
            Self::Unreadable { kind, .. } | Self::Malformed { kind, .. } => *kind,
        }
    }

    /// Address of the structure that failed to decode.
    pub fn address(&self) -> u64 {
        match self {
            Self::Unreadable { address, .. } | Self::Malformed { address, .. } => *address,
        }
    }

    pub fn is_unreadable(&self) -> bool {
        matches!(self, Self::Unreadable { .. })
    }
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum InspectError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no struct layout for allocator version {version} on {arch}")]
    UnsupportedAllocatorVersion { arch: Architecture, version: u32 },
    #[error("query cancelled")]
    Cancelled,
}

impl InspectError {
    /// The decode error underneath, if that is what this is.
    pub fn as_decode(&self) -> Option<&DecodeError> {
        match self {
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

/// Failure loading something (a snapshot, a layout table) from disk.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum FromFileError {
    #[error("i/o error: {0}")]
    IoError(#[from] io::Error),
    #[error("json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("invalid layout: {0}")]
    Layout(#[from] crate::layout::LayoutError),
    #[error("segment at {address:#x} wraps the address space")]
    WrappingSegment { address: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_name_structure_and_address() {
        let e = DecodeError::unreadable(
            StructKind::Magazine,
            0x7000,
            UnreadableMemory::new(0x7018, 8),
        );
        assert_eq!(
            e.to_string(),
            "magazine at 0x7000: cannot read 0x8 bytes at 0x7018"
        );
        assert!(e.is_unreadable());
        assert_eq!(e.kind(), StructKind::Magazine);

        let e = DecodeError::malformed(StructKind::ComplexZone, 0x2000, "too many magazines");
        assert_eq!(e.address(), 0x2000);
        assert!(e.to_string().contains("is malformed: too many magazines"));
    }
}
