use serde::Serialize;

use super::{Decode, StructBytes};
use crate::{
    error::StructKind,
    layout::{LinkEncoding, StructLayout},
    serialize::serde_addr,
    Outcome,
};

/// A `previous`/`next` link out of a free block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Link {
    /// As stored.
    pub raw: u64,
    #[serde(with = "serde_addr")]
    pub pointer: u64,
    /// Always true for plain links.
    pub checksum_ok: bool,
}

impl Link {
    pub fn decode(raw: u64, encoding: LinkEncoding, cookie: u64) -> Link {
        match encoding {
            LinkEncoding::Plain => Link {
                raw,
                pointer: raw,
                checksum_ok: true,
            },
            LinkEncoding::Checksummed { rotate } => {
                let t = raw.rotate_left(rotate);
                let mask = (1u64 << rotate) - 1;
                let pointer = t & !mask;
                Link {
                    raw,
                    pointer,
                    checksum_ok: t & mask == checksum(pointer ^ cookie) & mask,
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        self.pointer == 0
    }
}

/// Byte sum, low four bits.
fn checksum(value: u64) -> u64 {
    u64::from(value.to_le_bytes().iter().fold(0u8, |a, &b| a.wrapping_add(b)) & 0xf)
}

/// Inverse of [`Link::decode`]: what the allocator would store for
/// `pointer`.
pub fn encode_link(pointer: u64, encoding: LinkEncoding, cookie: u64) -> u64 {
    match encoding {
        LinkEncoding::Plain => pointer,
        LinkEncoding::Checksummed { rotate } => {
            let mask = (1u64 << rotate) - 1;
            (pointer | (checksum(pointer ^ cookie) & mask)).rotate_right(rotate)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeNodeContext {
    pub cookie: u64,
    /// The node is on a slot whose blocks are one quantum long, so it holds no
    /// msize.
    pub unit: bool,
}

/// The header of a free block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FreeNode {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub previous: Link,
    pub next: Link,
    /// Size in quanta; 1 for unit nodes.
    pub msize: u64,
}

impl Decode for FreeNode {
    type Context = FreeNodeContext;
    const KIND: StructKind = StructKind::FreeNode;

    fn size(layout: &StructLayout, cx: &FreeNodeContext) -> usize {
        let n = &layout.free_node;
        if cx.unit {
            n.previous.end().max(n.next.end()).unwrap_or(n.size)
        } else {
            n.size
        }
    }

    fn decode_from(b: &StructBytes<'_>, layout: &StructLayout, cx: &FreeNodeContext) -> Outcome<Self> {
        let n = &layout.free_node;
        let msize = if cx.unit {
            1
        } else {
            u64::from(b.u16(n.msize)?)
        };
        Ok(FreeNode {
            address: b.address(),
            previous: Link::decode(b.u64(n.previous)?, n.link_encoding, cx.cookie),
            next: Link::decode(b.u64(n.next)?, n.link_encoding, cx.cookie),
            msize,
        })
    }
}
