//! What the decoded structures add up to: free lists, region lists,
//! occupancy, and which block an address falls in.

pub mod bitmap;
pub mod free_list;
pub mod resolve;
pub mod ring;

pub use bitmap::{BlockExtent, Granule, RegionBitmap};
pub use free_list::{FreeBlock, FreeListGraph, FreeSlot, SlotFault, SlotStatus};
pub use resolve::{Block, BlockState, Discrepancy, Evidence, Resolution, ResolveReport};
pub use ring::{RegionRing, RingFault, RingStatus};
