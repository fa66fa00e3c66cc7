//! Read the state of a magazine allocator (the macOS `szone` scalable
//! allocator and its relatives) out of another process's memory or a saved
//! snapshot of it.
//!
//! ```no_run
//! use magheap::{inspect::Inspector, layout::{layout_for, Architecture}, source::Snapshot};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let snapshot = Snapshot::from_file("heap.json")?;
//! let layout = layout_for(Architecture::X86_64, 8)?;
//! let inspector = Inspector::new(&snapshot, layout);
//! let zone = inspector.zone(0x1_0000_0000)?;
//! println!("{:?}", inspector.resolve(&zone, 0x1_0000_8010)?);
//! # Ok(())
//! # }
//! ```

pub mod decode;
pub mod error;
pub mod graph;
pub mod heap;
pub mod inspect;
pub mod layout;
pub mod logging;
pub mod os;
pub mod serialize;
pub mod source;
pub mod synth;
pub mod util;

pub use error::{DecodeError, InspectError, UnreadableMemory};
pub use inspect::{CancelToken, Inspector};

/// The result of decoding one item, where a failure only affects that item.
pub type Outcome<T> = Result<T, DecodeError>;
