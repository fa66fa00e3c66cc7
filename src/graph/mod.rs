//! The heap as a graph of what points at what, for export.

mod heap;

pub use heap::{HeapEdge, HeapGraph, HeapNode};
