//! Host-specific memory sources.

#[cfg(target_os = "linux")]
mod mem;

#[cfg(target_os = "linux")]
pub use mem::{LiveProcess, Mapping};
