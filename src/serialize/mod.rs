pub mod serde_addr;
pub mod serde_hex;
