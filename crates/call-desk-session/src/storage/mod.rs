//! Metrics storage implementations.

#[cfg(feature = "memory")]
pub mod memory;

pub mod file;

pub use file::FileStorage;
#[cfg(feature = "memory")]
pub use memory::MemoryStorage;
