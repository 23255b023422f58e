//! Media probing: extracting structured information from files on disk.

pub mod probe;

pub use probe::{MediaInfo, MediaProbe};
