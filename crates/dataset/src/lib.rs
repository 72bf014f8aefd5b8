//! Dataset storage: the COCO manifest, its single-writer accumulator, the
//! per-job shard log, and YOLO sidecar files.
//!
//! All writes go through [`atomic::write_atomic`], so a reader only ever
//! sees a complete file.

pub mod accumulator;
pub mod atomic;
pub mod error;
pub mod manifest;
pub mod shards;
pub mod sidecar;

pub use accumulator::{Accumulator, AccumulatorHandle, AccumulatorReport};
pub use error::DatasetError;
pub use manifest::{CocoDataset, DatasetEntry, ImageRecord};
pub use shards::{compact, CompactionReport, ShardLog};
