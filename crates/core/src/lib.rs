//! Domain logic for synthetic dataset generation.
//!
//! Everything here is independent of the renderer and of storage:
//! configuration, geometry, the asset catalog, scene sampling, projection,
//! annotation encoding, and external process invocation.

pub mod annotation;
pub mod catalog;
pub mod config;
pub mod error;
pub mod geometry;
pub mod process;
pub mod projection;
pub mod sampler;
pub mod types;
