//! Command-line surface of the dataset worker.
//!
//! Kept in a library so the flag-to-[`Config`](synthblend_core::config::Config)
//! mapping can be tested without running a batch.

pub mod cli;
