#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Data types and small utilities consumed by the `ethlink` transport core.
//!
//! This crate deliberately carries no transport, signing or RLP machinery:
//! it is the vocabulary the dispatch core speaks — quantities, byte strings,
//! transaction requests, block headers and chain profiles.

pub mod types;

pub mod utils;

// Re-export the ABI crate used for multicall encoding and revert decoding so
// downstream crates agree on its version.
pub use ethabi;
