#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # ethlink
//!
//! A low-latency JSON-RPC 2.0 transport and dispatch core for Ethereum-style
//! nodes: multiplexed WebSocket and one-shot HTTP transports, a classifying
//! retry layer, a gas-fill pipeline, a multicall batcher and a dev-node
//! control surface.
//!
//! ## Quickstart: `prelude`
//!
//! ```no_run
//! # #[allow(unused)]
//! use ethlink::prelude::*;
//! ```
//!
//! ## Modules
//!
//! - [`core`]: the data types the transport core consumes ([`core::types`],
//!   [`core::utils`]).
//! - [`providers`]: the transports themselves ([`providers::Http`],
//!   [`providers::WsClient`], [`providers::RetryClient`]), the typed
//!   [`providers::Provider`] front-end with its gas-fill pipeline, and the
//!   multicall and dev-node extensions under [`providers::ext`].

pub use ethlink_core as core;
pub use ethlink_providers as providers;

/// Easy imports of frequently used type definitions and traits.
#[doc(hidden)]
pub mod prelude {
    pub use super::core::{types::*, utils};
    pub use super::providers::*;
}
