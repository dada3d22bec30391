//! Ethereum data types.
//!
//! Numeric primitives come from [`ethereum_types`], whose serde
//! implementations produce the `0x`-prefixed minimal hex encoding that
//! JSON-RPC quantities require (`0x0` for zero, no leading zeros otherwise).

pub use ethereum_types::{Address, H160, H256, U256, U64};

/// A transaction hash.
pub type TxHash = H256;

mod bytes;
pub use bytes::{Bytes, ParseBytesError};

mod block;
pub use block::{Block, BlockNumber};

mod chain;
pub use chain::ChainProfile;

mod transaction;
pub use transaction::{AccessList, AccessListItem, TransactionReceipt, TransactionRequest};
