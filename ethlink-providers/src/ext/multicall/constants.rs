use ethlink_core::types::{Address, H160};

/// The Multicall3 contract address, identical on most supported chains:
/// [`0xcA11bde05977b3631167028862bE2a173976CA11`](https://etherscan.io/address/0xcA11bde05977b3631167028862bE2a173976CA11)
pub const MULTICALL_ADDRESS: Address = H160([
    0xca, 0x11, 0xbd, 0xe0, 0x59, 0x77, 0xb3, 0x63, 0x11, 0x67, 0x02, 0x88, 0x62, 0xbe, 0x2a,
    0x17, 0x39, 0x76, 0xca, 0x11,
]);

/// Selector of `aggregate3((address,bool,bytes)[])`.
pub const AGGREGATE3_SELECTOR: [u8; 4] = [0x82, 0xad, 0x56, 0xcb];

/// Calls per `eth_call` unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Upper bound on the configurable chunk size.
pub const MAX_CHUNK_SIZE: usize = 1000;
