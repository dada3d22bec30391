use super::U256;

/// Fee-market capabilities of the chain a provider is connected to.
///
/// The gas-fill pipeline consults this to decide between EIP-1559 and legacy
/// pricing, and for a chain-specific priority fee default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainProfile {
    /// The chain id, as returned by `eth_chainId`.
    pub chain_id: u64,
    /// Whether blocks on this chain carry a `baseFeePerGas`.
    pub supports_eip1559: bool,
    /// Priority fee to use when the caller provides none. Falls back to
    /// 1 gwei when unset.
    pub default_priority_fee: Option<U256>,
}

impl ChainProfile {
    /// A profile for an EIP-1559 chain with the given id.
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id, supports_eip1559: true, default_priority_fee: None }
    }

    /// A profile for a chain without a fee market; the gas-fill pipeline will
    /// always use legacy `gasPrice` pricing.
    pub fn legacy(chain_id: u64) -> Self {
        Self { chain_id, supports_eip1559: false, default_priority_fee: None }
    }

    /// Ethereum mainnet.
    pub fn mainnet() -> Self {
        Self::new(1)
    }

    /// Sets the default priority fee used when the caller provides none.
    #[must_use]
    pub fn with_default_priority_fee(mut self, fee: U256) -> Self {
        self.default_priority_fee = Some(fee);
        self
    }
}

impl Default for ChainProfile {
    fn default() -> Self {
        Self::mainnet()
    }
}
