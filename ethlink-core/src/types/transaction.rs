use super::{Address, Bytes, H256, U256, U64};
use serde::{Deserialize, Serialize};

/// Parameters for sending a transaction, as accepted by `eth_call`,
/// `eth_estimateGas` and `eth_sendTransaction`.
///
/// All fields are optional; the gas-fill pipeline completes the unset ones.
/// `gas_price` and the EIP-1559 fee fields are mutually exclusive: each
/// pricing builder clears the other mode's fields and keeps the
/// `is_eip1559` flag consistent, so both modes can never serialize onto
/// the wire together.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    /// Sender address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,

    /// Recipient address. `None` for contract creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,

    /// Gas limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<U256>,

    /// Legacy gas price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,

    /// EIP-1559 fee cap per unit of gas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,

    /// EIP-1559 tip per unit of gas paid to the block producer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,

    /// Transferred value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,

    /// Transaction nonce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<U256>,

    /// Call input data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,

    /// EIP-2930 access list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<AccessList>,

    /// Whether this request should be priced with the EIP-1559 fee fields.
    /// Not a wire field; nodes infer the transaction type from the fields
    /// present.
    #[serde(skip)]
    pub is_eip1559: bool,
}

impl TransactionRequest {
    /// Creates an empty transaction request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience function for sending a new payment transaction to the receiver.
    pub fn pay<T: Into<Address>, V: Into<U256>>(to: T, value: V) -> Self {
        Self::new().to(to).value(value)
    }

    /// Sets the `from` field in the transaction.
    #[must_use]
    pub fn from<T: Into<Address>>(mut self, from: T) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the `to` field in the transaction.
    #[must_use]
    pub fn to<T: Into<Address>>(mut self, to: T) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Sets the `gas` field in the transaction.
    #[must_use]
    pub fn gas<T: Into<U256>>(mut self, gas: T) -> Self {
        self.gas = Some(gas.into());
        self
    }

    /// Sets the `gas_price` field and marks the request as legacy-priced,
    /// clearing any EIP-1559 fee fields.
    #[must_use]
    pub fn gas_price<T: Into<U256>>(mut self, gas_price: T) -> Self {
        self.gas_price = Some(gas_price.into());
        self.max_fee_per_gas = None;
        self.max_priority_fee_per_gas = None;
        self.is_eip1559 = false;
        self
    }

    /// Sets the `max_fee_per_gas` field and marks the request as
    /// EIP-1559-priced, clearing any legacy `gas_price`.
    #[must_use]
    pub fn max_fee_per_gas<T: Into<U256>>(mut self, fee: T) -> Self {
        self.max_fee_per_gas = Some(fee.into());
        self.gas_price = None;
        self.is_eip1559 = true;
        self
    }

    /// Sets the `max_priority_fee_per_gas` field and marks the request as
    /// EIP-1559-priced, clearing any legacy `gas_price`.
    #[must_use]
    pub fn max_priority_fee_per_gas<T: Into<U256>>(mut self, fee: T) -> Self {
        self.max_priority_fee_per_gas = Some(fee.into());
        self.gas_price = None;
        self.is_eip1559 = true;
        self
    }

    /// Marks the request as EIP-1559-priced without setting fee values,
    /// leaving them for the gas-fill pipeline.
    #[must_use]
    pub fn eip1559(mut self) -> Self {
        self.is_eip1559 = true;
        self
    }

    /// Sets the `value` field in the transaction.
    #[must_use]
    pub fn value<T: Into<U256>>(mut self, value: T) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Sets the `nonce` field in the transaction.
    #[must_use]
    pub fn nonce<T: Into<U256>>(mut self, nonce: T) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Sets the `data` field in the transaction.
    #[must_use]
    pub fn data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Sets the EIP-2930 access list.
    #[must_use]
    pub fn access_list<T: Into<AccessList>>(mut self, access_list: T) -> Self {
        self.access_list = Some(access_list.into());
        self
    }
}

/// An EIP-2930 access list.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessList(pub Vec<AccessListItem>);

impl From<Vec<AccessListItem>> for AccessList {
    fn from(src: Vec<AccessListItem>) -> Self {
        Self(src)
    }
}

/// Access list item.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessListItem {
    /// Account address to be warmed.
    pub address: Address,
    /// Storage keys to be warmed.
    pub storage_keys: Vec<H256>,
}

/// "Receipt" of an executed transaction.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    /// Transaction hash.
    pub transaction_hash: H256,
    /// Index within the block.
    #[serde(default)]
    pub transaction_index: U64,
    /// Hash of the block this transaction was included within.
    pub block_hash: Option<H256>,
    /// Number of the block this transaction was included within.
    pub block_number: Option<U64>,
    /// Sender.
    #[serde(default)]
    pub from: Address,
    /// Recipient. `None` when the transaction is a contract creation.
    pub to: Option<Address>,
    /// Cumulative gas used within the block after this was executed.
    #[serde(default)]
    pub cumulative_gas_used: U256,
    /// Gas used by this transaction alone.
    pub gas_used: Option<U256>,
    /// Contract address created, or `None` if not a deployment.
    pub contract_address: Option<Address>,
    /// Status: either 1 (success) or 0 (failure).
    pub status: Option<U64>,
    /// The price paid post-execution by the transaction.
    pub effective_gas_price: Option<U256>,
}
