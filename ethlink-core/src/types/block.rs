use super::{H256, U256, U64};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// A block header, trimmed to the fields the dispatch core reads.
///
/// Nodes attach many more fields to `eth_getBlockByNumber` responses; unknown
/// fields are ignored on deserialization.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Hash of the block. `None` when pending.
    pub hash: Option<H256>,
    /// Hash of the parent block.
    #[serde(default)]
    pub parent_hash: H256,
    /// Block number. `None` when pending.
    pub number: Option<U64>,
    /// Timestamp of the block's collation.
    #[serde(default)]
    pub timestamp: U256,
    /// Maximum gas allowed in this block.
    #[serde(default)]
    pub gas_limit: U256,
    /// Gas used by all transactions in this block.
    #[serde(default)]
    pub gas_used: U256,
    /// Base fee per unit of gas. `None` for pre-EIP-1559 blocks and chains
    /// without a fee market.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
    /// Hashes of the transactions included in this block.
    #[serde(default)]
    pub transactions: Vec<H256>,
}

/// A block tag accepted by `eth_getBlockByNumber`, `eth_call` and friends.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlockNumber {
    /// The most recently mined block.
    #[default]
    Latest,
    /// The lowest block the node knows about.
    Earliest,
    /// The next block, as currently assembled by the node.
    Pending,
    /// A specific block number.
    Number(U64),
}

impl BlockNumber {
    /// Returns the numeric block number, if this is a [`BlockNumber::Number`].
    pub fn as_number(&self) -> Option<U64> {
        match *self {
            BlockNumber::Number(num) => Some(num),
            _ => None,
        }
    }
}

impl<T: Into<U64>> From<T> for BlockNumber {
    fn from(num: T) -> Self {
        BlockNumber::Number(num.into())
    }
}

impl Serialize for BlockNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BlockNumber::Latest => serializer.serialize_str("latest"),
            BlockNumber::Earliest => serializer.serialize_str("earliest"),
            BlockNumber::Pending => serializer.serialize_str("pending"),
            BlockNumber::Number(num) => serializer.serialize_str(&format!("0x{num:x}")),
        }
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockNumber::Latest => f.write_str("latest"),
            BlockNumber::Earliest => f.write_str("earliest"),
            BlockNumber::Pending => f.write_str("pending"),
            BlockNumber::Number(num) => write!(f, "0x{num:x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_block_tags() {
        assert_eq!(serde_json::to_string(&BlockNumber::Latest).unwrap(), r#""latest""#);
        assert_eq!(serde_json::to_string(&BlockNumber::Pending).unwrap(), r#""pending""#);
        assert_eq!(
            serde_json::to_string(&BlockNumber::from(0x1b4u64)).unwrap(),
            r#""0x1b4""#
        );
    }

    #[test]
    fn deserializes_block_with_extra_fields() {
        let json = r#"{
            "hash": "0x7c5a35e9cb3e8ae0e221ab470abae9d446c3a5626ce6689fc777dcffcab52c70",
            "parentHash": "0x6c5a35e9cb3e8ae0e221ab470abae9d446c3a5626ce6689fc777dcffcab52c70",
            "number": "0x10",
            "timestamp": "0x64",
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "baseFeePerGas": "0x174876e800",
            "miner": "0x0000000000000000000000000000000000000000",
            "transactions": []
        }"#;
        let block: Block = serde_json::from_str(json).unwrap();
        assert_eq!(block.number, Some(0x10u64.into()));
        assert_eq!(block.base_fee_per_gas, Some(U256::from(100_000_000_000u64)));
    }

    #[test]
    fn deserializes_block_without_base_fee() {
        let json = r#"{"hash":null,"parentHash":"0x6c5a35e9cb3e8ae0e221ab470abae9d446c3a5626ce6689fc777dcffcab52c70","number":"0x1","timestamp":"0x0","gasLimit":"0x0","gasUsed":"0x0","transactions":[]}"#;
        let block: Block = serde_json::from_str(json).unwrap();
        assert!(block.base_fee_per_gas.is_none());
    }
}
