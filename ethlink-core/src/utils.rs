//! ABI-adjacent helpers used across the transport core.

use crate::types::U256;
use ethabi::ParamType;

/// `keccak256("Error(string)")[..4]`, the selector carried by string reverts.
const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// `keccak256("Panic(uint256)")[..4]`, the selector carried by Solidity
/// assertion failures.
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Attempts to decode ABI-encoded revert bytes into a human readable reason.
///
/// Understands the two shapes Solidity emits: `Error(string)` and
/// `Panic(uint256)`. Returns `None` for custom errors and free-form bytes;
/// callers surface those as raw hex.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None
    }
    let (selector, payload) = data.split_at(4);
    match selector {
        s if s == ERROR_SELECTOR => {
            let tokens = ethabi::decode(&[ParamType::String], payload).ok()?;
            tokens.into_iter().next()?.into_string()
        }
        s if s == PANIC_SELECTOR => {
            let tokens = ethabi::decode(&[ParamType::Uint(256)], payload).ok()?;
            let code = tokens.into_iter().next()?.into_uint()?;
            Some(format!("panicked with code 0x{code:x}"))
        }
        _ => None,
    }
}

/// Converts an amount denominated in gwei into wei.
pub fn gwei<T: Into<U256>>(amount: T) -> U256 {
    amount.into() * U256::from(1_000_000_000u64)
}
