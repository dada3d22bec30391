use std::{error::Error, fmt::Debug};

use ethlink_core::{
    types::{Address, Bytes, TxHash},
    utils::decode_revert_reason,
};
use thiserror::Error;

use crate::JsonRpcError;

/// An `RpcError` is an abstraction over error types returned by a
/// [`crate::JsonRpcClient`].
///
/// All clients can return [`JsonRpcError`] responses, as well as serde
/// deserialization errors. Because client errors are typically type-erased
/// via the [`ProviderError`], this trait provides access to the underlying
/// error types, plus the classification hooks the retry layer runs on.
pub trait RpcError: Error + Debug + Send + Sync {
    /// Access an underlying JSON-RPC error (if any)
    ///
    /// Attempts to access an underlying [`JsonRpcError`]. If the underlying
    /// error is not a JSON-RPC error response, this function will return
    /// `None`.
    fn as_error_response(&self) -> Option<&JsonRpcError>;

    /// Returns `true` if the underlying error is a JSON-RPC error response
    fn is_error_response(&self) -> bool {
        self.as_error_response().is_some()
    }

    /// Access an underlying `serde_json` error (if any)
    ///
    /// Attempts to access an underlying [`serde_json::Error`]. If the
    /// underlying error is not a serde_json error, this function will return
    /// `None`.
    fn as_serde_error(&self) -> Option<&serde_json::Error>;

    /// Returns `true` if the underlying error is a serde_json
    /// (de)serialization error.
    fn is_serde_error(&self) -> bool {
        self.as_serde_error().is_some()
    }

    /// Returns `true` when the failure happened at the socket/IO level
    /// (connection refused, reset, lost, ...) rather than being produced by
    /// the remote node. Transport failures are retryable by default.
    fn is_transport_error(&self) -> bool {
        false
    }
}

/// An EVM execution failure extracted from an RPC error response.
///
/// Distinguished from transport and RPC errors because it is a
/// contract-level outcome; the retry layer never retries reverts.
#[derive(Debug, Clone, Error)]
pub struct RevertError {
    /// Decoded `Error(string)`/`Panic(uint256)` reason, when the bytes carry
    /// one.
    pub reason: Option<String>,
    /// The raw revert data.
    pub raw: Bytes,
}

impl std::fmt::Display for RevertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "execution reverted: {reason}"),
            None => write!(f, "execution reverted with data {}", self.raw),
        }
    }
}

impl RevertError {
    /// Builds a revert error from raw revert bytes, decoding the reason when
    /// possible.
    pub fn from_raw(raw: Bytes) -> Self {
        Self { reason: decode_revert_reason(&raw), raw }
    }
}

#[derive(Debug, Error)]
/// An error thrown when making a call to the provider
pub enum ProviderError {
    /// An internal error in the JSON RPC Client
    #[error("{0}")]
    JsonRpcClientError(Box<dyn RpcError + Send + Sync>),

    /// A JSON-RPC error response returned by the node
    #[error(transparent)]
    JsonRpcError(JsonRpcError),

    /// The node reported an EVM execution revert
    #[error(transparent)]
    Revert(#[from] RevertError),

    /// Error in underlying lib `serde_json`
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    /// Error in underlying lib `hex`
    #[error(transparent)]
    HexError(#[from] hex::FromHexError),

    /// Error in underlying lib `reqwest`
    #[error(transparent)]
    HTTPError(#[from] reqwest::Error),

    /// Gas estimation failed; carries the transaction context so production
    /// failures can be triaged without a debugger
    #[error("gas estimation failed for tx (from: {from:?}, to: {to:?}): {source}")]
    GasEstimation {
        /// Sender of the transaction being estimated
        from: Option<Address>,
        /// Recipient of the transaction being estimated
        to: Option<Address>,
        /// The underlying failure
        source: Box<ProviderError>,
    },

    /// Timed out waiting for a transaction receipt
    #[error("timed out waiting for receipt of transaction {0:?}")]
    ReceiptTimeout(TxHash),

    /// `eth_simulateV1` is not implemented by the connected node
    #[error("eth_simulateV1 is not supported by the connected node")]
    SimulateNotSupported,

    /// Custom error from unknown source
    #[error("custom error: {0}")]
    CustomError(String),

    /// RPC method is not supported by this provider
    #[error("unsupported RPC")]
    UnsupportedRPC,
}

impl From<JsonRpcError> for ProviderError {
    fn from(err: JsonRpcError) -> Self {
        match err.revert_data() {
            Some(raw) => ProviderError::Revert(RevertError::from_raw(raw)),
            None => ProviderError::JsonRpcError(err),
        }
    }
}

/// Converts a transport error into a [`ProviderError`], reclassifying error
/// responses whose `data` carries revert bytes into [`RevertError`] so they
/// surface immediately and are never retried.
pub(crate) fn classify_client_error<E>(err: E) -> ProviderError
where
    E: RpcError + Send + Sync + 'static,
{
    if let Some(raw) = err.as_error_response().and_then(JsonRpcError::revert_data) {
        return ProviderError::Revert(RevertError::from_raw(raw))
    }
    ProviderError::JsonRpcClientError(Box::new(err))
}

impl RpcError for ProviderError {
    fn as_error_response(&self) -> Option<&JsonRpcError> {
        match self {
            ProviderError::JsonRpcClientError(err) => err.as_error_response(),
            ProviderError::JsonRpcError(err) => Some(err),
            ProviderError::GasEstimation { source, .. } => source.as_error_response(),
            _ => None,
        }
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        match self {
            ProviderError::JsonRpcClientError(e) => e.as_serde_error(),
            ProviderError::SerdeJson(e) => Some(e),
            _ => None,
        }
    }

    fn is_transport_error(&self) -> bool {
        match self {
            ProviderError::JsonRpcClientError(e) => e.is_transport_error(),
            ProviderError::HTTPError(_) => true,
            ProviderError::GasEstimation { source, .. } => source.is_transport_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_rpc_error_with_revert_data_becomes_revert() {
        let err = JsonRpcError {
            code: 3,
            message: "execution reverted".to_string(),
            data: Some(serde_json::json!(
                "0x08c379a000000000000000000000000000000000000000000000000000000000000000200000000000000000000000000000000000000000000000000000000000000014696e73756666696369656e742062616c616e6365000000000000000000000000"
            )),
        };
        match ProviderError::from(err) {
            ProviderError::Revert(revert) => {
                assert_eq!(revert.reason.as_deref(), Some("insufficient balance"))
            }
            other => panic!("expected revert, got {other:?}"),
        }
    }

    #[test]
    fn json_rpc_error_without_data_stays_rpc() {
        let err = JsonRpcError { code: -32000, message: "nope".to_string(), data: None };
        assert!(matches!(ProviderError::from(err), ProviderError::JsonRpcError(_)));
    }
}
