use ethlink_core::types::U256;

use crate::{errors::classify_client_error, JsonRpcError, ProviderError, RpcError};

use super::WsError;

/// Error thrown by the WebSocket transport.
#[derive(Debug, thiserror::Error)]
pub enum WsClientError {
    /// Thrown if deserialization failed
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    /// Thrown if the response could not be parsed
    #[error(transparent)]
    JsonRpcError(#[from] JsonRpcError),

    /// Internal lib error
    #[error(transparent)]
    InternalError(#[from] WsError),

    /// Remote server sent a Close message
    #[error("Websocket closed unexpectedly")]
    UnexpectedClose,

    /// Unexpected channel closure
    #[error("Unexpected internal channel closure. This is likely a bug. Please report via github")]
    DeadChannel,

    /// Thrown if the websocket responds with binary data
    #[error("Websocket responded with unexpected binary data")]
    UnexpectedBinary(Vec<u8>),

    /// The timeout sweeper expired the request
    #[error("request timed out before a response arrived")]
    RequestTimeout,

    /// The transport was closed while the request was pending
    #[error("request cancelled by transport shutdown")]
    Cancelled,

    /// The socket went away while the request was in flight; in-flight
    /// requests are never replayed across reconnects
    #[error("connection lost while request was in flight")]
    ConnectionLost,

    /// The pending-request table is at capacity
    #[error("pending request capacity exhausted ({pending}/{max})")]
    Backpressure {
        /// Requests currently awaiting a response
        pending: usize,
        /// The configured capacity
        max: usize,
    },

    /// PubSubClient asked to listen to an unknown subscription id
    #[error("Attempted to listen to unknown subscription: {0:?}")]
    UnknownSubscription(U256),

    /// Too Many Reconnects
    #[error("Reconnect limit reached")]
    TooManyReconnects,

    /// Rejected configuration value
    #[error("invalid websocket configuration: {0}")]
    InvalidConfig(&'static str),
}

impl From<super::types::RequestError> for WsClientError {
    fn from(src: super::types::RequestError) -> Self {
        use super::types::RequestError;
        match src {
            RequestError::Rpc(err) => WsClientError::JsonRpcError(err),
            RequestError::Timeout => WsClientError::RequestTimeout,
            RequestError::Cancelled => WsClientError::Cancelled,
            RequestError::ConnectionLost => WsClientError::ConnectionLost,
            RequestError::Backpressure { pending, max } => {
                WsClientError::Backpressure { pending, max }
            }
        }
    }
}

impl RpcError for WsClientError {
    fn as_error_response(&self) -> Option<&JsonRpcError> {
        if let WsClientError::JsonRpcError(err) = self {
            Some(err)
        } else {
            None
        }
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        match self {
            WsClientError::JsonError(err) => Some(err),
            _ => None,
        }
    }

    fn is_transport_error(&self) -> bool {
        matches!(
            self,
            WsClientError::InternalError(_) |
                WsClientError::UnexpectedClose |
                WsClientError::ConnectionLost |
                WsClientError::DeadChannel |
                WsClientError::TooManyReconnects |
                WsClientError::Backpressure { .. }
        )
    }
}

impl From<WsClientError> for ProviderError {
    fn from(src: WsClientError) -> Self {
        classify_client_error(src)
    }
}
