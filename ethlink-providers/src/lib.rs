#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::type_complexity)]
#![doc = include_str!("../README.md")]

mod transports;
pub use transports::*;

mod provider;
pub use provider::{Eip1559Fallback, Provider, DEFAULT_POLL_INTERVAL, MAX_POLL_INTERVAL};

mod errors;
pub use errors::{ProviderError, RevertError, RpcError};

mod metrics;
pub use metrics::{Metrics, NoopMetrics, TracingMetrics};

mod pubsub;
pub use pubsub::{PubsubClient, SubscriptionStream};

pub mod ext;
pub use ext::{
    dev_node::{DevNode, DevNodeError, ImpersonationSession, NodeMode},
    multicall::{BatchHandle, Multicall, MulticallError},
};

use async_trait::async_trait;
use auto_impl::auto_impl;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, future::Future};

pub use futures_util::StreamExt;

/// Trait which must be implemented by data transports to be used with the
/// Ethereum JSON-RPC provider.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait JsonRpcClient: Debug + Send + Sync {
    /// A JSON-RPC Error.
    type Error: RpcError + Into<ProviderError> + 'static;

    /// Sends a request with the provided JSON-RPC and parameters serialized as JSON.
    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Self::Error>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned;
}

/// Calls the future if `item` is None, otherwise returns a `futures::ok`
pub async fn maybe<F, T, E>(item: Option<T>, f: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    if let Some(item) = item {
        futures_util::future::ok(item).await
    } else {
        f.await
    }
}
