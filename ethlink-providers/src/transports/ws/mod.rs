//! A WebSocket JSON-RPC transport.
//!
//! A single I/O task owns the socket (see `backend`); a manager task owns
//! the pending-request and subscription tables (see `manager`); any number
//! of cloned [`WsClient`] handles feed it instructions through a bounded
//! queue.
//!
//! Reconnection semantics: on socket loss every in-flight request fails with
//! [`WsClientError::ConnectionLost`] — requests are **never** replayed on
//! the fresh connection — while active subscriptions *are* re-established,
//! keeping their client-facing ids stable via server-id aliasing.

mod backend;

mod manager;

use manager::{RequestManager, SharedChannelMap};
use std::fmt;

mod types;
pub use types::{ConnectionDetails, WaitStrategy, WsConfig};
use types::*;

mod error;
pub use error::*;

use crate::{JsonRpcClient, Metrics, PubsubClient};
use async_trait::async_trait;
use ethlink_core::types::U256;
use futures_channel::{mpsc, oneshot};
use futures_util::SinkExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::value::{to_raw_value, RawValue};
use std::{fmt::Debug, sync::Arc};

/// A client for a multiplexing WebSocket connection.
///
/// Cloning is cheap: all clones feed the same connection. Completion futures
/// are resolved from the I/O side; a resolved `request` future must not
/// synchronously issue another request from inside a completion callback
/// chain that blocks the runtime, or the transport can starve.
#[derive(Clone)]
pub struct WsClient {
    // Used to send instructions to the `RequestManager`
    pub(super) instructions: mpsc::Sender<Instruction>,
    // Used to receive sub notification channels from the manager
    pub(super) channel_map: SharedChannelMap,
    // What to do when the instruction queue is full
    pub(super) wait_strategy: WaitStrategy,
    // Capacity of the instruction queue, for the saturation hook
    pub(super) queue_capacity: usize,
    pub(super) metrics: Arc<dyn Metrics>,
}

impl WsClient {
    /// Establishes a new websocket connection with the default
    /// configuration. Defaults to 5 reconnects per outage.
    pub async fn connect(conn: impl Into<ConnectionDetails>) -> Result<Self, WsClientError> {
        Self::connect_with_config(conn, WsConfig::default()).await
    }

    /// Establishes a new websocket connection with custom timeouts,
    /// capacities, reconnect schedule and metrics sink.
    pub async fn connect_with_config(
        conn: impl Into<ConnectionDetails>,
        config: WsConfig,
    ) -> Result<Self, WsClientError> {
        let (man, this) = RequestManager::connect(conn.into(), config).await?;
        man.spawn();
        Ok(this)
    }

    async fn send_instruction(&self, instruction: Instruction) -> Result<(), WsClientError> {
        let mut tx = self.instructions.clone();
        match self.wait_strategy {
            WaitStrategy::Blocking => {
                tx.send(instruction).await.map_err(|_| WsClientError::UnexpectedClose)
            }
            WaitStrategy::Yielding => {
                let mut instruction = instruction;
                loop {
                    match tx.try_send(instruction) {
                        Ok(()) => return Ok(()),
                        Err(err) if err.is_full() => {
                            self.metrics.on_send_queue_saturation(self.queue_capacity);
                            instruction = err.into_inner();
                            tokio::task::yield_now().await;
                        }
                        Err(_) => return Err(WsClientError::UnexpectedClose),
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self, params), err)]
    async fn make_request<R>(&self, method: &str, params: Box<RawValue>) -> Result<R, WsClientError>
    where
        R: DeserializeOwned,
    {
        let (tx, rx) = oneshot::channel();
        let instruction = Instruction::Request { method: method.to_owned(), params, sender: tx };
        self.send_instruction(instruction).await?;

        let res = rx.await.map_err(|_| WsClientError::UnexpectedClose)?.map_err(WsClientError::from)?;
        tracing::trace!(res = %res, "Received response from request manager");
        let resp = serde_json::from_str(res.get())?;
        Ok(resp)
    }

    /// Packs the given calls into a single JSON array frame.
    ///
    /// Correlation remains by id. The returned vector is in input order;
    /// each element resolves independently, so one slow or failed call does
    /// not poison its neighbors.
    pub async fn request_batch(
        &self,
        calls: Vec<(String, Box<RawValue>)>,
    ) -> Result<Vec<Result<Box<RawValue>, WsClientError>>, WsClientError> {
        let mut senders = Vec::with_capacity(calls.len());
        let mut receivers = Vec::with_capacity(calls.len());
        for _ in 0..calls.len() {
            let (tx, rx) = oneshot::channel();
            senders.push(tx);
            receivers.push(rx);
        }

        self.send_instruction(Instruction::BatchRequest { requests: calls, senders }).await?;

        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            let res = match rx.await {
                Ok(Ok(raw)) => Ok(raw),
                Ok(Err(err)) => Err(WsClientError::from(err)),
                Err(_) => Err(WsClientError::UnexpectedClose),
            };
            results.push(res);
        }
        Ok(results)
    }

    /// Cancels a subscription, returning the server's ack. The local
    /// listener is removed unconditionally and immediately, whatever the
    /// server replies.
    pub async fn unsubscribe_with_ack(&self, id: impl Into<U256>) -> Result<bool, WsClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_instruction(Instruction::Unsubscribe { id: id.into(), sender: tx }).await?;
        let raw = rx.await.map_err(|_| WsClientError::UnexpectedClose)?.map_err(WsClientError::from)?;
        Ok(serde_json::from_str(raw.get())?)
    }

    /// Gracefully shuts the transport down: no further work is accepted,
    /// in-flight requests get up to 5 s to complete, and the remainder fail
    /// with [`WsClientError::Cancelled`]. Subscription streams end silently.
    pub async fn close(&self) -> Result<(), WsClientError> {
        self.send_instruction(Instruction::Close).await
    }
}

impl fmt::Debug for WsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ws").finish_non_exhaustive()
    }
}

#[async_trait]
impl JsonRpcClient for WsClient {
    type Error = WsClientError;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, WsClientError>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned,
    {
        let params = to_raw_value(&params)?;
        let res = self.make_request(method, params).await?;

        Ok(res)
    }
}

impl PubsubClient for WsClient {
    type NotificationStream = mpsc::UnboundedReceiver<Box<RawValue>>;

    fn subscribe<T: Into<U256>>(&self, id: T) -> Result<Self::NotificationStream, WsClientError> {
        // due to the behavior of the request manager, we know this map has
        // been populated by the time the `request()` call returns
        let id = id.into();
        self.channel_map.lock().unwrap().remove(&id).ok_or(WsClientError::UnknownSubscription(id))
    }

    fn unsubscribe<T: Into<U256>>(&self, id: T) -> Result<(), WsClientError> {
        // fire-and-forget: local removal is what matters here, the server
        // ack is available via `unsubscribe_with_ack`
        let (tx, _rx) = oneshot::channel();
        self.instructions
            .clone()
            .try_send(Instruction::Unsubscribe { id: id.into(), sender: tx })
            .map_err(|_| WsClientError::UnexpectedClose)
    }
}
