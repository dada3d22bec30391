//! A uniform control surface over development-node JSON RPC dialects.
//!
//! # Example
//!
//! ```no_run
//! use ethlink_providers::{DevNode, Http, NodeMode, Provider};
//! use ethlink_core::types::{Address, U256};
//! use std::str::FromStr;
//!
//! # async fn foo() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Provider::new(Http::from_str("http://localhost:8545")?);
//! let node = DevNode::new(provider, NodeMode::Anvil);
//!
//! // snapshot the initial state
//! let snap_id = node.snapshot().await?;
//!
//! // act as a whale account without its key
//! let whale = Address::from_str("0x00000000219ab540356cbb839cbe05303d7705fa")?;
//! let session = node.impersonate(whale).await?;
//! session.close().await;
//!
//! // roll everything back
//! node.revert_to_snapshot(snap_id).await?;
//! # Ok(()) }
//! ```

use crate::{JsonRpcClient, Metrics, Provider, ProviderError};
use ethlink_core::types::{Address, Bytes, TransactionRequest, TxHash, H256, U256};
use serde::Serialize;
use serde_json::Value;
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use thiserror::Error;

/// The development-node dialect spoken by the connected endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeMode {
    /// Foundry's anvil; the richest dialect.
    Anvil,
    /// Hardhat Network.
    Hardhat,
    /// Ganache, which keeps everything under the `evm_` namespace.
    Ganache,
}

impl NodeMode {
    fn prefix(&self) -> &'static str {
        match self {
            NodeMode::Anvil => "anvil",
            NodeMode::Hardhat => "hardhat",
            NodeMode::Ganache => "evm",
        }
    }

    /// The dialect-specific method name for an operation, e.g. `setBalance`
    /// becomes `anvil_setBalance` or `hardhat_setBalance`.
    fn method(&self, op: &str) -> String {
        format!("{}_{op}", self.prefix())
    }
}

/// DevNode Errors
#[derive(Debug, Error)]
pub enum DevNodeError {
    /// The operation only exists in another dialect.
    #[error("operation `{op}` is not supported in {mode:?} mode")]
    Unsupported {
        /// The operation that was attempted
        op: &'static str,
        /// The dialect it was attempted on
        mode: NodeMode,
    },

    /// Attempted to revert to an unavailable snapshot.
    #[error("could not revert to snapshot {0}")]
    NoSnapshot(U256),

    /// The impersonation session was already closed.
    #[error("impersonation session for {0:?} is closed")]
    SessionClosed(Address),

    /// The node handle behind a session was dropped.
    #[error("the node control handle is no longer alive")]
    NodeDropped,

    /// Internal provider error.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A control handle over a development node (Anvil, Hardhat or Ganache).
///
/// Composes a [`Provider`] instead of layering on it: the same provider
/// value can keep serving regular reads and writes while this handle drives
/// the node's test-only namespace.
#[derive(Debug)]
pub struct DevNode<P> {
    provider: Arc<Provider<P>>,
    mode: NodeMode,
    metrics: Arc<dyn Metrics>,
}

impl<P> Clone for DevNode<P> {
    fn clone(&self) -> Self {
        Self { provider: self.provider.clone(), mode: self.mode, metrics: self.metrics.clone() }
    }
}

impl<P: JsonRpcClient + 'static> DevNode<P> {
    /// Instantiates a control handle speaking the given dialect.
    pub fn new(provider: impl Into<Arc<Provider<P>>>, mode: NodeMode) -> Self {
        Self { provider: provider.into(), mode, metrics: crate::metrics::noop() }
    }

    /// Replaces the metrics sink (used to report swallowed close failures).
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The provider this handle drives.
    pub fn provider(&self) -> &Arc<Provider<P>> {
        &self.provider
    }

    /// The dialect this handle speaks.
    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    fn anvil_only(&self, op: &'static str) -> Result<(), DevNodeError> {
        if self.mode != NodeMode::Anvil {
            return Err(DevNodeError::Unsupported { op, mode: self.mode })
        }
        Ok(())
    }

    /// Issues an operation whose return value we do not care about; the
    /// dialects disagree on what these calls return.
    async fn op<T: Debug + Serialize + Send + Sync>(
        &self,
        method: &str,
        params: T,
    ) -> Result<(), DevNodeError> {
        let _: Value = self.provider.request(method, params).await?;
        Ok(())
    }

    /// Create a new snapshot on the node. Returns the Snapshot ID.
    ///
    /// ### Note
    ///
    /// Ganache, Hardhat and Anvil increment snapshot ID even if no state has changed
    pub async fn snapshot(&self) -> Result<U256, DevNodeError> {
        self.provider.request::<(), U256>("evm_snapshot", ()).await.map_err(From::from)
    }

    /// Revert the state of the node to the snapshot, specified by its ID.
    /// A snapshot can only be reverted to once.
    pub async fn revert_to_snapshot(&self, id: U256) -> Result<(), DevNodeError> {
        let ok = self.provider.request::<[U256; 1], bool>("evm_revert", [id]).await?;
        if ok {
            Ok(())
        } else {
            Err(DevNodeError::NoSnapshot(id))
        }
    }

    /// Starts impersonating `address`: transactions sent from it need no
    /// signature. Returns a scoped session; its `close` stops the
    /// impersonation. Anvil only.
    pub async fn impersonate(
        &self,
        address: Address,
    ) -> Result<ImpersonationSession<P>, DevNodeError> {
        self.anvil_only("impersonateAccount")?;
        self.op(&self.mode.method("impersonateAccount"), [address]).await?;
        Ok(ImpersonationSession {
            provider: Arc::downgrade(&self.provider),
            mode: self.mode,
            address,
            closed: AtomicBool::new(false),
            metrics: self.metrics.clone(),
        })
    }

    /// Stops impersonating `address`. Anvil only.
    pub async fn stop_impersonating(&self, address: Address) -> Result<(), DevNodeError> {
        self.anvil_only("stopImpersonatingAccount")?;
        self.op(&self.mode.method("stopImpersonatingAccount"), [address]).await
    }

    /// Toggles automatic impersonation of every sender. Anvil only.
    pub async fn auto_impersonate(&self, enabled: bool) -> Result<(), DevNodeError> {
        self.anvil_only("autoImpersonateAccount")?;
        self.op(&self.mode.method("autoImpersonateAccount"), [enabled]).await
    }

    /// Overrides the balance of an account.
    pub async fn set_balance(&self, address: Address, balance: U256) -> Result<(), DevNodeError> {
        self.op(&self.mode.method("setBalance"), (address, balance)).await
    }

    /// Overrides the code of an account.
    pub async fn set_code(&self, address: Address, code: Bytes) -> Result<(), DevNodeError> {
        self.op(&self.mode.method("setCode"), (address, code)).await
    }

    /// Overrides the nonce of an account.
    pub async fn set_nonce(&self, address: Address, nonce: U256) -> Result<(), DevNodeError> {
        self.op(&self.mode.method("setNonce"), (address, nonce)).await
    }

    /// Overrides a storage slot of an account.
    pub async fn set_storage_at(
        &self,
        address: Address,
        slot: H256,
        value: H256,
    ) -> Result<(), DevNodeError> {
        self.op(&self.mode.method("setStorageAt"), (address, slot, value)).await
    }

    /// Mines `blocks` blocks (default one), optionally `interval` seconds
    /// apart.
    pub async fn mine(
        &self,
        blocks: Option<u64>,
        interval: Option<u64>,
    ) -> Result<(), DevNodeError> {
        let mut params: Vec<U256> = Vec::new();
        if let Some(blocks) = blocks {
            params.push(blocks.into());
            if let Some(interval) = interval {
                params.push(interval.into());
            }
        }
        self.op(&self.mode.method("mine"), params).await
    }

    /// Mines one block with the given timestamp.
    pub async fn mine_at(&self, timestamp: u64) -> Result<(), DevNodeError> {
        self.op("evm_mine", [timestamp]).await
    }

    /// Enables or disables mining a block per transaction.
    pub async fn set_automine(&self, enabled: bool) -> Result<(), DevNodeError> {
        self.op("evm_setAutomine", [enabled]).await
    }

    /// Mines a block every `interval` seconds; `0` disables interval mining.
    pub async fn set_interval_mining(&self, interval: u64) -> Result<(), DevNodeError> {
        self.op("evm_setIntervalMining", [interval]).await
    }

    /// Sets the exact timestamp of the next block.
    pub async fn set_next_block_timestamp(&self, timestamp: u64) -> Result<(), DevNodeError> {
        self.op("evm_setNextBlockTimestamp", [timestamp]).await
    }

    /// Advances node time by `seconds`.
    pub async fn increase_time(&self, seconds: u64) -> Result<(), DevNodeError> {
        self.op("evm_increaseTime", [seconds]).await
    }

    /// Sets the base fee of the next block.
    pub async fn set_next_block_base_fee(&self, fee: U256) -> Result<(), DevNodeError> {
        self.op(&self.mode.method("setNextBlockBaseFeePerGas"), [fee]).await
    }

    /// Sets the gas limit of future blocks.
    pub async fn set_block_gas_limit(&self, limit: U256) -> Result<(), DevNodeError> {
        self.op("evm_setBlockGasLimit", [limit]).await
    }

    /// Sets the coinbase address of future blocks.
    pub async fn set_coinbase(&self, address: Address) -> Result<(), DevNodeError> {
        self.op(&self.mode.method("setCoinbase"), [address]).await
    }

    /// Resets the node, optionally re-forking from a remote endpoint.
    pub async fn reset(&self, fork: Option<ResetFork>) -> Result<(), DevNodeError> {
        match fork {
            Some(fork) => {
                self.op(&self.mode.method("reset"), [serde_json::json!({ "forking": fork })]).await
            }
            None => self.op(&self.mode.method("reset"), ()).await,
        }
    }

    /// Serializes the node state to bytes. Anvil only.
    pub async fn dump_state(&self) -> Result<Bytes, DevNodeError> {
        self.anvil_only("dumpState")?;
        self.provider.request(&self.mode.method("dumpState"), ()).await.map_err(From::from)
    }

    /// Restores node state from a `dump_state` payload. Anvil only.
    pub async fn load_state(&self, state: Bytes) -> Result<bool, DevNodeError> {
        self.anvil_only("loadState")?;
        self.provider.request(&self.mode.method("loadState"), [state]).await.map_err(From::from)
    }

    /// Removes a transaction from the pool. Anvil only.
    pub async fn drop_transaction(&self, hash: TxHash) -> Result<Option<TxHash>, DevNodeError> {
        self.anvil_only("dropTransaction")?;
        self.provider.request(&self.mode.method("dropTransaction"), [hash]).await.map_err(From::from)
    }
}

/// Parameters for [`DevNode::reset`] when re-forking.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetFork {
    /// The endpoint to fork from.
    pub json_rpc_url: String,
    /// The block to fork at; latest when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

/// A scoped impersonation of one account.
///
/// Obtained from [`DevNode::impersonate`]; [`close`](Self::close) stops the
/// impersonation exactly once, no matter how often it is called or whether
/// the session is simply dropped. It holds only a weak handle to the
/// provider, so an outliving session cannot keep a torn-down transport
/// alive.
#[derive(Debug)]
pub struct ImpersonationSession<P: JsonRpcClient + 'static> {
    provider: Weak<Provider<P>>,
    mode: NodeMode,
    address: Address,
    closed: AtomicBool,
    metrics: Arc<dyn Metrics>,
}

impl<P: JsonRpcClient + 'static> ImpersonationSession<P> {
    /// The impersonated address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a transaction as the impersonated account, filling `from` when
    /// the caller left it unset.
    pub async fn send_transaction(
        &self,
        mut tx: TransactionRequest,
    ) -> Result<TxHash, DevNodeError> {
        if self.is_closed() {
            return Err(DevNodeError::SessionClosed(self.address))
        }
        let provider = self.provider.upgrade().ok_or(DevNodeError::NodeDropped)?;
        if tx.from.is_none() {
            tx.from = Some(self.address);
        }
        provider.send_transaction(&tx).await.map_err(From::from)
    }

    /// Stops the impersonation. Idempotent and infallible: repeated calls
    /// are no-ops, and a failed stop is reported to metrics and the log
    /// rather than raised.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return
        }
        let Some(provider) = self.provider.upgrade() else { return };
        let method = self.mode.method("stopImpersonatingAccount");
        if let Err(err) = provider.request::<_, Value>(&method, [self.address]).await {
            self.metrics.on_request_failed(&method, &err.to_string());
            tracing::warn!(address = ?self.address, %err, "failed to stop impersonation");
        }
    }
}

impl<P: JsonRpcClient + 'static> Drop for ImpersonationSession<P> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return
        }
        // best effort: detached sessions are released in the background when
        // a runtime is available
        let (Some(provider), Ok(handle)) =
            (self.provider.upgrade(), tokio::runtime::Handle::try_current())
        else {
            return
        };
        let method = self.mode.method("stopImpersonatingAccount");
        let address = self.address;
        let metrics = self.metrics.clone();
        handle.spawn(async move {
            if let Err(err) = provider.request::<_, Value>(&method, [address]).await {
                metrics.on_request_failed(&method, &err.to_string());
                tracing::warn!(address = ?address, %err, "failed to stop impersonation");
            }
        });
    }
}
