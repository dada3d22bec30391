use crate::{
    maybe, JsonRpcClient, MockProvider, ProviderError, PubsubClient, RpcError, SubscriptionStream,
};
use ethlink_core::{
    types::{
        Address, Block, BlockNumber, Bytes, ChainProfile, TransactionReceipt, TransactionRequest,
        TxHash, H256, U256, U64,
    },
    utils::gwei,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{fmt::Debug, time::Duration};

use crate::JsonRpcError;

/// The default polling interval for `wait_for_receipt`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(7);

/// The cap applied to the exponential receipt-polling backoff.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What the gas-fill pipeline does when an EIP-1559 request meets a chain
/// that cannot produce a `baseFeePerGas`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Eip1559Fallback {
    /// Fail the fill with an RPC-shaped error (`code -32000`).
    #[default]
    Reject,
    /// Quietly convert the request to legacy gas pricing.
    Silent,
    /// Convert to legacy gas pricing, logging a warning.
    Warn,
}

/// An abstract provider for interacting with the [Ethereum JSON RPC
/// API](https://github.com/ethereum/wiki/wiki/JSON-RPC), on top of any
/// [`JsonRpcClient`] transport.
///
/// # Example
///
/// ```no_run
/// # async fn foo() -> Result<(), Box<dyn std::error::Error>> {
/// use ethlink_providers::{Http, Provider};
/// use std::str::FromStr;
///
/// let provider = Provider::new(Http::from_str("http://localhost:8545")?);
/// let block = provider.get_block(ethlink_core::types::BlockNumber::Latest).await?;
/// println!("Got block: {}", serde_json::to_string(&block)?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Provider<P> {
    inner: P,
    from: Option<Address>,
    chain: ChainProfile,
    gas_buffer: (u64, u64),
    eip1559_fallback: Eip1559Fallback,
}

impl<P> Provider<P> {
    /// Instantiates a provider over the given transport, assuming an
    /// EIP-1559 mainnet-like chain.
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            from: None,
            chain: ChainProfile::default(),
            gas_buffer: (120, 100),
            eip1559_fallback: Eip1559Fallback::default(),
        }
    }

    /// Sets the default sender filled into transactions without a `from`.
    #[must_use]
    pub fn with_sender(mut self, from: impl Into<Address>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the chain profile consulted by the gas-fill pipeline.
    #[must_use]
    pub fn with_chain_profile(mut self, chain: ChainProfile) -> Self {
        self.chain = chain;
        self
    }

    /// Sets the buffer applied to gas estimates as a `numerator /
    /// denominator` pair; the default of `120 / 100` adds 20%. Zero values
    /// are lifted to one.
    #[must_use]
    pub fn with_gas_buffer(mut self, numerator: u64, denominator: u64) -> Self {
        self.gas_buffer = (numerator.max(1), denominator.max(1));
        self
    }

    /// Sets the policy applied when EIP-1559 fee data is unavailable.
    #[must_use]
    pub fn with_eip1559_fallback(mut self, fallback: Eip1559Fallback) -> Self {
        self.eip1559_fallback = fallback;
        self
    }

    /// The default sender, if any.
    pub fn default_sender(&self) -> Option<Address> {
        self.from
    }

    /// The configured chain profile.
    pub fn chain_profile(&self) -> &ChainProfile {
        &self.chain
    }
}

impl<P> AsRef<P> for Provider<P> {
    fn as_ref(&self) -> &P {
        &self.inner
    }
}

impl Provider<MockProvider> {
    /// Returns a `Provider` instantiated over a [`MockProvider`], along with
    /// a handle for pushing canned responses.
    pub fn mocked() -> (Self, MockProvider) {
        let mock = MockProvider::new();
        let provider = Self::new(mock.clone());
        (provider, mock)
    }
}

impl<P: JsonRpcClient> Provider<P> {
    /// Sends the raw RPC call over the underlying transport.
    pub async fn request<T, R>(&self, method: &str, params: T) -> Result<R, ProviderError>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned,
    {
        self.inner.request(method, params).await.map_err(Into::into)
    }

    /// Returns the chain id, from `eth_chainId`.
    pub async fn get_chainid(&self) -> Result<U256, ProviderError> {
        self.request("eth_chainId", ()).await
    }

    /// Returns the current block number.
    pub async fn get_block_number(&self) -> Result<U64, ProviderError> {
        self.request("eth_blockNumber", ()).await
    }

    /// Returns the current legacy gas price.
    pub async fn get_gas_price(&self) -> Result<U256, ProviderError> {
        self.request("eth_gasPrice", ()).await
    }

    /// Returns the account balance at the given block.
    pub async fn get_balance(
        &self,
        address: Address,
        block: Option<BlockNumber>,
    ) -> Result<U256, ProviderError> {
        self.request("eth_getBalance", (address, block.unwrap_or_default())).await
    }

    /// Returns the account nonce at the given block.
    pub async fn get_transaction_count(
        &self,
        address: Address,
        block: Option<BlockNumber>,
    ) -> Result<U256, ProviderError> {
        self.request("eth_getTransactionCount", (address, block.unwrap_or_default())).await
    }

    /// Returns the client software version string.
    pub async fn client_version(&self) -> Result<String, ProviderError> {
        self.request("web3_clientVersion", ()).await
    }

    /// Returns the deployed code at the given address.
    pub async fn get_code(
        &self,
        address: Address,
        block: Option<BlockNumber>,
    ) -> Result<Bytes, ProviderError> {
        self.request("eth_getCode", (address, block.unwrap_or_default())).await
    }

    /// Returns the value of the given storage slot.
    pub async fn get_storage_at(
        &self,
        address: Address,
        slot: H256,
        block: Option<BlockNumber>,
    ) -> Result<H256, ProviderError> {
        self.request("eth_getStorageAt", (address, slot, block.unwrap_or_default())).await
    }

    /// Returns the block header for the given tag, without full transaction
    /// bodies.
    pub async fn get_block(
        &self,
        block: impl Into<BlockNumber> + Send + Sync,
    ) -> Result<Option<Block>, ProviderError> {
        self.request("eth_getBlockByNumber", (block.into(), false)).await
    }

    /// Estimates the gas the transaction will consume.
    pub async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<U256, ProviderError> {
        self.request("eth_estimateGas", [tx]).await
    }

    /// Executes a read-only call against the given block.
    pub async fn call(
        &self,
        tx: &TransactionRequest,
        block: Option<BlockNumber>,
    ) -> Result<Bytes, ProviderError> {
        self.request("eth_call", (tx, block.unwrap_or_default())).await
    }

    /// Submits an unsigned transaction for the node to sign and broadcast
    /// (`eth_sendTransaction`; the account must be unlocked or
    /// impersonated).
    pub async fn send_transaction(&self, tx: &TransactionRequest) -> Result<TxHash, ProviderError> {
        self.request("eth_sendTransaction", [tx]).await
    }

    /// Broadcasts a signed raw transaction.
    pub async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, ProviderError> {
        self.request("eth_sendRawTransaction", [raw]).await
    }

    /// Returns the receipt for the given transaction hash, if it has been
    /// mined.
    pub async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, ProviderError> {
        self.request("eth_getTransactionReceipt", [hash]).await
    }

    /// Polls for the receipt of `hash` until it lands in a block.
    ///
    /// Polling runs on the monotonic clock with exponential backoff: the
    /// interval starts at `poll_interval` and doubles up to
    /// [`MAX_POLL_INTERVAL`]. With a `timeout`, gives up with
    /// [`ProviderError::ReceiptTimeout`] once the deadline passes.
    pub async fn wait_for_receipt(
        &self,
        hash: TxHash,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<TransactionReceipt, ProviderError> {
        let started = tokio::time::Instant::now();
        let mut delay = poll_interval;

        loop {
            if let Some(receipt) = self.get_transaction_receipt(hash).await? {
                if receipt.block_number.is_some() {
                    return Ok(receipt)
                }
            }

            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return Err(ProviderError::ReceiptTimeout(hash))
                }
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Executes `eth_simulateV1`. Nodes without the method surface
    /// [`ProviderError::SimulateNotSupported`].
    pub async fn simulate_v1<R: DeserializeOwned>(
        &self,
        payload: &Value,
    ) -> Result<R, ProviderError> {
        match self.request("eth_simulateV1", [payload]).await {
            Err(err) if err.as_error_response().map(|e| e.code) == Some(-32601) => {
                Err(ProviderError::SimulateNotSupported)
            }
            other => other,
        }
    }

    /// Fills the unset gas fields of `tx`, leaving caller-provided fields
    /// untouched:
    ///
    /// 1. `from` defaults to the provider's sender;
    /// 2. `gas` is estimated and padded by the configured buffer;
    /// 3. an EIP-1559 request on an EIP-1559 chain is priced off the latest
    ///    block's base fee (`max_fee = 2 * base_fee + priority`, headroom
    ///    for several consecutive max base fee increases); when the block
    ///    carries no base fee, the configured [`Eip1559Fallback`] applies;
    /// 4. otherwise `gas_price` is fetched.
    ///
    /// The one exception to non-override: whenever the fill converts a
    /// request to legacy pricing (fallback, or an EIP-1559 request on a
    /// chain without a fee market), any EIP-1559 fee fields are cleared so
    /// they cannot shadow `gas_price` on the wire.
    pub async fn fill_transaction(&self, tx: &mut TransactionRequest) -> Result<(), ProviderError> {
        if tx.from.is_none() {
            tx.from = self.from;
        }

        if tx.gas.is_none() {
            let estimate =
                self.estimate_gas(tx).await.map_err(|source| ProviderError::GasEstimation {
                    from: tx.from,
                    to: tx.to,
                    source: Box::new(source),
                })?;
            let (numerator, denominator) = self.gas_buffer;
            tx.gas = Some(estimate * U256::from(numerator) / U256::from(denominator));
        }

        if self.chain.supports_eip1559 && tx.is_eip1559 {
            if tx.max_fee_per_gas.is_none() || tx.max_priority_fee_per_gas.is_none() {
                let base_fee = self
                    .get_block(BlockNumber::Latest)
                    .await?
                    .and_then(|block| block.base_fee_per_gas);

                match base_fee {
                    Some(base_fee) => {
                        let priority = tx
                            .max_priority_fee_per_gas
                            .or(self.chain.default_priority_fee)
                            .unwrap_or_else(|| gwei(1u64));
                        let max_fee =
                            tx.max_fee_per_gas.unwrap_or(base_fee * U256::from(2) + priority);
                        tx.max_priority_fee_per_gas = Some(priority);
                        tx.max_fee_per_gas = Some(max_fee);
                    }
                    None => self.fill_eip1559_fallback(tx).await?,
                }
            }
        } else {
            // an EIP-1559 request against a chain without a fee market gets
            // legacy pricing; stale dynamic-fee fields must not reach the
            // wire next to gasPrice, or nodes will prefer them
            tx.is_eip1559 = false;
            tx.max_fee_per_gas = None;
            tx.max_priority_fee_per_gas = None;
            let gas_price = maybe(tx.gas_price, self.get_gas_price()).await?;
            tx.gas_price = Some(gas_price);
        }

        Ok(())
    }

    async fn fill_eip1559_fallback(
        &self,
        tx: &mut TransactionRequest,
    ) -> Result<(), ProviderError> {
        match self.eip1559_fallback {
            Eip1559Fallback::Reject => Err(JsonRpcError {
                code: -32000,
                message: "EIP-1559 fees requested, but the latest block carries no baseFeePerGas"
                    .to_string(),
                data: None,
            }
            .into()),
            Eip1559Fallback::Silent | Eip1559Fallback::Warn => {
                if self.eip1559_fallback == Eip1559Fallback::Warn {
                    tracing::warn!(
                        chain_id = self.chain.chain_id,
                        "no baseFeePerGas available, falling back to legacy gas pricing"
                    );
                }
                tx.is_eip1559 = false;
                tx.max_fee_per_gas = None;
                tx.max_priority_fee_per_gas = None;
                let gas_price = maybe(tx.gas_price, self.get_gas_price()).await?;
                tx.gas_price = Some(gas_price);
                Ok(())
            }
        }
    }
}

impl<P: PubsubClient> Provider<P> {
    /// Installs a subscription with the given parameters, returning a typed
    /// stream of its notifications.
    pub async fn subscribe<T, R>(
        &self,
        params: T,
    ) -> Result<SubscriptionStream<'_, P, R>, ProviderError>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned,
    {
        let id: U256 = self.request("eth_subscribe", params).await?;
        SubscriptionStream::new(id, self).map_err(Into::into)
    }

    /// Streams new block headers, via `eth_subscribe("newHeads")`.
    pub async fn subscribe_blocks(
        &self,
    ) -> Result<SubscriptionStream<'_, P, Block>, ProviderError> {
        self.subscribe(["newHeads"]).await
    }

    /// Streams pending transaction hashes, via
    /// `eth_subscribe("newPendingTransactions")`.
    pub async fn subscribe_pending_txs(
        &self,
    ) -> Result<SubscriptionStream<'_, P, TxHash>, ProviderError> {
        self.subscribe(["newPendingTransactions"]).await
    }

    /// Detaches the local listener for the given subscription id. The
    /// transport notifies the server; transports exposing the server ack do
    /// so through their own surface.
    pub async fn unsubscribe<T: Into<U256> + Send + Sync>(
        &self,
        id: T,
    ) -> Result<(), ProviderError> {
        self.inner.unsubscribe(id).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockResponse;
    use ethlink_core::types::H256;

    fn block_with_base_fee(base_fee: Option<U256>) -> Block {
        Block {
            hash: Some(H256::repeat_byte(1)),
            number: Some(1u64.into()),
            base_fee_per_gas: base_fee,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fill_transaction_eip1559_prices_off_base_fee() {
        let (provider, mock) = Provider::mocked();
        let provider = provider
            .with_sender(Address::repeat_byte(7))
            .with_chain_profile(ChainProfile::mainnet().with_default_priority_fee(gwei(2u64)));

        // responses are a stack: estimateGas is requested first
        mock.push(block_with_base_fee(Some(gwei(100u64)))).unwrap();
        mock.push(U256::from(100_000u64)).unwrap();

        let mut tx = TransactionRequest::new().to(Address::repeat_byte(2)).eip1559();
        provider.fill_transaction(&mut tx).await.unwrap();

        assert_eq!(tx.from, Some(Address::repeat_byte(7)));
        assert_eq!(tx.gas, Some(U256::from(120_000u64)));
        assert_eq!(tx.max_priority_fee_per_gas, Some(gwei(2u64)));
        assert_eq!(tx.max_fee_per_gas, Some(gwei(202u64)));
        assert!(tx.gas_price.is_none());
    }

    #[tokio::test]
    async fn fill_transaction_eip1559_reject_fallback_skips_gas_price() {
        let (provider, mock) = Provider::mocked();
        let provider = provider.with_eip1559_fallback(Eip1559Fallback::Reject);

        mock.push(block_with_base_fee(None)).unwrap();
        mock.push(U256::from(21_000u64)).unwrap();

        let mut tx = TransactionRequest::new().to(Address::repeat_byte(2)).eip1559();
        let as_estimated = tx.clone();
        let err = provider.fill_transaction(&mut tx).await.unwrap_err();
        match err {
            ProviderError::JsonRpcError(e) => assert_eq!(e.code, -32000),
            other => panic!("expected rpc error, got {other:?}"),
        }

        // estimateGas and getBlockByNumber only; no eth_gasPrice call
        mock.assert_request("eth_estimateGas", [&as_estimated]).unwrap();
        mock.assert_request("eth_getBlockByNumber", (BlockNumber::Latest, false)).unwrap();
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn fill_transaction_eip1559_legacy_fallback_fetches_gas_price() {
        let (provider, mock) = Provider::mocked();
        let provider = provider.with_eip1559_fallback(Eip1559Fallback::Silent);

        mock.push(gwei(30u64)).unwrap();
        mock.push(block_with_base_fee(None)).unwrap();
        mock.push(U256::from(21_000u64)).unwrap();

        // the caller asked for EIP-1559 pricing and even set a tip; without
        // a base fee the fallback must strip it, not send it next to
        // gasPrice
        let mut tx = TransactionRequest::new()
            .to(Address::repeat_byte(2))
            .max_priority_fee_per_gas(gwei(1u64));
        provider.fill_transaction(&mut tx).await.unwrap();

        assert!(!tx.is_eip1559);
        assert_eq!(tx.gas_price, Some(gwei(30u64)));
        assert!(tx.max_fee_per_gas.is_none());
        assert!(tx.max_priority_fee_per_gas.is_none());
    }

    #[tokio::test]
    async fn fill_transaction_legacy_fills_gas_price() {
        let (provider, mock) = Provider::mocked();
        let provider = provider.with_chain_profile(ChainProfile::legacy(61));

        mock.push(gwei(5u64)).unwrap();
        mock.push(U256::from(21_000u64)).unwrap();

        let mut tx = TransactionRequest::new().to(Address::repeat_byte(2));
        provider.fill_transaction(&mut tx).await.unwrap();

        assert_eq!(tx.gas, Some(U256::from(25_200u64)));
        assert_eq!(tx.gas_price, Some(gwei(5u64)));
    }

    #[tokio::test]
    async fn fill_transaction_on_legacy_chain_clears_eip1559_fields() {
        let (provider, mock) = Provider::mocked();
        let provider = provider.with_chain_profile(ChainProfile::legacy(61));

        mock.push(gwei(5u64)).unwrap();
        mock.push(U256::from(21_000u64)).unwrap();

        let mut tx = TransactionRequest::new()
            .to(Address::repeat_byte(2))
            .max_priority_fee_per_gas(gwei(1u64));
        provider.fill_transaction(&mut tx).await.unwrap();

        assert!(!tx.is_eip1559);
        assert_eq!(tx.gas_price, Some(gwei(5u64)));
        assert!(tx.max_fee_per_gas.is_none());
        assert!(tx.max_priority_fee_per_gas.is_none());
    }

    #[tokio::test]
    async fn fill_transaction_never_overrides_caller_fields() {
        let (provider, mock) = Provider::mocked();
        let provider = provider.with_sender(Address::repeat_byte(7));

        let mut tx = TransactionRequest::new()
            .from(Address::repeat_byte(1))
            .to(Address::repeat_byte(2))
            .gas(50_000u64)
            .max_fee_per_gas(gwei(10u64))
            .max_priority_fee_per_gas(gwei(1u64));
        let reference = tx.clone();

        // no responses pushed: any RPC call would fail the test
        provider.fill_transaction(&mut tx).await.unwrap();
        assert_eq!(tx, reference);
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn fill_transaction_embeds_context_in_estimation_errors() {
        let (provider, mock) = Provider::mocked();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: -32000,
            message: "gas required exceeds allowance".to_string(),
            data: None,
        }));

        let mut tx =
            TransactionRequest::new().from(Address::repeat_byte(1)).to(Address::repeat_byte(2));
        let err = provider.fill_transaction(&mut tx).await.unwrap_err();
        match err {
            ProviderError::GasEstimation { from, to, .. } => {
                assert_eq!(from, Some(Address::repeat_byte(1)));
                assert_eq!(to, Some(Address::repeat_byte(2)));
            }
            other => panic!("expected gas estimation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn simulate_v1_maps_method_not_found() {
        let (provider, mock) = Provider::mocked();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: -32601,
            message: "the method eth_simulateV1 does not exist".to_string(),
            data: None,
        }));

        let err = provider
            .simulate_v1::<Value>(&serde_json::json!({ "blockStateCalls": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::SimulateNotSupported));
    }

    #[tokio::test]
    async fn wait_for_receipt_polls_until_mined() {
        let (provider, mock) = Provider::mocked();
        let hash = H256::repeat_byte(0xaa);

        let receipt = TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(10u64.into()),
            ..Default::default()
        };
        // first poll sees nothing, second sees the mined receipt
        mock.push(receipt.clone()).unwrap();
        mock.push(Value::Null).unwrap();

        let got = provider
            .wait_for_receipt(hash, Duration::from_millis(1), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(got.block_number, receipt.block_number);
    }

    #[tokio::test]
    async fn wait_for_receipt_times_out() {
        let (provider, mock) = Provider::mocked();
        let hash = H256::repeat_byte(0xaa);
        for _ in 0..8 {
            mock.push(Value::Null).unwrap();
        }

        let err = provider
            .wait_for_receipt(hash, Duration::from_millis(1), Some(Duration::from_millis(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ReceiptTimeout(h) if h == hash));
    }
}
